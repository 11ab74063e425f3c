//! Plot formula validation and evaluation.
//!
//! Formulas are arithmetic expressions over scaler names, e.g. `It/Io` or
//! `log(If/Io)`, evaluated with `evalexpr`. Every scaler name is a variable;
//! `log`, `exp` and `sqrt` are available as functions.

use std::collections::{BTreeSet, HashMap};

use common::ValidationError;
use evalexpr::{
    eval_number_with_context, ContextWithMutableFunctions, ContextWithMutableVariables,
    EvalexprError, Function, HashMapContext, Value,
};

/// Value bound to every variable when trial-evaluating a formula.
const TRIAL_VALUE: f64 = 1.0;

fn unary(f: fn(f64) -> f64) -> Function {
    Function::new(move |argument| Ok(Value::Float(f(argument.as_number()?))))
}

fn context<'a>(
    formula: &str,
    values: impl IntoIterator<Item = (&'a str, f64)>,
) -> Result<HashMapContext, ValidationError> {
    let invalid = |e: EvalexprError| ValidationError::InvalidFormula {
        formula: formula.to_string(),
        reason: e.to_string(),
    };

    let functions: [(&str, fn(f64) -> f64); 3] =
        [("log", f64::ln), ("exp", f64::exp), ("sqrt", f64::sqrt)];
    let mut context = HashMapContext::new();
    for (name, f) in functions {
        context
            .set_function(name.to_string(), unary(f))
            .map_err(invalid)?;
    }
    for (name, value) in values {
        context
            .set_value(name.to_string(), Value::Float(value))
            .map_err(invalid)?;
    }
    Ok(context)
}

/// Check that `formula` evaluates against `variables`.
///
/// Every variable is bound to 1.0. A division by zero still counts as valid:
/// the formula is well-formed, only degenerate at the trial point.
pub fn validate(formula: &str, variables: &BTreeSet<String>) -> Result<(), ValidationError> {
    if variables.is_empty() {
        return Err(ValidationError::NoAvailableData);
    }
    let context = context(formula, variables.iter().map(|v| (v.as_str(), TRIAL_VALUE)))?;
    match eval_number_with_context(formula, &context) {
        Ok(_) | Err(EvalexprError::DivisionError { .. }) => Ok(()),
        Err(e) => Err(ValidationError::InvalidFormula {
            formula: formula.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Evaluate `formula` with the given variable values.
pub fn evaluate(formula: &str, values: &HashMap<String, f64>) -> Result<f64, ValidationError> {
    let context = context(formula, values.iter().map(|(k, v)| (k.as_str(), *v)))?;
    eval_number_with_context(formula, &context).map_err(|e| ValidationError::InvalidFormula {
        formula: formula.to_string(),
        reason: e.to_string(),
    })
}
