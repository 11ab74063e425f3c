//! Worker-side error types.
//!
//! [`DriverError`] reports failures of an [`Instrument`](crate::Instrument)
//! implementation; [`WorkerError`] is what a single command handler returns.
//! The scanner logs a failed command and keeps serving, so none of these
//! errors terminate the worker.

use thiserror::Error;

/// Broad category of a driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// The database could not be opened or parsed.
    Initialization,
    /// An operation needs state the driver does not have yet.
    Configuration,
    /// Reading or writing a data file failed.
    Communication,
    InvalidParameter,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
        };
        write!(f, "{}", label)
    }
}

#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    pub driver_type: String,
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Failure of one worker command.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The command envelope did not decode.
    #[error(transparent)]
    Protocol(#[from] common::ScanError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    /// The command arrived before the state it depends on.
    #[error("{0}")]
    NotReady(&'static str),
}
