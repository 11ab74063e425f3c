//! Error types for the scan controller.
//!
//! Two enums cover everything the orchestration core can report:
//!
//! - **`ValidationError`**: problems with a scan request detected before the
//!   worker is touched. The scan never starts; the message is meant to be shown
//!   to the user as-is.
//! - **`ScanError`**: the top-level error. It wraps validation failures and adds
//!   the runtime categories:
//!   - `ProtocolTimeout`: a blocking query received no response in time.
//!   - `WorkerFault`: the worker process exited without being asked to.
//!   - `WorkerSpawn`, `Protocol`, `Codec`, `Io`: plumbing failures.
//!   - `InvalidState`: an operation was requested in the wrong session state.
//!
//! Using `#[from]`, lower-level errors convert into `ScanError` so callers can
//! propagate with `?`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::Verb;

/// Convenience alias for results using the controller error type.
pub type Result<T> = std::result::Result<T, ScanError>;

/// A scan request failed validation.
///
/// Variants are checked in declaration order by the request builder; the first
/// violation wins.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// The database picker still shows the placeholder entry.
    #[error("Please select an MX database")]
    NoDatabaseSelected,

    /// The same scaler was chosen for two slots.
    #[error("Scaler '{0}' is selected more than once")]
    DuplicateScaler(String),

    /// The plot formula does not evaluate against the selected scalers.
    #[error("Invalid formula '{formula}': {reason}. Check that the formula is correct and all scalers are added")]
    InvalidFormula { formula: String, reason: String },

    /// There are no variables to evaluate the formula against.
    #[error("No scaler data available to evaluate the formula against")]
    NoAvailableData,

    /// The chosen output directory is not on disk.
    #[error("Output directory {} does not exist. Please select another directory", .0.display())]
    OutputDirectoryMissing(PathBuf),

    /// The output name contains characters other than letters, digits, `_` and `-`.
    #[error("Invalid output file name '{0}'. Please do not include spaces, '.' or any special characters")]
    InvalidFileName(String),

    /// Dwell time must be a positive number of seconds.
    #[error("Dwell time must be positive, got {0}")]
    InvalidDwellTime(f64),

    /// A zero step would never reach the end of the axis.
    #[error("Step size for motor {axis} must be non-zero")]
    ZeroStep { axis: char },

    /// The scan directory was created but never showed up on the filesystem.
    #[error("Output directory {} was not confirmed within {timeout:?}", path.display())]
    OutputDirectoryNotConfirmed { path: PathBuf, timeout: Duration },
}

/// Primary error type for the scan controller.
#[derive(Error, Debug)]
pub enum ScanError {
    /// The request was rejected before any worker interaction.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A blocking query did not receive its response.
    ///
    /// **Recovery Strategy**: the worker is presumed wedged; stop and respawn
    /// it before issuing further queries.
    #[error("No response to '{verb}' within {timeout:?}")]
    ProtocolTimeout { verb: Verb, timeout: Duration },

    /// The worker process exited without a shutdown request, or with a
    /// failure status.
    #[error("Worker fault: {0}")]
    WorkerFault(String),

    /// The worker process could not be started.
    #[error("Failed to spawn worker process: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    /// A message did not have the expected shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The session was asked to do something its current state forbids.
    #[error("Cannot {action} while session is {state}")]
    InvalidState { action: &'static str, state: String },

    /// The selected database file is missing.
    #[error("MX database {} does not exist", .0.display())]
    DatabaseNotFound(PathBuf),

    /// A directory holds no `<name>.0` scan data file to read back.
    #[error("No scan data files found in {}", .0.display())]
    NoScanData(PathBuf),

    /// JSON encoding or decoding failed.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Standard I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The background scan task panicked or was cancelled.
    #[error("Scan task failed: {0}")]
    TaskFailed(String),

    /// The host event loop is no longer receiving updates.
    #[error("Dispatch channel closed")]
    ChannelClosed,
}

impl ScanError {
    /// Whether the error was raised before the worker was involved.
    pub fn is_validation(&self) -> bool {
        matches!(self, ScanError::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_converts_with_question_mark() {
        fn check() -> Result<()> {
            let validated: std::result::Result<(), ValidationError> =
                Err(ValidationError::NoDatabaseSelected);
            validated?;
            Ok(())
        }
        let err = check().unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "Please select an MX database");
    }

    #[test]
    fn test_timeout_message_names_verb() {
        let err = ScanError::ProtocolTimeout {
            verb: Verb::GetDevices,
            timeout: Duration::from_secs(2),
        };
        assert_eq!(err.to_string(), "No response to 'get_devices' within 2s");
        assert!(!err.is_validation());
    }
}
