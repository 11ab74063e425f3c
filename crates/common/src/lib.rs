//! Shared building blocks for the mxscan controller and its worker process.
//!
//! Everything that crosses the controller/worker boundary lives here:
//!
//! - [`channel`]: the command and result queues plus the [`channel::ChannelPair`]
//! - [`abort`]: the cooperative cancellation flag shared by both sides
//! - [`protocol`]: command verbs, result messages and the line framing used
//!   on the worker's stdin/stdout
//! - [`request`]: the validated scan request data model
//! - [`config`]: layered configuration (defaults, TOML file, environment)
//! - [`error`]: the error taxonomy used across the workspace

pub mod abort;
pub mod channel;
pub mod config;
pub mod error;
pub mod protocol;
pub mod request;

pub use abort::AbortSignal;
pub use channel::{Channel, ChannelPair};
pub use error::{Result, ScanError, ValidationError};
pub use protocol::{
    decode_line, encode_line, Command, DeviceLists, ScanResult, SetDevices, Verb, WorkerCommand,
    WorkerFrame,
};
pub use request::{AxisRange, Detector, ScanRequest};
