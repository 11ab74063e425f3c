//! # hardware
//!
//! Worker side of the scan system. The worker owns the instrument handle and
//! executes commands it receives over the [`common::ChannelPair`]:
//!
//! - **[`Instrument`]** - driver trait for an MX-style instrument database
//! - **[`MockInstrument`]** - simulated instrument writing text data files
//! - **[`Scanner`]** - the command loop (`start_mxdb`, `get_devices`,
//!   `set_devices`, `scan`) with cooperative abort between rows
//! - **[`stdio`]** - bridge that runs a [`Scanner`] behind stdin/stdout so it can
//!   live in its own OS process
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use hardware::{MockInstrument, Scanner, WorkerLink};
//!
//! let link = WorkerLink::new();
//! let worker = tokio::spawn(Scanner::new(link.clone(), MockInstrument::new()).run());
//!
//! link.channels.commands.send(Command::start_mxdb("/etc/mx/mxmotor.dat".as_ref()));
//! ```

pub mod database;
pub mod description;
pub mod drivers;
pub mod error;
pub mod instrument;
pub mod scanner;
pub mod stdio;

pub use database::{DeviceRecord, MxDatabase};
pub use description::ScanDescription;
pub use drivers::mock::MockInstrument;
pub use error::{DriverError, DriverErrorKind, WorkerError};
pub use instrument::Instrument;
pub use scanner::{Scanner, WorkerLink};
