//! Scan orchestration for the mxscan controller.
//!
//! # Components
//!
//! - [`formula`] - plot formula validation and evaluation
//! - [`RequestBuilder`] - raw fields to a validated [`common::ScanRequest`]
//! - [`WorkerSupervisor`] - worker lifecycle over a [`WorkerBackend`]
//! - [`LiveUpdateFeeder`] - result channel to [`PlotSink`] during a scan
//! - [`RecoveryManager`] - abort path and post-scan worker replacement
//! - [`ScanSession`] - the controller facade tying the above together
//! - [`ScanMap`] - reading produced data files into a map

pub mod backend;
pub mod context;
pub mod dispatch;
pub mod feeder;
pub mod formula;
pub mod map_data;
pub mod recovery;
pub mod request_builder;
pub mod session;
pub mod supervisor;

pub use backend::{InProcessBackend, ProcessBackend, WorkerBackend, WorkerExit, WorkerHandle};
pub use context::SessionContext;
pub use dispatch::{Dispatcher, UiEvent};
pub use feeder::{FeedSummary, LiveUpdateFeeder, PlotSink};
pub use map_data::{MapPoint, ScanFiles, ScanMap};
pub use recovery::{RecoveryManager, RecoveryReport};
pub use request_builder::{RawScanFields, RequestBuilder};
pub use session::{ScanHandle, ScanOutcome, ScanSession, SessionState, SessionStatus};
pub use supervisor::WorkerSupervisor;
