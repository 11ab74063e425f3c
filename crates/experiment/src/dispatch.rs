//! Hand-off from background tasks to the host's main loop.
//!
//! Background tasks never touch front-end state directly. They submit
//! [`UiEvent`]s to a [`Dispatcher`]; the host drains the receiver on its own
//! loop.

use std::path::{Path, PathBuf};

use common::ScanError;
use tokio::sync::mpsc;

use crate::feeder::PlotSink;
use crate::session::SessionStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// New status line text.
    Status(SessionStatus),
    /// A data file is ready to be plotted.
    Plot(PathBuf),
    /// The scan cycle, including recovery, is over.
    ScanFinished { datapoints: usize, aborted: bool },
    /// The worker could not be replaced after the scan. A database must be
    /// selected again before the next scan.
    ScanFailed(String),
}

/// Sending half of the main-loop queue.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl Dispatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn submit(&self, event: UiEvent) -> common::Result<()> {
        self.tx.send(event).map_err(|_| ScanError::ChannelClosed)
    }

    pub fn status(&self, status: SessionStatus) -> common::Result<()> {
        self.submit(UiEvent::Status(status))
    }
}

impl PlotSink for Dispatcher {
    fn plot(&self, path: &Path) -> anyhow::Result<()> {
        self.submit(UiEvent::Plot(path.to_path_buf()))?;
        Ok(())
    }
}
