//! ScanSession - controller facade and scan-cycle state machine.
//!
//! # State Machine
//!
//! ```text
//! ┌───────────────┐ select_database() ┌───────────┐  start_scan()  ┌──────────┐
//! │ Uninitialized │──────────────────▶│ Connected │───────────────▶│ Scanning │
//! └───────────────┘                   └───────────┘                └────┬─────┘
//!                                           ▲            request_abort() │ sentinel
//!                                           │                 ▼          ▼
//!                                           │          ┌──────────┐ ┌────────────┐
//!                                           │          │ Aborting │ │ Completing │
//!                                           │          └────┬─────┘ └─────┬──────┘
//!                                           │   respawned   ▼             │
//!                                           └────────── ┌──────────┐ ◀────┘
//!                                                       │ Draining │
//!                                                       └──────────┘
//! ```
//!
//! A scan cycle returns to `Connected`, not `Uninitialized`: the database is
//! chosen once and replayed to every replacement worker. If the replacement
//! cannot be started the cycle ends in `Uninitialized` with
//! [`UiEvent::ScanFailed`], and the next `select_database` starts a worker.
//!
//! # Usage
//!
//! ```rust,ignore
//! let (dispatcher, mut events) = Dispatcher::new();
//! let mut session = ScanSession::start(backend, &settings, dispatcher).await?;
//! let devices = session.select_database(Path::new("/etc/mx/mxmotor.dat")).await?;
//!
//! let scan = session.start_scan(&fields).await?;
//! while let Some(event) = events.recv().await {
//!     match event {
//!         UiEvent::Plot(path) => plotter.read(&path)?,
//!         UiEvent::ScanFinished { .. } | UiEvent::ScanFailed(_) => break,
//!         UiEvent::Status(status) => println!("Status: {}", status),
//!     }
//! }
//! let outcome = scan.wait().await?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::config::{Settings, WorkerSettings};
use common::{Channel, Command, DeviceLists, ScanError, ScanRequest, ScanResult, ValidationError};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{WorkerBackend, WorkerExit};
use crate::context::SessionContext;
use crate::dispatch::{Dispatcher, UiEvent};
use crate::feeder::{FeedSummary, LiveUpdateFeeder};
use crate::recovery::{RecoveryManager, RecoveryReport};
use crate::request_builder::{RawScanFields, RequestBuilder};
use crate::supervisor::WorkerSupervisor;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Worker running, no database selected yet
    Uninitialized,
    /// Database loaded, ready to scan
    Connected,
    /// Scan submitted, live updates flowing
    Scanning,
    /// Sentinel received after a normal scan
    Completing,
    /// Abort requested, waiting for the scan to wind down
    Aborting,
    /// Replacing the worker
    Draining,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Uninitialized => write!(f, "uninitialized"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Scanning => write!(f, "scanning"),
            SessionState::Completing => write!(f, "completing"),
            SessionState::Aborting => write!(f, "aborting"),
            SessionState::Draining => write!(f, "draining"),
        }
    }
}

/// User-facing status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    SelectDatabase,
    Ready,
    Scanning,
    Stopping,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::SelectDatabase => write!(f, "Please select MX Database"),
            SessionStatus::Ready => write!(f, "Ready to scan"),
            SessionStatus::Scanning => write!(f, "Scanning"),
            SessionStatus::Stopping => write!(f, "Stopping scan"),
        }
    }
}

/// Result of one scan cycle.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub request: ScanRequest,
    pub summary: FeedSummary,
    pub aborted: bool,
    pub recovery: RecoveryReport,
}

/// Handle to a running scan cycle.
pub struct ScanHandle {
    task: JoinHandle<common::Result<ScanOutcome>>,
}

impl ScanHandle {
    /// Wait for live updates to finish and the worker to be replaced.
    pub async fn wait(self) -> common::Result<ScanOutcome> {
        self.task
            .await
            .map_err(|e| ScanError::TaskFailed(e.to_string()))?
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct ActiveScan {
    finished: CancellationToken,
    abort_task: Option<JoinHandle<bool>>,
}

struct Shared {
    state: RwLock<SessionState>,
    supervisor: Mutex<WorkerSupervisor>,
    recovery: RecoveryManager,
    results: Channel<ScanResult>,
    dispatcher: Dispatcher,
    active: parking_lot::Mutex<Option<ActiveScan>>,
}

impl Shared {
    fn publish(&self, status: SessionStatus) {
        if self.dispatcher.status(status).is_err() {
            debug!(%status, "Main loop gone, status update dropped");
        }
    }

    async fn set_state(&self, state: SessionState) {
        *self.state.write().await = state;
    }

    /// Start a worker if the last one is gone.
    async fn ensure_worker(&self) -> common::Result<()> {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.is_running() {
            return Ok(());
        }
        warn!("No worker running, starting a new one");
        supervisor.start().await
    }
}

pub struct ScanSession {
    shared: Arc<Shared>,
    context: SessionContext,
    settings: WorkerSettings,
}

impl ScanSession {
    /// Start the worker and return a session waiting for a database.
    pub async fn start(
        backend: Arc<dyn WorkerBackend>,
        settings: &Settings,
        dispatcher: Dispatcher,
    ) -> common::Result<Self> {
        let mut supervisor = WorkerSupervisor::new(backend, &settings.worker);
        supervisor.start().await?;
        let recovery = RecoveryManager::new(&supervisor, settings.worker.abort_grace());
        let results = supervisor.channels().results.clone();

        let shared = Arc::new(Shared {
            state: RwLock::new(SessionState::Uninitialized),
            supervisor: Mutex::new(supervisor),
            recovery,
            results,
            dispatcher,
            active: parking_lot::Mutex::new(None),
        });
        shared.publish(SessionStatus::SelectDatabase);

        Ok(Self {
            shared,
            context: SessionContext::new(settings.instrument_config()),
            settings: settings.worker.clone(),
        })
    }

    pub async fn state(&self) -> SessionState {
        *self.shared.state.read().await
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub async fn worker_pid(&self) -> Option<u32> {
        self.shared.supervisor.lock().await.pid()
    }

    /// Load `path` in the worker and discover its devices.
    #[instrument(skip(self, path), fields(path = %path.display()), err)]
    pub async fn select_database(&mut self, path: &Path) -> common::Result<DeviceLists> {
        let state = self.state().await;
        if !matches!(state, SessionState::Uninitialized | SessionState::Connected) {
            return Err(ScanError::InvalidState {
                action: "select a database",
                state: state.to_string(),
            });
        }
        if !tokio::fs::try_exists(path).await? {
            return Err(ScanError::DatabaseNotFound(path.to_path_buf()));
        }
        self.shared.ensure_worker().await?;

        let response = {
            let supervisor = self.shared.supervisor.lock().await;
            supervisor.send(Command::start_mxdb(path));
            supervisor
                .query(
                    Command::get_devices(
                        self.context.scaler_classes(),
                        self.context.detector_classes(),
                    ),
                    None,
                )
                .await?
        };
        let devices = match response {
            ScanResult::Devices(devices) => devices,
            other => {
                return Err(ScanError::Protocol(format!(
                    "expected device lists in response to get_devices, got {:?}",
                    other
                )))
            }
        };

        self.context.set_database(path.to_path_buf());
        self.shared.set_state(SessionState::Connected).await;
        self.shared.publish(SessionStatus::Ready);
        info!(
            motors = devices.x_motors.len(),
            scalers = devices.scalers.len(),
            detectors = devices.detectors.len(),
            "Database selected"
        );
        Ok(devices)
    }

    /// Validate `fields`, submit the scan and start live updates.
    ///
    /// Validation errors leave the session in `Connected`.
    #[instrument(skip_all, err)]
    pub async fn start_scan(&self, fields: &RawScanFields) -> common::Result<ScanHandle> {
        {
            let mut state = self.shared.state.write().await;
            match *state {
                SessionState::Connected => *state = SessionState::Scanning,
                SessionState::Uninitialized => {
                    return Err(ValidationError::NoDatabaseSelected.into())
                }
                other => {
                    return Err(ScanError::InvalidState {
                        action: "start a scan",
                        state: other.to_string(),
                    })
                }
            }
        }

        let (request, database) = match self.submit(fields).await {
            Ok(submitted) => submitted,
            Err(e) => {
                self.shared.set_state(SessionState::Connected).await;
                return Err(e);
            }
        };

        let finished = CancellationToken::new();
        *self.shared.active.lock() = Some(ActiveScan {
            finished: finished.clone(),
            abort_task: None,
        });
        self.shared.publish(SessionStatus::Scanning);
        info!(
            dir = %request.data_dir().display(),
            points = request.num_points(),
            "Scan started"
        );

        let feeder = LiveUpdateFeeder::new(
            self.shared.results.clone(),
            self.settings.poll_interval(),
        );
        let task = tokio::spawn(run_cycle(
            Arc::clone(&self.shared),
            feeder,
            request,
            database,
            finished,
        ));
        Ok(ScanHandle { task })
    }

    async fn submit(&self, fields: &RawScanFields) -> common::Result<(ScanRequest, PathBuf)> {
        let request = RequestBuilder::new(&self.context)
            .with_directory_wait(
                self.settings.directory_poll_interval(),
                self.settings.directory_timeout(),
            )
            .build(fields)
            .await?;
        let database = self
            .context
            .database()
            .map(Path::to_path_buf)
            .ok_or(ValidationError::NoDatabaseSelected)?;
        let set_devices = Command::set_devices(&request)?;
        self.shared.ensure_worker().await?;

        let supervisor = self.shared.supervisor.lock().await;
        supervisor.abort_signal().clear();
        supervisor.send(set_devices);
        supervisor.send(Command::scan());
        Ok((request, database))
    }

    /// Ask the running scan to stop.
    ///
    /// Returns immediately; the scan handle resolves once live updates have
    /// ended and the worker has been replaced.
    pub async fn request_abort(&self) -> common::Result<()> {
        let mut state = self.shared.state.write().await;
        if *state != SessionState::Scanning {
            return Err(ScanError::InvalidState {
                action: "abort the scan",
                state: state.to_string(),
            });
        }
        *state = SessionState::Aborting;
        self.shared.publish(SessionStatus::Stopping);

        let mut active = self.shared.active.lock();
        if let Some(active) = active.as_mut() {
            let recovery = self.shared.recovery.clone();
            let finished = active.finished.clone();
            active.abort_task = Some(tokio::spawn(async move {
                recovery.request_abort(&finished).await
            }));
        }
        Ok(())
    }

    /// Stop the worker for good.
    pub async fn shutdown(&self) -> WorkerExit {
        let exit = self.shared.supervisor.lock().await.stop().await;
        info!(%exit, "Session shut down");
        exit
    }
}

/// Feed live updates until the sentinel, then replace the worker.
async fn run_cycle(
    shared: Arc<Shared>,
    feeder: LiveUpdateFeeder,
    request: ScanRequest,
    database: PathBuf,
    finished: CancellationToken,
) -> common::Result<ScanOutcome> {
    let summary = feeder
        .run(&shared.dispatcher, |summary| {
            debug!(datapoints = summary.datapoints, "Scan complete");
        })
        .await;
    finished.cancel();

    let aborted = {
        let mut state = shared.state.write().await;
        let aborted = *state == SessionState::Aborting;
        if !aborted {
            *state = SessionState::Completing;
        }
        aborted
    };

    // An abort in its grace period may still enqueue the sentinel; wait for it
    // so recovery drains it.
    let abort_task = shared.active.lock().take().and_then(|a| a.abort_task);
    if let Some(task) = abort_task {
        if let Err(e) = task.await {
            warn!(error = %e, "Abort task failed");
        }
    }

    shared.set_state(SessionState::Draining).await;
    let recovered = {
        let mut supervisor = shared.supervisor.lock().await;
        shared.recovery.recover(&mut supervisor, &database).await
    };

    match recovered {
        Ok(recovery) => {
            shared.set_state(SessionState::Connected).await;
            shared.publish(SessionStatus::Ready);
            let event = UiEvent::ScanFinished {
                datapoints: summary.datapoints,
                aborted,
            };
            if shared.dispatcher.submit(event).is_err() {
                debug!("Main loop gone, scan completion not delivered");
            }
            Ok(ScanOutcome {
                request,
                summary,
                aborted,
                recovery,
            })
        }
        Err(e) => {
            error!(error = %e, "Worker recovery failed");
            shared.set_state(SessionState::Uninitialized).await;
            shared.publish(SessionStatus::SelectDatabase);
            if shared.dispatcher.submit(UiEvent::ScanFailed(e.to_string())).is_err() {
                debug!("Main loop gone, scan failure not delivered");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text() {
        assert_eq!(
            format!("Status: {}", SessionStatus::Scanning),
            "Status: Scanning"
        );
        assert_eq!(SessionStatus::Stopping.to_string(), "Stopping scan");
        assert_eq!(SessionStatus::Ready.to_string(), "Ready to scan");
        assert_eq!(
            SessionStatus::SelectDatabase.to_string(),
            "Please select MX Database"
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Draining.to_string(), "draining");
        assert_eq!(SessionState::Connected.to_string(), "connected");
    }
}
