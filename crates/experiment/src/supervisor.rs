//! Worker lifecycle: start, send, query, stop, respawn.
//!
//! The supervisor owns the [`WorkerLink`] (channel pair and abort flag). The
//! link outlives individual workers: `respawn` binds a brand-new worker to the
//! same channels, so results the old worker left behind must be drained by
//! the caller first.

use std::sync::Arc;
use std::time::Duration;

use common::config::WorkerSettings;
use common::{AbortSignal, ChannelPair, Command, ScanError, ScanResult};
use hardware::WorkerLink;
use tracing::{debug, info, instrument, warn};

use crate::backend::{WorkerBackend, WorkerExit, WorkerHandle};

pub struct WorkerSupervisor {
    backend: Arc<dyn WorkerBackend>,
    link: WorkerLink,
    handle: Option<Box<dyn WorkerHandle>>,
    query_timeout: Duration,
    stop_timeout: Duration,
}

impl WorkerSupervisor {
    pub fn new(backend: Arc<dyn WorkerBackend>, settings: &WorkerSettings) -> Self {
        Self {
            backend,
            link: WorkerLink::new(),
            handle: None,
            query_timeout: settings.query_timeout(),
            stop_timeout: settings.stop_timeout(),
        }
    }

    pub fn channels(&self) -> &ChannelPair {
        &self.link.channels
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.link.abort
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(|h| h.pid())
    }

    /// Spawn the worker bound to the shared channels and abort flag.
    pub async fn start(&mut self) -> common::Result<()> {
        if self.is_running() {
            return Err(ScanError::InvalidState {
                action: "start the worker",
                state: "running".into(),
            });
        }
        let handle = self.backend.launch(self.link.clone()).await?;
        info!(pid = handle.pid(), "Worker started");
        self.handle = Some(handle);
        Ok(())
    }

    /// Enqueue a command. Never blocks and confirms nothing.
    pub fn send(&self, command: Command) {
        debug!(verb = %command.verb, "Sending command");
        self.link.channels.commands.send(command);
    }

    /// Send `command` and wait for exactly one result.
    ///
    /// Without an explicit timeout the configured query timeout applies.
    /// Elapsing yields [`ScanError::ProtocolTimeout`]; the worker should then
    /// be treated as wedged.
    #[instrument(skip(self, command), fields(verb = %command.verb), err)]
    pub async fn query(
        &self,
        command: Command,
        timeout: Option<Duration>,
    ) -> common::Result<ScanResult> {
        let verb = command.verb;
        let timeout = timeout.unwrap_or(self.query_timeout);
        self.send(command);
        self.link
            .channels
            .results
            .recv_timeout(timeout)
            .await
            .ok_or(ScanError::ProtocolTimeout { verb, timeout })
    }

    /// Stop the worker and wait for it to exit (killing it after the stop timeout).
    pub async fn stop(&mut self) -> WorkerExit {
        let Some(mut handle) = self.handle.take() else {
            return WorkerExit::Clean;
        };
        let pid = handle.pid();
        let exit = handle.shutdown(self.stop_timeout).await;
        match &exit {
            WorkerExit::Faulted(reason) => warn!(pid, %reason, "Worker ended with a fault"),
            exit => info!(pid, %exit, "Worker stopped"),
        }
        exit
    }

    /// Replace the worker with a fresh one on the same channels.
    ///
    /// In-flight commands are not replayed.
    pub async fn respawn(&mut self) -> common::Result<()> {
        if self.handle.is_some() {
            warn!("Respawning over a live worker, stopping it first");
            self.stop().await;
        }
        self.link = self.link.rebind();
        self.start().await
    }

    /// Whether a worker is alive. An unrequested exit is logged as a fault.
    pub fn is_running(&mut self) -> bool {
        let Some(handle) = self.handle.as_mut() else {
            return false;
        };
        match handle.try_exit() {
            None => true,
            Some(exit) => {
                warn!(pid = handle.pid(), %exit, "Worker is no longer running");
                self.handle = None;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Verb;
    use hardware::MockInstrument;

    use crate::backend::InProcessBackend;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            query_timeout_ms: 200,
            stop_timeout_ms: 1000,
            ..WorkerSettings::default()
        }
    }

    fn supervisor() -> WorkerSupervisor {
        WorkerSupervisor::new(
            Arc::new(InProcessBackend::new(MockInstrument::instant)),
            &settings(),
        )
    }

    #[tokio::test]
    async fn test_start_stop() {
        let mut supervisor = supervisor();
        assert!(!supervisor.is_running());
        supervisor.start().await.unwrap();
        assert!(supervisor.is_running());
        assert!(supervisor.start().await.is_err());
        assert_eq!(supervisor.stop().await, WorkerExit::Clean);
        assert!(!supervisor.is_running());
        // Stopping twice is harmless
        assert_eq!(supervisor.stop().await, WorkerExit::Clean);
    }

    #[tokio::test]
    async fn test_query_times_out_without_response() {
        let mut supervisor = supervisor();
        supervisor.start().await.unwrap();

        // No database loaded: the worker logs the failure and never answers
        let err = supervisor
            .query(Command::get_devices(&["scaler".into()], &[]), None)
            .await
            .unwrap_err();
        match err {
            ScanError::ProtocolTimeout { verb, timeout } => {
                assert_eq!(verb, Verb::GetDevices);
                assert_eq!(timeout, Duration::from_millis(200));
            }
            other => panic!("unexpected {other:?}"),
        }
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_respawn_keeps_channels() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("mxmotor.dat");
        std::fs::write(&db, "smx device motor e500\n").unwrap();

        let mut supervisor = supervisor();
        supervisor.start().await.unwrap();
        let channels = supervisor.channels().clone();

        supervisor.stop().await;
        supervisor.respawn().await.unwrap();
        assert!(supervisor.is_running());

        // The new worker serves the same channel pair
        channels.commands.send(Command::start_mxdb(&db));
        let result = supervisor
            .query(Command::get_devices(&[], &[]), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(matches!(result, ScanResult::Devices(lists) if lists.x_motors == ["smx"]));
        supervisor.stop().await;
    }
}
