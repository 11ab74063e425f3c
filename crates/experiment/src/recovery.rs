//! Abort handling and post-scan recovery.
//!
//! The worker cannot be trusted to reset cleanly after a scan, so every scan
//! cycle, completed or aborted, ends with a full replacement of the worker
//! process. Recovery never fails the scan: a worker that faulted is logged and
//! replaced like any other.

use std::path::Path;
use std::time::Duration;

use common::{AbortSignal, ChannelPair, Command, ScanResult};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::WorkerExit;
use crate::supervisor::WorkerSupervisor;

/// What `recover` cleaned up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub drained_commands: usize,
    pub drained_results: usize,
    /// How the replaced worker ended.
    pub previous_exit: WorkerExit,
}

#[derive(Debug, Clone)]
pub struct RecoveryManager {
    channels: ChannelPair,
    abort: AbortSignal,
    grace: Duration,
}

impl RecoveryManager {
    pub fn new(supervisor: &WorkerSupervisor, grace: Duration) -> Self {
        Self {
            channels: supervisor.channels().clone(),
            abort: supervisor.abort_signal().clone(),
            grace,
        }
    }

    /// Set the abort flag, give the worker `grace` to wind down, then end the
    /// live update stream by enqueueing the sentinel directly.
    ///
    /// The sentinel is not enqueued if `scan_finished` fires during the grace
    /// period. Returns whether it was.
    #[instrument(skip_all)]
    pub async fn request_abort(&self, scan_finished: &CancellationToken) -> bool {
        info!(grace = ?self.grace, "Abort requested");
        self.abort.set();
        tokio::select! {
            _ = tokio::time::sleep(self.grace) => {}
            _ = scan_finished.cancelled() => {}
        }
        if scan_finished.is_cancelled() {
            debug!("Scan ended within the grace period");
            return false;
        }
        self.channels.results.send(ScanResult::StopLivePlotting);
        true
    }

    /// Clear the abort flag, empty both channels, replace the worker and
    /// bring the new one back to the selected database.
    #[instrument(skip_all, fields(database = %database.display()), err)]
    pub async fn recover(
        &self,
        supervisor: &mut WorkerSupervisor,
        database: &Path,
    ) -> common::Result<RecoveryReport> {
        self.abort.clear();
        let drained_commands = self.channels.commands.drain().len();
        let mut drained_results = self.channels.results.drain().len();

        let previous_exit = supervisor.stop().await;
        if let WorkerExit::Faulted(reason) = &previous_exit {
            warn!(%reason, "Replacing faulted worker");
        }
        // Results the old worker flushed while exiting
        drained_results += self.channels.results.drain().len();

        supervisor.respawn().await?;
        supervisor.send(Command::start_mxdb(database));

        info!(
            drained_commands,
            drained_results,
            previous_exit = %previous_exit,
            pid = supervisor.pid(),
            "Worker recovered"
        );
        Ok(RecoveryReport {
            drained_commands,
            drained_results,
            previous_exit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use common::config::WorkerSettings;
    use hardware::MockInstrument;

    use crate::backend::InProcessBackend;
    use tracing_test::traced_test;

    fn supervisor() -> WorkerSupervisor {
        WorkerSupervisor::new(
            Arc::new(InProcessBackend::new(MockInstrument::instant)),
            &WorkerSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_abort_injects_sentinel_after_grace() {
        let supervisor = supervisor();
        let recovery = RecoveryManager::new(&supervisor, Duration::from_millis(20));
        let finished = CancellationToken::new();

        assert!(recovery.request_abort(&finished).await);
        assert!(supervisor.abort_signal().is_set());
        assert_eq!(
            supervisor.channels().results.try_recv(),
            Some(ScanResult::StopLivePlotting)
        );
    }

    #[tokio::test]
    async fn test_abort_skips_sentinel_when_scan_already_ended() {
        let supervisor = supervisor();
        let recovery = RecoveryManager::new(&supervisor, Duration::from_secs(5));
        let finished = CancellationToken::new();
        finished.cancel();

        let injected = tokio::time::timeout(Duration::from_secs(1), recovery.request_abort(&finished))
            .await
            .unwrap();
        assert!(!injected);
        assert!(supervisor.channels().results.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_recover_empties_channels_and_replays_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("mxmotor.dat");
        std::fs::write(&db, "smx device motor e500\nIo device scaler e500_scaler\n").unwrap();

        let mut supervisor = supervisor();
        supervisor.start().await.unwrap();
        let recovery = RecoveryManager::new(&supervisor, Duration::from_millis(10));

        supervisor.abort_signal().set();
        supervisor
            .channels()
            .results
            .send(ScanResult::Datapoint("stale".into()));
        supervisor
            .channels()
            .results
            .send(ScanResult::StopLivePlotting);

        let report = recovery.recover(&mut supervisor, &db).await.unwrap();
        assert_eq!(report.drained_results, 2);
        assert_eq!(report.previous_exit, WorkerExit::Clean);
        assert!(!supervisor.abort_signal().is_set());
        assert!(supervisor.is_running());

        // The replacement worker has the database loaded
        let devices = supervisor
            .query(Command::get_devices(&["scaler".into()], &[]), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(matches!(devices, ScanResult::Devices(lists) if lists.scalers == ["Io"]));
        assert!(supervisor.channels().is_idle());
        assert!(logs_contain("Worker recovered"));
        supervisor.stop().await;
    }
}
