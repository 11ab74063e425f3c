//! The scan worker loop.
//!
//! [`Scanner`] owns an [`Instrument`] and serves commands from the command
//! channel until its stop token fires. A failing command is logged and the
//! loop keeps going; the controller learns about trouble from missing results
//! and recovers by replacing the worker.
//!
//! # Abort
//!
//! The abort flag is cooperative. While idle, a set flag makes the worker
//! discard every queued command and clear the flag. During a scan the flag is
//! checked before each row, so an abort takes effect after the current row
//! finishes. An aborted scan does not emit `stop_live_plotting`; the
//! controller injects that sentinel itself.

use common::{
    AbortSignal, ChannelPair, Command, ScanResult, SetDevices, WorkerCommand,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::description::ScanDescription;
use crate::error::WorkerError;
use crate::instrument::Instrument;

/// Everything a worker shares with its controller.
#[derive(Debug, Clone, Default)]
pub struct WorkerLink {
    pub channels: ChannelPair,
    pub abort: AbortSignal,
    /// Fired to ask the worker to exit.
    pub stop: CancellationToken,
}

impl WorkerLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same channels and abort flag, fresh stop token.
    pub fn rebind(&self) -> Self {
        Self {
            channels: self.channels.clone(),
            abort: self.abort.clone(),
            stop: CancellationToken::new(),
        }
    }
}

/// How a scan command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanEnd {
    Completed,
    Aborted,
}

pub struct Scanner<I: Instrument> {
    link: WorkerLink,
    instrument: I,
    plan: Option<SetDevices>,
}

impl<I: Instrument> Scanner<I> {
    pub fn new(link: WorkerLink, instrument: I) -> Self {
        Self {
            link,
            instrument,
            plan: None,
        }
    }

    /// Serve commands until the stop token is cancelled.
    pub async fn run(mut self) {
        let commands = self.link.channels.commands.clone();
        let abort = self.link.abort.clone();
        let stop = self.link.stop.clone();

        info!(driver = self.instrument.driver_type(), "Scan worker started");
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = abort.wait_set() => self.discard_pending(),
                command = commands.recv() => self.handle(command).await,
            }
        }
        self.discard_pending();
        info!("Scan worker stopped");
    }

    /// Drop every queued command and clear the abort flag.
    fn discard_pending(&self) {
        let dropped = self.link.channels.commands.drain();
        if !dropped.is_empty() {
            warn!(count = dropped.len(), "Discarded pending commands");
        }
        self.link.abort.clear();
    }

    async fn handle(&mut self, command: Command) {
        let verb = command.verb;
        debug!(%verb, "Received command");
        let outcome = match WorkerCommand::try_from(command) {
            Ok(command) => self.dispatch(command).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = outcome {
            error!(%verb, error = %e, "Could not run command");
        }
    }

    async fn dispatch(&mut self, command: WorkerCommand) -> Result<(), WorkerError> {
        match command {
            WorkerCommand::StartMxdb { db_path } => {
                info!(path = %db_path.display(), "Loading MX database");
                self.instrument.open_database(&db_path).await?;
            }
            WorkerCommand::GetDevices {
                scaler_classes,
                detector_classes,
            } => {
                let db = self
                    .instrument
                    .database()
                    .ok_or(WorkerError::NotReady("get_devices before start_mxdb"))?;
                let devices = db.classify(&scaler_classes, &detector_classes);
                self.link.channels.results.send(ScanResult::Devices(devices));
            }
            WorkerCommand::SetDevices(plan) => {
                debug!(
                    x_nsteps = plan.x_axis().num_steps(),
                    y_nsteps = plan.y_axis().num_steps(),
                    dir = %plan.dir_path.display(),
                    "Scan configured"
                );
                self.plan = Some(plan);
            }
            WorkerCommand::Scan => {
                let plan = self
                    .plan
                    .clone()
                    .ok_or(WorkerError::NotReady("scan before set_devices"))?;
                let outcome = self.run_scan(&plan).await;
                // A failed scan still ends the live update stream
                if !matches!(outcome, Ok(ScanEnd::Aborted)) {
                    self.link.channels.results.send(ScanResult::StopLivePlotting);
                }
                outcome?;
            }
        }
        Ok(())
    }

    /// One row scan per y position.
    #[instrument(skip_all, fields(dir = %plan.dir_path.display()))]
    async fn run_scan(&mut self, plan: &SetDevices) -> Result<ScanEnd, WorkerError> {
        let prefix = self
            .instrument
            .database()
            .ok_or(WorkerError::NotReady("scan before start_mxdb"))?
            .free_row_prefix();
        let rows = plan.y_axis().num_steps();

        for row in 0..rows {
            if self.link.abort.is_set() || self.link.stop.is_cancelled() {
                warn!(row, rows, "Scan aborted");
                self.discard_pending();
                return Ok(ScanEnd::Aborted);
            }
            let description = ScanDescription::for_row(plan, &prefix, row);
            info!(scan = %description.scan_name, "Scanning");
            debug!(description = %description, "Scan record");

            self.instrument.perform_scan(&description).await?;
            self.link
                .channels
                .results
                .send(ScanResult::Datapoint(description.datafile));
        }
        info!(rows, "All scans are performed");
        Ok(ScanEnd::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use crate::drivers::mock::MockInstrument;

    const DB: &str = "\
smx device motor e500 \"\" \"\" 0 0
smy device motor e500 \"\" \"\" 0 0
Io device scaler e500_scaler \"\" \"\" 0 0
If device mca_value net_mca_value \"\" \"\" 0 0
vortex device mca net_mca \"\" \"\" 4096
";

    fn plan(dir: &Path) -> SetDevices {
        SetDevices {
            dir_path: dir.to_path_buf(),
            x_motor: "smx".into(),
            x_start: 0.0,
            x_step: 100.0,
            x_end: 200.0,
            y_motor: "smy".into(),
            y_start: 0.0,
            y_step: 100.0,
            y_end: 300.0,
            scalers: vec!["Io".into()],
            dwell_time: 0.01,
            detector: None,
            timer: None,
            file_name: "run1".into(),
        }
    }

    fn set_devices(plan: &SetDevices) -> Command {
        let kwargs = match serde_json::to_value(plan).unwrap() {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        Command {
            kwargs,
            ..Command::new(common::Verb::SetDevices)
        }
    }

    fn spawn(link: &WorkerLink) -> tokio::task::JoinHandle<()> {
        tokio::spawn(Scanner::new(link.clone(), MockInstrument::instant()).run())
    }

    async fn next(link: &WorkerLink) -> ScanResult {
        link.channels
            .results
            .recv_timeout(Duration::from_secs(5))
            .await
            .expect("worker produced no result")
    }

    fn write_db(dir: &Path) -> PathBuf {
        let path = dir.join("mxmotor.dat");
        std::fs::write(&path, DB).unwrap();
        path
    }

    #[tokio::test]
    async fn test_get_devices_after_start_mxdb() {
        let dir = tempfile::tempdir().unwrap();
        let link = WorkerLink::new();
        let worker = spawn(&link);

        link.channels
            .commands
            .send(Command::start_mxdb(&write_db(dir.path())));
        link.channels.commands.send(Command::get_devices(
            &["scaler".into(), "mca_value".into()],
            &["mca".into()],
        ));

        match next(&link).await {
            ScanResult::Devices(lists) => {
                assert_eq!(lists.x_motors, vec!["smx", "smy"]);
                assert_eq!(lists.scalers, vec!["Io", "If"]);
                assert_eq!(lists.detectors, vec!["vortex"]);
            }
            other => panic!("expected devices, got {other:?}"),
        }

        link.stop.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_emits_one_datapoint_per_row_then_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let link = WorkerLink::new();
        let worker = spawn(&link);
        let plan = plan(dir.path());

        link.channels
            .commands
            .send(Command::start_mxdb(&write_db(dir.path())));
        link.channels.commands.send(set_devices(&plan));
        link.channels.commands.send(Command::scan());

        for row in 0..4 {
            let expected = dir.path().join(format!("run1.{}", row));
            assert_eq!(next(&link).await, ScanResult::Datapoint(expected.clone()));
            assert!(expected.exists());
        }
        assert_eq!(next(&link).await, ScanResult::StopLivePlotting);

        link.stop.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_second_scan_uses_next_row_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let link = WorkerLink::new();
        let worker = spawn(&link);
        let mut plan = plan(dir.path());
        plan.y_end = 0.0;

        link.channels
            .commands
            .send(Command::start_mxdb(&write_db(dir.path())));
        link.channels.commands.send(set_devices(&plan));
        link.channels.commands.send(Command::scan());
        link.channels.commands.send(Command::scan());

        let mut scan_names = Vec::new();
        for _ in 0..2 {
            let ScanResult::Datapoint(path) = next(&link).await else {
                panic!("expected datapoint");
            };
            let text = std::fs::read_to_string(path).unwrap();
            scan_names.push(text.lines().nth(1).unwrap().to_string());
            assert_eq!(next(&link).await, ScanResult::StopLivePlotting);
        }
        assert_eq!(scan_names, vec!["# scan = row0_0", "# scan = row1_0"]);

        link.stop.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_while_idle_discards_queued_commands() {
        let link = WorkerLink::new();
        link.abort.set();
        link.channels.commands.send(Command::scan());
        link.channels.commands.send(Command::scan());
        let worker = spawn(&link);

        tokio::time::timeout(Duration::from_secs(1), async {
            while link.abort.is_set() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker never cleared the abort flag");
        assert!(link.channels.commands.is_empty());
        assert!(link.channels.results.is_empty());

        link.stop.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_stops_between_rows_without_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let link = WorkerLink::new();
        let instrument = MockInstrument::with_config(crate::drivers::mock::MockInstrumentConfig {
            time_scale: 1.0,
            ..Default::default()
        });
        let worker = tokio::spawn(Scanner::new(link.clone(), instrument).run());
        let mut plan = plan(dir.path());
        plan.y_end = 5000.0;

        link.channels
            .commands
            .send(Command::start_mxdb(&write_db(dir.path())));
        link.channels.commands.send(set_devices(&plan));
        link.channels.commands.send(Command::scan());

        assert!(matches!(next(&link).await, ScanResult::Datapoint(_)));
        link.abort.set();

        // At most the row in flight completes, and no sentinel follows
        tokio::time::sleep(Duration::from_millis(200)).await;
        let rest = link.channels.results.drain();
        assert!(rest.len() <= 1, "{rest:?}");
        assert!(!rest.contains(&ScanResult::StopLivePlotting));
        assert!(!link.abort.is_set());

        link.stop.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_command_does_not_kill_worker() {
        let dir = tempfile::tempdir().unwrap();
        let link = WorkerLink::new();
        let worker = spawn(&link);

        // Scan before configuration and a malformed start_mxdb are both logged
        link.channels.commands.send(Command::scan());
        link.channels
            .commands
            .send(Command::new(common::Verb::StartMxdb));
        link.channels
            .commands
            .send(Command::start_mxdb(&write_db(dir.path())));
        link.channels
            .commands
            .send(Command::get_devices(&["scaler".into()], &[]));

        assert!(matches!(next(&link).await, ScanResult::Devices(_)));
        assert!(!worker.is_finished());

        link.stop.cancel();
        worker.await.unwrap();
    }

    #[test]
    fn test_rebind_keeps_channels() {
        let link = WorkerLink::new();
        link.stop.cancel();
        let fresh = link.rebind();
        assert!(!fresh.stop.is_cancelled());
        fresh.channels.commands.send(Command::scan());
        assert_eq!(link.channels.commands.len(), 1);
    }
}
