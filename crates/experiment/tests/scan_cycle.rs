//! End-to-end scan cycles against in-process workers.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::config::Settings;
use common::{ScanError, ValidationError};
use experiment::{
    Dispatcher, InProcessBackend, RawScanFields, ScanSession, SessionState, SessionStatus,
    UiEvent, WorkerBackend, WorkerExit, WorkerHandle,
};
use hardware::drivers::mock::MockInstrumentConfig;
use hardware::{
    DriverError, Instrument, MockInstrument, MxDatabase, ScanDescription, WorkerLink,
};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

const DATABASE: &str = r#"
smx        device  motor       e500         ""  ""  0 0 -1e8 1e8 0 -1 -1 0.1 0 um
smy        device  motor       e500         ""  ""  0 0 -1e8 1e8 0 -1 -1 0.1 0 um
Io         device  scaler      e500_scaler  ""  ""  0 0 0x0 joerger_timer
It         device  scaler      e500_scaler  ""  ""  0 0 0x0 joerger_timer
vortex     device  mca         net_mca      ""  ""  4096
joerger_timer device timer     e500_timer   ""  ""
"#;

struct Fixture {
    dir: TempDir,
    database: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let database = dir.path().join("mxmotor.dat");
        std::fs::write(&database, DATABASE).unwrap();
        std::fs::create_dir(dir.path().join("data")).unwrap();
        Self { dir, database }
    }

    fn output_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    fn fields(&self, file_name: &str, dwell_time: f64) -> RawScanFields {
        RawScanFields {
            output_dir: self.output_dir(),
            file_name: file_name.into(),
            x_motor: "smx".into(),
            x_start: 0.0,
            x_end: 500.0,
            x_step: 100.0,
            y_motor: "smy".into(),
            y_start: 0.0,
            y_end: 400.0,
            y_step: -100.0,
            scalers: vec!["Io".into(), "It".into()],
            dwell_time,
            detector: Some("None".into()),
            formula: "It/Io".into(),
        }
    }
}

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.mx.database.clear();
    settings.worker.query_timeout_ms = 2_000;
    settings.worker.stop_timeout_ms = 200;
    settings.worker.abort_grace_ms = 100;
    settings.worker.poll_interval_ms = 5;
    settings
}

async fn session_with<F, I>(factory: F) -> (ScanSession, UnboundedReceiver<UiEvent>)
where
    F: Fn() -> I + Send + Sync + 'static,
    I: Instrument + 'static,
{
    let (dispatcher, events) = Dispatcher::new();
    let session = ScanSession::start(
        Arc::new(InProcessBackend::new(factory)),
        &settings(),
        dispatcher,
    )
    .await
    .unwrap();
    (session, events)
}

/// Drain events until the scan cycle reports completion.
async fn collect_until_finished(events: &mut UnboundedReceiver<UiEvent>) -> Vec<UiEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("scan cycle did not finish")
            .expect("dispatcher dropped");
        let done = matches!(event, UiEvent::ScanFinished { .. } | UiEvent::ScanFailed(_));
        seen.push(event);
        if done {
            return seen;
        }
    }
}

fn plots(events: &[UiEvent]) -> Vec<PathBuf> {
    events
        .iter()
        .filter_map(|e| match e {
            UiEvent::Plot(path) => Some(path.clone()),
            _ => None,
        })
        .collect()
}

/// Loads databases normally but never finishes a scan.
struct WedgedInstrument {
    database: Option<MxDatabase>,
}

#[async_trait]
impl Instrument for WedgedInstrument {
    fn driver_type(&self) -> &'static str {
        "wedged"
    }

    async fn open_database(&mut self, path: &Path) -> Result<(), DriverError> {
        self.database = Some(MxDatabase::load(path).await?);
        Ok(())
    }

    fn database(&self) -> Option<&MxDatabase> {
        self.database.as_ref()
    }

    async fn perform_scan(&mut self, _description: &ScanDescription) -> Result<(), DriverError> {
        std::future::pending().await
    }
}

/// In-process backend whose `fail_on`-th launch (counting from zero) fails.
struct FlakyBackend {
    inner: InProcessBackend<fn() -> MockInstrument>,
    launches: AtomicUsize,
    fail_on: usize,
}

#[async_trait]
impl WorkerBackend for FlakyBackend {
    async fn launch(&self, link: WorkerLink) -> common::Result<Box<dyn WorkerHandle>> {
        if self.launches.fetch_add(1, Ordering::SeqCst) == self.fail_on {
            return Err(ScanError::WorkerSpawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no binary",
            )));
        }
        self.inner.launch(link).await
    }
}

#[tokio::test]
async fn test_full_scan_cycle_returns_to_connected() {
    let fixture = Fixture::new();
    let (mut session, mut events) = session_with(MockInstrument::instant).await;
    assert_eq!(session.state().await, SessionState::Uninitialized);

    let devices = session.select_database(&fixture.database).await.unwrap();
    assert_eq!(devices.x_motors, vec!["smx", "smy"]);
    assert_eq!(devices.scalers, vec!["Io", "It"]);
    assert_eq!(devices.detectors, vec!["vortex"]);
    assert_eq!(session.state().await, SessionState::Connected);

    let scan = session.start_scan(&fixture.fields("run1", 0.5)).await.unwrap();
    let seen = collect_until_finished(&mut events).await;
    let outcome = scan.wait().await.unwrap();

    assert_eq!(outcome.request.x.step, 100.0);
    assert_eq!(outcome.request.y.step, 100.0);
    assert!(!outcome.aborted);
    assert_eq!(outcome.summary.datapoints, 5);
    assert_eq!(outcome.recovery.previous_exit, WorkerExit::Clean);
    assert_eq!(outcome.recovery.drained_results, 0);

    let run_dir = fixture.output_dir().join("run1");
    assert!(run_dir.is_dir());
    let files = plots(&seen);
    assert_eq!(files.len(), 5);
    for file in &files {
        assert!(file.starts_with(&run_dir));
        assert!(file.is_file(), "missing data file {}", file.display());
    }

    assert!(seen.contains(&UiEvent::Status(SessionStatus::Scanning)));
    assert_eq!(
        seen.last(),
        Some(&UiEvent::ScanFinished {
            datapoints: 5,
            aborted: false
        })
    );
    assert_eq!(session.state().await, SessionState::Connected);

    session.shutdown().await;
}

#[tokio::test]
async fn test_replacement_worker_runs_next_scan() {
    let fixture = Fixture::new();
    let (mut session, mut events) = session_with(MockInstrument::instant).await;
    session.select_database(&fixture.database).await.unwrap();

    for name in ["first", "second"] {
        let scan = session.start_scan(&fixture.fields(name, 0.1)).await.unwrap();
        collect_until_finished(&mut events).await;
        let outcome = scan.wait().await.unwrap();
        assert_eq!(outcome.summary.datapoints, 5);
        assert!(fixture.output_dir().join(name).is_dir());
    }
    assert_eq!(session.state().await, SessionState::Connected);

    session.shutdown().await;
}

#[tokio::test]
async fn test_abort_stops_slow_scan_between_rows() {
    let fixture = Fixture::new();
    let slow = || {
        MockInstrument::with_config(MockInstrumentConfig {
            time_scale: 1.0,
            ..MockInstrumentConfig::default()
        })
    };
    let (mut session, mut events) = session_with(slow).await;
    session.select_database(&fixture.database).await.unwrap();

    // 6 points per row at 50ms each
    let scan = session.start_scan(&fixture.fields("slow", 0.05)).await.unwrap();
    loop {
        match events.recv().await.unwrap() {
            UiEvent::Plot(_) => break,
            UiEvent::ScanFinished { .. } | UiEvent::ScanFailed(_) => {
                panic!("scan finished before abort")
            }
            UiEvent::Status(_) => {}
        }
    }
    session.request_abort().await.unwrap();
    assert_eq!(session.state().await, SessionState::Aborting);

    let seen = collect_until_finished(&mut events).await;
    assert!(seen.contains(&UiEvent::Status(SessionStatus::Stopping)));
    let outcome = scan.wait().await.unwrap();
    assert!(outcome.aborted);
    assert!(outcome.summary.datapoints >= 1);
    assert!(outcome.summary.datapoints < 5);
    assert_eq!(session.state().await, SessionState::Connected);

    // The replacement worker accepts a new scan
    let scan = session.start_scan(&fixture.fields("after", 0.001)).await.unwrap();
    collect_until_finished(&mut events).await;
    assert!(!scan.wait().await.unwrap().aborted);

    session.shutdown().await;
}

#[tokio::test]
async fn test_abort_ends_wedged_scan() {
    let fixture = Fixture::new();
    let (mut session, mut events) = session_with(|| WedgedInstrument { database: None }).await;
    session.select_database(&fixture.database).await.unwrap();

    let scan = session.start_scan(&fixture.fields("wedged", 0.5)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!scan.is_finished());

    let started = Instant::now();
    session.request_abort().await.unwrap();
    collect_until_finished(&mut events).await;
    let outcome = scan.wait().await.unwrap();

    // abort grace (100ms) + stop timeout (200ms) + slack
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(outcome.aborted);
    assert_eq!(outcome.summary.datapoints, 0);
    assert_eq!(outcome.recovery.previous_exit, WorkerExit::Killed);
    assert_eq!(session.state().await, SessionState::Connected);

    session.shutdown().await;
}

#[tokio::test]
async fn test_invalid_request_leaves_session_connected() {
    let fixture = Fixture::new();
    let (mut session, _events) = session_with(MockInstrument::instant).await;
    session.select_database(&fixture.database).await.unwrap();

    let mut fields = fixture.fields("dup", 0.5);
    fields.scalers = vec!["Io".into(), "Io".into()];
    let err = session.start_scan(&fields).await.err().unwrap();
    assert!(matches!(
        err,
        ScanError::Validation(ValidationError::DuplicateScaler(ref name)) if name == "Io"
    ));
    assert_eq!(session.state().await, SessionState::Connected);

    let err = session
        .start_scan(&fixture.fields("bad name", 0.5))
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        ScanError::Validation(ValidationError::InvalidFileName(_))
    ));
    assert!(!fixture.output_dir().join("bad name").exists());
    assert_eq!(session.state().await, SessionState::Connected);

    session.shutdown().await;
}

#[tokio::test]
async fn test_scan_requires_database() {
    let fixture = Fixture::new();
    let (session, _events) = session_with(MockInstrument::instant).await;

    let err = session
        .start_scan(&fixture.fields("run1", 0.5))
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        ScanError::Validation(ValidationError::NoDatabaseSelected)
    ));
    assert_eq!(session.state().await, SessionState::Uninitialized);

    session.shutdown().await;
}

#[tokio::test]
async fn test_abort_outside_scan_is_rejected() {
    let fixture = Fixture::new();
    let (mut session, _events) = session_with(MockInstrument::instant).await;

    let err = session.request_abort().await.unwrap_err();
    assert!(matches!(err, ScanError::InvalidState { .. }));

    let err = session
        .select_database(&fixture.dir.path().join("missing.dat"))
        .await
        .unwrap_err();
    assert!(matches!(err, ScanError::DatabaseNotFound(_)));
    assert_eq!(session.state().await, SessionState::Uninitialized);

    session.select_database(&fixture.database).await.unwrap();
    let err = session.request_abort().await.unwrap_err();
    assert!(matches!(err, ScanError::InvalidState { .. }));
    assert_eq!(session.state().await, SessionState::Connected);

    session.shutdown().await;
}

#[tokio::test]
async fn test_failed_respawn_ends_cycle_and_next_database_restarts_worker() {
    let fixture = Fixture::new();
    let backend = Arc::new(FlakyBackend {
        inner: InProcessBackend::new(MockInstrument::instant),
        launches: AtomicUsize::new(0),
        fail_on: 1,
    });
    let (dispatcher, mut events) = Dispatcher::new();
    let mut session = ScanSession::start(backend.clone(), &settings(), dispatcher)
        .await
        .unwrap();
    session.select_database(&fixture.database).await.unwrap();

    let scan = session.start_scan(&fixture.fields("run1", 0.1)).await.unwrap();
    let seen = collect_until_finished(&mut events).await;
    assert!(matches!(
        seen.last(),
        Some(UiEvent::ScanFailed(reason)) if reason.contains("no binary")
    ));
    assert!(seen.contains(&UiEvent::Status(SessionStatus::SelectDatabase)));
    assert!(matches!(scan.wait().await, Err(ScanError::WorkerSpawn(_))));
    assert_eq!(session.state().await, SessionState::Uninitialized);

    // Selecting the database again brings a worker back
    let devices = tokio::time::timeout(
        Duration::from_secs(5),
        session.select_database(&fixture.database),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(devices.x_motors, vec!["smx", "smy"]);
    assert_eq!(backend.launches.load(Ordering::SeqCst), 3);
    assert_eq!(session.state().await, SessionState::Connected);

    let scan = session.start_scan(&fixture.fields("run2", 0.1)).await.unwrap();
    collect_until_finished(&mut events).await;
    assert_eq!(scan.wait().await.unwrap().summary.datapoints, 5);

    session.shutdown().await;
}
