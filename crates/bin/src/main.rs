//! CLI Entry Point for mxscan
//!
//! Provides command-line interface for:
//! - Listing the motors, scalers and detectors of an MX database
//! - Running a raster scan described by a TOML request file
//! - Replaying the data files of a finished scan into the map
//! - The hidden `worker` entry point the controller spawns as its child
//!
//! # Usage
//!
//! ```bash
//! mxscan devices --database /etc/mx/mxmotor.dat
//! mxscan scan --request scan.toml
//! mxscan read --dir /data/user/run1 --formula "log(Io/It)"
//! ```
//!
//! A request file holds the scan fields as entered in a front end:
//!
//! ```toml
//! output_dir = "/data/user"
//! file_name = "run1"
//! x_motor = "smx"
//! x_start = 0.0
//! x_end = 500.0
//! x_step = 100.0
//! y_motor = "smy"
//! y_start = 0.0
//! y_end = 400.0
//! y_step = 100.0
//! scalers = ["Io", "It"]
//! dwell_time = 0.5
//! detector = "None"
//! formula = "log(Io/It)"
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::config::Settings;
use common::DeviceLists;
use experiment::map_data::z_range;
use experiment::{
    Dispatcher, InProcessBackend, ProcessBackend, RawScanFields, ScanFiles, ScanMap, ScanSession,
    UiEvent, WorkerBackend,
};
use hardware::MockInstrument;
use tokio::signal;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mxscan")]
#[command(about = "Raster scans of MX motors with live plotting", long_about = None)]
struct Cli {
    /// Configuration file (TOML format)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Run the worker as a task in this process instead of a child process
    #[arg(long, global = true)]
    in_process: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load an MX database and list its devices
    Devices {
        /// Database file. Defaults to the first available configured database
        #[arg(long)]
        database: Option<PathBuf>,
    },

    /// Run a raster scan
    Scan {
        /// Scan request file (TOML format)
        #[arg(long)]
        request: PathBuf,

        /// Database file. Defaults to the first available configured database
        #[arg(long)]
        database: Option<PathBuf>,
    },

    /// Plot the data files of a finished scan
    Read {
        /// Directory holding the scan's data files
        #[arg(long)]
        dir: PathBuf,

        /// Plot formula over the recorded columns
        #[arg(long, default_value = "It/Io")]
        formula: String,
    },

    /// Serve the worker protocol on stdin/stdout
    #[command(hide = true)]
    Worker,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // The configured level is unknown until the settings are loaded, so
    // loading reports through a temporary subscriber.
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(env_filter("info"))
        .with_writer(std::io::stderr)
        .finish();
    let settings = tracing::subscriber::with_default(bootstrap, || {
        Settings::load(cli.config.clone())
    })
    .context("Failed to load configuration")?;

    // stdout carries the worker protocol, so logs always go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(&settings.log_level))
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    let result = match cli.command {
        Commands::Worker => runtime.block_on(run_worker()),
        Commands::Devices { database } => {
            runtime.block_on(list_devices(&settings, cli.in_process, database))
        }
        Commands::Scan { request, database } => {
            runtime.block_on(run_scan(&settings, cli.in_process, &request, database))
        }
        Commands::Read { dir, formula } => runtime.block_on(run_read(&dir, &formula)),
    };
    // The stdin reader of a worker sits in a blocking read until the next
    // line arrives; do not wait for it.
    runtime.shutdown_background();
    result
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

async fn run_worker() -> Result<()> {
    hardware::stdio::serve_stdio(MockInstrument::new())
        .await
        .context("Worker I/O failed")
}

fn backend(settings: &Settings, in_process: bool) -> Result<Arc<dyn WorkerBackend>> {
    if in_process {
        return Ok(Arc::new(InProcessBackend::new(MockInstrument::new)));
    }
    let backend = match &settings.worker.program {
        Some(program) => ProcessBackend::new(program),
        None => ProcessBackend::current_exe().context("Cannot locate the mxscan executable")?,
    };
    Ok(Arc::new(backend))
}

fn pick_database(settings: &Settings, database: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = database {
        return Ok(path);
    }
    match settings.available_databases().into_iter().next() {
        Some(path) => Ok(path),
        None => bail!("No MX database found. Pass --database or set mx.database in the config"),
    }
}

struct Connection {
    session: ScanSession,
    events: UnboundedReceiver<UiEvent>,
    devices: DeviceLists,
}

/// Start a worker and load `database` into it.
async fn connect(settings: &Settings, in_process: bool, database: &Path) -> Result<Connection> {
    let (dispatcher, events) = Dispatcher::new();
    let mut session = ScanSession::start(backend(settings, in_process)?, settings, dispatcher)
        .await
        .context("Failed to start worker")?;
    match session.select_database(database).await {
        Ok(devices) => Ok(Connection {
            session,
            events,
            devices,
        }),
        Err(e) => {
            session.shutdown().await;
            Err(e).with_context(|| format!("Cannot use database {}", database.display()))
        }
    }
}

async fn list_devices(
    settings: &Settings,
    in_process: bool,
    database: Option<PathBuf>,
) -> Result<()> {
    let database = pick_database(settings, database)?;
    let Connection {
        session, devices, ..
    } = connect(settings, in_process, &database).await?;
    session.shutdown().await;

    println!("Database: {}", database.display());
    println!("Motors:    {}", devices.x_motors.join(", "));
    println!("Scalers:   {}", devices.scalers.join(", "));
    println!("Detectors: {}", devices.detectors.join(", "));
    Ok(())
}

/// Keeps the map of everything plotted so far and reports the formula range.
struct MapPlotSink {
    map: ScanMap,
    formula: String,
}

impl MapPlotSink {
    fn new(x_motor: &str, y_motor: &str, formula: &str) -> Self {
        Self {
            map: ScanMap::new(x_motor, y_motor),
            formula: formula.to_string(),
        }
    }

    /// Add the rows of `path` and re-evaluate the map. Returns the number of
    /// map points.
    async fn update(&mut self, path: &Path) -> Result<usize> {
        let rows = self
            .map
            .read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let points = self.map.evaluate(&self.formula)?;
        match z_range(&points) {
            Some((min, max)) => info!(
                file = %path.display(),
                rows,
                points = points.len(),
                min,
                max,
                "Map updated"
            ),
            None => info!(file = %path.display(), rows, "Map updated, nothing to plot yet"),
        }
        Ok(points.len())
    }
}

async fn run_scan(
    settings: &Settings,
    in_process: bool,
    request: &Path,
    database: Option<PathBuf>,
) -> Result<()> {
    let text = tokio::fs::read_to_string(request)
        .await
        .with_context(|| format!("Failed to read request file {}", request.display()))?;
    let fields: RawScanFields = toml::from_str(&text)
        .with_context(|| format!("Invalid request file {}", request.display()))?;

    let database = pick_database(settings, database)?;
    let Connection {
        session,
        mut events,
        ..
    } = connect(settings, in_process, &database).await?;
    let session = Arc::new(session);

    let scan = match session.start_scan(&fields).await {
        Ok(scan) => scan,
        Err(e) => {
            session.shutdown().await;
            return Err(e.into());
        }
    };

    let abort_session = Arc::clone(&session);
    let ctrl_c = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            println!("Stopping scan...");
            if let Err(e) = abort_session.request_abort().await {
                warn!(error = %e, "Abort request ignored");
            }
        }
    });

    let mut sink = MapPlotSink::new(&fields.x_motor, &fields.y_motor, &fields.formula);
    while let Some(event) = events.recv().await {
        match event {
            UiEvent::Status(status) => println!("Status: {}", status),
            UiEvent::Plot(path) => {
                if let Err(e) = sink.update(&path).await {
                    warn!(error = %e, "Plot update failed");
                }
            }
            UiEvent::ScanFinished {
                datapoints,
                aborted,
            } => {
                let verb = if aborted { "aborted" } else { "complete" };
                println!("Scan {} after {} data file(s)", verb, datapoints);
                break;
            }
            UiEvent::ScanFailed(reason) => {
                println!("Scan failed: {}", reason);
                break;
            }
        }
    }

    ctrl_c.abort();
    let outcome = scan.wait().await;
    session.shutdown().await;
    let outcome = outcome?;
    println!("Data directory: {}", outcome.request.data_dir().display());
    Ok(())
}

/// Replay the data files found in `dir`, in row order.
async fn run_read(dir: &Path, formula: &str) -> Result<()> {
    let scan = ScanFiles::discover(dir)
        .await
        .with_context(|| format!("Cannot read scan data in {}", dir.display()))?;
    let columns = scan.columns().await?;
    let variables: BTreeSet<String> = columns.iter().cloned().collect();
    experiment::formula::validate(formula, &variables)?;
    let [x_motor, y_motor, ..] = columns.as_slice() else {
        bail!("{} has no motor columns", scan.template.display());
    };

    println!("Template:  {}", scan.name);
    println!("Columns:   {}", columns.join(", "));

    let mut sink = MapPlotSink::new(x_motor, y_motor, formula);
    let mut points = 0;
    for file in &scan.files {
        points = sink.update(file).await?;
    }
    println!("Plotted {} file(s), {} point(s)", scan.files.len(), points);
    Ok(())
}
