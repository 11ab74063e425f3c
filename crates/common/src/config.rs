//! Configuration management for the scan controller.
//!
//! Settings are layered with Figment:
//!
//! 1. Base layer: hardcoded defaults from `Settings::default()`
//! 2. File layer: a TOML file (explicit path, `/etc/mxscan.toml`, or
//!    `config/mxscan.toml`; a missing file only warns)
//! 3. Environment layer: variables prefixed with `MXSCAN_`, nested fields
//!    separated by double underscores
//!
//! ## Schema
//!
//! ```toml
//! log_level = "info"
//!
//! [mx]
//! database = "/opt/mx/etc/mvortex.dat,/etc/mx/mxmotor.dat"
//! scaler_classes = "scaler,mca_value"
//! detector_classes = "mca,area_detector"
//! timer = "joerger_timer"
//!
//! [worker]
//! query_timeout_ms = 30000
//! stop_timeout_ms = 5000
//! abort_grace_ms = 1000
//! poll_interval_ms = 10
//! ```
//!
//! The `mx` lists accept either a comma-separated string or a TOML array, so
//! they can also be overridden from the environment, e.g.
//! `MXSCAN_MX__DATABASE=/etc/mx/a.dat,/etc/mx/b.dat`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::{Figment, Provider};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, ScanError};

/// System-wide configuration file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/mxscan.toml";
/// Configuration file next to the working directory.
pub const LOCAL_CONFIG_PATH: &str = "config/mxscan.toml";
/// Environment variable naming an extra database file.
pub const DATABASE_ENV: &str = "MXDATABASE";
/// Environment variable naming the MX installation directory.
pub const MXDIR_ENV: &str = "MXDIR";
/// MX installation directory used when `MXDIR` is unset.
pub const DEFAULT_MXDIR: &str = "/opt/mx";

impl Provider for Settings {
    fn metadata(&self) -> figment::Metadata {
        figment::Metadata::named("Library Defaults")
    }

    fn data(
        &self,
    ) -> std::result::Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error>
    {
        Serialized::defaults(Settings::default()).data()
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Logging verbosity ("error", "warn", "info", "debug", "trace").
    pub log_level: String,

    /// Instrument database and device classification.
    pub mx: MxSettings,

    /// Worker process lifecycle and protocol timing.
    pub worker: WorkerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            mx: MxSettings::default(),
            worker: WorkerSettings::default(),
        }
    }
}

/// `[mx]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MxSettings {
    /// Candidate database files, in picker order.
    #[serde(deserialize_with = "comma_list")]
    pub database: Vec<String>,

    /// `mx_class` values reported as scalers.
    #[serde(deserialize_with = "comma_list")]
    pub scaler_classes: Vec<String>,

    /// `mx_class` values reported as detectors.
    #[serde(deserialize_with = "comma_list")]
    pub detector_classes: Vec<String>,

    /// Timer record used for preset-time measurements.
    pub timer: String,
}

impl Default for MxSettings {
    fn default() -> Self {
        Self {
            database: vec![
                "/opt/mx/etc/mvortex.dat".to_string(),
                "/etc/mx/mxmotor.dat".to_string(),
            ],
            scaler_classes: vec!["scaler".to_string(), "mca_value".to_string()],
            detector_classes: vec!["mca".to_string(), "area_detector".to_string()],
            timer: "joerger_timer".to_string(),
        }
    }
}

/// `[worker]` section. All durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Worker executable. Defaults to the running binary.
    #[serde(default)]
    pub program: Option<PathBuf>,

    /// Upper bound for a blocking `get_devices` query.
    pub query_timeout_ms: u64,

    /// How long `stop()` waits for a graceful exit before killing.
    pub stop_timeout_ms: u64,

    /// Time the worker gets to notice an abort before live updates are cut.
    pub abort_grace_ms: u64,

    /// Live-update receive tick.
    pub poll_interval_ms: u64,

    /// Poll interval while waiting for a new scan directory to appear.
    pub directory_poll_interval_ms: u64,

    /// Give up on a new scan directory after this long.
    pub directory_timeout_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            program: None,
            query_timeout_ms: 30_000,
            stop_timeout_ms: 5_000,
            abort_grace_ms: 1_000,
            poll_interval_ms: 10,
            directory_poll_interval_ms: 1,
            directory_timeout_ms: 2_000,
        }
    }
}

impl WorkerSettings {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn directory_poll_interval(&self) -> Duration {
        Duration::from_millis(self.directory_poll_interval_ms)
    }

    pub fn directory_timeout(&self) -> Duration {
        Duration::from_millis(self.directory_timeout_ms)
    }
}

/// The static instrument configuration handed to the controller at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentConfig {
    pub database_paths: Vec<PathBuf>,
    pub scaler_class_names: Vec<String>,
    pub detector_class_names: Vec<String>,
    pub timer_name: String,
}

fn comma_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Joined(String),
        List(Vec<String>),
    }

    let items = match Raw::deserialize(deserializer)? {
        Raw::Joined(joined) => joined.split(',').map(str::to_string).collect(),
        Raw::List(list) => list,
    };
    Ok(items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect())
}

fn validate_timeout_range(value: u64, min: u64, max: u64, name: &str) -> Result<()> {
    if !(min..=max).contains(&value) {
        return Err(ScanError::Config(format!(
            "'{name}' = {value}ms is out of valid range ({min}ms - {max}ms). Check [worker] in config."
        )));
    }
    Ok(())
}

impl Settings {
    /// Load configuration from defaults, an optional TOML file and `MXSCAN_`
    /// environment variables, then validate it.
    ///
    /// Without an explicit path, `/etc/mxscan.toml` is tried first, then
    /// `config/mxscan.toml`.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let mut figment = Figment::from(Settings::default());

        match config_path.or_else(default_config_path) {
            Some(path) if path.exists() => {
                debug!(path = %path.display(), "Loading configuration file");
                figment = figment.merge(Toml::file(&path));
            }
            Some(path) => {
                warn!(path = %path.display(), "Config file not found. Using defaults.");
            }
            None => {
                warn!(
                    "Neither {} nor {} exists. Default configuration will be used instead.",
                    SYSTEM_CONFIG_PATH, LOCAL_CONFIG_PATH
                );
            }
        }

        figment = figment.merge(Env::prefixed("MXSCAN_").split("__"));
        Self::from_figment(figment)
    }

    /// Extract and validate settings from an assembled figment.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let settings: Settings = figment
            .extract()
            .map_err(|e| ScanError::Config(format!("Failed to extract configuration: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic checks beyond what deserialisation enforces.
    pub fn validate(&self) -> Result<()> {
        const MAX_MS: u64 = 600_000;

        if self.mx.scaler_classes.is_empty() {
            return Err(ScanError::Config(
                "mx.scaler_classes must name at least one class".to_string(),
            ));
        }
        if self.mx.timer.trim().is_empty() {
            return Err(ScanError::Config("mx.timer must not be empty".to_string()));
        }

        let w = &self.worker;
        validate_timeout_range(w.query_timeout_ms, 10, MAX_MS, "query_timeout_ms")?;
        validate_timeout_range(w.stop_timeout_ms, 10, MAX_MS, "stop_timeout_ms")?;
        validate_timeout_range(w.abort_grace_ms, 0, MAX_MS, "abort_grace_ms")?;
        validate_timeout_range(w.poll_interval_ms, 1, 10_000, "poll_interval_ms")?;
        validate_timeout_range(
            w.directory_poll_interval_ms,
            1,
            10_000,
            "directory_poll_interval_ms",
        )?;
        validate_timeout_range(w.directory_timeout_ms, 1, MAX_MS, "directory_timeout_ms")?;
        Ok(())
    }

    /// Database files that can actually be opened, in picker order.
    ///
    /// Configured paths come first, then `$MXDATABASE`, then
    /// `<mxdir>/etc/mxmotor.dat`. Missing files and duplicates are skipped.
    pub fn available_databases(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for db in &self.mx.database {
            push_existing(&mut found, PathBuf::from(db));
        }
        if let Some(db) = std::env::var_os(DATABASE_ENV) {
            push_existing(&mut found, PathBuf::from(db));
        }
        push_existing(&mut found, mx_dir().join("etc").join("mxmotor.dat"));
        found
    }

    /// The static instrument record consumed by the controller.
    pub fn instrument_config(&self) -> InstrumentConfig {
        InstrumentConfig {
            database_paths: self.available_databases(),
            scaler_class_names: self.mx.scaler_classes.clone(),
            detector_class_names: self.mx.detector_classes.clone(),
            timer_name: self.mx.timer.clone(),
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    [SYSTEM_CONFIG_PATH, LOCAL_CONFIG_PATH]
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

fn push_existing(found: &mut Vec<PathBuf>, candidate: PathBuf) {
    let candidate = normalize(&candidate);
    if candidate.exists() && !found.contains(&candidate) {
        found.push(candidate);
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.components().collect()
}

/// MX installation directory (`$MXDIR`, else `/opt/mx`).
pub fn mx_dir() -> PathBuf {
    std::env::var_os(MXDIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MXDIR))
}
