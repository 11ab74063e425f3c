//! Per-session state shared by the request builder and the supervisor.

use std::path::{Path, PathBuf};

use common::config::InstrumentConfig;

/// Database selection and instrument configuration for one controller run.
///
/// The database is chosen once per session and replayed to every fresh worker.
#[derive(Debug, Clone)]
pub struct SessionContext {
    instrument: InstrumentConfig,
    database: Option<PathBuf>,
}

impl SessionContext {
    pub fn new(instrument: InstrumentConfig) -> Self {
        Self {
            instrument,
            database: None,
        }
    }

    pub fn instrument(&self) -> &InstrumentConfig {
        &self.instrument
    }

    /// The selected database, `None` while the picker shows the placeholder.
    pub fn database(&self) -> Option<&Path> {
        self.database.as_deref()
    }

    pub fn set_database(&mut self, path: PathBuf) {
        self.database = Some(path);
    }

    pub fn timer(&self) -> &str {
        &self.instrument.timer_name
    }

    pub fn scaler_classes(&self) -> &[String] {
        &self.instrument.scaler_class_names
    }

    pub fn detector_classes(&self) -> &[String] {
        &self.instrument.detector_class_names
    }
}
