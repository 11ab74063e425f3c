//! Simulated MX instrument.
//!
//! Reads a real MX database for device discovery and simulates each row scan
//! by writing a text data file in the MX `sff` layout:
//!
//! ```text
//! # MX scan data file
//! # scan = row0_0
//! # %devices = smx smy Io It vortex;
//! 0.000000 0.000000 500 1000
//! 100.000000 0.000000 412 824
//! ```
//!
//! Only scaler counts are written as columns; detectors appear in the header
//! but record their spectra elsewhere on real hardware.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::database::{DeviceRecord, MxDatabase};
use crate::description::ScanDescription;
use crate::error::{DriverError, DriverErrorKind};
use crate::instrument::Instrument;

const DRIVER_TYPE: &str = "mock_mx";

/// Configuration for [`MockInstrument`].
#[derive(Debug, Clone)]
pub struct MockInstrumentConfig {
    /// Multiplier applied to the dwell time of every point (0 disables sleeping).
    pub time_scale: f64,
    /// Counts per second at the centre of the simulated sample.
    pub peak_rate: f64,
    /// Width of the simulated sample feature, in motor units.
    pub feature_width: f64,
}

impl Default for MockInstrumentConfig {
    fn default() -> Self {
        Self {
            time_scale: 1.0,
            peak_rate: 1000.0,
            feature_width: 250.0,
        }
    }
}

pub struct MockInstrument {
    config: MockInstrumentConfig,
    database: Option<MxDatabase>,
}

impl Default for MockInstrument {
    fn default() -> Self {
        Self::new()
    }
}

impl MockInstrument {
    pub fn new() -> Self {
        Self::with_config(MockInstrumentConfig::default())
    }

    pub fn with_config(config: MockInstrumentConfig) -> Self {
        Self {
            config,
            database: None,
        }
    }

    /// Instrument that does not sleep between points.
    pub fn instant() -> Self {
        Self::with_config(MockInstrumentConfig {
            time_scale: 0.0,
            ..MockInstrumentConfig::default()
        })
    }

    fn error(kind: DriverErrorKind, message: impl Into<String>) -> DriverError {
        DriverError::new(DRIVER_TYPE, kind, message)
    }

    fn point_duration(&self, dwell_time: f64) -> Result<Duration, DriverError> {
        Duration::try_from_secs_f64(dwell_time * self.config.time_scale).map_err(|e| {
            Self::error(
                DriverErrorKind::InvalidParameter,
                format!("Invalid measurement time {}: {}", dwell_time, e),
            )
        })
    }

    /// Simulated counts of input `channel` at (x, y).
    fn counts(&self, channel: usize, x: f64, y: f64, dwell_time: f64) -> u64 {
        let w = self.config.feature_width.max(f64::EPSILON);
        let feature = (-(x * x + y * y) / (2.0 * w * w)).exp();
        let gain = 1.0 / (channel + 1) as f64;
        let rate = self.config.peak_rate * (0.5 + feature) * gain;
        (rate * dwell_time).round().max(1.0) as u64
    }

    fn check_devices(db: &MxDatabase, description: &ScanDescription) -> Result<(), DriverError> {
        let names = [&description.x_motor, &description.y_motor]
            .into_iter()
            .map(String::as_str)
            .chain(description.inputs());
        for name in names {
            if !db.contains(name) {
                return Err(Self::error(
                    DriverErrorKind::InvalidParameter,
                    format!("Record '{}' is not in database {}", name, db.path().display()),
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Instrument for MockInstrument {
    fn driver_type(&self) -> &'static str {
        DRIVER_TYPE
    }

    async fn open_database(&mut self, path: &Path) -> Result<(), DriverError> {
        let db = MxDatabase::load(path).await?;
        info!(path = %path.display(), records = db.records().len(), "MX database loaded");
        self.database = Some(db);
        Ok(())
    }

    fn database(&self) -> Option<&MxDatabase> {
        self.database.as_ref()
    }

    async fn perform_scan(&mut self, description: &ScanDescription) -> Result<(), DriverError> {
        let point_duration = self.point_duration(description.measurement_time)?;
        let db = self.database.as_mut().ok_or_else(|| {
            Self::error(DriverErrorKind::Configuration, "No MX database loaded")
        })?;
        Self::check_devices(db, description)?;
        db.add(DeviceRecord {
            fields: description.to_string(),
            ..DeviceRecord::new(
                description.scan_name.clone(),
                "scan",
                "linear_scan",
                "motor_scan",
            )
        })?;

        let io_error = |e: std::io::Error| {
            Self::error(
                DriverErrorKind::Communication,
                format!("Failed to write {}: {}", description.datafile.display(), e),
            )
        };

        let mut file = tokio::fs::File::create(&description.datafile)
            .await
            .map_err(io_error)?;
        let mut devices = vec![description.x_motor.as_str(), description.y_motor.as_str()];
        devices.extend(description.inputs());
        let header = format!(
            "# MX scan data file\n# scan = {}\n# %devices = {};\n",
            description.scan_name,
            devices.join(" ")
        );
        file.write_all(header.as_bytes()).await.map_err(io_error)?;

        for index in 0..description.x_nsteps {
            if !point_duration.is_zero() {
                tokio::time::sleep(point_duration).await;
            }
            let x = description.x_position(index);
            let mut line = format!("{:.6} {:.6}", x, description.y);
            for channel in 0..description.scalers.len() {
                let counts = self.counts(channel, x, description.y, description.measurement_time);
                line.push_str(&format!(" {}", counts));
            }
            line.push('\n');
            file.write_all(line.as_bytes()).await.map_err(io_error)?;
        }
        file.flush().await.map_err(io_error)?;

        debug!(
            scan = %description.scan_name,
            points = description.x_nsteps,
            path = %description.datafile.display(),
            "Row scan written"
        );
        Ok(())
    }
}
