//! Turns raw front-end fields into a validated [`ScanRequest`].
//!
//! Checks run in a fixed order and the first violation is reported:
//!
//! 1. a database is selected
//! 2. scaler names are pairwise distinct
//! 3. the formula evaluates against the scaler names
//! 4. the output directory exists
//! 5. the file name is alphanumeric once `_` and `-` are removed
//! 6. the dwell time is positive
//! 7. neither axis has a zero step
//!
//! Steps are then normalised to point from start toward end. [`RequestBuilder::build`]
//! also creates `output_dir/file_name` and waits until the filesystem reports it.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::{AxisRange, Detector, ScanRequest, ValidationError};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::context::SessionContext;
use crate::formula;

/// Detector value meaning "no detector".
pub const NO_DETECTOR: &str = "None";

/// Scan fields as entered by the user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawScanFields {
    pub output_dir: PathBuf,
    pub file_name: String,
    pub x_motor: String,
    pub x_start: f64,
    pub x_end: f64,
    pub x_step: f64,
    pub y_motor: String,
    pub y_start: f64,
    pub y_end: f64,
    pub y_step: f64,
    pub scalers: Vec<String>,
    pub dwell_time: f64,
    pub detector: Option<String>,
    pub formula: String,
}

pub struct RequestBuilder<'a> {
    context: &'a SessionContext,
    poll_interval: Duration,
    timeout: Duration,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(context: &'a SessionContext) -> Self {
        Self {
            context,
            poll_interval: Duration::from_millis(1),
            timeout: Duration::from_secs(2),
        }
    }

    /// How often, and for how long, to wait for the scan directory to appear.
    pub fn with_directory_wait(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.timeout = timeout;
        self
    }

    /// Validate and normalise without touching the filesystem beyond checks.
    pub fn validate(&self, raw: &RawScanFields) -> Result<ScanRequest, ValidationError> {
        if self.context.database().is_none() {
            return Err(ValidationError::NoDatabaseSelected);
        }

        let mut seen = BTreeSet::new();
        for scaler in &raw.scalers {
            if !seen.insert(scaler.clone()) {
                return Err(ValidationError::DuplicateScaler(scaler.clone()));
            }
        }

        formula::validate(&raw.formula, &seen)?;

        if !raw.output_dir.is_dir() {
            return Err(ValidationError::OutputDirectoryMissing(raw.output_dir.clone()));
        }

        if !is_valid_file_name(&raw.file_name) {
            return Err(ValidationError::InvalidFileName(raw.file_name.clone()));
        }

        if !(raw.dwell_time.is_finite() && raw.dwell_time > 0.0) {
            return Err(ValidationError::InvalidDwellTime(raw.dwell_time));
        }

        for (axis, step) in [('x', raw.x_step), ('y', raw.y_step)] {
            if step == 0.0 || !step.is_finite() {
                return Err(ValidationError::ZeroStep { axis });
            }
        }

        let detector = raw
            .detector
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty() && *name != NO_DETECTOR)
            .map(|name| Detector {
                name: name.to_string(),
            });

        Ok(ScanRequest {
            output_dir: raw.output_dir.clone(),
            file_name: raw.file_name.clone(),
            x: AxisRange::normalized(raw.x_motor.clone(), raw.x_start, raw.x_end, raw.x_step),
            y: AxisRange::normalized(raw.y_motor.clone(), raw.y_start, raw.y_end, raw.y_step),
            scalers: raw.scalers.clone(),
            dwell_time: raw.dwell_time,
            detector,
            timer: self.context.timer().to_string(),
            formula: raw.formula.clone(),
        })
    }

    /// Validate, then make sure the scan directory exists before returning.
    pub async fn build(&self, raw: &RawScanFields) -> common::Result<ScanRequest> {
        let request = self.validate(raw)?;
        ensure_directory(&request.data_dir(), self.poll_interval, self.timeout).await?;
        debug!(
            x_step = request.x.step,
            y_step = request.y.step,
            points = request.num_points(),
            "Scan request built"
        );
        Ok(request)
    }
}

/// Letters and digits only, once `_` and `-` are removed; never empty.
pub fn is_valid_file_name(name: &str) -> bool {
    let stripped: String = name.chars().filter(|c| *c != '_' && *c != '-').collect();
    !stripped.is_empty() && stripped.chars().all(char::is_alphanumeric)
}

/// Create `path` if missing, then poll until it is visible or `timeout` elapses.
pub async fn ensure_directory(
    path: &Path,
    poll_interval: Duration,
    timeout: Duration,
) -> common::Result<()> {
    if tokio::fs::try_exists(path).await? {
        return Ok(());
    }
    match tokio::fs::create_dir(path).await {
        Ok(()) => info!(path = %path.display(), "Created scan directory"),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e.into()),
    }

    let deadline = Instant::now() + timeout;
    loop {
        if tokio::fs::try_exists(path).await? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(ValidationError::OutputDirectoryNotConfirmed {
                path: path.to_path_buf(),
                timeout,
            }
            .into());
        }
        tokio::time::sleep(poll_interval).await;
    }
}
