//! Validated scan request.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Optional area/multichannel detector recorded alongside the scalers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detector {
    pub name: String,
}

/// One motor axis of a raster scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisRange {
    pub motor: String,
    pub start: f64,
    pub end: f64,
    pub step: f64,
}

impl AxisRange {
    /// Build an axis whose step points from `start` toward `end`.
    ///
    /// The magnitude of `step` is kept; only its sign is replaced by
    /// `sign(end - start)`. When `end == start` the step stays positive.
    pub fn normalized(motor: impl Into<String>, start: f64, end: f64, step: f64) -> Self {
        Self {
            motor: motor.into(),
            start,
            end,
            step: normalize_step(start, end, step),
        }
    }

    /// Number of positions visited, `floor((end - start) / step) + 1`.
    pub fn num_steps(&self) -> usize {
        if self.step == 0.0 || !self.step.is_finite() {
            return 1;
        }
        let intervals = ((self.end - self.start) / self.step).floor();
        if intervals.is_finite() && intervals > 0.0 {
            intervals as usize + 1
        } else {
            1
        }
    }

    /// Motor position of the `index`-th point.
    pub fn position(&self, index: usize) -> f64 {
        self.start + self.step * index as f64
    }
}

/// `sign(end - start) * |step|`.
pub fn normalize_step(start: f64, end: f64, step: f64) -> f64 {
    (end - start).signum() * step.abs()
}

/// A scan request that passed validation.
///
/// Created once per scan attempt and consumed by the worker supervisor when
/// the scan is submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    /// Parent directory chosen by the user.
    pub output_dir: PathBuf,
    /// Base name for the scan directory and its data files.
    pub file_name: String,
    pub x: AxisRange,
    pub y: AxisRange,
    /// Pairwise distinct scaler names, in slot order.
    pub scalers: Vec<String>,
    /// Seconds of count integration per point.
    pub dwell_time: f64,
    pub detector: Option<Detector>,
    pub timer: String,
    /// Plot formula over the scaler names.
    pub formula: String,
}

impl ScanRequest {
    /// Directory the worker writes data files into.
    pub fn data_dir(&self) -> PathBuf {
        self.output_dir.join(&self.file_name)
    }

    /// Total number of points in the raster.
    pub fn num_points(&self) -> usize {
        self.x.num_steps() * self.y.num_steps()
    }
}
