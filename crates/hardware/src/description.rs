//! MX linear motor scan descriptions.
//!
//! Each row of a raster is a separate one-dimensional scan record. The record
//! is described by a single line in MX database syntax:
//!
//! ```text
//! row0_0 scan linear_scan motor_scan "" "" 1 2 2 smx smy 2 Io It 0 0.000000 preset_time "0.500000 joerger_timer" sff /data/run1/run1.0 none $f[0] 0.000000 0.000000 100.000000 1.000000 6 1
//! ```

use std::fmt;
use std::path::PathBuf;

use common::SetDevices;

/// Timer used when the request does not name one.
pub const DEFAULT_TIMER: &str = "joerger_timer";

const NUM_SCANS: u32 = 1;
const NUM_MOTORS: u32 = 2;
const SCAN_FLAGS: u32 = 0x0;
const SETTLING_TIME: f64 = 0.0;

/// One row scan: the x axis is swept, y is held at a fixed position.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanDescription {
    pub scan_name: String,
    pub x_motor: String,
    pub y_motor: String,
    pub scalers: Vec<String>,
    pub detector: Option<String>,
    pub measurement_time: f64,
    pub timer: String,
    pub datafile: PathBuf,
    pub x_start: f64,
    pub x_step: f64,
    pub x_nsteps: usize,
    pub y: f64,
}

impl ScanDescription {
    /// Description of row `row` of the raster configured by `plan`.
    pub fn for_row(plan: &SetDevices, prefix: &str, row: usize) -> Self {
        let x = plan.x_axis();
        let y = plan.y_axis();

        let timer = match plan.timer.as_deref() {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => DEFAULT_TIMER.to_string(),
        };

        Self {
            scan_name: format!("{}{}", prefix, row),
            x_motor: x.motor.clone(),
            y_motor: y.motor.clone(),
            scalers: plan.scalers.clone(),
            detector: plan.detector.as_ref().map(|d| d.name.clone()),
            measurement_time: plan.dwell_time,
            timer,
            datafile: datafile_path(plan, row, y.num_steps()),
            x_start: x.start,
            x_step: x.step,
            x_nsteps: x.num_steps(),
            y: y.position(row),
        }
    }

    /// Scalers followed by the detector, if any.
    pub fn inputs(&self) -> impl Iterator<Item = &str> {
        self.scalers
            .iter()
            .map(String::as_str)
            .chain(self.detector.as_deref())
    }

    /// Motor position of point `index` along the row.
    pub fn x_position(&self, index: usize) -> f64 {
        self.x_start + self.x_step * index as f64
    }
}

/// `<dir_path>/<file_name>.<row>`, the row zero-padded to the width of `y_nsteps`.
pub fn datafile_path(plan: &SetDevices, row: usize, y_nsteps: usize) -> PathBuf {
    let width = y_nsteps.to_string().len();
    plan.dir_path
        .join(format!("{}.{:0width$}", plan.file_name, row, width = width))
}

impl fmt::Display for ScanDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} scan linear_scan motor_scan \"\" \"\" {} {} {} {} {} {}",
            self.scan_name,
            NUM_SCANS,
            NUM_MOTORS,
            NUM_MOTORS,
            self.x_motor,
            self.y_motor,
            self.inputs().count()
        )?;
        for input in self.inputs() {
            write!(f, " {}", input)?;
        }
        write!(
            f,
            " {:x} {:.6} preset_time \"{:.6} {}\" sff {} none $f[0] {:.6} {:.6} {:.6} {:.6} {} 1",
            SCAN_FLAGS,
            SETTLING_TIME,
            self.measurement_time,
            self.timer,
            self.datafile.display(),
            self.x_start,
            self.y,
            self.x_step,
            1.0,
            self.x_nsteps
        )
    }
}
