//! Command/response protocol between the controller and the scan worker.
//!
//! # Commands
//!
//! Every command is an envelope `(verb, positional args, keyword args)`:
//!
//! | verb          | arguments                                        | response          |
//! |---------------|--------------------------------------------------|-------------------|
//! | `start_mxdb`  | `db_path`                                        | none              |
//! | `get_devices` | `scaler_class_names`, `detector_class_names`     | [`DeviceLists`]   |
//! | `set_devices` | keyword arguments of [`SetDevices`]              | none              |
//! | `scan`        | none                                             | datapoints, then `stop_live_plotting` |
//!
//! Commands are fire-and-forget except `get_devices`, which the controller
//! treats as a blocking query.
//!
//! # Results
//!
//! The result stream is untyped on the wire: a 4-array of name lists, a data
//! file path string, or the literal string `"stop_live_plotting"`.
//! [`ScanResult`] restores the distinction on decode.
//!
//! # Framing
//!
//! When the worker runs as a child process, the controller writes one
//! [`WorkerFrame`] JSON document per line to its stdin and reads one
//! [`ScanResult`] JSON document per line from its stdout.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, ScanError};
use crate::request::{AxisRange, Detector, ScanRequest};

/// Sentinel telling the live-update consumer that the scan is over.
pub const STOP_LIVE_PLOTTING: &str = "stop_live_plotting";

/// Command verbs understood by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    StartMxdb,
    GetDevices,
    SetDevices,
    Scan,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::StartMxdb => "start_mxdb",
            Verb::GetDevices => "get_devices",
            Verb::SetDevices => "set_devices",
            Verb::Scan => "scan",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command envelope as it crosses the process boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub verb: Verb,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Command {
    /// A command with no arguments.
    pub fn new(verb: Verb) -> Self {
        Self {
            verb,
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    /// Load the instrument database at `db_path`.
    pub fn start_mxdb(db_path: &Path) -> Self {
        Self {
            args: vec![Value::String(db_path.to_string_lossy().into_owned())],
            ..Self::new(Verb::StartMxdb)
        }
    }

    /// Ask for the device lists, classifying records by these class names.
    pub fn get_devices(scaler_classes: &[String], detector_classes: &[String]) -> Self {
        Self {
            args: vec![
                Value::from(scaler_classes.to_vec()),
                Value::from(detector_classes.to_vec()),
            ],
            ..Self::new(Verb::GetDevices)
        }
    }

    /// Configure the next scan from a validated request.
    pub fn set_devices(request: &ScanRequest) -> Result<Self> {
        let kwargs = match serde_json::to_value(SetDevices::from(request))? {
            Value::Object(map) => map,
            other => {
                return Err(ScanError::Protocol(format!(
                    "set_devices arguments encoded as {other}, expected an object"
                )))
            }
        };
        Ok(Self {
            kwargs,
            ..Self::new(Verb::SetDevices)
        })
    }

    /// Run the configured scan.
    pub fn scan() -> Self {
        Self::new(Verb::Scan)
    }
}

/// Keyword arguments of `set_devices`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetDevices {
    /// Directory the data files are written to (`output_dir/file_name`).
    pub dir_path: PathBuf,
    pub x_motor: String,
    pub x_start: f64,
    pub x_step: f64,
    pub x_end: f64,
    pub y_motor: String,
    pub y_start: f64,
    pub y_step: f64,
    pub y_end: f64,
    pub scalers: Vec<String>,
    pub dwell_time: f64,
    pub detector: Option<Detector>,
    #[serde(default)]
    pub timer: Option<String>,
    #[serde(default = "default_file_name")]
    pub file_name: String,
}

fn default_file_name() -> String {
    "output".to_string()
}

impl SetDevices {
    pub fn x_axis(&self) -> AxisRange {
        AxisRange {
            motor: self.x_motor.clone(),
            start: self.x_start,
            end: self.x_end,
            step: self.x_step,
        }
    }

    pub fn y_axis(&self) -> AxisRange {
        AxisRange {
            motor: self.y_motor.clone(),
            start: self.y_start,
            end: self.y_end,
            step: self.y_step,
        }
    }
}

impl From<&ScanRequest> for SetDevices {
    fn from(request: &ScanRequest) -> Self {
        Self {
            dir_path: request.data_dir(),
            x_motor: request.x.motor.clone(),
            x_start: request.x.start,
            x_step: request.x.step,
            x_end: request.x.end,
            y_motor: request.y.motor.clone(),
            y_start: request.y.start,
            y_step: request.y.step,
            y_end: request.y.end,
            scalers: request.scalers.clone(),
            dwell_time: request.dwell_time,
            detector: request.detector.clone(),
            timer: Some(request.timer.clone()),
            file_name: request.file_name.clone(),
        }
    }
}

/// A command decoded into its typed form on the worker side.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerCommand {
    StartMxdb {
        db_path: PathBuf,
    },
    GetDevices {
        scaler_classes: Vec<String>,
        detector_classes: Vec<String>,
    },
    SetDevices(SetDevices),
    Scan,
}

impl TryFrom<Command> for WorkerCommand {
    type Error = ScanError;

    fn try_from(command: Command) -> Result<Self> {
        let verb = command.verb;
        match verb {
            Verb::StartMxdb => Ok(WorkerCommand::StartMxdb {
                db_path: positional(&command.args, 0, verb)?,
            }),
            Verb::GetDevices => Ok(WorkerCommand::GetDevices {
                scaler_classes: positional(&command.args, 0, verb)?,
                detector_classes: positional(&command.args, 1, verb)?,
            }),
            Verb::SetDevices => serde_json::from_value(Value::Object(command.kwargs))
                .map(WorkerCommand::SetDevices)
                .map_err(|e| ScanError::Protocol(format!("'{verb}' keyword arguments: {e}"))),
            Verb::Scan => Ok(WorkerCommand::Scan),
        }
    }
}

fn positional<T: DeserializeOwned>(args: &[Value], index: usize, verb: Verb) -> Result<T> {
    let value = args.get(index).ok_or_else(|| {
        ScanError::Protocol(format!(
            "'{verb}' expects at least {} positional argument(s), got {}",
            index + 1,
            args.len()
        ))
    })?;
    serde_json::from_value(value.clone())
        .map_err(|e| ScanError::Protocol(format!("'{verb}' argument {index}: {e}")))
}

/// Device names found in the instrument database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceLists {
    pub x_motors: Vec<String>,
    pub y_motors: Vec<String>,
    pub scalers: Vec<String>,
    pub detectors: Vec<String>,
}

/// A message on the result channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireResult", into = "WireResult")]
pub enum ScanResult {
    /// Response to `get_devices`.
    Devices(DeviceLists),
    /// A data file was produced.
    Datapoint(PathBuf),
    /// The scan is over; the live-update consumer should stop.
    StopLivePlotting,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireResult {
    Devices(Vec<String>, Vec<String>, Vec<String>, Vec<String>),
    Text(String),
}

impl From<WireResult> for ScanResult {
    fn from(wire: WireResult) -> Self {
        match wire {
            WireResult::Devices(x_motors, y_motors, scalers, detectors) => {
                ScanResult::Devices(DeviceLists {
                    x_motors,
                    y_motors,
                    scalers,
                    detectors,
                })
            }
            WireResult::Text(text) if text == STOP_LIVE_PLOTTING => ScanResult::StopLivePlotting,
            WireResult::Text(text) => ScanResult::Datapoint(PathBuf::from(text)),
        }
    }
}

impl From<ScanResult> for WireResult {
    fn from(result: ScanResult) -> Self {
        match result {
            ScanResult::Devices(d) => {
                WireResult::Devices(d.x_motors, d.y_motors, d.scalers, d.detectors)
            }
            ScanResult::Datapoint(path) => WireResult::Text(path.to_string_lossy().into_owned()),
            ScanResult::StopLivePlotting => WireResult::Text(STOP_LIVE_PLOTTING.to_string()),
        }
    }
}

/// Controller → child process frames on stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum WorkerFrame {
    /// A protocol command.
    Command(Command),
    /// The abort flag was set on the controller side.
    Abort,
    /// Terminate after discarding pending commands.
    Shutdown,
}

/// Encode one message as a newline-terminated JSON line.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decode one JSON line.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    Ok(serde_json::from_str(line.trim_end())?)
}
