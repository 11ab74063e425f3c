//! MX instrument database files.
//!
//! A database is a text file with one record per line:
//!
//! ```text
//! # name   superclass  class     type       ...driver fields
//! smx      device      motor     e500       ""  ""  0 0 ...
//! Io       device      scaler    e500_scaler ...
//! ```
//!
//! Only the first four whitespace-separated fields are interpreted; the
//! driver-specific remainder is kept verbatim. Blank lines and lines starting
//! with `#` are ignored.

use std::path::{Path, PathBuf};

use common::DeviceLists;

use crate::error::{DriverError, DriverErrorKind};

const DRIVER_TYPE: &str = "mx_database";

/// Class name of positioning records.
pub const MOTOR_CLASS: &str = "motor";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub name: String,
    pub superclass: String,
    pub class: String,
    pub record_type: String,
    /// Driver-specific fields after the record type.
    pub fields: String,
}

impl DeviceRecord {
    pub fn new(
        name: impl Into<String>,
        superclass: impl Into<String>,
        class: impl Into<String>,
        record_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            superclass: superclass.into(),
            class: class.into(),
            record_type: record_type.into(),
            fields: String::new(),
        }
    }

    fn parse(line: &str) -> Option<Self> {
        let mut rest = line.trim();
        let mut head = Vec::with_capacity(4);
        while head.len() < 4 {
            let token_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            if token_end == 0 {
                return None;
            }
            head.push(&rest[..token_end]);
            rest = rest[token_end..].trim_start();
        }
        Some(Self {
            name: head[0].to_string(),
            superclass: head[1].to_string(),
            class: head[2].to_string(),
            record_type: head[3].to_string(),
            fields: rest.to_string(),
        })
    }
}

/// Records loaded from one database file.
#[derive(Debug, Clone, Default)]
pub struct MxDatabase {
    path: PathBuf,
    records: Vec<DeviceRecord>,
}

impl MxDatabase {
    /// Parse database text. `path` is only used for error messages.
    pub fn parse(path: &Path, text: &str) -> Result<Self, DriverError> {
        let mut records = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let record = DeviceRecord::parse(trimmed).ok_or_else(|| {
                DriverError::new(
                    DRIVER_TYPE,
                    DriverErrorKind::Initialization,
                    format!(
                        "{}:{}: expected 'name superclass class type', got '{}'",
                        path.display(),
                        index + 1,
                        trimmed
                    ),
                )
            })?;
            records.push(record);
        }
        Ok(Self {
            path: path.to_path_buf(),
            records,
        })
    }

    pub async fn load(path: &Path) -> Result<Self, DriverError> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            DriverError::new(
                DRIVER_TYPE,
                DriverErrorKind::Initialization,
                format!("Failed to read {}: {}", path.display(), e),
            )
        })?;
        Self::parse(path, &text)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[DeviceRecord] {
        &self.records
    }

    pub fn get(&self, name: &str) -> Option<&DeviceRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Register a record created at runtime (scan records).
    pub fn add(&mut self, record: DeviceRecord) -> Result<(), DriverError> {
        if self.contains(&record.name) {
            return Err(DriverError::new(
                DRIVER_TYPE,
                DriverErrorKind::InvalidParameter,
                format!("Record '{}' already exists", record.name),
            ));
        }
        self.records.push(record);
        Ok(())
    }

    /// Sort record names into the four device lists, in file order.
    ///
    /// Motors appear in both the x and the y list.
    pub fn classify(&self, scaler_classes: &[String], detector_classes: &[String]) -> DeviceLists {
        let mut lists = DeviceLists::default();
        for record in &self.records {
            if record.class == MOTOR_CLASS {
                lists.x_motors.push(record.name.clone());
                lists.y_motors.push(record.name.clone());
            } else if scaler_classes.contains(&record.class) {
                lists.scalers.push(record.name.clone());
            } else if detector_classes.contains(&record.class) {
                lists.detectors.push(record.name.clone());
            }
        }
        lists
    }

    /// First `row{i}_` prefix whose row 0 record does not exist yet.
    pub fn free_row_prefix(&self) -> String {
        let mut i = 0usize;
        while self.contains(&format!("row{}_0", i)) {
            i += 1;
        }
        format!("row{}_", i)
    }
}
