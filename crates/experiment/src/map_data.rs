//! Reading scan data files into a 2-D map.
//!
//! Each data file holds one row of a raster. The `%devices` header names the
//! columns (motors first, then scalers, then detectors); only as many names as
//! there are numeric columns are kept. Rows from all files read so far are
//! combined, and [`ScanMap::evaluate`] applies the plot formula to each.
//!
//! [`ScanFiles`] finds the files of a finished scan on disk so they can be
//! replayed offline.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use common::ScanError;

use crate::formula;

/// One evaluated map cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapPoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone)]
pub struct ScanMap {
    x_motor: String,
    y_motor: String,
    columns: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl ScanMap {
    pub fn new(x_motor: impl Into<String>, y_motor: impl Into<String>) -> Self {
        Self {
            x_motor: x_motor.into(),
            y_motor: y_motor.into(),
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Append the rows of the data file at `path`. Returns the number of rows read.
    pub async fn read(&mut self, path: &Path) -> common::Result<usize> {
        let text = tokio::fs::read_to_string(path).await?;
        self.parse(&text)
            .map_err(|e| ScanError::Protocol(format!("{}: {}", path.display(), e)))
    }

    /// Append the rows of one data file's text.
    pub fn parse(&mut self, text: &str) -> Result<usize, String> {
        let header = text
            .lines()
            .find(|line| line.contains("%devices"))
            .map(device_names)
            .ok_or_else(|| "no %devices header".to_string())?;

        let mut rows = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let row = line
                .split_whitespace()
                .map(str::parse::<f64>)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| format!("line {}: {}", index + 1, e))?;
            if let Some(first) = rows.first().map(Vec::len) {
                if row.len() != first {
                    return Err(format!(
                        "line {}: expected {} columns, found {}",
                        index + 1,
                        first,
                        row.len()
                    ));
                }
            }
            rows.push(row);
        }

        let Some(width) = rows.first().map(Vec::len) else {
            return Ok(0);
        };
        if width > header.len() {
            return Err(format!(
                "{} data columns but only {} device names",
                width,
                header.len()
            ));
        }
        let columns: Vec<String> = header.into_iter().take(width).collect();
        if self.columns.is_empty() {
            self.columns = columns;
        } else if self.columns != columns {
            return Err(format!(
                "columns {:?} do not match earlier files {:?}",
                columns, self.columns
            ));
        }

        let count = rows.len();
        self.rows.extend(rows);
        Ok(count)
    }

    fn column(&self, name: &str) -> Result<usize, ScanError> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| ScanError::Protocol(format!("no '{}' column in scan data", name)))
    }

    /// Evaluate `formula` on every distinct row, sorted by (y, x).
    ///
    /// Infinite values (division by a zero count) become 0.
    pub fn evaluate(&self, formula: &str) -> common::Result<Vec<MapPoint>> {
        if self.rows.is_empty() {
            return Ok(Vec::new());
        }
        let xi = self.column(&self.x_motor)?;
        let yi = self.column(&self.y_motor)?;

        let mut rows: Vec<&Vec<f64>> = self.rows.iter().collect();
        rows.sort_by(|a, b| {
            a[yi].total_cmp(&b[yi])
                .then(a[xi].total_cmp(&b[xi]))
                .then_with(|| {
                    a.iter()
                        .zip(b.iter())
                        .map(|(l, r)| l.total_cmp(r))
                        .find(|o| *o != Ordering::Equal)
                        .unwrap_or(Ordering::Equal)
                })
        });
        rows.dedup();

        let mut values = HashMap::with_capacity(self.columns.len());
        rows.into_iter()
            .map(|row| {
                values.clear();
                for (name, value) in self.columns.iter().zip(row.iter()) {
                    values.insert(name.clone(), *value);
                }
                let z = formula::evaluate(formula, &values)?;
                Ok(MapPoint {
                    x: row[xi],
                    y: row[yi],
                    z: if z.is_infinite() { 0.0 } else { z },
                })
            })
            .collect()
    }
}

/// Column names from a `# %devices = a b c;` line.
fn device_names(line: &str) -> Vec<String> {
    line.split_whitespace()
        .skip_while(|token| *token != "=")
        .skip(1)
        .map(|token| token.trim_end_matches(';'))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// `(stem, suffix)` of a name with exactly one dot.
fn split_data_name(name: &str) -> Option<(&str, &str)> {
    let (stem, suffix) = name.split_once('.')?;
    (!stem.is_empty() && !suffix.contains('.')).then_some((stem, suffix))
}

/// Data files of one scan, found by name in a directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanFiles {
    /// Output name shared by every file, e.g. `run1` for `run1.0`.
    pub name: String,
    /// The file the columns are taken from.
    pub template: PathBuf,
    /// Every `<name>.<n>` file, ordered by row number.
    pub files: Vec<PathBuf>,
}

impl ScanFiles {
    /// Find the scan in `dir`.
    ///
    /// The template is the first file, by name, with a single dot followed by
    /// `0`. Names with more than one dot are never scan data.
    pub async fn discover(dir: &Path) -> common::Result<Self> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();

        let template = names
            .iter()
            .find(|f| matches!(split_data_name(f), Some((_, suffix)) if suffix.starts_with('0')))
            .ok_or_else(|| ScanError::NoScanData(dir.to_path_buf()))?;
        let name = template
            .split_once('.')
            .map(|(stem, _)| stem.to_string())
            .unwrap_or_default();

        let mut rows: Vec<(u64, &String)> = names
            .iter()
            .filter_map(|f| {
                let (stem, suffix) = split_data_name(f)?;
                (stem == name).then(|| (suffix.parse().unwrap_or(u64::MAX), f))
            })
            .collect();
        rows.sort();

        Ok(Self {
            template: dir.join(template),
            files: rows.into_iter().map(|(_, f)| dir.join(f)).collect(),
            name,
        })
    }

    /// Column names of the template file. Empty if it holds no data rows.
    pub async fn columns(&self) -> common::Result<Vec<String>> {
        let mut map = ScanMap::new("", "");
        map.read(&self.template).await?;
        Ok(map.columns().to_vec())
    }
}

/// Smallest and largest `z`, ignoring NaN.
pub fn z_range(points: &[MapPoint]) -> Option<(f64, f64)> {
    points
        .iter()
        .map(|p| p.z)
        .filter(|z| !z.is_nan())
        .fold(None, |range, z| match range {
            None => Some((z, z)),
            Some((lo, hi)) => Some((lo.min(z), hi.max(z))),
        })
}
