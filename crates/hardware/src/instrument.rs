//! Instrument driver trait.
//!
//! The worker talks to the instrument only through [`Instrument`]. A driver
//! owns the loaded database and knows how to run one row scan and write its
//! data file. Implementations need not be `Sync`: the worker is the sole owner
//! of the handle for the lifetime of the process.

use std::path::Path;

use async_trait::async_trait;

use crate::database::MxDatabase;
use crate::description::ScanDescription;
use crate::error::DriverError;

#[async_trait]
pub trait Instrument: Send {
    /// Short identifier used in error messages and logs.
    fn driver_type(&self) -> &'static str;

    /// Load (or reload) the instrument database at `path`.
    async fn open_database(&mut self, path: &Path) -> Result<(), DriverError>;

    /// The loaded database, if any.
    fn database(&self) -> Option<&MxDatabase>;

    /// Create the scan record for `description`, run it and write its data
    /// file. Returns once the file is complete.
    async fn perform_scan(&mut self, description: &ScanDescription) -> Result<(), DriverError>;
}
