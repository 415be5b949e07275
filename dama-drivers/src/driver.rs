//! Driver contract shared by every backend
//!
//! A driver owns one physical resource and its connection. Writes go through
//! a capability-tagged [`Writer`]: row stores hand out a [`RowWriter`], array
//! stores a [`ColumnSlabWriter`], and the write orchestrator dispatches on the
//! tag instead of on per-backend flags.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dama_core::{Chunks, Group, Schema, Shape};
use tracing::{debug, warn};

use crate::config::{DriverConfig, DriverKind, Mode};
use crate::error::Result;

/// Address spaces every driver exposes
pub const SPACES: [&str; 2] = ["data", "metadata"];

/// Uniqueness constraints and secondary indices for [`Driver::set_schema`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaOptions {
    /// Unique keys, each a single column or a composite of columns
    pub unique: Vec<Vec<String>>,

    /// Secondary indices, each over one or more columns
    pub indices: Vec<Vec<String>>,
}

impl SchemaOptions {
    /// No constraints
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a unique key over `columns`
    #[must_use]
    pub fn with_unique(mut self, columns: &[&str]) -> Self {
        self.unique.push(columns.iter().map(ToString::to_string).collect());
        self
    }

    /// Add a secondary index over `columns`
    #[must_use]
    pub fn with_index(mut self, columns: &[&str]) -> Self {
        self.indices.push(columns.iter().map(ToString::to_string).collect());
        self
    }
}

/// Writes each row of a chunk as one store row
pub trait RowWriter {
    /// Write the rows of `chunk` starting at row `start`, returning rows written
    fn write_rows(&mut self, start: usize, chunk: &Group) -> Result<usize>;

    /// Make written rows durable
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writes contiguous per-column ranges
pub trait ColumnSlabWriter {
    /// Write every column of `chunk` at rows `start..`, returning rows written
    fn write_slab(&mut self, start: usize, chunk: &Group) -> Result<usize>;

    /// Make written slabs durable
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The write capability a driver offers
pub enum Writer<'a> {
    /// Row-oriented backend
    Rows(&'a mut dyn RowWriter),

    /// Array-oriented backend
    ColumnSlabs(&'a mut dyn ColumnSlabWriter),
}

impl fmt::Debug for Writer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Writer::Rows(_) => f.write_str("Writer::Rows"),
            Writer::ColumnSlabs(_) => f.write_str("Writer::ColumnSlabs"),
        }
    }
}

/// A storage backend for one dataset resource
pub trait Driver: Send + fmt::Debug {
    /// Backend implementation
    fn kind(&self) -> DriverKind;

    /// Construction parameters
    fn config(&self) -> &DriverConfig;

    /// Dataset name
    fn name(&self) -> &str;

    /// Optional group level in the resource path
    fn group_name(&self) -> Option<&str>;

    /// Open or create the resource according to the mode
    ///
    /// Write mode destroys any existing resource first. Read mode on a missing
    /// resource fails with `NotFound`.
    fn open(&mut self) -> Result<()>;

    /// Release the connection; column handles fail afterwards
    fn close(&mut self) -> Result<()>;

    /// Whether a connection is held
    fn is_open(&self) -> bool;

    /// Open mode
    fn mode(&self) -> Mode {
        self.config().mode
    }

    /// Stored schema, `None` before one is set
    fn dtypes(&self) -> Result<Option<Schema>>;

    /// Stored column names
    fn groups(&self) -> Result<Vec<String>> {
        Ok(self.dtypes()?.map(|s| s.names()).unwrap_or_default())
    }

    /// Define columns and constraints
    ///
    /// A no-op when the resource already has the same schema; a different
    /// schema is a `SchemaConflict`.
    fn set_schema(&mut self, schema: &Schema, options: &SchemaOptions) -> Result<()>;

    /// Warn when the stored schema drifted from `expected`
    fn verify_schema(&self, expected: &Schema) -> Result<()> {
        match self.dtypes()? {
            Some(actual) => {
                let diff = expected.diff(&actual);
                if !diff.is_empty() {
                    warn!(driver = %self.kind(), name = self.name(), %diff, "Stored schema differs from expected");
                }
            }
            None => warn!(driver = %self.kind(), name = self.name(), "Stored schema is missing"),
        }
        Ok(())
    }

    /// Preallocation hint
    fn set_data_shape(&mut self, _shape: &Shape) -> Result<()> {
        Ok(())
    }

    /// Write capability
    fn writer(&mut self) -> Result<Writer<'_>>;

    /// Whether the resource holds a dataset
    fn exists(&self) -> bool;

    /// Remove the resource
    fn destroy(&mut self) -> Result<()>;

    /// Logical address spaces
    fn spaces(&self) -> Vec<&'static str> {
        SPACES.to_vec()
    }

    /// Group over the stored columns
    fn manager(&self, chunks: Option<Chunks>) -> Result<Group>;

    /// Stored attribute
    fn attr(&self, key: &str) -> Result<Option<String>>;

    /// Store an attribute
    fn set_attr(&mut self, key: &str, value: &str) -> Result<()>;

    /// Resource location
    fn url(&self) -> PathBuf {
        self.config().build_url(self.name(), self.group_name())
    }

    /// Name recorded in the catalog
    fn driver_name(&self) -> &'static str {
        self.kind().name()
    }

    /// Module recorded in the catalog
    fn driver_module(&self) -> &'static str {
        self.kind().module()
    }

    /// Whether data survives the process
    fn persistent(&self) -> bool;

    /// Shape of the stored columns
    fn shape(&self) -> Result<Shape> {
        Ok(self.manager(None)?.shape()?)
    }
}

/// Fail unless `requested` matches the schema already stored
pub(crate) fn ensure_same_schema(existing: &Schema, requested: &Schema) -> Result<()> {
    if existing == requested {
        return Ok(());
    }
    Err(dama_core::Error::SchemaConflict(format!(
        "stored schema {existing} differs from {requested}: {}",
        requested.diff(existing)
    ))
    .into())
}

/// Liveness flag shared between a driver and the column handles it gave out
///
/// Every open creates a fresh flag, so handles from an earlier connection stay
/// closed even after the driver reopens.
#[derive(Debug, Clone, Default)]
pub(crate) struct OpenFlag(Arc<AtomicBool>);

impl OpenFlag {
    pub(crate) fn opened() -> Self {
        OpenFlag(Arc::new(AtomicBool::new(true)))
    }

    pub(crate) fn close(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub(crate) fn is_open(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn check(&self, what: &str) -> dama_core::Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(dama_core::Error::Closed(what.to_string()))
        }
    }
}

/// An open driver that closes itself when dropped
pub struct OpenDriver<'a, D: Driver + ?Sized> {
    driver: &'a mut D,
    closed: bool,
}

impl<'a, D: Driver + ?Sized> OpenDriver<'a, D> {
    /// Open `driver`
    pub fn open(driver: &'a mut D) -> Result<Self> {
        driver.open()?;
        Ok(Self {
            driver,
            closed: false,
        })
    }

    /// Close now, surfacing the close error
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.driver.close()
    }
}

impl<D: Driver + ?Sized> Deref for OpenDriver<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        self.driver
    }
}

impl<D: Driver + ?Sized> DerefMut for OpenDriver<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        self.driver
    }
}

impl<D: Driver + ?Sized> Drop for OpenDriver<'_, D> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        debug!(driver = %self.driver.kind(), "Closing driver on scope exit");
        if let Err(err) = self.driver.close() {
            warn!(%err, "Failed to close driver");
        }
    }
}

/// Run `f` on an open driver, closing it on every exit path
pub fn with_open<D, T, E, F>(driver: &mut D, f: F) -> std::result::Result<T, E>
where
    D: Driver + ?Sized,
    E: From<crate::error::Error>,
    F: FnOnce(&mut D) -> std::result::Result<T, E>,
{
    let mut guard = OpenDriver::open(driver)?;
    let out = f(&mut guard)?;
    guard.close()?;
    Ok(out)
}
