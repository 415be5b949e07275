//! Storage drivers for dama datasets
//!
//! Every backend implements [`Driver`] and exposes its columns as a
//! [`dama_core::Group`]. Writes are dispatched by [`write_batches`] on the
//! writer capability the backend declares.

#![warn(missing_docs)]

mod error;

pub mod config;
pub mod driver;
pub mod factory;
pub mod memory;
pub mod slab;
pub mod sqlite;
pub mod write;

pub use config::{Compressor, DriverConfig, DriverKind, Login, Mode};
pub use driver::{with_open, ColumnSlabWriter, Driver, OpenDriver, RowWriter, SchemaOptions, Writer, SPACES};
pub use error::{Error, Result};
pub use factory::{create_driver, driver_from_name};
pub use memory::MemoryDriver;
pub use slab::SlabDriver;
pub use sqlite::SqliteDriver;
pub use write::{write_batches, write_batches_at, WriteReport};
