//! Dataset facade and content-addressed catalog for dama
//!
//! [`Data`] ties a named dataset to one storage driver: it normalises ingest
//! sources into chunked streams, writes them, hashes the stored content and
//! records every version in the [`Catalog`]. [`Data::load`] reverses the
//! path from a content hash back to an opened dataset.

#![warn(missing_docs)]

mod error;

pub mod catalog;
pub mod data;
pub mod source;
pub mod stats;

// Re-export key types for convenience
pub use catalog::{Catalog, CatalogEntry, CatalogFilter, Upsert, CATALOG_FILE, NO_GROUP};
pub use data::Data;
pub use error::{Error, Result};
pub use source::{DataSource, DEFAULT_GROUP};
pub use stats::{GroupStats, Statistics};
