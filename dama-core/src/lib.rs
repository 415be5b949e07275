//! Core dtypes, arrays, shapes, chunking, iterators and groups for dama datasets
//!
//! This crate holds everything a dataset is made of independent of where it
//! is stored: the dtype system, dense arrays, the Shape/Chunks arithmetic that
//! reconciles heterogeneously shaped columns, the lazy pull-based
//! [`DataIter`], and the named-column [`Group`] facade that storage drivers
//! plug their columns into.

#![warn(missing_docs)]

pub mod array;
pub mod chunks;
pub mod config;
pub mod error;
pub mod group;
pub mod hash;
pub mod iter;
pub mod logging;
pub mod memory;
pub mod schema;
pub mod shape;
pub mod table;
pub mod value;

// Re-export key types for convenience
pub use array::Array;
pub use chunks::{ChunkSpec, Chunks};
pub use config::Settings;
pub use error::{Error, Result};
pub use group::{ColumnRef, ColumnStore, Group, GroupKey, GroupValue, MemoryColumn, Selection};
pub use hash::{ContentHasher, HashAlgorithm};
pub use iter::{DataIter, Element, InMemory, IterDtype, Operand};
pub use memory::MemoryBudget;
pub use schema::{DataType, Field, Schema, SchemaDiff};
pub use shape::Shape;
pub use table::Table;
pub use value::{BinaryOp, Value};
