//! Error types for dama datasets

use std::io;
use thiserror::Error;

/// Result type for dama core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for dama core operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A referenced resource, group or catalog entry does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A dtype or shape disagrees with an existing schema
    #[error("Schema conflict: {0}")]
    SchemaConflict(String),

    /// A catalog upsert could not be resolved to a unique row
    #[error("Identity conflict: {0}")]
    IdentityConflict(String),

    /// An element disagrees with the inferred type of a stream
    #[error("Data type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// The dtype the stream was inferred or declared with
        expected: String,
        /// The dtype actually found
        actual: String,
    },

    /// A one-shot source was pulled after it was exhausted
    #[error("Source exhausted")]
    ExhaustedSource,

    /// A column handle was used after its connection was closed
    #[error("Connection closed: {0}")]
    Closed(String),

    /// A storage backend failed while serving a column
    #[error("Backend error: {0}")]
    Backend(String),

    /// Index out of bounds
    #[error("Index out of bounds: {index} >= {len}")]
    IndexOutOfBounds {
        /// Requested index
        index: usize,
        /// Length of the indexed axis
        len: usize,
    },

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Array shape error
    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Build a type mismatch from anything printable
    pub fn type_mismatch(expected: impl ToString, actual: impl ToString) -> Self {
        Error::TypeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Whether this error means the referenced resource is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
