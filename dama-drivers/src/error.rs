//! Error types for storage drivers

use thiserror::Error;

/// Error type for storage drivers
#[derive(Error, Debug)]
pub enum Error {
    /// Core library error
    #[error("Core error: {0}")]
    Core(#[from] dama_core::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite error
    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// JSON manifest error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary encoding error
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// Unknown driver name
    #[error("Unknown driver: {0}")]
    UnknownDriver(String),

    /// Operation not valid in the current driver mode
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl Error {
    /// Whether this error means the resource is absent
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Core(e) => e.is_not_found(),
            Error::Sql(rusqlite::Error::QueryReturnedNoRows) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<Error> for dama_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Core(e) => e,
            Error::Io(e) => dama_core::Error::Io(e),
            Error::Json(e) => dama_core::Error::Json(e),
            Error::Encoding(e) => dama_core::Error::Serialization(e),
            other => dama_core::Error::Backend(other.to_string()),
        }
    }
}

/// Result type for storage drivers
pub type Result<T> = std::result::Result<T, Error>;
