//! Error types for datasets and the catalog

use thiserror::Error;

/// Error type for datasets and the catalog
#[derive(Error, Debug)]
pub enum Error {
    /// Core library error
    #[error("Core error: {0}")]
    Core(#[from] dama_core::Error),

    /// Storage driver error
    #[error("Driver error: {0}")]
    Driver(#[from] dama_drivers::Error),

    /// Catalog database error
    #[error("Catalog error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Dataset or catalog entry does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A catalog upsert matched no row under any unique key
    #[error("Identity conflict: {0}")]
    IdentityConflict(String),
}

impl Error {
    /// Whether this error means the resource is absent
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Core(e) => e.is_not_found(),
            Error::Driver(e) => e.is_not_found(),
            Error::Sql(rusqlite::Error::QueryReturnedNoRows) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Result type for datasets and the catalog
pub type Result<T> = std::result::Result<T, Error>;
