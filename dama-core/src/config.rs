//! Process-wide settings, built once and passed by reference

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hash::HashAlgorithm;
use crate::memory::MemoryBudget;

/// Settings shared by drivers, datasets and the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root directory for dataset resources
    pub data_path: PathBuf,

    /// Directory holding the catalog database
    pub metadata_path: PathBuf,

    /// Catalog table name
    pub catalog_table: String,

    /// Fraction of available memory a chunk may use
    pub memory_allowed: f64,

    /// Fixed memory budget in bytes; measured from the OS when unset
    pub memory_limit_bytes: Option<usize>,

    /// Digest used for content hashes
    pub hash_algorithm: HashAlgorithm,

    /// Log filter directive, e.g. `info` or `dama_data=debug`
    pub log_level: String,

    /// Rows per batch for streamed conversions
    pub batch_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data"),
            metadata_path: PathBuf::from("metadata"),
            catalog_table: "data".to_string(),
            memory_allowed: 0.9,
            memory_limit_bytes: None,
            hash_algorithm: HashAlgorithm::Sha1,
            log_level: "info".to_string(),
            batch_size: 258,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file; missing keys keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Set the data root
    pub fn with_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = path.into();
        self
    }

    /// Set the catalog directory
    pub fn with_metadata_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.metadata_path = path.into();
        self
    }

    /// Fix the memory budget instead of measuring it
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }

    /// Set the usable memory fraction
    pub fn with_memory_allowed(mut self, fraction: f64) -> Self {
        self.memory_allowed = fraction;
        self
    }

    /// Set the digest algorithm
    pub fn with_hash_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.hash_algorithm = algorithm;
        self
    }

    /// Set the log filter
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Set the streamed conversion batch size
    pub fn with_batch_size(mut self, rows: usize) -> Self {
        self.batch_size = rows.max(1);
        self
    }

    /// Memory budget implied by these settings
    pub fn memory_budget(&self) -> MemoryBudget {
        match self.memory_limit_bytes {
            Some(bytes) => MemoryBudget::fixed(bytes, self.memory_allowed),
            None => MemoryBudget::from_system(self.memory_allowed),
        }
    }
}
