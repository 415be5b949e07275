//! Driver configuration and resource naming

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Backend implementations known to the factory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriverKind {
    /// In-process arrays, not persistent
    Memory,

    /// Row store in a SQLite file
    Sqlite,

    /// Memory-mapped column slabs
    Slab,
}

impl DriverKind {
    /// Name used in resource paths and catalog rows
    pub fn name(&self) -> &'static str {
        match self {
            DriverKind::Memory => "Memory",
            DriverKind::Sqlite => "Sqlite",
            DriverKind::Slab => "Slab",
        }
    }

    /// Module path recorded in catalog rows
    pub fn module(&self) -> &'static str {
        match self {
            DriverKind::Memory => "dama_drivers::memory",
            DriverKind::Sqlite => "dama_drivers::sqlite",
            DriverKind::Slab => "dama_drivers::slab",
        }
    }

    /// File extension of the resource
    pub fn ext(&self) -> &'static str {
        match self {
            DriverKind::Memory => "mem",
            DriverKind::Sqlite => "sqlite3",
            DriverKind::Slab => "slab",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DriverKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(DriverKind::Memory),
            "sqlite" => Ok(DriverKind::Sqlite),
            "slab" => Ok(DriverKind::Slab),
            _ => Err(Error::UnknownDriver(s.to_string())),
        }
    }
}

/// How a driver treats an existing resource on open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Open an existing resource read-only; missing is an error
    Read,

    /// Open or create, keeping existing data
    #[default]
    Append,

    /// Destroy any existing resource and start over
    Write,
}

impl Mode {
    /// Whether writes are allowed
    pub fn is_writable(&self) -> bool {
        !matches!(self, Mode::Read)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self {
            Mode::Read => "r",
            Mode::Append => "a",
            Mode::Write => "w",
        };
        f.write_str(mode)
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" | "read" => Ok(Mode::Read),
            "a" | "append" => Ok(Mode::Append),
            "w" | "write" => Ok(Mode::Write),
            other => Err(Error::Unsupported(format!("unknown mode {other}"))),
        }
    }
}

/// Connection details for a backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Login {
    /// User name
    pub username: Option<String>,

    /// Database or bucket name
    pub resource: Option<String>,

    /// Server host
    pub host: Option<String>,

    /// Server port
    pub port: Option<u16>,

    /// Table holding the dataset rows
    pub table: Option<String>,
}

impl Login {
    /// Login naming only a table
    pub fn with_table(table: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            ..Self::default()
        }
    }
}

/// Compression codec requested for stored columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compressor {
    /// Codec identifier, e.g. `lz4`
    pub codec: String,

    /// Codec level
    pub level: u8,
}

impl Compressor {
    /// Create a compressor description
    pub fn new(codec: impl Into<String>, level: u8) -> Self {
        Self {
            codec: codec.into(),
            level,
        }
    }
}

/// Everything needed to construct a driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Backend implementation
    pub kind: DriverKind,

    /// Connection details
    pub login: Login,

    /// Open mode
    pub mode: Mode,

    /// Requested compression
    pub compressor: Option<Compressor>,

    /// Root directory for resources
    pub path: PathBuf,
}

impl DriverConfig {
    /// Configuration for `kind` rooted at `path`
    pub fn new(kind: DriverKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            login: Login::default(),
            mode: Mode::default(),
            compressor: None,
            path: path.into(),
        }
    }

    /// Set the open mode
    #[must_use]
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Set connection details
    #[must_use]
    pub fn with_login(mut self, login: Login) -> Self {
        self.login = login;
        self
    }

    /// Request a compression codec
    #[must_use]
    pub fn with_compressor(mut self, compressor: Compressor) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// Resource location: `path/<DriverName>/[group]/<name>.<ext>`
    pub fn build_url(&self, name: &str, group_name: Option<&str>) -> PathBuf {
        build_url(&self.path, self.kind, name, group_name)
    }
}

/// Resource location: `path/<DriverName>/[group]/<name>.<ext>`
pub fn build_url(path: &Path, kind: DriverKind, name: &str, group_name: Option<&str>) -> PathBuf {
    let mut url = path.join(kind.name());
    if let Some(group) = group_name {
        url.push(group);
    }
    url.push(format!("{name}.{}", kind.ext()));
    url
}
