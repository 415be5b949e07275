//! Content-addressed catalog of dataset versions
//!
//! The catalog is a single SQLite table. Every operation opens its own
//! connection and closes it before returning, so catalog writes never share
//! a transaction with the data plane.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dama_core::Settings;
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Group name stored for datasets without a group level
pub const NO_GROUP: &str = "s/n";

/// File name of the catalog database inside the metadata directory
pub const CATALOG_FILE: &str = "metadata.sqlite3";

const COLUMNS: [&str; 13] = [
    "hash",
    "name",
    "author",
    "description",
    "size",
    "driver_module",
    "driver_name",
    "path",
    "group_name",
    "timestamp",
    "num_groups",
    "is_valid",
    "from_ds_hash",
];

/// Unique keys tried, in order, when an insert collides
const UNIQUE_KEYS: [&[&str]; 2] = [&["hash"], &["path", "name", "driver_name", "group_name"]];

/// One dataset version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Content hash, `"<algo>.<hex>"`
    pub hash: String,
    /// Dataset name
    pub name: String,
    /// Author attribute
    pub author: String,
    /// Description attribute
    pub description: String,
    /// Bytes used by the stored resource
    pub size: u64,
    /// Module path of the driver
    pub driver_module: String,
    /// Driver name, resolvable by the driver factory
    pub driver_name: String,
    /// Root path the driver was configured with
    pub path: String,
    /// Group level, [`NO_GROUP`] when absent
    pub group_name: String,
    /// Write time
    pub timestamp: DateTime<Utc>,
    /// Number of stored groups
    pub num_groups: usize,
    /// Soft-delete flag
    pub is_valid: bool,
    /// Hash of the dataset this one was derived from
    pub from_ds_hash: Option<String>,
}

impl CatalogEntry {
    /// Group level, `None` for the [`NO_GROUP`] marker
    pub fn group(&self) -> Option<&str> {
        Some(self.group_name.as_str()).filter(|g| *g != NO_GROUP)
    }

    fn values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::Text(self.hash.clone()),
            SqlValue::Text(self.name.clone()),
            SqlValue::Text(self.author.clone()),
            SqlValue::Text(self.description.clone()),
            SqlValue::Integer(i64::try_from(self.size).unwrap_or(i64::MAX)),
            SqlValue::Text(self.driver_module.clone()),
            SqlValue::Text(self.driver_name.clone()),
            SqlValue::Text(self.path.clone()),
            SqlValue::Text(self.group_name.clone()),
            SqlValue::Text(self.timestamp.to_rfc3339()),
            SqlValue::Integer(i64::try_from(self.num_groups).unwrap_or(i64::MAX)),
            SqlValue::Integer(i64::from(self.is_valid)),
            self.from_ds_hash.clone().map_or(SqlValue::Null, SqlValue::Text),
        ]
    }

    fn key_values(&self, key: &[&str]) -> Vec<SqlValue> {
        key.iter()
            .map(|column| {
                let text = match *column {
                    "hash" => &self.hash,
                    "path" => &self.path,
                    "name" => &self.name,
                    "driver_name" => &self.driver_name,
                    _ => &self.group_name,
                };
                SqlValue::Text(text.clone())
            })
            .collect()
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let timestamp: String = row.get(9)?;
        let timestamp = DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?
            .with_timezone(&Utc);
        Ok(Self {
            hash: row.get(0)?,
            name: row.get(1)?,
            author: row.get(2)?,
            description: row.get(3)?,
            size: u64::try_from(row.get::<_, i64>(4)?).unwrap_or_default(),
            driver_module: row.get(5)?,
            driver_name: row.get(6)?,
            path: row.get(7)?,
            group_name: row.get(8)?,
            timestamp,
            num_groups: usize::try_from(row.get::<_, i64>(10)?).unwrap_or_default(),
            is_valid: row.get(11)?,
            from_ds_hash: row.get(12)?,
        })
    }
}

/// How an upsert landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// A new row was inserted
    Inserted,
    /// The row matching `hash` was updated
    UpdatedByHash,
    /// The row matching the location key was updated
    UpdatedByLocation,
}

/// Listing filter; valid rows only by default
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogFilter {
    /// Include invalidated rows
    pub include_invalid: bool,
    /// Only rows written by this driver
    pub driver_name: Option<String>,
    /// Only rows in this group level
    pub group_name: Option<String>,
    /// Page size
    pub limit: Option<usize>,
    /// Rows to skip
    pub offset: usize,
}

impl CatalogFilter {
    /// Valid rows of every driver and group
    pub fn new() -> Self {
        Self::default()
    }

    /// Also list invalidated rows
    #[must_use]
    pub fn include_invalid(mut self) -> Self {
        self.include_invalid = true;
        self
    }

    /// Restrict to one driver
    #[must_use]
    pub fn with_driver(mut self, driver_name: impl Into<String>) -> Self {
        self.driver_name = Some(driver_name.into());
        self
    }

    /// Restrict to one group level
    #[must_use]
    pub fn with_group(mut self, group_name: impl Into<String>) -> Self {
        self.group_name = Some(group_name.into());
        self
    }

    /// Return one page of rows
    #[must_use]
    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

/// Handle to the catalog table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    db: PathBuf,
    table: String,
}

impl Catalog {
    /// Catalog located by the metadata settings
    pub fn new(settings: &Settings) -> Self {
        Self::at(settings.metadata_path.join(CATALOG_FILE), &settings.catalog_table)
    }

    /// Catalog in an explicit database file and table
    pub fn at(db: impl Into<PathBuf>, table: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            table: table.into(),
        }
    }

    /// Database file
    pub fn url(&self) -> &Path {
        &self.db
    }

    /// Table name
    pub fn table(&self) -> &str {
        &self.table
    }

    fn connect(&self) -> Result<Connection> {
        if let Some(parent) = self.db.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.db)?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 id INTEGER PRIMARY KEY, \
                 hash TEXT UNIQUE, name TEXT, author TEXT, description TEXT, size INTEGER, \
                 driver_module TEXT, driver_name TEXT, path TEXT, group_name TEXT, \
                 timestamp TEXT, num_groups INTEGER, is_valid BOOLEAN, from_ds_hash TEXT, \
                 UNIQUE (path, name, driver_name, group_name))",
                quote(&self.table)
            ),
            [],
        )?;
        Ok(conn)
    }

    fn select(&self) -> String {
        format!("SELECT {} FROM {}", COLUMNS.join(", "), quote(&self.table))
    }

    /// Insert `entry`, or update the row it collides with
    ///
    /// Collisions are resolved by updating the row matching `hash`, then the
    /// row matching `(path, name, driver_name, group_name)`. When neither
    /// update applies the entry conflicts with two different rows.
    pub fn upsert(&self, entry: &CatalogEntry) -> Result<Upsert> {
        let conn = self.connect()?;
        let placeholders: Vec<String> = (1..=COLUMNS.len()).map(|i| format!("?{i}")).collect();
        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(&self.table),
            COLUMNS.join(", "),
            placeholders.join(", ")
        );
        match conn.execute(&insert, params_from_iter(entry.values())) {
            Ok(_) => {
                info!(hash = %entry.hash, name = %entry.name, "Inserted catalog row");
                return Ok(Upsert::Inserted);
            }
            Err(err) if is_unique_violation(&err) => {
                debug!(hash = %entry.hash, "Catalog insert collided, updating");
            }
            Err(err) => return Err(err.into()),
        }

        let assignments: Vec<String> = COLUMNS
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{c} = ?{}", i + 1))
            .collect();
        for (key, outcome) in UNIQUE_KEYS.iter().zip([Upsert::UpdatedByHash, Upsert::UpdatedByLocation]) {
            let conditions: Vec<String> = key
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{c} = ?{}", COLUMNS.len() + i + 1))
                .collect();
            let update = format!(
                "UPDATE {} SET {} WHERE {}",
                quote(&self.table),
                assignments.join(", "),
                conditions.join(" AND ")
            );
            let mut params = entry.values();
            params.extend(entry.key_values(key));
            match conn.execute(&update, params_from_iter(params)) {
                Ok(0) => continue,
                Ok(_) => {
                    info!(hash = %entry.hash, key = ?key, "Updated catalog row");
                    return Ok(outcome);
                }
                Err(err) if is_unique_violation(&err) => {
                    warn!(hash = %entry.hash, key = ?key, "Catalog update collided with another row");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(Error::IdentityConflict(format!(
            "dataset {} at {} ({}) matches no single catalog row in {}",
            entry.hash,
            entry.path,
            entry.name,
            self.db.display()
        )))
    }

    /// Mark the row for `hash` invalid; returns whether a row changed
    pub fn invalidate(&self, hash: &str) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn.execute(
            &format!("UPDATE {} SET is_valid = 0 WHERE hash = ?1", quote(&self.table)),
            [hash],
        )?;
        if changed > 0 {
            info!(hash, "Invalidated catalog row");
        }
        Ok(changed > 0)
    }

    /// Valid row for `hash`
    pub fn get(&self, hash: &str) -> Result<Option<CatalogEntry>> {
        let conn = self.connect()?;
        let sql = format!("{} WHERE hash = ?1 AND is_valid = 1", self.select());
        Ok(conn.query_row(&sql, [hash], CatalogEntry::from_row).optional()?)
    }

    /// Row for `hash`, valid or not
    pub fn get_any(&self, hash: &str) -> Result<Option<CatalogEntry>> {
        let conn = self.connect()?;
        let sql = format!("{} WHERE hash = ?1", self.select());
        Ok(conn.query_row(&sql, [hash], CatalogEntry::from_row).optional()?)
    }

    /// Whether any row has `hash`
    pub fn exists(&self, hash: &str) -> Result<bool> {
        Ok(self.get_any(hash)?.is_some())
    }

    /// Whether the row for `hash` exists and is valid
    pub fn is_valid(&self, hash: &str) -> Result<bool> {
        Ok(self.get(hash)?.is_some())
    }

    /// Rows matching `filter`, in insertion order
    pub fn list(&self, filter: &CatalogFilter) -> Result<Vec<CatalogEntry>> {
        let mut conditions = Vec::new();
        let mut params = Vec::new();
        if !filter.include_invalid {
            conditions.push("is_valid = 1".to_string());
        }
        if let Some(driver_name) = &filter.driver_name {
            params.push(SqlValue::Text(driver_name.clone()));
            conditions.push(format!("driver_name = ?{}", params.len()));
        }
        if let Some(group_name) = &filter.group_name {
            params.push(SqlValue::Text(group_name.clone()));
            conditions.push(format!("group_name = ?{}", params.len()));
        }

        let mut sql = self.select();
        if !conditions.is_empty() {
            sql.push_str(&format!(" WHERE {}", conditions.join(" AND ")));
        }
        let limit = filter.limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        sql.push_str(&format!(" ORDER BY id LIMIT {limit} OFFSET {}", filter.offset));

        let conn = self.connect()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), CatalogEntry::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Number of valid rows
    pub fn count_valid(&self) -> Result<usize> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE is_valid = 1", quote(&self.table)),
            [],
            |r| r.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn catalog(dir: &TempDir) -> Catalog {
        Catalog::new(&Settings::default().with_metadata_path(dir.path().join("metadata")))
    }

    fn entry(hash: &str, name: &str) -> CatalogEntry {
        CatalogEntry {
            hash: hash.to_string(),
            name: name.to_string(),
            author: "someone".to_string(),
            description: String::new(),
            size: 128,
            driver_module: "dama_drivers::slab".to_string(),
            driver_name: "Slab".to_string(),
            path: "/data".to_string(),
            group_name: NO_GROUP.to_string(),
            timestamp: Utc::now(),
            num_groups: 2,
            is_valid: true,
            from_ds_hash: None,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);
        let row = entry("sha1.aa", "iris");
        assert_eq!(catalog.upsert(&row).unwrap(), Upsert::Inserted);
        assert_eq!(catalog.get("sha1.aa").unwrap(), Some(row.clone()));
        assert!(catalog.url().ends_with(CATALOG_FILE));
        assert_eq!(row.group(), None);
    }

    #[test]
    fn test_same_identity_updates_in_place() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);
        catalog.upsert(&entry("sha1.aa", "iris")).unwrap();

        let mut again = entry("sha1.aa", "iris");
        again.size = 256;
        assert_eq!(catalog.upsert(&again).unwrap(), Upsert::UpdatedByHash);
        assert_eq!(catalog.count_valid().unwrap(), 1);
        assert_eq!(catalog.get("sha1.aa").unwrap().unwrap().size, 256);
    }

    #[test]
    fn test_rewritten_location_takes_new_hash() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);
        catalog.upsert(&entry("sha1.aa", "iris")).unwrap();
        assert_eq!(catalog.upsert(&entry("sha1.bb", "iris")).unwrap(), Upsert::UpdatedByLocation);
        assert!(!catalog.exists("sha1.aa").unwrap());
        assert!(catalog.is_valid("sha1.bb").unwrap());
    }

    #[test]
    fn test_conflicting_keys_are_rejected() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);
        catalog.upsert(&entry("sha1.aa", "iris")).unwrap();
        catalog.upsert(&entry("sha1.bb", "wine")).unwrap();

        let err = catalog.upsert(&entry("sha1.aa", "wine")).unwrap_err();
        assert!(matches!(err, Error::IdentityConflict(_)));
        assert_eq!(catalog.count_valid().unwrap(), 2);
    }

    #[test]
    fn test_invalidated_rows_hidden_by_default() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);
        catalog.upsert(&entry("sha1.aa", "iris")).unwrap();
        catalog.upsert(&entry("sha1.bb", "wine")).unwrap();

        assert!(catalog.invalidate("sha1.aa").unwrap());
        assert!(!catalog.invalidate("sha1.zz").unwrap());
        assert_eq!(catalog.get("sha1.aa").unwrap(), None);
        assert!(!catalog.get_any("sha1.aa").unwrap().unwrap().is_valid);
        assert!(catalog.exists("sha1.aa").unwrap());

        let names: Vec<String> = catalog.list(&CatalogFilter::new()).unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["wine"]);
        assert_eq!(catalog.list(&CatalogFilter::new().include_invalid()).unwrap().len(), 2);
        assert_eq!(catalog.count_valid().unwrap(), 1);
    }

    #[test]
    fn test_list_filters_and_pages() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir);
        for (i, driver) in ["Slab", "Sqlite", "Slab", "Slab"].iter().enumerate() {
            let mut row = entry(&format!("sha1.{i}"), &format!("ds{i}"));
            row.driver_name = (*driver).to_string();
            if i == 3 {
                row.group_name = "train".to_string();
            }
            catalog.upsert(&row).unwrap();
        }

        let slab = catalog.list(&CatalogFilter::new().with_driver("Slab")).unwrap();
        assert_eq!(slab.len(), 3);
        let page = catalog.list(&CatalogFilter::new().with_driver("Slab").page(1, 1)).unwrap();
        assert_eq!(page[0].name, "ds2");
        let train = catalog.list(&CatalogFilter::new().with_group("train")).unwrap();
        assert_eq!(train[0].group(), Some("train"));
    }
}
