//! SQLite row-store driver
//!
//! Every dataset row is one table row keyed by a 1-based `id`. Columns are
//! 1-D; attributes live in a `dama_attrs` side table, which also records the
//! data table's name so a file reopened without a login finds its rows.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use dama_core::{Array, Chunks, ColumnStore, DataType, Group, Schema, Selection, Shape, Value};
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::config::{DriverConfig, DriverKind, Mode};
use crate::driver::{ensure_same_schema, Driver, RowWriter, SchemaOptions, Writer};
use crate::error::{Error, Result};

type SharedConnection = Arc<Mutex<Option<Connection>>>;

const ATTRS_TABLE: &str = "dama_attrs";

/// Attribute key holding the name of the data table
pub const TABLE_ATTR: &str = "data_table";

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn to_sql(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(b)),
        Value::Int(i) => SqlValue::Integer(i),
        Value::Float(x) if x.is_nan() => SqlValue::Null,
        Value::Float(x) => SqlValue::Real(x),
        Value::Text(s) => SqlValue::Text(s),
    }
}

#[allow(clippy::cast_precision_loss)]
fn from_sql(value: SqlValue, dtype: DataType) -> Value {
    match (value, dtype) {
        (SqlValue::Null, _) => Value::Null,
        (SqlValue::Integer(i), DataType::Boolean) => Value::Bool(i != 0),
        (SqlValue::Integer(i), DataType::Float32 | DataType::Float64) => Value::Float(i as f64),
        (SqlValue::Integer(i), _) => Value::Int(i),
        (SqlValue::Real(x), _) => Value::Float(x),
        (SqlValue::Text(s), _) => Value::Text(s),
        (SqlValue::Blob(b), _) => Value::Text(String::from_utf8_lossy(&b).into_owned()),
    }
}

fn one_dimensional(name: &str, shape: &[usize]) -> Result<()> {
    if shape.len() > 1 {
        return Err(dama_core::Error::SchemaConflict(format!(
            "Sqlite stores 1-D columns only, group {name} has shape {shape:?}"
        ))
        .into());
    }
    Ok(())
}

fn sql_error(err: rusqlite::Error) -> dama_core::Error {
    Error::Sql(err).into()
}

/// One table column
#[derive(Debug)]
struct SqliteColumn {
    conn: SharedConnection,
    table: String,
    column: String,
    dtype: DataType,
}

impl SqliteColumn {
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> dama_core::Result<T> {
        let mut guard = self.conn.lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| dama_core::Error::Closed(format!("{}.{}", self.table, self.column)))?;
        f(conn).map_err(sql_error)
    }

    fn to_array(&self, values: Vec<SqlValue>) -> dama_core::Result<Array> {
        let values: Vec<Value> = values.into_iter().map(|v| from_sql(v, self.dtype)).collect();
        Array::from_values(self.dtype, &[values.len()], &values)
    }
}

impl ColumnStore for SqliteColumn {
    fn dtype(&self) -> DataType {
        self.dtype
    }

    fn shape(&self) -> dama_core::Result<Vec<usize>> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote(&self.table));
        let rows: i64 = self.with_conn(|c| c.query_row(&sql, [], |r| r.get(0)))?;
        Ok(vec![usize::try_from(rows).unwrap_or(0)])
    }

    fn read(&self, selection: &Selection) -> dama_core::Result<Array> {
        let column = quote(&self.column);
        let table = quote(&self.table);
        let values = self.with_conn(|c| match selection {
            Selection::All => {
                let mut stmt = c.prepare_cached(&format!("SELECT {column} FROM {table} ORDER BY id"))?;
                let rows = stmt.query_map([], |r| r.get::<_, SqlValue>(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            }
            Selection::Range(range) => {
                let mut stmt = c.prepare_cached(&format!(
                    "SELECT {column} FROM {table} ORDER BY id LIMIT ?1 OFFSET ?2"
                ))?;
                let limit = i64::try_from(range.len()).unwrap_or(i64::MAX);
                let offset = i64::try_from(range.start).unwrap_or(i64::MAX);
                let rows = stmt.query_map(params![limit, offset], |r| r.get::<_, SqlValue>(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            }
            Selection::Rows(indices) => {
                let mut stmt =
                    c.prepare_cached(&format!("SELECT {column} FROM {table} WHERE id = ?1"))?;
                indices
                    .iter()
                    .map(|&i| {
                        let id = i64::try_from(i + 1).unwrap_or(i64::MAX);
                        stmt.query_row([id], |r| r.get::<_, SqlValue>(0))
                    })
                    .collect::<rusqlite::Result<Vec<_>>>()
            }
        })?;
        self.to_array(values)
    }

    fn write(&self, start: usize, data: &Array) -> dama_core::Result<()> {
        one_dimensional(&self.column, data.shape())?;
        let column = quote(&self.column);
        let table = quote(&self.table);
        self.with_conn(|c| {
            let tx = c.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&format!(
                    "INSERT INTO {table} (id, {column}) VALUES (?1, ?2) \
                     ON CONFLICT(id) DO UPDATE SET {column} = excluded.{column}"
                ))?;
                for (i, value) in data.values().into_iter().enumerate() {
                    let id = i64::try_from(start + i + 1).unwrap_or(i64::MAX);
                    stmt.execute(params![id, to_sql(value)])?;
                }
            }
            tx.commit()
        })
    }
}

/// Persistent driver storing rows in a SQLite table
#[derive(Debug)]
pub struct SqliteDriver {
    config: DriverConfig,
    name: String,
    group_name: Option<String>,
    table: String,
    conn: SharedConnection,
}

impl SqliteDriver {
    /// Create a closed driver
    ///
    /// The table comes from the login, else from the table recorded in the
    /// file when it is opened, else the dataset name.
    pub fn new(config: DriverConfig, name: impl Into<String>, group_name: Option<&str>) -> Self {
        let name = name.into();
        let table = config.login.table.clone().unwrap_or_else(|| name.clone());
        Self {
            config,
            name,
            group_name: group_name.map(ToString::to_string),
            table,
            conn: Arc::new(Mutex::new(None)),
        }
    }

    /// Table holding the rows
    pub fn table(&self) -> &str {
        &self.table
    }

    fn attrs_table() -> String {
        quote(ATTRS_TABLE)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut guard = self.conn.lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| dama_core::Error::Closed(self.url().display().to_string()))?;
        Ok(f(conn)?)
    }

    fn has_table(&self, table: &str) -> Result<bool> {
        self.with_conn(|c| {
            c.query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
        })
    }

    fn table_exists(&self) -> Result<bool> {
        self.has_table(&self.table)
    }

    /// Adopt the table recorded in the file unless the login names one
    fn resolve_table(&mut self) -> Result<()> {
        if self.config.login.table.is_some() {
            return Ok(());
        }
        if let Some(table) = self.attr(TABLE_ATTR)? {
            if table != self.table {
                debug!(table = %table, "Using table recorded in sqlite file");
                self.table = table;
            }
        }
        Ok(())
    }
}

impl Driver for SqliteDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Sqlite
    }

    fn config(&self) -> &DriverConfig {
        &self.config
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn group_name(&self) -> Option<&str> {
        self.group_name.as_deref()
    }

    fn open(&mut self) -> Result<()> {
        let url: PathBuf = self.url();
        match self.config.mode {
            Mode::Write => self.destroy()?,
            Mode::Read if !url.exists() => {
                return Err(dama_core::Error::NotFound(format!("Sqlite dataset {}", url.display())).into())
            }
            _ => {}
        }
        if let Some(parent) = url.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&url)?;
        self.conn = Arc::new(Mutex::new(Some(conn)));
        self.resolve_table()?;
        debug!(url = %url.display(), mode = %self.config.mode, "Opened sqlite driver");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.lock().take() {
            conn.close().map_err(|(_, err)| Error::Sql(err))?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.conn.lock().is_some()
    }

    fn dtypes(&self) -> Result<Option<Schema>> {
        let sql = format!("PRAGMA table_info({})", quote(&self.table));
        let columns = self.with_conn(|c| {
            let mut stmt = c.prepare(&sql)?;
            let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(1)?, r.get::<_, String>(2)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        let fields: Vec<(String, DataType)> = columns
            .into_iter()
            .filter(|(name, _)| name != "id")
            .map(|(name, sql_type)| (name, DataType::from_sql_type(&sql_type)))
            .collect();
        Ok(if fields.is_empty() {
            None
        } else {
            Some(Schema::from_pairs(fields))
        })
    }

    fn set_schema(&mut self, schema: &Schema, options: &SchemaOptions) -> Result<()> {
        if let Some(existing) = self.dtypes()? {
            return ensure_same_schema(&existing, schema);
        }
        let mut columns = vec!["id INTEGER PRIMARY KEY".to_string()];
        for field in schema.fields() {
            let unique = options
                .unique
                .iter()
                .any(|key| key.len() == 1 && key[0] == field.name());
            columns.push(format!(
                "{} {}{}",
                quote(field.name()),
                field.data_type().sql_type(),
                if unique { " UNIQUE" } else { "" }
            ));
        }
        for key in options.unique.iter().filter(|key| key.len() > 1) {
            let key: Vec<String> = key.iter().map(|c| quote(c)).collect();
            columns.push(format!("UNIQUE ({})", key.join(", ")));
        }

        let table = self.table.clone();
        let create = format!("CREATE TABLE {} ({})", quote(&table), columns.join(", "));
        let indices: Vec<String> = options
            .indices
            .iter()
            .map(|cols| {
                let index_name = format!("{}_{table}_index", cols.join("_"));
                let on: Vec<String> = cols.iter().map(|c| quote(c)).collect();
                format!("CREATE INDEX {} ON {} ({})", quote(&index_name), quote(&table), on.join(", "))
            })
            .collect();
        self.with_conn(|c| {
            let tx = c.transaction()?;
            tx.execute(&create, [])?;
            for index in &indices {
                tx.execute(index, [])?;
            }
            tx.commit()
        })?;
        self.set_attr(TABLE_ATTR, &table)?;
        info!(table = %table, columns = schema.len(), "Created sqlite table");
        Ok(())
    }

    fn set_data_shape(&mut self, shape: &Shape) -> Result<()> {
        for (name, dims) in shape.iter() {
            one_dimensional(name, dims)?;
        }
        Ok(())
    }

    fn writer(&mut self) -> Result<Writer<'_>> {
        Ok(Writer::Rows(self))
    }

    fn exists(&self) -> bool {
        if self.is_open() {
            self.table_exists().unwrap_or(false)
        } else {
            self.url().exists()
        }
    }

    fn destroy(&mut self) -> Result<()> {
        self.close()?;
        let url = self.url();
        match fs::remove_file(&url) {
            Ok(()) => debug!(url = %url.display(), "Removed sqlite resource"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    fn manager(&self, chunks: Option<Chunks>) -> Result<Group> {
        let schema = self.dtypes()?.unwrap_or_default();
        let stores = schema.fields().iter().map(|field| {
            let store: Arc<dyn ColumnStore> = Arc::new(SqliteColumn {
                conn: Arc::clone(&self.conn),
                table: self.table.clone(),
                column: field.name().to_string(),
                dtype: field.data_type(),
            });
            (field.name().to_string(), store)
        });
        let group = Group::from_stores(stores);
        Ok(match chunks {
            Some(chunks) => group.with_chunks(chunks),
            None => group,
        })
    }

    fn attr(&self, key: &str) -> Result<Option<String>> {
        if !self.has_table(ATTRS_TABLE)? {
            return Ok(None);
        }
        let table = Self::attrs_table();
        self.with_conn(|c| {
            c.query_row(&format!("SELECT value FROM {table} WHERE key = ?1"), [key], |r| r.get(0))
                .optional()
        })
    }

    fn set_attr(&mut self, key: &str, value: &str) -> Result<()> {
        let table = Self::attrs_table();
        self.with_conn(|c| {
            c.execute(
                &format!("CREATE TABLE IF NOT EXISTS {table} (key TEXT PRIMARY KEY, value TEXT)"),
                [],
            )?;
            c.execute(
                &format!(
                    "INSERT INTO {table} (key, value) VALUES (?1, ?2) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value"
                ),
                [key, value],
            )
        })?;
        Ok(())
    }

    fn persistent(&self) -> bool {
        true
    }
}

impl RowWriter for SqliteDriver {
    fn write_rows(&mut self, start: usize, chunk: &Group) -> Result<usize> {
        let arrays = chunk.to_arrays()?;
        for (name, data) in &arrays {
            one_dimensional(name, data.shape())?;
        }
        let rows = chunk.len()?;
        let names: Vec<String> = arrays.keys().map(|n| quote(chunk.backing_name(n))).collect();
        let placeholders: Vec<String> = (2..=names.len() + 1).map(|i| format!("?{i}")).collect();
        let updates: Vec<String> = names.iter().map(|n| format!("{n} = excluded.{n}")).collect();
        let sql = format!(
            "INSERT INTO {} (id, {}) VALUES (?1, {}) ON CONFLICT(id) DO UPDATE SET {}",
            quote(&self.table),
            names.join(", "),
            placeholders.join(", "),
            updates.join(", ")
        );
        let columns: Vec<Vec<Value>> = arrays.values().map(Array::values).collect();

        self.with_conn(|c| {
            let tx = c.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&sql)?;
                for i in 0..rows {
                    let id = i64::try_from(start + i + 1).unwrap_or(i64::MAX);
                    let mut row = vec![SqlValue::Integer(id)];
                    row.extend(
                        columns
                            .iter()
                            .map(|col| to_sql(col.get(i).cloned().unwrap_or(Value::Null))),
                    );
                    stmt.execute(params_from_iter(row))?;
                }
            }
            tx.commit()
        })?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Login;
    use crate::driver::with_open;
    use crate::write::write_batches;
    use tempfile::TempDir;

    fn driver(dir: &TempDir, mode: Mode) -> SqliteDriver {
        let config = DriverConfig::new(DriverKind::Sqlite, dir.path()).with_mode(mode);
        SqliteDriver::new(config, "points", None)
    }

    fn points() -> Group {
        Group::from_arrays([
            ("id_str", Array::from_vec((0..6).map(|i| format!("p{i}")).collect::<Vec<_>>())),
            ("score", Array::from_vec(vec![0.5_f64, 1.5, 2.5, 3.5, 4.5, 5.5])),
            ("flag", Array::from_vec(vec![true, false, true, false, true, false])),
        ])
        .unwrap()
    }

    #[test]
    fn test_rows_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut d = driver(&dir, Mode::Write);
        let data = points();
        with_open(&mut d, |d| {
            d.set_schema(&data.dtypes(), &SchemaOptions::new().with_unique(&["id_str"]).with_index(&["score"]))?;
            write_batches(d, data.batches(4)?)
        })
        .unwrap();

        let mut d = driver(&dir, Mode::Read);
        d.open().unwrap();
        assert_eq!(d.dtypes().unwrap(), Some(data.dtypes()));
        let group = d.manager(None).unwrap();
        assert_eq!(group.len().unwrap(), 6);
        assert_eq!(group.column("score").unwrap(), data.column("score").unwrap());
        assert_eq!(group.column("flag").unwrap(), data.column("flag").unwrap());
        let tail = group.get(4..6).unwrap();
        assert_eq!(tail.column("id_str").unwrap().values(), vec![Value::from("p4"), Value::from("p5")]);
    }

    #[test]
    fn test_index_and_unique_constraints() {
        let dir = TempDir::new().unwrap();
        let mut d = driver(&dir, Mode::Write);
        d.open().unwrap();
        d.set_schema(
            &points().dtypes(),
            &SchemaOptions::new().with_unique(&["id_str"]).with_index(&["score", "flag"]),
        )
        .unwrap();
        let index: Option<String> = d
            .with_conn(|c| {
                c.query_row(
                    "SELECT name FROM sqlite_master WHERE type = 'index' AND name = 'score_flag_points_index'",
                    [],
                    |r| r.get(0),
                )
                .optional()
            })
            .unwrap();
        assert!(index.is_some());

        let dup = Group::from_arrays([
            ("id_str", Array::from_vec(vec!["a".to_string(), "a".to_string()])),
            ("score", Array::from_vec(vec![1.0_f64, 2.0])),
            ("flag", Array::from_vec(vec![true, true])),
        ])
        .unwrap();
        assert!(d.write_rows(0, &dup).is_err());
    }

    #[test]
    fn test_multi_dimensional_rejected() {
        let dir = TempDir::new().unwrap();
        let mut d = driver(&dir, Mode::Write);
        d.open().unwrap();
        let shape = Shape::from_groups([("x", vec![10, 3])]);
        let err = d.set_data_shape(&shape).unwrap_err();
        assert!(matches!(err, Error::Core(dama_core::Error::SchemaConflict(_))));
    }

    #[test]
    fn test_attrs_and_destroy() {
        let dir = TempDir::new().unwrap();
        let mut d = driver(&dir, Mode::Write);
        d.open().unwrap();
        assert_eq!(d.attr("hash").unwrap(), None);
        d.set_attr("hash", "sha1.abc").unwrap();
        d.set_attr("hash", "sha1.def").unwrap();
        assert_eq!(d.attr("hash").unwrap().as_deref(), Some("sha1.def"));

        assert!(d.url().exists());
        d.destroy().unwrap();
        assert!(!d.url().exists());
        assert!(!d.is_open());
        assert!(driver(&dir, Mode::Read).open().unwrap_err().is_not_found());
    }

    #[test]
    fn test_column_handles_close_with_driver() {
        let dir = TempDir::new().unwrap();
        let mut d = driver(&dir, Mode::Write);
        d.open().unwrap();
        d.set_schema(&points().dtypes(), &SchemaOptions::new()).unwrap();
        d.write_rows(0, &points()).unwrap();
        let group = d.manager(None).unwrap();
        d.close().unwrap();
        assert!(matches!(group.column("score"), Err(dama_core::Error::Closed(_))));
    }

    #[test]
    fn test_login_table_recorded_for_reopen() {
        let dir = TempDir::new().unwrap();
        let config = DriverConfig::new(DriverKind::Sqlite, dir.path())
            .with_mode(Mode::Write)
            .with_login(Login::with_table("t1"));
        let mut d = SqliteDriver::new(config, "points", None);
        let data = points();
        with_open(&mut d, |d| {
            d.set_schema(&data.dtypes(), &SchemaOptions::new())?;
            write_batches(d, data.batches(4)?)
        })
        .unwrap();

        let mut d = driver(&dir, Mode::Read);
        assert_eq!(d.table(), "points");
        d.open().unwrap();
        assert_eq!(d.table(), "t1");
        assert_eq!(d.attr(TABLE_ATTR).unwrap().as_deref(), Some("t1"));
        assert_eq!(d.manager(None).unwrap().len().unwrap(), 6);
        assert_eq!(d.dtypes().unwrap(), Some(data.dtypes()));
    }

    #[test]
    fn test_schema_conflict_on_write() {
        let dir = TempDir::new().unwrap();
        let mut d = driver(&dir, Mode::Write);
        d.open().unwrap();
        d.set_schema(&points().dtypes(), &SchemaOptions::new()).unwrap();
        d.set_schema(&points().dtypes(), &SchemaOptions::new()).unwrap();
        let other = Schema::from_pairs([("score", DataType::Utf8)]);
        assert!(d.set_schema(&other, &SchemaOptions::new()).is_err());
    }
}
