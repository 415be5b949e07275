//! In-process driver backed by shared arrays

use std::sync::Arc;

use dama_core::{Array, Chunks, ColumnStore, DataType, Group, MemoryColumn, Schema, Selection, Shape};
use indexmap::IndexMap;
use tracing::debug;

use crate::config::{DriverConfig, DriverKind, Mode};
use crate::driver::{ensure_same_schema, ColumnSlabWriter, Driver, OpenFlag, SchemaOptions, Writer};
use crate::error::Result;

/// Column handle that stops working once the driver closes
#[derive(Debug)]
struct MemoryStore {
    name: String,
    column: Arc<MemoryColumn>,
    flag: OpenFlag,
}

impl ColumnStore for MemoryStore {
    fn dtype(&self) -> DataType {
        self.column.dtype()
    }

    fn shape(&self) -> dama_core::Result<Vec<usize>> {
        self.flag.check(&self.name)?;
        self.column.shape()
    }

    fn read(&self, selection: &Selection) -> dama_core::Result<Array> {
        self.flag.check(&self.name)?;
        self.column.read(selection)
    }

    fn write(&self, start: usize, data: &Array) -> dama_core::Result<()> {
        self.flag.check(&self.name)?;
        self.column.write(start, data)
    }
}

/// Non-persistent driver keeping every column in memory
///
/// Data survives close and reopen of the same driver value, but not the
/// value itself.
#[derive(Debug)]
pub struct MemoryDriver {
    config: DriverConfig,
    name: String,
    group_name: Option<String>,
    schema: Option<Schema>,
    columns: IndexMap<String, Arc<MemoryColumn>>,
    attrs: IndexMap<String, String>,
    flag: OpenFlag,
}

impl MemoryDriver {
    /// Create a closed driver
    pub fn new(config: DriverConfig, name: impl Into<String>, group_name: Option<&str>) -> Self {
        Self {
            config,
            name: name.into(),
            group_name: group_name.map(ToString::to_string),
            schema: None,
            columns: IndexMap::new(),
            attrs: IndexMap::new(),
            flag: OpenFlag::default(),
        }
    }

    fn column(&self, name: &str) -> Result<&Arc<MemoryColumn>> {
        self.columns
            .get(name)
            .ok_or_else(|| dama_core::Error::NotFound(format!("Group not found: {name}")).into())
    }

    fn check_open(&self) -> Result<()> {
        Ok(self.flag.check(&self.name)?)
    }
}

impl Driver for MemoryDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Memory
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
        match self.config.mode {
            Mode::Write => self.destroy()?,
            Mode::Read if !self.exists() => {
                return Err(dama_core::Error::NotFound(format!("Memory dataset {}", self.name)).into())
            }
            _ => {}
        }
        self.flag = OpenFlag::opened();
        debug!(name = %self.name, mode = %self.config.mode, "Opened memory driver");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flag.close();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.flag.is_open()
    }

    fn dtypes(&self) -> Result<Option<Schema>> {
        Ok(self.schema.clone())
    }

    fn set_schema(&mut self, schema: &Schema, _options: &SchemaOptions) -> Result<()> {
        self.check_open()?;
        if let Some(existing) = &self.schema {
            return ensure_same_schema(existing, schema);
        }
        self.columns = schema
            .fields()
            .iter()
            .map(|f| {
                let column = MemoryColumn::new(Array::zeros(f.data_type(), &[0]));
                (f.name().to_string(), Arc::new(column))
            })
            .collect();
        self.schema = Some(schema.clone());
        Ok(())
    }

    fn set_data_shape(&mut self, shape: &Shape) -> Result<()> {
        self.check_open()?;
        for (name, dims) in shape.iter() {
            let column = self.column(name)?;
            if column.shape()?.first().copied().unwrap_or(0) == 0 {
                let preallocated = MemoryColumn::new(Array::zeros(column.dtype(), dims));
                self.columns.insert(name.to_string(), Arc::new(preallocated));
            }
        }
        Ok(())
    }

    fn writer(&mut self) -> Result<Writer<'_>> {
        self.check_open()?;
        Ok(Writer::ColumnSlabs(self))
    }

    fn exists(&self) -> bool {
        self.schema.is_some()
    }

    fn destroy(&mut self) -> Result<()> {
        self.schema = None;
        self.columns.clear();
        self.attrs.clear();
        debug!(name = %self.name, "Destroyed memory dataset");
        Ok(())
    }

    fn manager(&self, chunks: Option<Chunks>) -> Result<Group> {
        self.check_open()?;
        let stores = self.columns.iter().map(|(name, column)| {
            let store: Arc<dyn ColumnStore> = Arc::new(MemoryStore {
                name: name.clone(),
                column: Arc::clone(column),
                flag: self.flag.clone(),
            });
            (name.clone(), store)
        });
        let group = Group::from_stores(stores);
        Ok(match chunks {
            Some(chunks) => group.with_chunks(chunks),
            None => group,
        })
    }

    fn attr(&self, key: &str) -> Result<Option<String>> {
        Ok(self.attrs.get(key).cloned())
    }

    fn set_attr(&mut self, key: &str, value: &str) -> Result<()> {
        self.attrs.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn persistent(&self) -> bool {
        false
    }
}

impl ColumnSlabWriter for MemoryDriver {
    fn write_slab(&mut self, start: usize, chunk: &Group) -> Result<usize> {
        self.check_open()?;
        for (name, data) in chunk.to_arrays()? {
            let backing = chunk.backing_name(&name).to_string();
            let column = self.column(&name).or_else(|_| self.column(&backing))?;
            column.write(start, &data)?;
        }
        Ok(chunk.len()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(mode: Mode) -> MemoryDriver {
        MemoryDriver::new(DriverConfig::new(DriverKind::Memory, "data").with_mode(mode), "mem", None)
    }

    fn schema() -> Schema {
        Schema::from_pairs([("a", DataType::Int64), ("b", DataType::Float64)])
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let err = driver(Mode::Read).open().unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_schema_idempotent_and_conflicting() {
        let mut d = driver(Mode::Write);
        d.open().unwrap();
        d.set_schema(&schema(), &SchemaOptions::new()).unwrap();
        d.set_schema(&schema(), &SchemaOptions::new()).unwrap();
        let other = Schema::from_pairs([("a", DataType::Utf8)]);
        let err = d.set_schema(&other, &SchemaOptions::new()).unwrap_err();
        assert!(matches!(err, crate::Error::Core(dama_core::Error::SchemaConflict(_))));
    }

    #[test]
    fn test_handles_fail_after_close() {
        let mut d = driver(Mode::Write);
        d.open().unwrap();
        d.set_schema(&schema(), &SchemaOptions::new()).unwrap();
        let group = d.manager(None).unwrap();
        d.close().unwrap();
        assert!(matches!(group.column("a"), Err(dama_core::Error::Closed(_))));

        d.open().unwrap();
        assert!(group.column("a").is_err());
        assert!(d.manager(None).unwrap().column("a").is_ok());
    }

    #[test]
    fn test_write_mode_clears_existing() {
        let mut d = driver(Mode::Append);
        d.open().unwrap();
        d.set_schema(&schema(), &SchemaOptions::new()).unwrap();
        d.set_attr("author", "someone").unwrap();
        d.close().unwrap();

        d.config.mode = Mode::Write;
        d.open().unwrap();
        assert!(!d.exists());
        assert_eq!(d.attr("author").unwrap(), None);
        assert_eq!(d.spaces(), vec!["data", "metadata"]);
    }
}
