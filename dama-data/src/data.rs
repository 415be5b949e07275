//! Dataset facade: ingestion, hashing and catalog writes

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dama_core::{
    Array, ChunkSpec, Chunks, ContentHasher, DataType, Group, GroupKey, HashAlgorithm, Schema, Settings, Shape,
    Table,
};
use dama_drivers::{
    create_driver, driver_from_name, write_batches_at, Driver, DriverConfig, Mode, SchemaOptions, WriteReport,
};
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, CatalogEntry, NO_GROUP};
use crate::error::{Error, Result};
use crate::source::DataSource;
use crate::stats::{self, Statistics};

const HASH: &str = "hash";
const AUTHOR: &str = "author";
const DESCRIPTION: &str = "description";
const TIMESTAMP: &str = "timestamp";
const FROM_DS_HASH: &str = "from_ds_hash";

/// Bytes used by a file or directory tree; zero when missing
fn resource_size(path: &Path) -> io::Result<u64> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        total += resource_size(&entry?.path())?;
    }
    Ok(total)
}

/// A named dataset stored through one driver
///
/// `Data` owns its driver. Attributes such as the content hash live in the
/// driver, so they are only readable while it is open.
#[derive(Debug)]
pub struct Data {
    driver: Box<dyn Driver>,
    settings: Settings,
    catalog: Catalog,
    chunk_spec: Option<ChunkSpec>,
    chunks: Option<Chunks>,
    auto_chunks: bool,
    expected: Option<Schema>,
}

impl Data {
    /// Dataset `name` stored by a driver built from `config`
    pub fn new(name: &str, config: DriverConfig, group_name: Option<&str>, settings: &Settings) -> Self {
        Self::from_driver(create_driver(config, name, group_name), settings)
    }

    /// Dataset over an already constructed driver
    pub fn from_driver(driver: Box<dyn Driver>, settings: &Settings) -> Self {
        Self {
            driver,
            settings: settings.clone(),
            catalog: Catalog::new(settings),
            chunk_spec: None,
            chunks: None,
            auto_chunks: false,
            expected: None,
        }
    }

    /// Request an explicit chunk size instead of budget-derived chunks
    #[must_use]
    pub fn with_chunks(mut self, spec: impl Into<ChunkSpec>) -> Self {
        self.chunk_spec = Some(spec.into());
        self
    }

    /// Size chunks from the stored shape when opening for read or append
    #[must_use]
    pub fn with_auto_chunks(mut self, auto_chunks: bool) -> Self {
        self.auto_chunks = auto_chunks;
        self
    }

    /// Schema the stored dataset is checked against when opened for read or append
    ///
    /// Differences are logged, not rejected.
    #[must_use]
    pub fn with_dtypes(mut self, schema: Schema) -> Self {
        self.expected = Some(schema);
        self
    }

    /// Load the valid dataset catalogued under `hash`, opened read-only on demand
    pub fn load(hash: &str, settings: &Settings) -> Result<Data> {
        let catalog = Catalog::new(settings);
        let Some(entry) = catalog.get(hash)? else {
            warn!(hash, table = catalog.table(), url = %catalog.url().display(), "Resource not in catalog");
            return Err(Error::NotFound(format!(
                "resource {hash} does not exist in table '{}' in {}",
                catalog.table(),
                catalog.url().display()
            )));
        };
        let driver = driver_from_name(&entry.driver_name, &entry.path, Mode::Read, &entry.name, entry.group())?;
        debug!(hash, name = %entry.name, driver = %entry.driver_name, "Resolved catalog row");
        Ok(Data::from_driver(driver, settings).with_auto_chunks(true))
    }

    /// Dataset name
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// Group level, if any
    pub fn group_name(&self) -> Option<&str> {
        self.driver.group_name()
    }

    /// Underlying driver
    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    /// Resource location
    pub fn url(&self) -> PathBuf {
        self.driver.url()
    }

    /// Catalog this dataset is recorded in
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Chunks used for reads and the last write
    pub fn chunks(&self) -> Option<&Chunks> {
        self.chunks.as_ref()
    }

    /// Open the driver and resolve read chunks
    pub fn open(&mut self) -> Result<()> {
        self.driver.open()?;
        if matches!(self.driver.mode(), Mode::Read | Mode::Append) && self.driver.exists() {
            if let Some(expected) = &self.expected {
                self.driver.verify_schema(expected)?;
            }
            if self.auto_chunks {
                match self.stored_chunks() {
                    Ok(chunks) => self.chunks = chunks,
                    Err(err) => warn!(%err, name = self.name(), "Could not size chunks from the stored shape"),
                }
            } else if let Some(spec) = &self.chunk_spec {
                self.chunks = Some(Chunks::build_from(spec, &self.driver.groups()?)?);
            }
        }
        debug!(name = self.name(), mode = %self.driver.mode(), chunks = ?self.chunks, "Opened dataset");
        Ok(())
    }

    fn stored_chunks(&self) -> Result<Option<Chunks>> {
        let Some(dtypes) = self.driver.dtypes()? else {
            return Ok(None);
        };
        let shape = self.driver.shape()?;
        Ok(Some(Chunks::build_from_shape(&shape, &dtypes, &self.settings.memory_budget())?))
    }

    /// Close the driver; groups handed out before stop working
    pub fn close(&mut self) -> Result<()> {
        self.driver.close()?;
        Ok(())
    }

    /// Run `f` on the open dataset, closing it on every exit path
    pub fn with_open<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Data) -> Result<T>,
    {
        self.open()?;
        let out = f(self);
        let closed = self.close();
        let out = out?;
        closed?;
        Ok(out)
    }

    fn attr(&self, key: &str) -> Result<Option<String>> {
        Ok(self.driver.attr(key)?)
    }

    /// Stored content hash
    pub fn hash(&self) -> Result<Option<String>> {
        self.attr(HASH)
    }

    /// Author attribute
    pub fn author(&self) -> Result<Option<String>> {
        self.attr(AUTHOR)
    }

    /// Set the author; part of the hash header
    pub fn set_author(&mut self, author: &str) -> Result<()> {
        Ok(self.driver.set_attr(AUTHOR, author)?)
    }

    /// Description attribute
    pub fn description(&self) -> Result<Option<String>> {
        self.attr(DESCRIPTION)
    }

    /// Set the description; part of the hash header
    pub fn set_description(&mut self, description: &str) -> Result<()> {
        Ok(self.driver.set_attr(DESCRIPTION, description)?)
    }

    /// Time of the last write
    pub fn timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(text) = self.attr(TIMESTAMP)? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(&text) {
            Ok(ts) => Ok(Some(ts.with_timezone(&Utc))),
            Err(err) => {
                warn!(%err, value = %text, "Unreadable timestamp attribute");
                Ok(None)
            }
        }
    }

    /// Hash of the dataset this one was derived from
    pub fn from_ds_hash(&self) -> Result<Option<String>> {
        self.attr(FROM_DS_HASH)
    }

    /// Stored columns as a group
    pub fn data(&self) -> Result<Group> {
        Ok(self.driver.manager(self.chunks.clone())?)
    }

    /// Index the stored group
    pub fn get(&self, key: impl Into<GroupKey>) -> Result<Group> {
        Ok(self.data()?.get(key)?)
    }

    /// Dense array over every group
    pub fn to_ndarray(&self, dtype: Option<DataType>) -> Result<Array> {
        Ok(self.data()?.to_ndarray(dtype)?)
    }

    /// Named table over every group
    pub fn to_df(&self) -> Result<Table> {
        Ok(self.data()?.to_df()?)
    }

    /// Shape of the stored groups
    pub fn shape(&self) -> Result<Shape> {
        Ok(self.driver.shape()?)
    }

    /// Rows in the dataset
    pub fn size(&self) -> Result<usize> {
        Ok(self.shape()?.max_length())
    }

    /// Stored schema, empty before the first write
    pub fn dtypes(&self) -> Result<Schema> {
        Ok(self.driver.dtypes()?.unwrap_or_default())
    }

    /// Group names
    pub fn groups(&self) -> Result<Vec<String>> {
        Ok(self.driver.groups()?)
    }

    /// Write `source` through the driver, then hash and catalog it
    ///
    /// In append mode the rows land after the ones already stored. With
    /// `with_hash` unset nothing is hashed or catalogued. Only persistent
    /// drivers get a catalog row.
    pub fn from_data(
        &mut self,
        source: impl Into<DataSource>,
        with_hash: Option<HashAlgorithm>,
        from_ds_hash: Option<&str>,
    ) -> Result<WriteReport> {
        let source: DataSource = source.into();
        let prepared = source.prepare(
            self.chunk_spec.as_ref(),
            &self.settings.memory_budget(),
            self.settings.batch_size,
        )?;
        let start = if self.driver.mode() == Mode::Append && self.driver.exists() {
            self.size()?
        } else {
            0
        };
        self.driver.set_schema(&prepared.schema, &SchemaOptions::new())?;
        if start == 0 {
            self.driver.set_data_shape(&prepared.shape)?;
        }
        let report = write_batches_at(self.driver.as_mut(), prepared.batches, start)?;
        self.chunks = Some(prepared.chunks);

        let hash = with_hash.map(|algorithm| self.calc_hash(algorithm)).transpose()?;
        if let Some(hash) = &hash {
            self.driver.set_attr(HASH, hash)?;
        }
        if let Some(from) = from_ds_hash {
            self.driver.set_attr(FROM_DS_HASH, from)?;
        }
        self.driver.set_attr(TIMESTAMP, &Utc::now().to_rfc3339())?;
        info!(name = self.name(), rows = report.rows(), hash = ?hash, "Stored dataset");

        if hash.is_some() && self.driver.persistent() {
            self.write_metadata()?;
        }
        Ok(report)
    }

    /// Upsert this dataset's catalog row
    pub fn write_metadata(&self) -> Result<()> {
        let entry = self.metadata()?;
        if entry.hash.is_empty() {
            return Err(Error::NotFound(format!("dataset {} has no hash to catalog", self.name())));
        }
        self.catalog.upsert(&entry)?;
        Ok(())
    }

    /// Content digest of the header attributes and every stored value
    ///
    /// Columns are read in group order, `batch_size` rows at a time, so the
    /// digest depends on the settings but not on the write chunks.
    pub fn calc_hash(&self, algorithm: HashAlgorithm) -> Result<String> {
        let mut hasher = ContentHasher::new(algorithm);
        let header: String = [self.author()?, self.description()?].into_iter().flatten().collect();
        hasher.update(header.as_bytes());

        let group = self.data()?;
        let len = group.len()?;
        let step = self.settings.batch_size.max(1);
        for name in group.groups() {
            let column = group.get(name.as_str())?;
            for start in (0..len).step_by(step) {
                let chunk = column.get(start..(start + step).min(len))?.column(&name)?;
                hasher.update(chunk.token());
            }
        }
        Ok(hasher.finalize())
    }

    /// Catalog row describing the current state
    pub fn metadata(&self) -> Result<CatalogEntry> {
        let timestamp = self.timestamp()?.unwrap_or_else(Utc::now);
        Ok(CatalogEntry {
            hash: self.hash()?.unwrap_or_default(),
            name: self.name().to_string(),
            author: self.author()?.unwrap_or_default(),
            description: self.description()?.unwrap_or_default(),
            size: if self.driver.persistent() { resource_size(&self.url())? } else { 0 },
            driver_module: self.driver.driver_module().to_string(),
            driver_name: self.driver.driver_name().to_string(),
            path: self.driver.config().path.to_string_lossy().into_owned(),
            group_name: self.group_name().unwrap_or(NO_GROUP).to_string(),
            timestamp,
            num_groups: self.groups()?.len(),
            is_valid: true,
            from_ds_hash: self.from_ds_hash()?,
        })
    }

    /// Write [`Data::metadata`] as JSON
    pub fn metadata_to_json(&self, writer: impl io::Write) -> Result<()> {
        serde_json::to_writer(writer, &self.metadata()?)?;
        Ok(())
    }

    /// Human readable summary of attributes and groups
    pub fn info(&self) -> Result<String> {
        let shape = self.shape()?;
        let mut lines = vec![
            format!("Name: {}", self.name()),
            format!("Author: {}", self.author()?.unwrap_or_default()),
            format!("Description: {}", self.description()?.unwrap_or_default()),
            format!("URL path: {}", self.url().display()),
            format!("Hash: {}", self.hash()?.unwrap_or_default()),
            format!("{:<16} {:<16} {}", "group", "shape", "dtype"),
        ];
        for field in self.dtypes()?.fields() {
            let dims = format!("{:?}", shape.group(field.name()).unwrap_or_default());
            lines.push(format!("{:<16} {dims:<16} {}", field.name(), field.data_type()));
        }
        lines.push(String::new());
        Ok(lines.join("\n"))
    }

    /// Per-group summary statistics, read `batch_size` rows at a time
    pub fn statistics(&self) -> Result<Statistics> {
        let stats = stats::compute(&self.data()?, self.settings.batch_size)?;
        debug!(name = self.name(), rows = stats.rows, groups = stats.groups.len(), "Computed statistics");
        Ok(stats)
    }

    /// Remove the stored resource and invalidate its catalog row
    pub fn destroy(&mut self) -> Result<()> {
        let hash = self.hash().unwrap_or_else(|err| {
            debug!(%err, name = self.name(), "No readable hash before destroy");
            None
        });
        self.driver.destroy()?;
        self.chunks = None;
        if let (Some(hash), true) = (&hash, self.driver.persistent()) {
            self.catalog.invalidate(hash)?;
        }
        info!(name = self.name(), hash = ?hash, "Destroyed dataset");
        Ok(())
    }

    /// Store the row-wise concatenation of `datasets` in this one
    pub fn concat(&mut self, datasets: &[&Data], with_hash: Option<HashAlgorithm>) -> Result<WriteReport> {
        let parts = datasets.iter().map(|ds| ds.data()).collect::<Result<Vec<_>>>()?;
        let group = Group::concat(&parts)?;
        self.from_data(group, with_hash, None)
    }
}
