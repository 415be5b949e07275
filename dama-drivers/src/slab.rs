//! Memory-mapped column slab driver
//!
//! A dataset is a directory holding a JSON manifest plus one file per column.
//! Fixed-width columns are raw element bytes in native order, addressed row by
//! row through a memory map. Text columns are `bincode` framed records plus an
//! `.offsets` file of `u64` record end offsets, so a row range reads only its
//! own bytes.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytemuck::Pod;
use dama_core::{Array, Chunks, ColumnStore, DataType, Group, Schema, Selection, Shape};
use indexmap::IndexMap;
use memmap2::{Mmap, MmapMut};
use ndarray::ArrayD;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{Compressor, DriverConfig, DriverKind, Mode};
use crate::driver::{ensure_same_schema, ColumnSlabWriter, Driver, SchemaOptions, Writer};
use crate::error::{Error, Result};

const MANIFEST: &str = "manifest.json";

fn native_byte_order() -> String {
    let order = if cfg!(target_endian = "little") { "little" } else { "big" };
    order.to_string()
}

/// Everything about a slab dataset except the column bytes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Manifest {
    schema: Schema,
    shapes: IndexMap<String, Vec<usize>>,
    compressor: Option<Compressor>,
    attrs: IndexMap<String, String>,
    byte_order: String,
}

impl Manifest {
    fn load(dir: &Path) -> Result<Manifest> {
        let reader = BufReader::new(File::open(dir.join(MANIFEST))?);
        let manifest: Manifest = serde_json::from_reader(reader)?;
        if manifest.byte_order != native_byte_order() {
            return Err(dama_core::Error::SchemaConflict(format!(
                "slab written in {} endian order",
                manifest.byte_order
            ))
            .into());
        }
        Ok(manifest)
    }

    fn save(&self, dir: &Path) -> Result<()> {
        let writer = BufWriter::new(File::create(dir.join(MANIFEST))?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

/// Open manifest shared by the driver and its column handles; `None` once closed
type SharedManifest = Arc<RwLock<Option<Manifest>>>;

fn column_file(dir: &Path, index: usize, dtype: DataType) -> PathBuf {
    let ext = if dtype.is_fixed_width() { "bin" } else { "bincode" };
    dir.join(format!("{index:04}.{ext}"))
}

const OFFSET_BYTES: usize = std::mem::size_of::<u64>();

fn offsets_file(path: &Path) -> PathBuf {
    path.with_extension("offsets")
}

#[allow(clippy::cast_possible_truncation)]
fn to_usize(n: u64) -> usize {
    n as usize
}

fn read_at(path: &Path, offset: u64, len: usize) -> dama_core::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

fn pod_bytes<T: Pod>(array: &ArrayD<T>) -> Vec<u8> {
    let values: Vec<T> = array.iter().copied().collect();
    bytemuck::cast_slice(&values).to_vec()
}

fn pod_values<T: Pod>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .collect()
}

fn encode(array: &Array) -> Vec<u8> {
    match array {
        Array::Boolean(a) => a.iter().map(|&b| u8::from(b)).collect(),
        Array::Int32(a) => pod_bytes(a),
        Array::Int64(a) => pod_bytes(a),
        Array::Float32(a) => pod_bytes(a),
        Array::Float64(a) => pod_bytes(a),
        Array::Utf8(_) => Vec::new(),
    }
}

fn decode(dtype: DataType, shape: &[usize], bytes: &[u8]) -> dama_core::Result<Array> {
    match dtype {
        DataType::Boolean => Array::from_shape_vec(shape, bytes.iter().map(|&b| b != 0).collect::<Vec<_>>()),
        DataType::Int32 => Array::from_shape_vec(shape, pod_values::<i32>(bytes)),
        DataType::Int64 => Array::from_shape_vec(shape, pod_values::<i64>(bytes)),
        DataType::Float32 => Array::from_shape_vec(shape, pod_values::<f32>(bytes)),
        DataType::Float64 => Array::from_shape_vec(shape, pod_values::<f64>(bytes)),
        DataType::Utf8 => Err(dama_core::Error::type_mismatch("fixed width", dtype)),
    }
}

/// One column file
#[derive(Debug)]
struct SlabColumn {
    manifest: SharedManifest,
    path: PathBuf,
    name: String,
    dtype: DataType,
}

impl SlabColumn {
    fn dims(&self) -> dama_core::Result<Vec<usize>> {
        let guard = self.manifest.read();
        let manifest = guard
            .as_ref()
            .ok_or_else(|| dama_core::Error::Closed(self.name.clone()))?;
        Ok(manifest.shapes.get(&self.name).cloned().unwrap_or_else(|| vec![0]))
    }

    fn row_bytes(&self, dims: &[usize]) -> usize {
        dims.iter().skip(1).product::<usize>() * self.dtype.size_bytes()
    }

    /// Raw bytes of a row range; the caller holds the manifest read lock
    #[allow(unsafe_code)]
    fn read_range(&self, dims: &[usize], rows: Range<usize>) -> dama_core::Result<Array> {
        let row_bytes = self.row_bytes(dims);
        let mut shape = dims.to_vec();
        shape[0] = rows.len();
        if rows.is_empty() || row_bytes == 0 {
            return Ok(Array::zeros(self.dtype, &shape));
        }
        let file = File::open(&self.path)?;
        // SAFETY: the caller holds the manifest read lock and this process only
        // resizes column files under its write lock
        let mmap = unsafe { Mmap::map(&file)? };
        let bytes = mmap
            .get(rows.start * row_bytes..rows.end * row_bytes)
            .ok_or(dama_core::Error::IndexOutOfBounds {
                index: rows.end,
                len: mmap.len() / row_bytes,
            })?;
        decode(self.dtype, &shape, bytes)
    }

    /// Record end offsets of `rows`, preceded by the start of the first one
    fn text_bounds(&self, rows: Range<usize>) -> dama_core::Result<Vec<u64>> {
        let first = rows.start.saturating_sub(1);
        let bytes = read_at(
            &offsets_file(&self.path),
            (first * OFFSET_BYTES) as u64,
            (rows.end - first) * OFFSET_BYTES,
        )?;
        let mut bounds = pod_values::<u64>(&bytes);
        if rows.start == 0 {
            bounds.insert(0, 0);
        }
        Ok(bounds)
    }

    /// Text rows of a range, reading only their records
    fn read_text(&self, rows: Range<usize>) -> dama_core::Result<Vec<String>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let bounds = self.text_bounds(rows)?;
        let base = bounds[0];
        let span = read_at(&self.path, base, to_usize(bounds[bounds.len() - 1] - base))?;
        bounds
            .windows(2)
            .map(|w| {
                let record = &span[to_usize(w[0] - base)..to_usize(w[1] - base)];
                Ok(bincode::deserialize::<String>(record)?)
            })
            .collect()
    }

    #[allow(unsafe_code)]
    fn write_fixed(&self, start: usize, rows: usize, row_bytes: usize, data: &Array) -> dama_core::Result<()> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(&self.path)?;
        let needed = ((start + data.len()).max(rows) * row_bytes) as u64;
        if file.metadata()?.len() < needed {
            file.set_len(needed)?;
        }
        if data.is_empty() || row_bytes == 0 {
            return Ok(());
        }
        // SAFETY: the manifest write lock is held for the whole write
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let bytes = encode(data);
        let offset = start * row_bytes;
        mmap[offset..offset + bytes.len()].copy_from_slice(&bytes);
        mmap.flush()?;
        Ok(())
    }

    /// Write text rows at `start`
    ///
    /// Both files are cut back to `start` and rewritten from there, so
    /// appends touch only new records and an overwrite in the middle
    /// rewrites only the rows after it.
    fn write_text(&self, start: usize, rows: usize, data: &Array) -> dama_core::Result<()> {
        let end = start + data.len();
        let tail = if end < rows { self.read_text(end..rows)? } else { Vec::new() };
        let kept = start.min(rows);
        let mut offset = if kept == 0 { 0 } else { self.text_bounds(kept - 1..kept)?[1] };

        let mut records: Vec<String> = vec![String::new(); start - kept];
        records.extend(
            data.values()
                .into_iter()
                .map(|v| v.as_str().map(ToString::to_string).unwrap_or_default()),
        );
        records.extend(tail);

        let data_file = OpenOptions::new().write(true).create(true).open(&self.path)?;
        data_file.set_len(offset)?;
        let offsets = OpenOptions::new().write(true).create(true).open(offsets_file(&self.path))?;
        offsets.set_len((kept * OFFSET_BYTES) as u64)?;

        let mut data_out = BufWriter::new(data_file);
        data_out.seek(SeekFrom::Start(offset))?;
        let mut ends = Vec::with_capacity(records.len());
        for record in &records {
            let bytes = bincode::serialize(record)?;
            data_out.write_all(&bytes)?;
            offset += bytes.len() as u64;
            ends.push(offset);
        }
        data_out.flush()?;

        let mut offsets_out = BufWriter::new(offsets);
        offsets_out.seek(SeekFrom::Start((kept * OFFSET_BYTES) as u64))?;
        offsets_out.write_all(bytemuck::cast_slice(&ends))?;
        offsets_out.flush()?;
        Ok(())
    }
}

impl ColumnStore for SlabColumn {
    fn dtype(&self) -> DataType {
        self.dtype
    }

    fn shape(&self) -> dama_core::Result<Vec<usize>> {
        self.dims()
    }

    fn read(&self, selection: &Selection) -> dama_core::Result<Array> {
        let guard = self.manifest.read();
        let manifest = guard
            .as_ref()
            .ok_or_else(|| dama_core::Error::Closed(self.name.clone()))?;
        let dims = manifest.shapes.get(&self.name).cloned().unwrap_or_else(|| vec![0]);
        let len = dims[0];
        if !self.dtype.is_fixed_width() {
            return match selection {
                Selection::All => Ok(Array::from_vec(self.read_text(0..len)?)),
                Selection::Range(r) => {
                    let end = r.end.min(len);
                    Ok(Array::from_vec(self.read_text(r.start.min(end)..end)?))
                }
                Selection::Rows(indices) => {
                    let values = indices
                        .iter()
                        .map(|&i| {
                            if i >= len {
                                return Err(dama_core::Error::IndexOutOfBounds { index: i, len });
                            }
                            Ok(self.read_text(i..i + 1)?.into_iter().next().unwrap_or_default())
                        })
                        .collect::<dama_core::Result<Vec<_>>>()?;
                    Ok(Array::from_vec(values))
                }
            };
        }
        match selection {
            Selection::All => self.read_range(&dims, 0..len),
            Selection::Range(r) => {
                let end = r.end.min(len);
                self.read_range(&dims, r.start.min(end)..end)
            }
            Selection::Rows(indices) => {
                let rows = indices
                    .iter()
                    .map(|&i| {
                        if i >= len {
                            return Err(dama_core::Error::IndexOutOfBounds { index: i, len });
                        }
                        self.read_range(&dims, i..i + 1)
                    })
                    .collect::<dama_core::Result<Vec<_>>>()?;
                if rows.is_empty() {
                    let mut shape = dims.clone();
                    shape[0] = 0;
                    return Ok(Array::zeros(self.dtype, &shape));
                }
                Array::concat_rows(&rows)
            }
        }
    }

    fn write(&self, start: usize, data: &Array) -> dama_core::Result<()> {
        let mut guard = self.manifest.write();
        let manifest = guard
            .as_mut()
            .ok_or_else(|| dama_core::Error::Closed(self.name.clone()))?;
        let dims = manifest.shapes.get(&self.name).cloned().unwrap_or_else(|| vec![0]);
        let data = if data.ndim() == 0 { data.reshape(&[1])? } else { data.cast(self.dtype)? };

        let row_dims = &data.shape()[1..];
        let rows = dims[0];
        if rows > 0 && dims[1..] != *row_dims {
            return Err(dama_core::Error::SchemaConflict(format!(
                "group {} stores rows of {:?}, got {row_dims:?}",
                self.name,
                &dims[1..]
            )));
        }
        let mut new_dims = vec![rows.max(start + data.len())];
        new_dims.extend_from_slice(row_dims);

        if self.dtype.is_fixed_width() {
            self.write_fixed(start, rows, self.row_bytes(&new_dims), &data)?;
        } else {
            self.write_text(start, rows, &data)?;
        }
        manifest.shapes.insert(self.name.clone(), new_dims);
        Ok(())
    }
}

/// Persistent driver writing memory-mapped column files
#[derive(Debug)]
pub struct SlabDriver {
    config: DriverConfig,
    name: String,
    group_name: Option<String>,
    manifest: SharedManifest,
}

impl SlabDriver {
    /// Create a closed driver
    pub fn new(config: DriverConfig, name: impl Into<String>, group_name: Option<&str>) -> Self {
        Self {
            config,
            name: name.into(),
            group_name: group_name.map(ToString::to_string),
            manifest: Arc::new(RwLock::new(None)),
        }
    }

    fn closed(&self) -> Error {
        dama_core::Error::Closed(self.url().display().to_string()).into()
    }

    fn save(&self) -> Result<()> {
        let guard = self.manifest.read();
        let manifest = guard.as_ref().ok_or_else(|| self.closed())?;
        manifest.save(&self.url())
    }

    fn stores(&self) -> Result<Vec<(String, SlabColumn)>> {
        let dir = self.url();
        let guard = self.manifest.read();
        let manifest = guard.as_ref().ok_or_else(|| self.closed())?;
        Ok(manifest
            .schema
            .fields()
            .iter()
            .enumerate()
            .map(|(i, field)| {
                let store = SlabColumn {
                    manifest: Arc::clone(&self.manifest),
                    path: column_file(&dir, i, field.data_type()),
                    name: field.name().to_string(),
                    dtype: field.data_type(),
                };
                (field.name().to_string(), store)
            })
            .collect())
    }
}

impl Driver for SlabDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Slab
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
        let dir = self.url();
        let exists = dir.join(MANIFEST).exists();
        let manifest = match self.config.mode {
            Mode::Read if !exists => {
                return Err(dama_core::Error::NotFound(format!("Slab dataset {}", dir.display())).into())
            }
            Mode::Read | Mode::Append if exists => Manifest::load(&dir)?,
            mode => {
                if mode == Mode::Write {
                    self.destroy()?;
                }
                fs::create_dir_all(&dir)?;
                let manifest = Manifest {
                    compressor: self.config.compressor.clone(),
                    byte_order: native_byte_order(),
                    ..Manifest::default()
                };
                manifest.save(&dir)?;
                manifest
            }
        };
        self.manifest = Arc::new(RwLock::new(Some(manifest)));
        debug!(url = %dir.display(), mode = %self.config.mode, "Opened slab driver");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.is_open() && self.config.mode.is_writable() {
            self.save()?;
        }
        self.manifest.write().take();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.manifest.read().is_some()
    }

    fn dtypes(&self) -> Result<Option<Schema>> {
        let guard = self.manifest.read();
        let manifest = guard.as_ref().ok_or_else(|| self.closed())?;
        Ok(Some(manifest.schema.clone()).filter(|s| !s.is_empty()))
    }

    fn set_schema(&mut self, schema: &Schema, _options: &SchemaOptions) -> Result<()> {
        if let Some(existing) = self.dtypes()? {
            return ensure_same_schema(&existing, schema);
        }
        let dir = self.url();
        {
            let mut guard = self.manifest.write();
            let manifest = guard.as_mut().ok_or_else(|| self.closed())?;
            manifest.schema = schema.clone();
            manifest.shapes = schema.names().into_iter().map(|n| (n, vec![0])).collect();
        }
        for (i, field) in schema.fields().iter().enumerate() {
            File::create(column_file(&dir, i, field.data_type()))?;
        }
        self.save()?;
        info!(url = %dir.display(), columns = schema.len(), "Created slab columns");
        Ok(())
    }

    fn set_data_shape(&mut self, shape: &Shape) -> Result<()> {
        for (name, store) in self.stores()? {
            let Some(dims) = shape.group(&name) else {
                continue;
            };
            if store.dims()?[0] == 0 && store.dtype.is_fixed_width() {
                let empty = Array::zeros(store.dtype, dims);
                store.write(0, &empty)?;
            }
        }
        self.save()
    }

    fn writer(&mut self) -> Result<Writer<'_>> {
        if !self.is_open() {
            return Err(self.closed());
        }
        Ok(Writer::ColumnSlabs(self))
    }

    fn exists(&self) -> bool {
        match self.dtypes() {
            Ok(schema) => schema.is_some(),
            Err(_) => self.url().join(MANIFEST).exists(),
        }
    }

    fn destroy(&mut self) -> Result<()> {
        self.manifest.write().take();
        let dir = self.url();
        match fs::remove_dir_all(&dir) {
            Ok(()) => debug!(url = %dir.display(), "Removed slab resource"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    fn manager(&self, chunks: Option<Chunks>) -> Result<Group> {
        let stores = self
            .stores()?
            .into_iter()
            .map(|(name, store)| (name, Arc::new(store) as Arc<dyn ColumnStore>));
        let group = Group::from_stores(stores);
        Ok(match chunks {
            Some(chunks) => group.with_chunks(chunks),
            None => group,
        })
    }

    fn attr(&self, key: &str) -> Result<Option<String>> {
        let guard = self.manifest.read();
        let manifest = guard.as_ref().ok_or_else(|| self.closed())?;
        Ok(manifest.attrs.get(key).cloned())
    }

    fn set_attr(&mut self, key: &str, value: &str) -> Result<()> {
        {
            let mut guard = self.manifest.write();
            let manifest = guard.as_mut().ok_or_else(|| self.closed())?;
            manifest.attrs.insert(key.to_string(), value.to_string());
        }
        self.save()
    }

    fn persistent(&self) -> bool {
        true
    }
}

impl ColumnSlabWriter for SlabDriver {
    fn write_slab(&mut self, start: usize, chunk: &Group) -> Result<usize> {
        let stores: IndexMap<String, SlabColumn> = self.stores()?.into_iter().collect();
        for (name, data) in chunk.to_arrays()? {
            let store = stores
                .get(&name)
                .or_else(|| stores.get(chunk.backing_name(&name)))
                .ok_or_else(|| dama_core::Error::NotFound(format!("Group not found: {name}")))?;
            store.write(start, &data)?;
        }
        Ok(chunk.len()?)
    }

    fn flush(&mut self) -> Result<()> {
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::with_open;
    use crate::write::write_batches;
    use dama_core::Value;
    use tempfile::TempDir;

    fn driver(dir: &TempDir, mode: Mode) -> SlabDriver {
        let config = DriverConfig::new(DriverKind::Slab, dir.path())
            .with_mode(mode)
            .with_compressor(Compressor::new("lz4", 5));
        SlabDriver::new(config, "frames", Some("train"))
    }

    fn frames() -> Group {
        let x = ndarray::Array2::from_shape_fn((7, 3), |(i, j)| (i * 3 + j) as f32).into_dyn();
        Group::from_arrays([
            ("x", Array::from(x)),
            ("label", Array::from_vec((0..7).map(|i| format!("l{i}")).collect::<Vec<_>>())),
            ("ok", Array::from_vec(vec![true, true, false, true, false, false, true])),
        ])
        .unwrap()
    }

    #[test]
    fn test_slabs_round_trip_through_reopen() {
        let dir = TempDir::new().unwrap();
        let data = frames();
        let mut d = driver(&dir, Mode::Write);
        with_open(&mut d, |d| {
            d.set_schema(&data.dtypes(), &SchemaOptions::new())?;
            d.set_data_shape(&data.shape()?)?;
            write_batches(d, data.batches(3)?)
        })
        .unwrap();
        assert!(d.url().ends_with("Slab/train/frames.slab"));

        let mut d = driver(&dir, Mode::Read);
        d.open().unwrap();
        let group = d.manager(None).unwrap();
        assert_eq!(group.shape().unwrap().to_tuple(), &[7, 5]);
        assert_eq!(group.column("x").unwrap(), data.column("x").unwrap());
        assert_eq!(group.column("label").unwrap(), data.column("label").unwrap());
        let picked = group.get(vec![6, 0]).unwrap();
        assert_eq!(picked.column("ok").unwrap().values(), vec![Value::Bool(true), Value::Bool(true)]);
        assert_eq!(picked.column("x").unwrap().row_values(0).unwrap()[0], Value::Float(18.0));
    }

    #[test]
    fn test_append_grows_columns() {
        let dir = TempDir::new().unwrap();
        let data = frames();
        let mut d = driver(&dir, Mode::Write);
        d.open().unwrap();
        d.set_schema(&data.dtypes(), &SchemaOptions::new()).unwrap();
        d.write_slab(0, &data.get(0..4).unwrap()).unwrap();
        d.close().unwrap();

        let mut d = driver(&dir, Mode::Append);
        d.open().unwrap();
        d.write_slab(4, &data.get(4..7).unwrap()).unwrap();
        assert_eq!(d.shape().unwrap().to_tuple(), &[7, 5]);
        assert_eq!(d.manager(None).unwrap().column("ok").unwrap(), data.column("ok").unwrap());
    }

    #[test]
    fn test_text_records_read_by_range_and_rewritten_in_place() {
        let dir = TempDir::new().unwrap();
        let mut d = driver(&dir, Mode::Write);
        d.open().unwrap();
        d.set_schema(&Schema::from_pairs([("label", DataType::Utf8)]), &SchemaOptions::new())
            .unwrap();
        let words = |rows: Range<usize>| Array::from_vec(rows.map(|i| format!("w{i}")).collect::<Vec<_>>());
        let (_, column) = d.stores().unwrap().remove(0);
        column.write(0, &words(0..4)).unwrap();
        column.write(4, &words(4..9)).unwrap();
        column.write(2, &Array::from_vec(vec!["x".to_string(), "yy".to_string()])).unwrap();
        column.write(11, &words(11..12)).unwrap();

        assert_eq!(column.dims().unwrap(), vec![12]);
        let offsets = fs::metadata(offsets_file(&column.path)).unwrap().len();
        assert_eq!(offsets, 12 * OFFSET_BYTES as u64);
        let middle = column.read(&Selection::Range(1..5)).unwrap();
        assert_eq!(middle.values(), ["w1", "x", "yy", "w4"].map(Value::from).to_vec());
        let picked = column.read(&Selection::Rows(vec![10, 8, 11])).unwrap();
        assert_eq!(picked.values(), ["", "w8", "w11"].map(Value::from).to_vec());
        assert_eq!(column.read(&Selection::All).unwrap().len(), 12);

        d.close().unwrap();
        assert!(matches!(column.read(&Selection::Range(0..2)), Err(dama_core::Error::Closed(_))));
    }

    #[test]
    fn test_row_dims_mismatch_is_conflict() {
        let dir = TempDir::new().unwrap();
        let mut d = driver(&dir, Mode::Write);
        d.open().unwrap();
        d.set_schema(&frames().dtypes(), &SchemaOptions::new()).unwrap();
        d.write_slab(0, &frames()).unwrap();
        let wide = ndarray::Array2::<f32>::zeros((2, 4)).into_dyn();
        let mut group = d.manager(None).unwrap();
        let err = group.write_rows("x", 7, &Array::from(wide)).unwrap_err();
        assert!(matches!(err, dama_core::Error::SchemaConflict(_)));
    }

    #[test]
    fn test_attrs_persist_and_destroy_removes_directory() {
        let dir = TempDir::new().unwrap();
        let mut d = driver(&dir, Mode::Write);
        d.open().unwrap();
        d.set_attr("author", "someone").unwrap();
        d.close().unwrap();

        let mut d = driver(&dir, Mode::Read);
        d.open().unwrap();
        assert_eq!(d.attr("author").unwrap().as_deref(), Some("someone"));
        d.destroy().unwrap();
        assert!(!d.url().exists());
        assert!(driver(&dir, Mode::Read).open().unwrap_err().is_not_found());
    }
}
