//! Named-column groups over backend column stores
//!
//! A [`Group`] maps visible column names to handles on a [`ColumnStore`]. Row
//! slicing composes a [`Selection`] on the handle, so sub-groups stay lazy until
//! a column is read. Renames only touch the owned [`AliasTable`]; the backing
//! store keeps its own names.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::array::Array;
use crate::chunks::Chunks;
use crate::error::{Error, Result};
use crate::iter::DataIter;
use crate::schema::{DataType, Field, Schema};
use crate::shape::Shape;
use crate::table::Table;
use crate::value::Value;

/// Rows streamed at once when a group has no chunks
pub const DEFAULT_BATCH_ROWS: usize = 258;

/// Rows of a column that a handle refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every row
    All,

    /// A contiguous row range
    Range(Range<usize>),

    /// Explicit row indices
    Rows(Vec<usize>),
}

impl Selection {
    /// Select `inner` relative to the rows of `self`
    pub fn compose(&self, inner: &Selection) -> Result<Selection> {
        Ok(match (self, inner) {
            (Selection::All, s) => s.clone(),
            (s, Selection::All) => s.clone(),
            (Selection::Range(outer), Selection::Range(r)) => {
                let start = (outer.start + r.start).min(outer.end);
                let end = (outer.start + r.end).min(outer.end);
                Selection::Range(start..end.max(start))
            }
            (Selection::Range(outer), Selection::Rows(idx)) => {
                let len = outer.len();
                if let Some(&index) = idx.iter().find(|&&i| i >= len) {
                    return Err(Error::IndexOutOfBounds { index, len });
                }
                Selection::Rows(idx.iter().map(|i| outer.start + i).collect())
            }
            (Selection::Rows(rows), Selection::Range(r)) => {
                let end = r.end.min(rows.len());
                let start = r.start.min(end);
                Selection::Rows(rows[start..end].to_vec())
            }
            (Selection::Rows(rows), Selection::Rows(idx)) => Selection::Rows(
                idx.iter()
                    .map(|&i| {
                        rows.get(i).copied().ok_or(Error::IndexOutOfBounds {
                            index: i,
                            len: rows.len(),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
        })
    }

    /// Number of selected rows out of `total`
    pub fn len(&self, total: usize) -> usize {
        match self {
            Selection::All => total,
            Selection::Range(r) => r.end.min(total).saturating_sub(r.start),
            Selection::Rows(rows) => rows.len(),
        }
    }

    /// Apply to an in-memory array
    pub fn apply(&self, array: &Array) -> Result<Array> {
        match self {
            Selection::All => Ok(array.clone()),
            Selection::Range(r) => Ok(array.slice_rows(r.clone())),
            Selection::Rows(rows) => array.take_rows(rows),
        }
    }
}

/// Raw column access implemented by storage backends
pub trait ColumnStore: Send + Sync + fmt::Debug {
    /// Dtype of the stored values
    fn dtype(&self) -> DataType;

    /// Full shape of the stored column
    fn shape(&self) -> Result<Vec<usize>>;

    /// Read the selected rows
    fn read(&self, selection: &Selection) -> Result<Array>;

    /// Overwrite rows starting at `start`, growing the column if needed
    fn write(&self, start: usize, data: &Array) -> Result<()>;
}

/// A column held in process memory
#[derive(Debug)]
pub struct MemoryColumn {
    data: RwLock<Array>,
}

impl MemoryColumn {
    /// Wrap an array
    pub fn new(data: Array) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Wrap an array as a shareable store
    pub fn shared(data: Array) -> Arc<dyn ColumnStore> {
        Arc::new(Self::new(data))
    }
}

impl ColumnStore for MemoryColumn {
    fn dtype(&self) -> DataType {
        self.data.read().dtype()
    }

    fn shape(&self) -> Result<Vec<usize>> {
        Ok(self.data.read().shape().to_vec())
    }

    fn read(&self, selection: &Selection) -> Result<Array> {
        selection.apply(&self.data.read())
    }

    fn write(&self, start: usize, data: &Array) -> Result<()> {
        let mut column = self.data.write();
        // an empty column adopts the row dims of its first write
        if column.is_empty() && column.shape().get(1..) != data.shape().get(1..) {
            let mut shape = vec![0];
            shape.extend_from_slice(data.shape().get(1..).unwrap_or_default());
            *column = Array::zeros(column.dtype(), &shape);
        }
        let end = start + data.len();
        if end > column.len() {
            *column = column.resize_rows(end)?;
        }
        column.set_rows(start, data)
    }
}

/// A handle on the selected rows of one store
#[derive(Debug, Clone)]
pub struct ColumnRef {
    store: Arc<dyn ColumnStore>,
    selection: Selection,
}

impl ColumnRef {
    /// Handle on every row of `store`
    pub fn new(store: Arc<dyn ColumnStore>) -> Self {
        Self {
            store,
            selection: Selection::All,
        }
    }

    fn select(&self, inner: &Selection) -> Result<ColumnRef> {
        Ok(ColumnRef {
            store: Arc::clone(&self.store),
            selection: self.selection.compose(inner)?,
        })
    }

    /// Dtype of the column
    pub fn dtype(&self) -> DataType {
        self.store.dtype()
    }

    /// Shape of the selected rows
    pub fn shape(&self) -> Result<Vec<usize>> {
        let mut shape = self.store.shape()?;
        if let Some(first) = shape.first_mut() {
            *first = self.selection.len(*first);
        }
        Ok(shape)
    }

    /// Number of selected rows
    pub fn len(&self) -> Result<usize> {
        Ok(self.shape()?.first().copied().unwrap_or(1))
    }

    /// Read every selected row
    pub fn read(&self) -> Result<Array> {
        self.store.read(&self.selection)
    }

    /// Read a range of the selected rows
    pub fn read_range(&self, range: Range<usize>) -> Result<Array> {
        self.store
            .read(&self.selection.compose(&Selection::Range(range))?)
    }

    /// Write `data` at a row offset relative to the selection
    pub fn write(&self, start: usize, data: &Array) -> Result<()> {
        match &self.selection {
            Selection::All => self.store.write(start, data),
            Selection::Range(r) => {
                let end = r.start + start + data.len();
                if end > r.end {
                    return Err(Error::IndexOutOfBounds {
                        index: end - 1,
                        len: r.end,
                    });
                }
                self.store.write(r.start + start, data)
            }
            Selection::Rows(rows) => {
                for k in 0..data.len() {
                    let row = rows.get(start + k).copied().ok_or(Error::IndexOutOfBounds {
                        index: start + k,
                        len: rows.len(),
                    })?;
                    self.store.write(row, &data.slice_rows(k..k + 1))?;
                }
                Ok(())
            }
        }
    }
}

/// Bidirectional map between visible and backing column names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasTable {
    to_backing: HashMap<String, String>,
    to_visible: HashMap<String, String>,
}

impl AliasTable {
    /// Register a column whose visible and backing names may differ
    pub fn insert(&mut self, visible: impl Into<String>, backing: impl Into<String>) {
        let (visible, backing) = (visible.into(), backing.into());
        self.to_visible.insert(backing.clone(), visible.clone());
        self.to_backing.insert(visible, backing);
    }

    /// Change the visible name of a column
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let backing = self
            .to_backing
            .remove(old)
            .ok_or_else(|| Error::NotFound(format!("Group not found: {old}")))?;
        self.to_visible.insert(backing.clone(), new.to_string());
        self.to_backing.insert(new.to_string(), backing);
        Ok(())
    }

    /// Backing name of a visible column
    pub fn backing<'a>(&'a self, visible: &'a str) -> &'a str {
        self.to_backing.get(visible).map_or(visible, String::as_str)
    }

    /// Visible name of a backing column
    pub fn visible(&self, backing: &str) -> Option<&str> {
        self.to_visible.get(backing).map(String::as_str)
    }

    fn retain(&mut self, visible: &[String]) {
        self.to_backing.retain(|v, _| visible.contains(v));
        let kept: Vec<String> = self.to_backing.values().cloned().collect();
        self.to_visible.retain(|b, _| kept.contains(b));
    }
}

/// Ways of indexing a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupKey {
    /// One column
    Name(String),

    /// Several columns in the given order
    Names(Vec<String>),

    /// One row across all columns
    Row(usize),

    /// A row range across all columns
    Range(Range<usize>),

    /// A gather of rows across all columns
    Rows(Vec<usize>),
}

impl From<&str> for GroupKey {
    fn from(name: &str) -> Self {
        GroupKey::Name(name.to_string())
    }
}

impl From<String> for GroupKey {
    fn from(name: String) -> Self {
        GroupKey::Name(name)
    }
}

impl From<&[&str]> for GroupKey {
    fn from(names: &[&str]) -> Self {
        GroupKey::Names(names.iter().map(ToString::to_string).collect())
    }
}

impl From<Vec<&str>> for GroupKey {
    fn from(names: Vec<&str>) -> Self {
        GroupKey::from(names.as_slice())
    }
}

impl From<usize> for GroupKey {
    fn from(row: usize) -> Self {
        GroupKey::Row(row)
    }
}

impl From<Range<usize>> for GroupKey {
    fn from(range: Range<usize>) -> Self {
        GroupKey::Range(range)
    }
}

impl From<Vec<usize>> for GroupKey {
    fn from(rows: Vec<usize>) -> Self {
        GroupKey::Rows(rows)
    }
}

/// Values accepted by [`Group::set`]
#[derive(Debug, Clone)]
pub enum GroupValue {
    /// Columns matched by name
    Group(Group),

    /// A dense array, split across columns by width when several are targeted
    Array(Array),

    /// One value broadcast to every targeted cell
    Scalar(Value),
}

impl From<Group> for GroupValue {
    fn from(group: Group) -> Self {
        GroupValue::Group(group)
    }
}

impl From<Array> for GroupValue {
    fn from(array: Array) -> Self {
        GroupValue::Array(array)
    }
}

impl From<Value> for GroupValue {
    fn from(value: Value) -> Self {
        GroupValue::Scalar(value)
    }
}

/// Ordered named columns exposed as one logical table
#[derive(Debug, Clone, Default)]
pub struct Group {
    /// Column handles by visible name
    columns: IndexMap<String, ColumnRef>,

    /// Visible to backing name mapping
    aliases: AliasTable,

    /// Chunk recommendation for streaming
    chunks: Option<Chunks>,

    /// Memoised shape, reset by `set`, `rename` and `insert`
    shape: OnceLock<Shape>,
}

impl Group {
    /// Create an empty group
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an in-memory group from `(name, array)` pairs
    pub fn from_arrays<S: Into<String>>(arrays: impl IntoIterator<Item = (S, Array)>) -> Result<Self> {
        let mut group = Group::new();
        for (name, array) in arrays {
            group.insert(name, array)?;
        }
        group.check_lengths()?;
        Ok(group)
    }

    /// Build an in-memory group from a table
    pub fn from_table(table: &Table) -> Result<Self> {
        Group::from_arrays(table.iter().map(|(n, c)| (n.to_string(), c.clone())))
    }

    /// Build a group over backend stores keyed by backing name
    pub fn from_stores<S: Into<String>>(stores: impl IntoIterator<Item = (S, Arc<dyn ColumnStore>)>) -> Self {
        let mut group = Group::new();
        for (name, store) in stores {
            let name = name.into();
            group.aliases.insert(name.clone(), name.clone());
            group.columns.insert(name, ColumnRef::new(store));
        }
        group
    }

    /// Attach a chunk recommendation
    #[must_use]
    pub fn with_chunks(mut self, chunks: Chunks) -> Self {
        self.chunks = Some(chunks);
        self
    }

    /// Chunk recommendation, if any
    pub fn chunks(&self) -> Option<&Chunks> {
        self.chunks.as_ref()
    }

    /// Add an in-memory column
    pub fn insert(&mut self, name: impl Into<String>, array: Array) -> Result<()> {
        let name = name.into();
        if self.columns.contains_key(&name) {
            return Err(Error::SchemaConflict(format!("Group already exists: {name}")));
        }
        self.aliases.insert(name.clone(), name.clone());
        self.columns
            .insert(name, ColumnRef::new(MemoryColumn::shared(array)));
        self.shape.take();
        Ok(())
    }

    fn check_lengths(&self) -> Result<()> {
        let mut lengths = self
            .columns
            .iter()
            .filter(|(_, c)| c.shape().is_ok_and(|s| !s.is_empty()))
            .map(|(n, c)| c.len().map(|l| (n, l)));
        if let Some(first) = lengths.next() {
            let (first_name, first_len) = first?;
            for other in lengths {
                let (name, len) = other?;
                if len != first_len {
                    return Err(Error::SchemaConflict(format!(
                        "group {name} has {len} rows, {first_name} has {first_len}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<&str> {
        if let Some((key, _)) = self.columns.get_key_value(name) {
            return Ok(key);
        }
        self.aliases
            .visible(name)
            .and_then(|v| self.columns.get_key_value(v).map(|(k, _)| k.as_str()))
            .ok_or_else(|| Error::NotFound(format!("Group not found: {name}")))
    }

    fn column_ref(&self, name: &str) -> Result<&ColumnRef> {
        let visible = self.resolve(name)?;
        self.columns
            .get(visible)
            .ok_or_else(|| Error::NotFound(format!("Group not found: {name}")))
    }

    /// Visible group names in order
    pub fn groups(&self) -> Vec<String> {
        self.columns.keys().cloned().collect()
    }

    /// Backing name of a visible group
    pub fn backing_name<'a>(&'a self, visible: &'a str) -> &'a str {
        self.aliases.backing(visible)
    }

    /// Number of groups
    pub fn num_groups(&self) -> usize {
        self.columns.len()
    }

    /// Names and dtypes of every group
    pub fn dtypes(&self) -> Schema {
        Schema::new(
            self.columns
                .iter()
                .map(|(n, c)| Field::new(n.clone(), c.dtype()))
                .collect(),
        )
    }

    /// Widest dtype across groups
    pub fn dtype(&self) -> Option<DataType> {
        self.dtypes().global_dtype()
    }

    /// Per-group shape, memoised
    pub fn shape(&self) -> Result<Shape> {
        if let Some(shape) = self.shape.get() {
            return Ok(shape.clone());
        }
        let shape = Shape::from_groups(
            self.columns
                .iter()
                .map(|(n, c)| c.shape().map(|s| (n.clone(), s)))
                .collect::<Result<Vec<_>>>()?,
        );
        let _ = self.shape.set(shape.clone());
        Ok(shape)
    }

    /// Number of rows
    pub fn len(&self) -> Result<usize> {
        Ok(self.shape()?.max_length())
    }

    /// Whether there are no rows
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Read one group fully
    pub fn column(&self, name: &str) -> Result<Array> {
        self.column_ref(name)?.read()
    }

    /// Read every group fully, keyed by visible name
    pub fn to_arrays(&self) -> Result<IndexMap<String, Array>> {
        self.columns
            .iter()
            .map(|(n, c)| c.read().map(|a| (n.clone(), a)))
            .collect()
    }

    fn project(&self, names: &[String]) -> Result<Group> {
        let mut columns = IndexMap::with_capacity(names.len());
        for name in names {
            let visible = self.resolve(name)?.to_string();
            let column = self.columns[visible.as_str()].clone();
            columns.insert(visible, column);
        }
        let mut aliases = self.aliases.clone();
        aliases.retain(&columns.keys().cloned().collect::<Vec<_>>());
        Ok(Group {
            columns,
            aliases,
            chunks: self.chunks.clone(),
            shape: OnceLock::new(),
        })
    }

    fn select_rows(&self, selection: &Selection) -> Result<Group> {
        let columns = self
            .columns
            .iter()
            .map(|(n, c)| c.select(selection).map(|c| (n.clone(), c)))
            .collect::<Result<IndexMap<_, _>>>()?;
        Ok(Group {
            columns,
            aliases: self.aliases.clone(),
            chunks: self.chunks.clone(),
            shape: OnceLock::new(),
        })
    }

    /// Index the group
    ///
    /// A name or list of names selects groups, a row, range or list of rows
    /// selects rows across every group.
    pub fn get(&self, key: impl Into<GroupKey>) -> Result<Group> {
        match key.into() {
            GroupKey::Name(name) => self.project(&[name]),
            GroupKey::Names(names) => self.project(&names),
            GroupKey::Row(row) => {
                let len = self.len()?;
                if row >= len {
                    return Err(Error::IndexOutOfBounds { index: row, len });
                }
                self.select_rows(&Selection::Range(row..row + 1))
            }
            GroupKey::Range(range) => self.select_rows(&Selection::Range(range)),
            GroupKey::Rows(rows) => {
                let len = self.len()?;
                if let Some(&index) = rows.iter().find(|&&i| i >= len) {
                    return Err(Error::IndexOutOfBounds { index, len });
                }
                self.select_rows(&Selection::Rows(rows))
            }
        }
    }

    /// Gather rows by index
    pub fn sample(&self, rows: Vec<usize>) -> Result<Group> {
        self.get(GroupKey::Rows(rows))
    }

    /// Write `value` through to the backing stores
    pub fn set(&mut self, key: impl Into<GroupKey>, value: impl Into<GroupValue>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        let all = self.groups();
        let (targets, start, rows): (Vec<String>, usize, Option<Vec<usize>>) = match &key {
            GroupKey::Name(name) => (vec![self.resolve(name)?.to_string()], 0, None),
            GroupKey::Names(names) => (
                names
                    .iter()
                    .map(|n| self.resolve(n).map(ToString::to_string))
                    .collect::<Result<Vec<_>>>()?,
                0,
                None,
            ),
            GroupKey::Row(row) => (all, *row, None),
            GroupKey::Range(range) => (all, range.start, None),
            GroupKey::Rows(rows) => (all, 0, Some(rows.clone())),
        };
        let window = match &key {
            GroupKey::Row(_) => Some(1),
            GroupKey::Range(range) => Some(range.len()),
            GroupKey::Rows(rows) => Some(rows.len()),
            GroupKey::Name(_) | GroupKey::Names(_) => None,
        };

        let mut offset = 0;
        for name in &targets {
            let column = &self.columns[name.as_str()];
            let dims = column.shape()?;
            let width = if dims.len() >= 2 { dims[1] } else { 1 };
            let data = match &value {
                GroupValue::Group(group) => {
                    if targets.len() == 1 && group.num_groups() == 1 {
                        group.columns[0].read()?
                    } else {
                        group
                            .column(name)
                            .or_else(|_| group.column(self.aliases.backing(name)))?
                    }
                }
                GroupValue::Array(array) if targets.len() == 1 => array.clone(),
                GroupValue::Array(array) => {
                    let part = array.select_columns(offset..offset + width)?;
                    if dims.len() <= 1 {
                        part.reshape(&[part.len()])?
                    } else {
                        part
                    }
                }
                GroupValue::Scalar(v) => {
                    let mut shape = dims.clone();
                    if shape.is_empty() {
                        shape.push(1);
                    }
                    shape[0] = window.unwrap_or(shape[0]);
                    Array::full(column.dtype(), &shape, v)?
                }
            };
            offset += width;

            if let Some(expected) = window {
                if data.len() != expected {
                    return Err(Error::SchemaConflict(format!(
                        "cannot assign {} rows to a window of {expected} rows",
                        data.len()
                    )));
                }
            }
            debug!(
                group = %name,
                backing = self.aliases.backing(name),
                rows = data.len(),
                "Writing group"
            );
            match &rows {
                Some(rows) => {
                    for (k, &row) in rows.iter().enumerate() {
                        column.write(row, &data.slice_rows(k..k + 1))?;
                    }
                }
                None => column.write(start, &data)?,
            }
        }
        self.shape.take();
        Ok(())
    }

    /// Write rows of one group starting at `start`
    pub fn write_rows(&mut self, name: &str, start: usize, data: &Array) -> Result<()> {
        self.column_ref(name)?.write(start, data)?;
        self.shape.take();
        Ok(())
    }

    /// Dense array of every group
    ///
    /// Several groups are laid out side by side following the reconciled
    /// shape, each at an offset given by its own width.
    pub fn to_ndarray(&self, dtype: Option<DataType>) -> Result<Array> {
        let dtype = match dtype.or_else(|| self.dtype()) {
            Some(dtype) => dtype,
            None => return Ok(Array::zeros(DataType::Float64, &[0])),
        };
        if self.columns.len() == 1 {
            return self.columns[0].read()?.cast(dtype);
        }

        let shape = self.shape()?;
        let tuple = shape.to_tuple().to_vec();
        let max_rank = shape.iter().map(|(_, d)| d.len()).max().unwrap_or(0);
        let mut out = Array::zeros(dtype, &tuple);
        let mut offset = 0;
        for (name, column) in &self.columns {
            let dims = shape.group(name).unwrap_or_default();
            let width = if dims.len() >= 2 && dims.len() == max_rank {
                dims[1]
            } else {
                1
            };
            out.set_columns(offset, width, &column.read()?)?;
            offset += width;
        }
        Ok(out)
    }

    fn batch_rows(&self) -> usize {
        self.chunks
            .as_ref()
            .map(Chunks::length)
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_BATCH_ROWS)
    }

    /// Named table, read batch by batch
    ///
    /// Groups of width > 1 expand into columns `c<i>`, numbered across the
    /// whole table.
    pub fn to_df(&self) -> Result<Table> {
        let len = self.len()?;
        let step = self.batch_rows();
        let mut parts = Vec::new();
        for start in (0..len.max(1)).step_by(step) {
            let end = (start + step).min(len);
            let mut table = Table::new();
            let mut index = 0;
            for (name, column) in &self.columns {
                let data = column.read_range(start..end)?;
                match data.ndim() {
                    0 | 1 => {
                        table.push_column(name.clone(), data.flatten())?;
                        index += 1;
                    }
                    2 => {
                        for i in 0..data.shape()[1] {
                            let part = data.select_columns(i..i + 1)?.reshape(&[data.len()])?;
                            table.push_column(format!("c{index}"), part)?;
                            index += 1;
                        }
                    }
                    _ => {
                        return Err(Error::SchemaConflict(format!(
                            "cannot tabulate group {name} of shape {:?}",
                            data.shape()
                        )))
                    }
                }
            }
            parts.push(table);
        }
        Table::concat(&parts)
    }

    /// Combine the groups of two non-overlapping groups
    pub fn merge(&self, other: &Group) -> Result<Group> {
        if let Some(name) = other.columns.keys().find(|n| self.columns.contains_key(*n)) {
            return Err(Error::SchemaConflict(format!("Group already exists: {name}")));
        }
        let mut merged = self.clone();
        for (name, column) in &other.columns {
            merged
                .aliases
                .insert(name.clone(), other.aliases.backing(name).to_string());
            merged.columns.insert(name.clone(), column.clone());
        }
        merged.shape.take();
        if !self.columns.is_empty() && !other.columns.is_empty() {
            merged.check_lengths()?;
        }
        Ok(merged)
    }

    /// Stack groups with the same names row-wise into memory
    pub fn concat(parts: &[Group]) -> Result<Group> {
        let Some(first) = parts.first() else {
            return Ok(Group::new());
        };
        let mut out = Group::new();
        for name in first.columns.keys() {
            let arrays = parts
                .iter()
                .map(|g| g.column(name))
                .collect::<Result<Vec<_>>>()?;
            out.insert(name.clone(), Array::concat_rows(&arrays)?)?;
        }
        Ok(out)
    }

    /// Split groups by position
    pub fn split_at(&self, at: usize) -> Result<(Group, Group)> {
        let names = self.groups();
        let at = at.min(names.len());
        Ok((self.project(&names[..at])?, self.project(&names[at..])?))
    }

    /// Push every group into `target` batch by batch
    pub fn store(&self, target: &mut Group) -> Result<()> {
        let len = self.len()?;
        let step = self.batch_rows();
        for (name, column) in &self.columns {
            let target_name = target
                .resolve(name)
                .or_else(|_| target.resolve(self.aliases.backing(name)))?
                .to_string();
            for start in (0..len).step_by(step) {
                let data = column.read_range(start..(start + step).min(len))?;
                target.write_rows(&target_name, start, &data)?;
            }
        }
        debug!(rows = len, groups = self.columns.len(), "Stored group");
        Ok(())
    }

    /// Change the visible name of a group
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let visible = self.resolve(old)?.to_string();
        if visible != new && self.columns.contains_key(new) {
            return Err(Error::SchemaConflict(format!("Group already exists: {new}")));
        }
        self.aliases.rename(&visible, new)?;
        let columns = std::mem::take(&mut self.columns);
        self.columns = columns
            .into_iter()
            .map(|(n, c)| if n == visible { (new.to_string(), c) } else { (n, c) })
            .collect();
        self.shape.take();
        Ok(())
    }

    /// Chunked iterator of row slices
    pub fn batches(&self, rows: usize) -> Result<DataIter> {
        DataIter::from_group(self.clone(), rows)
    }
}

impl std::ops::Add<&Group> for &Group {
    type Output = Result<Group>;

    fn add(self, rhs: &Group) -> Self::Output {
        self.merge(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunks::ChunkSpec;
    use ndarray::{array, Array2};

    fn xy() -> Group {
        let x = Array2::from_shape_fn((10, 3), |(i, j)| (i * 3 + j) as f64).into_dyn();
        let y = Array::from_vec((0..10_i64).collect::<Vec<_>>());
        Group::from_arrays([("x", Array::from(x)), ("y", y)]).unwrap()
    }

    #[test]
    fn test_shape_and_ndarray() {
        let group = xy();
        assert_eq!(group.shape().unwrap().to_tuple(), &[10, 4]);
        let dense = group.to_ndarray(None).unwrap();
        assert_eq!(dense.shape(), &[10, 4]);
        assert_eq!(
            dense.row_values(2).unwrap(),
            vec![Value::Float(6.0), Value::Float(7.0), Value::Float(8.0), Value::Float(2.0)]
        );
        assert_eq!(group.get("y").unwrap().to_ndarray(None).unwrap().shape(), &[10]);
    }

    #[test]
    fn test_indexing_keys() {
        let group = xy();
        assert_eq!(group.get(2..5).unwrap().len().unwrap(), 3);
        assert_eq!(group.get(vec!["y", "x"]).unwrap().groups(), vec!["y", "x"]);
        let sampled = group.sample(vec![9, 0]).unwrap();
        assert_eq!(sampled.column("y").unwrap().values(), vec![Value::Int(9), Value::Int(0)]);
        assert!(matches!(group.get(10_usize), Err(Error::IndexOutOfBounds { .. })));
        assert!(group.get("z").unwrap_err().is_not_found());
    }

    #[test]
    fn test_nested_slices_compose() {
        let group = xy();
        let inner = group.get(2..8).unwrap().get(vec![1, 3]).unwrap();
        assert_eq!(inner.column("y").unwrap().values(), vec![Value::Int(3), Value::Int(5)]);
    }

    #[test]
    fn test_set_writes_through_slices() {
        let mut group = xy();
        let mut window = group.get(4..6).unwrap();
        window.set("y", Array::from_vec(vec![40_i64, 50])).unwrap();
        assert_eq!(group.column("y").unwrap().values()[4..6], [Value::Int(40), Value::Int(50)]);

        group.set(0_usize, Value::Int(-1)).unwrap();
        assert_eq!(group.column("x").unwrap().row_values(0).unwrap(), vec![Value::Float(-1.0); 3]);
        assert!(group.set(0..2, Array::from_vec(vec![1_i64])).is_err());
    }

    #[test]
    fn test_set_splits_dense_array_by_width() {
        let mut group = xy();
        let dense = Array::from(Array2::<f64>::ones((10, 4)).into_dyn());
        let err = group.set(vec!["x", "y"], dense.clone());
        assert!(err.is_err(), "float into int column is lossy");

        let mut floats = Group::from_arrays([
            ("a", Array::from(Array2::<f64>::zeros((10, 3)).into_dyn())),
            ("b", Array::from_vec(vec![0.0_f64; 10])),
        ])
        .unwrap();
        floats.set(vec!["a", "b"], dense).unwrap();
        assert_eq!(floats.column("b").unwrap().values(), vec![Value::Float(1.0); 10]);
    }

    #[test]
    fn test_rename_keeps_backing_name() {
        let mut group = xy();
        group.rename("x", "features").unwrap();
        assert_eq!(group.groups(), vec!["features", "y"]);
        assert_eq!(group.backing_name("features"), "x");
        assert_eq!(group.get("x").unwrap().groups(), vec!["features"]);
    }

    #[test]
    fn test_merge_rejects_overlap() {
        let group = xy();
        let z = Group::from_arrays([("z", Array::from_vec(vec![true; 10]))]).unwrap();
        let merged = (&group + &z).unwrap();
        assert_eq!(merged.groups(), vec!["x", "y", "z"]);
        assert!(matches!(group.merge(&group), Err(Error::SchemaConflict(_))));
    }

    #[test]
    fn test_to_df_expands_wide_groups() {
        let chunks = Chunks::build_from(&ChunkSpec::Rows(4), &["x", "y"]).unwrap();
        let table = xy().with_chunks(chunks).to_df().unwrap();
        assert_eq!(table.names(), vec!["c0", "c1", "c2", "y"]);
        assert_eq!(table.num_rows(), 10);
    }

    #[test]
    fn test_store_into_other_group() {
        let source = xy();
        let mut target = Group::from_arrays([
            ("x", Array::zeros(DataType::Float64, &[0, 3])),
            ("y", Array::zeros(DataType::Int64, &[0])),
        ])
        .unwrap();
        source.store(&mut target).unwrap();
        assert_eq!(target.len().unwrap(), 10);
        assert_eq!(target.column("x").unwrap(), source.column("x").unwrap());
    }

    #[test]
    fn test_from_arrays_rejects_ragged() {
        let ragged = Group::from_arrays([
            ("a", Array::from(array![1, 2].into_dyn())),
            ("b", Array::from(array![1].into_dyn())),
        ]);
        assert!(matches!(ragged, Err(Error::SchemaConflict(_))));
    }
}
