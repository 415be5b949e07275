//! Lazy, one-shot pull iterators over dataset elements
//!
//! A [`DataIter`] wraps any fallible source of [`Element`]s. The first
//! element is peeked to infer the dtype and per-row dims, then pushed back so
//! consumers still see it. Once the source runs dry the iterator is
//! exhausted for good: eager materialisers fail with
//! [`Error::ExhaustedSource`] instead of silently returning nothing.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use crate::array::Array;
use crate::error::{Error, Result};
use crate::group::Group;
use crate::schema::{DataType, Field, Schema};
use crate::shape::Shape;
use crate::table::Table;
use crate::value::{BinaryOp, Value};

/// Boxed fallible element source
pub type Source = Box<dyn Iterator<Item = Result<Element>> + Send>;

/// One item pulled from a [`DataIter`]
#[derive(Debug, Clone)]
pub enum Element {
    /// A single value
    Scalar(Value),

    /// A structured row
    Row(Vec<Value>),

    /// A dense row, or a dense chunk of rows in chunked streams
    Array(Array),

    /// A structured chunk of rows
    Group(Group),
}

/// Element dtype of a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterDtype {
    /// Every element has one dtype
    Plain(DataType),

    /// Elements are structured with named, typed fields
    Fields(Schema),
}

impl IterDtype {
    /// Widest dtype
    pub fn global(&self) -> Option<DataType> {
        match self {
            IterDtype::Plain(dtype) => Some(*dtype),
            IterDtype::Fields(schema) => schema.global_dtype(),
        }
    }

    /// Field names of structured streams
    pub fn names(&self) -> Option<Vec<String>> {
        match self {
            IterDtype::Plain(_) => None,
            IterDtype::Fields(schema) => Some(schema.names()),
        }
    }
}

impl fmt::Display for IterDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IterDtype::Plain(dtype) => write!(f, "{dtype}"),
            IterDtype::Fields(schema) => write!(f, "{schema}"),
        }
    }
}

/// Same dtype up to integer or float width
fn compatible(expected: DataType, actual: DataType) -> bool {
    expected == actual
        || (expected.is_float() && actual.is_float())
        || (matches!(expected, DataType::Int32 | DataType::Int64)
            && matches!(actual, DataType::Int32 | DataType::Int64))
}

fn row_schema(values: &[Value]) -> Schema {
    Schema::new(
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Field::new(format!("c{i}"), v.data_type().unwrap_or(DataType::Float64)))
            .collect(),
    )
}

impl Element {
    /// Dtype inferred from this element alone
    pub fn dtype(&self) -> IterDtype {
        match self {
            Element::Scalar(v) => IterDtype::Plain(v.data_type().unwrap_or(DataType::Float64)),
            Element::Row(values) => IterDtype::Fields(row_schema(values)),
            Element::Array(a) => IterDtype::Plain(a.dtype()),
            Element::Group(g) => IterDtype::Fields(g.dtypes()),
        }
    }

    fn features(&self, chunked: bool) -> Result<Vec<usize>> {
        Ok(match self {
            Element::Scalar(_) => Vec::new(),
            Element::Row(values) => vec![values.len()],
            Element::Array(a) if chunked => a.shape().iter().skip(1).copied().collect(),
            Element::Array(a) => a.shape().to_vec(),
            Element::Group(g) => g.shape()?.to_tuple().iter().skip(1).copied().collect(),
        })
    }

    /// Rows held by a chunk element
    pub fn rows(&self) -> Result<usize> {
        match self {
            Element::Scalar(_) | Element::Row(_) => Ok(1),
            Element::Array(a) => Ok(a.len()),
            Element::Group(g) => g.len(),
        }
    }

    fn slice_rows(&self, end: usize) -> Result<Element> {
        Ok(match self {
            Element::Array(a) => Element::Array(a.slice_rows(0..end)),
            Element::Group(g) => Element::Group(g.get(0..end)?),
            other => other.clone(),
        })
    }

    /// Split a chunk element into its rows
    fn into_rows(self) -> Result<Vec<Element>> {
        match self {
            Element::Array(a) if a.ndim() <= 1 => {
                Ok(a.values().into_iter().map(Element::Scalar).collect())
            }
            Element::Array(a) => (0..a.len()).map(|i| a.row(i).map(Element::Array)).collect(),
            Element::Group(g) => {
                let arrays = g.to_arrays()?;
                (0..g.len()?)
                    .map(|i| {
                        Group::from_arrays(
                            arrays
                                .iter()
                                .map(|(n, a)| (n.clone(), a.slice_rows(i..i + 1))),
                        )
                        .map(Element::Group)
                    })
                    .collect()
            }
            other => Ok(vec![other]),
        }
    }

    /// Every value in logical order
    pub fn values(&self) -> Result<Vec<Value>> {
        match self {
            Element::Scalar(v) => Ok(vec![v.clone()]),
            Element::Row(values) => Ok(values.clone()),
            Element::Array(a) => Ok(a.values()),
            Element::Group(g) => Ok(g.to_ndarray(None)?.values()),
        }
    }

    /// Dense view of this element
    pub fn to_array(&self) -> Result<Array> {
        match self {
            Element::Scalar(v) => Array::from_values(
                v.data_type().unwrap_or(DataType::Float64),
                &[],
                std::slice::from_ref(v),
            ),
            Element::Row(values) => {
                let dtype = row_schema(values).global_dtype().unwrap_or(DataType::Float64);
                Array::from_values(dtype, &[values.len()], values)
            }
            Element::Array(a) => Ok(a.clone()),
            Element::Group(g) => g.to_ndarray(None),
        }
    }

    fn type_name(&self) -> String {
        match self {
            Element::Scalar(v) => v.type_name().to_string(),
            other => other.dtype().to_string(),
        }
    }

    fn split_at(&self, at: usize, chunked: bool) -> Result<(Element, Element)> {
        match self {
            Element::Row(values) => {
                let at = at.min(values.len());
                Ok((Element::Row(values[..at].to_vec()), Element::Row(values[at..].to_vec())))
            }
            Element::Array(a) if chunked => {
                let width = a.shape().get(1).copied().unwrap_or(0);
                let at = at.min(width);
                Ok((
                    Element::Array(a.select_columns(0..at)?),
                    Element::Array(a.select_columns(at..width)?),
                ))
            }
            Element::Array(a) => {
                let at = at.min(a.len());
                Ok((Element::Array(a.slice_rows(0..at)), Element::Array(a.slice_rows(at..a.len()))))
            }
            Element::Group(g) => {
                let (left, right) = g.split_at(at)?;
                Ok((Element::Group(left), Element::Group(right)))
            }
            Element::Scalar(v) => Err(Error::type_mismatch("container", v.type_name())),
        }
    }

    fn apply_scalar(&self, op: BinaryOp, rhs: &Value) -> Result<Element> {
        Ok(match self {
            Element::Scalar(v) => Element::Scalar(v.apply(op, rhs)?),
            Element::Row(values) => Element::Row(
                values
                    .iter()
                    .map(|v| v.apply(op, rhs))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Element::Array(a) => Element::Array(a.apply_scalar(op, rhs)?),
            Element::Group(g) => Element::Group(Group::from_arrays(
                g.to_arrays()?
                    .into_iter()
                    .map(|(n, a)| a.apply_scalar(op, rhs).map(|a| (n, a)))
                    .collect::<Result<Vec<_>>>()?,
            )?),
        })
    }

    fn apply(&self, op: BinaryOp, rhs: &Element) -> Result<Element> {
        Ok(match (self, rhs) {
            (lhs, Element::Scalar(v)) => lhs.apply_scalar(op, v)?,
            (Element::Scalar(v), Element::Array(a)) => {
                let lhs = Array::full(a.dtype().max(v.data_type().unwrap_or(DataType::Float64)), a.shape(), v)?;
                Element::Array(lhs.apply(op, a)?)
            }
            (Element::Row(a), Element::Row(b)) if a.len() == b.len() => Element::Row(
                a.iter()
                    .zip(b)
                    .map(|(x, y)| x.apply(op, y))
                    .collect::<Result<Vec<_>>>()?,
            ),
            (Element::Array(a), Element::Array(b)) => Element::Array(a.apply(op, b)?),
            (Element::Group(a), Element::Group(b)) if a.num_groups() == b.num_groups() => {
                let pairs = a.to_arrays()?.into_iter().zip(b.to_arrays()?.into_values());
                Element::Group(Group::from_arrays(
                    pairs
                        .map(|((n, x), y)| x.apply(op, &y).map(|r| (n, r)))
                        .collect::<Result<Vec<_>>>()?,
                )?)
            }
            (lhs, rhs) => return Err(Error::type_mismatch(lhs.type_name(), rhs.type_name())),
        })
    }
}

/// Check one element against the stream dtype
fn check_element(expected: &IterDtype, element: &Element) -> Result<()> {
    let mismatch = || Error::type_mismatch(expected, element.type_name());
    match (expected, element) {
        (IterDtype::Plain(dtype), Element::Scalar(v)) => match v.data_type() {
            Some(actual) if !compatible(*dtype, actual) => Err(mismatch()),
            _ => Ok(()),
        },
        (IterDtype::Plain(dtype), Element::Array(a)) if !compatible(*dtype, a.dtype()) => {
            Err(mismatch())
        }
        (IterDtype::Plain(dtype), Element::Row(values)) => {
            if values
                .iter()
                .filter_map(Value::data_type)
                .all(|actual| compatible(*dtype, actual))
            {
                Ok(())
            } else {
                Err(mismatch())
            }
        }
        (IterDtype::Plain(_), Element::Array(_) | Element::Group(_)) => Ok(()),
        (IterDtype::Fields(schema), Element::Row(values)) => {
            if values.len() != schema.len() {
                return Err(mismatch());
            }
            for (field, value) in schema.fields().iter().zip(values) {
                if let Some(actual) = value.data_type() {
                    if !compatible(field.data_type(), actual) {
                        return Err(Error::type_mismatch(
                            format!("{field}"),
                            format!("{}: {actual}", field.name()),
                        ));
                    }
                }
            }
            Ok(())
        }
        (IterDtype::Fields(schema), Element::Group(g)) => {
            let actual = g.dtypes();
            let same = actual.len() == schema.len()
                && schema
                    .fields()
                    .iter()
                    .zip(actual.fields())
                    .all(|(e, a)| e.name() == a.name() && compatible(e.data_type(), a.data_type()));
            if same {
                Ok(())
            } else {
                Err(Error::type_mismatch(schema, actual))
            }
        }
        (IterDtype::Fields(_), _) => Err(mismatch()),
    }
}

/// Batch elements into one dense or structured chunk
fn build_chunk(dtype: &IterDtype, batch: Vec<Element>) -> Result<Element> {
    for element in &batch {
        check_element(dtype, element)?;
    }
    let rows = batch.len();
    match (dtype, batch.first()) {
        (_, Some(Element::Group(_))) => {
            let groups = batch
                .into_iter()
                .map(|e| match e {
                    Element::Group(g) => Ok(g),
                    other => Err(Error::type_mismatch("group", other.type_name())),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Element::Group(Group::concat(&groups)?))
        }
        (IterDtype::Fields(schema), _) => {
            let mut columns: Vec<Vec<Value>> = vec![Vec::with_capacity(rows); schema.len()];
            for element in batch {
                if let Element::Row(values) = element {
                    for (column, value) in columns.iter_mut().zip(values) {
                        column.push(value);
                    }
                }
            }
            let arrays = schema
                .fields()
                .iter()
                .zip(columns)
                .map(|(field, values)| {
                    Array::from_values(field.data_type(), &[rows], &values)
                        .map(|a| (field.name().to_string(), a))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Element::Group(Group::from_arrays(arrays)?))
        }
        (IterDtype::Plain(dtype), Some(Element::Array(_))) => {
            let arrays = batch
                .into_iter()
                .map(|e| e.to_array().and_then(|a| a.cast(*dtype)))
                .collect::<Result<Vec<_>>>()?;
            Ok(Element::Array(Array::from_rows(&arrays)?))
        }
        (IterDtype::Plain(dtype), Some(Element::Row(first))) => {
            let width = first.len();
            let values: Vec<Value> = batch
                .iter()
                .map(Element::values)
                .collect::<Result<Vec<_>>>()?
                .concat();
            Ok(Element::Array(Array::from_values(*dtype, &[rows, width], &values)?))
        }
        (IterDtype::Plain(dtype), _) => {
            let values = batch
                .into_iter()
                .map(|e| match e {
                    Element::Scalar(v) => Ok(v),
                    other => Err(Error::type_mismatch("scalar", other.type_name())),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Element::Array(Array::from_values(*dtype, &[rows], &values)?))
        }
    }
}

/// Right-hand side of an arithmetic operation
pub enum Operand {
    /// Broadcast scalar
    Scalar(Value),

    /// Another stream, zipped position-wise
    Stream(DataIter),
}

impl From<Value> for Operand {
    fn from(value: Value) -> Self {
        Operand::Scalar(value)
    }
}

impl From<f64> for Operand {
    fn from(value: f64) -> Self {
        Operand::Scalar(Value::Float(value))
    }
}

impl From<i64> for Operand {
    fn from(value: i64) -> Self {
        Operand::Scalar(Value::Int(value))
    }
}

impl From<DataIter> for Operand {
    fn from(stream: DataIter) -> Self {
        Operand::Stream(stream)
    }
}

/// Result of [`DataIter::to_memory`]
#[derive(Debug, Clone, PartialEq)]
pub enum InMemory {
    /// Plain streams become one dense array
    Array(Array),

    /// Structured streams become a table
    Table(Table),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    Ready,
    Exhausted,
}

/// A lazy, one-shot, self-describing stream of elements
pub struct DataIter {
    source: Source,

    /// Elements pulled early and handed back first
    pushed: Vec<Element>,

    dtype: Option<IterDtype>,

    /// Dims of one row
    features: Option<Vec<usize>>,

    /// Rows per element when the stream is chunked
    chunk_size: Option<usize>,

    /// Upper bound on the rows this stream yields
    length: Option<usize>,

    /// Rows handed out so far
    emitted: usize,

    state: State,
}

impl fmt::Debug for DataIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataIter")
            .field("dtype", &self.dtype)
            .field("chunk_size", &self.chunk_size)
            .field("length", &self.length)
            .field("emitted", &self.emitted)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

struct SplitState {
    source: DataIter,
    queues: [VecDeque<Element>; 2],
}

impl SplitState {
    fn pull(&mut self, side: usize, at: usize, chunked: bool) -> Option<Result<Element>> {
        if let Some(element) = self.queues[side].pop_front() {
            return Some(Ok(element));
        }
        let element = match self.source.next()? {
            Ok(element) => element,
            Err(err) => return Some(Err(err)),
        };
        match element.split_at(at, chunked) {
            Ok((left, right)) => {
                let (mine, theirs) = if side == 0 { (left, right) } else { (right, left) };
                self.queues[1 - side].push_back(theirs);
                Some(Ok(mine))
            }
            Err(err) => Some(Err(err)),
        }
    }
}

struct Keyed {
    key: f64,
    index: usize,
    element: Element,
}

impl PartialEq for Keyed {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Keyed {}

impl PartialOrd for Keyed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Keyed {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .total_cmp(&other.key)
            .then_with(|| other.index.cmp(&self.index))
    }
}

impl DataIter {
    /// Wrap a fallible element source
    pub fn new(source: impl Iterator<Item = Result<Element>> + Send + 'static) -> Self {
        Self {
            source: Box::new(source.fuse()),
            pushed: Vec::new(),
            dtype: None,
            features: None,
            chunk_size: None,
            length: None,
            emitted: 0,
            state: State::Uninitialized,
        }
    }

    /// Stream that yields nothing
    pub fn empty() -> Self {
        DataIter::new(std::iter::empty())
    }

    /// Stream of ready elements
    pub fn from_elements<I>(elements: I) -> Self
    where
        I: IntoIterator<Item = Element>,
        I::IntoIter: Send + 'static,
    {
        DataIter::new(elements.into_iter().map(Ok))
    }

    /// Stream of scalars
    pub fn from_values<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        I::IntoIter: Send + 'static,
        V: Into<Value>,
    {
        DataIter::new(values.into_iter().map(|v| Ok(Element::Scalar(v.into()))))
    }

    /// Stream of structured rows
    pub fn from_rows<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = Vec<Value>>,
        I::IntoIter: Send + 'static,
    {
        DataIter::new(rows.into_iter().map(|r| Ok(Element::Row(r))))
    }

    /// Stream the rows of an array; 1-D arrays yield scalars
    pub fn from_array(array: Array) -> Self {
        let len = array.len();
        let it = if array.ndim() <= 1 {
            DataIter::from_values(array.values())
        } else {
            DataIter::new((0..len).map(move |i| array.row(i).map(Element::Array)))
        };
        it.it_length(len)
    }

    /// Stream an array as dense chunks of `rows` rows
    pub fn from_array_chunks(array: Array, rows: usize) -> Result<Self> {
        if rows == 0 {
            return Err(Error::InvalidArgument("chunk length must be positive".to_string()));
        }
        let len = array.len();
        let source = (0..len)
            .step_by(rows)
            .map(move |start| Ok(Element::Array(array.slice_rows(start..start + rows))));
        Ok(DataIter::new(source).with_chunk_size(rows).it_length(len))
    }

    /// Stream a table row by row
    pub fn from_table(table: Table) -> Self {
        let len = table.num_rows();
        let dtype = IterDtype::Fields(table.schema());
        DataIter::new((0..len).map(move |i| table.row(i).map(Element::Row)))
            .with_dtype(dtype)
            .it_length(len)
    }

    /// Stream a group as chunks of `rows` rows
    pub fn from_group(group: Group, rows: usize) -> Result<Self> {
        if rows == 0 {
            return Err(Error::InvalidArgument("chunk length must be positive".to_string()));
        }
        let len = group.len()?;
        let dtype = IterDtype::Fields(group.dtypes());
        let source = (0..len)
            .step_by(rows)
            .map(move |start| group.get(start..start + rows).map(Element::Group));
        Ok(DataIter::new(source)
            .with_dtype(dtype)
            .with_chunk_size(rows)
            .it_length(len))
    }

    /// Declare the dtype instead of inferring it
    #[must_use]
    pub fn with_dtype(mut self, dtype: IterDtype) -> Self {
        self.dtype = Some(dtype);
        self
    }

    /// Mark elements as chunks of `rows` rows
    #[must_use]
    pub fn with_chunk_size(mut self, rows: usize) -> Self {
        self.chunk_size = Some(rows).filter(|&n| n > 0);
        self
    }

    fn observe(&mut self, element: &Element) -> Result<()> {
        if self.dtype.is_none() {
            self.dtype = Some(element.dtype());
        }
        if self.features.is_none() {
            self.features = Some(element.features(self.chunk_size.is_some())?);
        }
        Ok(())
    }

    /// Peek the first element to infer dtype and dims
    fn taste(&mut self) -> Result<()> {
        if self.state != State::Uninitialized {
            return Ok(());
        }
        let first = match self.pushed.pop() {
            Some(element) => Some(element),
            None => self.source.next().transpose()?,
        };
        if let Some(element) = first {
            self.observe(&element)?;
            trace!(dtype = ?self.dtype, "Inferred stream dtype");
            self.pushed.push(element);
        }
        self.state = State::Ready;
        Ok(())
    }

    fn begin_eager(&mut self) -> Result<()> {
        if self.state == State::Exhausted {
            return Err(Error::ExhaustedSource);
        }
        self.taste()
    }

    /// Element dtype
    pub fn dtype(&mut self) -> Result<Option<IterDtype>> {
        self.taste()?;
        Ok(self.dtype.clone())
    }

    /// Widest dtype of the elements
    pub fn global_dtype(&mut self) -> Result<Option<DataType>> {
        Ok(self.dtype()?.and_then(|d| d.global()))
    }

    /// Field names of structured streams
    pub fn columns(&mut self) -> Result<Option<Vec<String>>> {
        Ok(self.dtype()?.and_then(|d| d.names()))
    }

    /// Group names: field names, or `c0` for plain streams
    pub fn groups(&mut self) -> Result<Vec<String>> {
        Ok(self.columns()?.unwrap_or_else(|| vec!["c0".to_string()]))
    }

    /// Dims of one row
    pub fn features(&mut self) -> Result<Vec<usize>> {
        self.taste()?;
        Ok(self.features.clone().unwrap_or_default())
    }

    /// Declared length followed by the row dims; length is 0 when unknown
    pub fn shape(&mut self) -> Result<Vec<usize>> {
        let mut shape = vec![self.length.unwrap_or(0)];
        shape.extend(self.features()?);
        Ok(shape)
    }

    /// Per-group shape at the declared length
    pub fn group_shape(&mut self) -> Result<Shape> {
        self.taste()?;
        let len = self.length.unwrap_or(0);
        Ok(match (&self.dtype, self.pushed.last()) {
            (Some(IterDtype::Fields(_)), Some(Element::Group(g))) => {
                Shape::from_groups(g.shape()?.iter().map(|(n, d)| {
                    let mut dims = d.to_vec();
                    if let Some(first) = dims.first_mut() {
                        *first = len;
                    }
                    (n.to_string(), dims)
                }))
            }
            (Some(IterDtype::Fields(schema)), _) => {
                Shape::from_groups(schema.names().into_iter().map(|n| (n, vec![len])))
            }
            (Some(IterDtype::Plain(_)), _) => {
                let mut dims = vec![len];
                dims.extend(self.features.clone().unwrap_or_default());
                Shape::from_groups([("c0", dims)])
            }
            (None, _) => Shape::new(),
        })
    }

    /// Declared length in rows
    pub fn length(&self) -> Option<usize> {
        self.length
    }

    /// Rows per chunk when chunked
    pub fn chunk_size(&self) -> Option<usize> {
        self.chunk_size
    }

    /// Whether the source has run dry
    pub fn is_exhausted(&self) -> bool {
        self.state == State::Exhausted
    }

    /// Number of elements a full pass yields
    pub fn num_splits(&self) -> Option<usize> {
        self.length.map(|len| match self.chunk_size {
            Some(rows) => len.div_ceil(rows),
            None => len,
        })
    }

    /// Yield at most `length` rows, cutting the last chunk if needed
    #[must_use]
    pub fn it_length(mut self, length: usize) -> Self {
        self.length = Some(self.length.map_or(length, |l| l.min(length)));
        self
    }

    /// Batch rows into chunks of `rows` rows
    pub fn to_chunks(self, rows: usize) -> Result<DataIter> {
        if rows == 0 {
            return Err(Error::InvalidArgument("chunk length must be positive".to_string()));
        }
        match self.chunk_size {
            Some(current) if current == rows => return Ok(self),
            Some(_) => return self.clean_chunks()?.to_chunks(rows),
            None => {}
        }

        let mut source = self;
        source.taste()?;
        let length = source.length;
        let Some(dtype) = source.dtype.clone() else {
            return Ok(DataIter::empty().with_chunk_size(rows));
        };
        debug!(rows, dtype = %dtype, "Chunking stream");

        let batch_dtype = dtype.clone();
        let batches = std::iter::from_fn(move || {
            let mut batch = Vec::with_capacity(rows);
            for item in source.by_ref().take(rows) {
                match item {
                    Ok(element) => batch.push(element),
                    Err(err) => return Some(Err(err)),
                }
            }
            if batch.is_empty() {
                None
            } else {
                Some(build_chunk(&batch_dtype, batch))
            }
        });
        let mut out = DataIter::new(batches)
            .with_dtype(dtype)
            .with_chunk_size(rows);
        out.length = length;
        Ok(out)
    }

    /// Undo chunking, yielding one element per row
    pub fn clean_chunks(self) -> Result<DataIter> {
        if self.chunk_size.is_none() {
            return Ok(self);
        }
        let mut source = self;
        source.taste()?;
        let dtype = source.dtype.clone();
        let length = source.length;
        let rows = source.flat_map(|item| match item.and_then(Element::into_rows) {
            Ok(rows) => rows.into_iter().map(Ok).collect::<Vec<_>>(),
            Err(err) => vec![Err(err)],
        });
        let mut out = DataIter::new(rows);
        out.dtype = dtype;
        out.length = length;
        Ok(out)
    }

    /// Scalars out of every container element
    ///
    /// Chunked streams are re-chunked with the same chunk size and the
    /// global dtype.
    pub fn flat(self) -> Result<DataIter> {
        let mut source = self;
        source.taste()?;
        if let Some(Element::Scalar(v)) = source.pushed.last() {
            return Err(Error::type_mismatch("container", v.type_name()));
        }
        let global = source
            .dtype
            .as_ref()
            .and_then(IterDtype::global)
            .unwrap_or(DataType::Float64);
        let width = source
            .features
            .as_ref()
            .map_or(1, |f| f.iter().product::<usize>().max(1));
        let chunk = source.chunk_size;
        let length = source.length.map(|l| l * width);

        let scalars = source.flat_map(move |item| {
            let values = item.and_then(|e| {
                e.values()?
                    .iter()
                    .map(|v| v.cast(global))
                    .collect::<Result<Vec<_>>>()
            });
            match values {
                Ok(values) => values.into_iter().map(|v| Ok(Element::Scalar(v))).collect::<Vec<_>>(),
                Err(err) => vec![Err(err)],
            }
        });
        let mut out = DataIter::new(scalars).with_dtype(IterDtype::Plain(global));
        out.length = length;
        match chunk {
            Some(rows) => out.to_chunks(rows),
            None => Ok(out),
        }
    }

    /// Partition every element's columns at `at` into two streams
    ///
    /// Both streams share one pull source; whichever side pulls first
    /// buffers the other side's half, so row order is preserved on both.
    pub fn split(self, at: usize) -> Result<(DataIter, DataIter)> {
        let mut source = self;
        source.taste()?;
        let (left_dtype, right_dtype) = match source.dtype.clone() {
            Some(IterDtype::Fields(schema)) => {
                let (l, r) = schema.split_at(at);
                (Some(IterDtype::Fields(l)), Some(IterDtype::Fields(r)))
            }
            other => (other.clone(), other),
        };
        let chunked = source.chunk_size.is_some();
        let (chunk_size, length) = (source.chunk_size, source.length);
        let shared = Arc::new(Mutex::new(SplitState {
            source,
            queues: [VecDeque::new(), VecDeque::new()],
        }));

        let side = |index: usize, dtype: Option<IterDtype>| {
            let shared = Arc::clone(&shared);
            let mut it = DataIter::new(std::iter::from_fn(move || shared.lock().pull(index, at, chunked)));
            it.dtype = dtype;
            it.chunk_size = chunk_size;
            it.length = length;
            it
        };
        Ok((side(0, left_dtype), side(1, right_dtype)))
    }

    /// Uniform reservoir sample of `k` rows
    pub fn sample(self, k: usize, weight: Option<&dyn Fn(&Element) -> f64>) -> Result<DataIter> {
        self.sample_with(k, weight, &mut rand::thread_rng())
    }

    /// Reproducible reservoir sample of `k` rows
    pub fn sample_seeded(
        self,
        k: usize,
        weight: Option<&dyn Fn(&Element) -> f64>,
        seed: u64,
    ) -> Result<DataIter> {
        self.sample_with(k, weight, &mut StdRng::seed_from_u64(seed))
    }

    /// Single-pass weighted reservoir sampling over the de-chunked stream
    ///
    /// Each row draws the key `ln(u) / w`; the `k` largest keys win. Rows with
    /// a non-positive weight are only picked when fewer than `k` rows exist.
    /// The sample keeps stream order.
    pub fn sample_with<R: Rng + ?Sized>(
        self,
        k: usize,
        weight: Option<&dyn Fn(&Element) -> f64>,
        rng: &mut R,
    ) -> Result<DataIter> {
        let mut source = self.clean_chunks()?;
        source.begin_eager()?;
        let dtype = source.dtype.clone();

        let mut reservoir: BinaryHeap<Reverse<Keyed>> = BinaryHeap::with_capacity(k + 1);
        for (index, item) in source.by_ref().enumerate() {
            let element = item?;
            let w = weight.map_or(1.0, |f| f(&element));
            let key = if w > 0.0 {
                (1.0 - rng.gen::<f64>()).ln() / w
            } else {
                f64::NEG_INFINITY
            };
            let candidate = Keyed { key, index, element };
            if reservoir.len() < k {
                reservoir.push(Reverse(candidate));
            } else if reservoir.peek().is_some_and(|min| candidate > min.0) {
                reservoir.pop();
                reservoir.push(Reverse(candidate));
            }
        }

        let mut picked: Vec<Keyed> = reservoir.into_iter().map(|r| r.0).collect();
        picked.sort_by_key(|p| p.index);
        let n = picked.len();
        debug!(k, picked = n, "Sampled stream");
        let mut out = DataIter::from_elements(picked.into_iter().map(|p| p.element));
        out.dtype = dtype;
        Ok(out.it_length(n))
    }

    fn operate(self, op: BinaryOp, rhs: Operand) -> DataIter {
        let (chunk_size, length) = (self.chunk_size, self.length);
        let mut out = match rhs {
            Operand::Scalar(value) => DataIter::new(
                self.map(move |item| item.and_then(|e| e.apply_scalar(op, &value))),
            ),
            Operand::Stream(other) => {
                let length = match (length, other.length) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                let mut out = DataIter::new(self.zip(other).map(move |(a, b)| a?.apply(op, &b?)));
                out.length = length;
                out.chunk_size = chunk_size;
                return out;
            }
        };
        out.chunk_size = chunk_size;
        out.length = length;
        out
    }

    /// Elementwise power
    #[must_use]
    pub fn pow(self, rhs: impl Into<Operand>) -> DataIter {
        self.operate(BinaryOp::Pow, rhs.into())
    }

    /// Lazily map every element
    #[must_use]
    pub fn compose<F>(self, f: F) -> DataIter
    where
        F: FnMut(Element) -> Result<Element> + Send + 'static,
    {
        let (chunk_size, length) = (self.chunk_size, self.length);
        let mut f = f;
        let mut out = DataIter::new(self.map(move |item| item.and_then(&mut f)));
        out.chunk_size = chunk_size;
        out.length = length;
        out
    }

    /// Chain another stream after this one
    #[must_use]
    pub fn concat(self, other: DataIter) -> DataIter {
        let chunk_size = if self.chunk_size == other.chunk_size {
            self.chunk_size
        } else {
            None
        };
        let length = self.length.zip(other.length).map(|(a, b)| a + b);
        let mut out = DataIter::new(self.chain(other));
        out.chunk_size = chunk_size;
        out.length = length;
        out
    }

    /// Materialise every row into one dense array
    ///
    /// Stops at the declared length; the result holds the rows actually
    /// produced.
    pub fn to_narray(&mut self, dtype: Option<DataType>) -> Result<Array> {
        self.begin_eager()?;
        let dtype = dtype
            .or_else(|| self.dtype.as_ref().and_then(IterDtype::global))
            .unwrap_or(DataType::Float64);
        let features = self.features.clone().unwrap_or_default();

        if self.chunk_size.is_some() {
            let parts = self
                .by_ref()
                .map(|item| item.and_then(|e| e.to_array()?.cast(dtype)))
                .collect::<Result<Vec<_>>>()?;
            if parts.is_empty() {
                let mut shape = vec![0];
                shape.extend(features);
                return Ok(Array::zeros(dtype, &shape));
            }
            return Array::concat_rows(&parts);
        }

        let mut values = Vec::new();
        let mut rows = 0;
        for item in self.by_ref() {
            values.extend(item?.values()?);
            rows += 1;
        }
        let mut shape = vec![rows];
        shape.extend(features);
        Array::from_values(dtype, &shape, &values)
    }

    /// Materialise every row into a named table
    pub fn to_df(&mut self) -> Result<Table> {
        self.begin_eager()?;
        let Some(IterDtype::Fields(schema)) = self.dtype.clone() else {
            return Table::from_array(&self.to_narray(None)?);
        };

        let mut parts = Vec::new();
        let mut rows: Vec<Vec<Value>> = Vec::new();
        let flush = |rows: &mut Vec<Vec<Value>>, parts: &mut Vec<Table>| -> Result<()> {
            if rows.is_empty() {
                return Ok(());
            }
            let n = rows.len();
            let mut columns: Vec<Vec<Value>> = vec![Vec::with_capacity(n); schema.len()];
            for row in rows.drain(..) {
                for (column, value) in columns.iter_mut().zip(row) {
                    column.push(value);
                }
            }
            let arrays = schema
                .fields()
                .iter()
                .zip(columns)
                .map(|(f, values)| Array::from_values(f.data_type(), &[n], &values).map(|a| (f.name().to_string(), a)))
                .collect::<Result<Vec<_>>>()?;
            parts.push(Table::from_columns(arrays)?);
            Ok(())
        };

        for item in self.by_ref() {
            let element = item?;
            check_element(&IterDtype::Fields(schema.clone()), &element)?;
            match element {
                Element::Row(values) => rows.push(values),
                Element::Group(g) => {
                    flush(&mut rows, &mut parts)?;
                    parts.push(g.to_df()?);
                }
                other => return Err(Error::type_mismatch(&schema, other.type_name())),
            }
        }
        flush(&mut rows, &mut parts)?;

        if parts.is_empty() {
            return Table::from_columns(
                schema
                    .fields()
                    .iter()
                    .map(|f| (f.name().to_string(), Array::zeros(f.data_type(), &[0]))),
            );
        }
        Table::concat(&parts)
    }

    /// Materialise up to `length` rows as an array or a table
    pub fn to_memory(&mut self, length: Option<usize>) -> Result<InMemory> {
        if let Some(n) = length {
            self.length = Some(self.length.map_or(n, |l| l.min(n)));
        }
        self.begin_eager()?;
        if matches!(self.dtype, Some(IterDtype::Fields(_))) {
            Ok(InMemory::Table(self.to_df()?))
        } else {
            Ok(InMemory::Array(self.to_narray(None)?))
        }
    }

    /// Count occurrences of every value, in first-seen order
    pub fn unique(&mut self) -> Result<IndexMap<Value, usize>> {
        self.begin_eager()?;
        let mut counts = IndexMap::new();
        for item in self.by_ref() {
            for value in item?.values()? {
                *counts.entry(value).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}

impl Iterator for DataIter {
    type Item = Result<Element>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state == State::Exhausted {
            return None;
        }
        let remaining = self.length.map(|l| l.saturating_sub(self.emitted));
        if remaining == Some(0) {
            self.state = State::Exhausted;
            return None;
        }

        let element = match self.pushed.pop() {
            Some(element) => element,
            None => match self.source.next() {
                Some(Ok(element)) => element,
                Some(Err(err)) => return Some(Err(err)),
                None => {
                    self.state = State::Exhausted;
                    return None;
                }
            },
        };
        if self.state == State::Uninitialized {
            if let Err(err) = self.observe(&element) {
                return Some(Err(err));
            }
            self.state = State::Ready;
        }

        let rows = if self.chunk_size.is_some() {
            match element.rows() {
                Ok(rows) => rows,
                Err(err) => return Some(Err(err)),
            }
        } else {
            1
        };
        let element = match remaining {
            Some(left) if rows > left => match element.slice_rows(left) {
                Ok(cut) => cut,
                Err(err) => return Some(Err(err)),
            },
            _ => element,
        };
        self.emitted += remaining.map_or(rows, |left| rows.min(left));
        Some(Ok(element))
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<T: Into<Operand>> std::ops::$trait<T> for DataIter {
            type Output = DataIter;

            fn $method(self, rhs: T) -> DataIter {
                self.operate($op, rhs.into())
            }
        }
    };
}

impl_binary_op!(Add, add, BinaryOp::Add);
impl_binary_op!(Sub, sub, BinaryOp::Sub);
impl_binary_op!(Mul, mul, BinaryOp::Mul);
impl_binary_op!(Div, div, BinaryOp::Div);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn collect_values(it: DataIter) -> Vec<Value> {
        it.map(|e| e.unwrap().values().unwrap())
            .collect::<Vec<_>>()
            .concat()
    }

    fn chunk_rows(it: DataIter) -> Vec<usize> {
        it.map(|e| e.unwrap().rows().unwrap()).collect()
    }

    #[test]
    fn test_to_chunks_remainder() {
        let it = DataIter::from_values(0..10_i64).to_chunks(4).unwrap();
        assert_eq!(chunk_rows(it), vec![4, 4, 2]);
    }

    #[test]
    fn test_to_chunks_type_mismatch_names_both() {
        let values = vec![Value::Int(1), Value::Int(2), Value::from("three")];
        let err = DataIter::from_values(values)
            .to_chunks(3)
            .unwrap()
            .next()
            .unwrap()
            .unwrap_err();
        match err {
            Error::TypeMismatch { expected, actual } => {
                assert_eq!(expected, "int64");
                assert_eq!(actual, "utf8");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_structured_rows_chunk_into_groups() {
        let rows = (0..5_i64).map(|i| vec![Value::Int(i), Value::Float(i as f64 / 2.0)]);
        let mut it = DataIter::from_rows(rows.collect::<Vec<_>>()).to_chunks(2).unwrap();
        assert_eq!(it.columns().unwrap(), Some(vec!["c0".to_string(), "c1".to_string()]));
        let first = it.next().unwrap().unwrap();
        match first {
            Element::Group(g) => assert_eq!(g.len().unwrap(), 2),
            other => panic!("expected a group chunk, got {other:?}"),
        }
    }

    #[test]
    fn test_flat_rejects_scalars() {
        let err = DataIter::from_values(vec![1.0_f64]).flat().unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn test_flat_rechunks_with_global_dtype() {
        let array = Array::from(ndarray::Array2::from_shape_fn((5, 2), |(i, j)| (i * 2 + j) as i64).into_dyn());
        let mut flat = DataIter::from_array_chunks(array, 2).unwrap().flat().unwrap();
        assert_eq!(flat.chunk_size(), Some(2));
        assert_eq!(flat.length(), Some(10));
        assert_eq!(flat.global_dtype().unwrap(), Some(DataType::Int64));
        assert_eq!(collect_values(flat), (0..10_i64).map(Value::Int).collect::<Vec<_>>());
    }

    #[test]
    fn test_split_preserves_order() {
        let rows: Vec<Vec<Value>> = (0..4_i64)
            .map(|i| vec![Value::Int(i), Value::Int(i * 10), Value::Int(i * 100)])
            .collect();
        let (mut left, mut right) = DataIter::from_rows(rows).split(2).unwrap();
        assert_eq!(left.columns().unwrap().unwrap(), vec!["c0", "c1"]);
        assert_eq!(right.columns().unwrap().unwrap(), vec!["c2"]);

        // pull the right side first to exercise buffering
        let r = collect_values(right);
        let l = collect_values(left);
        assert_eq!(r, (0..4_i64).map(|i| Value::Int(i * 100)).collect::<Vec<_>>());
        assert_eq!(l[2..4], [Value::Int(1), Value::Int(10)]);
    }

    #[test]
    fn test_sample_exact_size_and_distinct() {
        let mut sample = DataIter::from_values(0..100_i64).sample_seeded(10, None, 7).unwrap();
        let counts = sample.unique().unwrap();
        assert_eq!(counts.len(), 10);
        assert!(counts.values().all(|&c| c == 1));

        let short = DataIter::from_values(0..3_i64).sample_seeded(10, None, 7).unwrap();
        assert_eq!(short.count(), 3);
    }

    #[test]
    fn test_weighted_sample_skips_zero_weight() {
        let even_only = |e: &Element| match e {
            Element::Scalar(Value::Int(i)) if i % 2 == 0 => 1.0,
            _ => 0.0,
        };
        let picked = collect_values(
            DataIter::from_values(0..50_i64)
                .to_chunks(8)
                .unwrap()
                .sample_seeded(5, Some(&even_only), 3)
                .unwrap(),
        );
        assert_eq!(picked.len(), 5);
        assert!(picked.iter().all(|v| v.as_i64().is_some_and(|i| i % 2 == 0)));
    }

    #[test]
    fn test_arithmetic_with_scalars_and_streams() {
        let plus = DataIter::from_values(vec![1_i64, 2, 3]) + 1_i64;
        assert_eq!(collect_values(plus), vec![Value::Int(2), Value::Int(3), Value::Int(4)]);

        let product = DataIter::from_values(vec![1_i64, 2, 3]) * DataIter::from_values(vec![2_i64, 2]);
        assert_eq!(collect_values(product), vec![Value::Int(2), Value::Int(4)]);

        let halves = DataIter::from_values(vec![1_i64, 3]) / 2_i64;
        assert_eq!(collect_values(halves), vec![Value::Float(0.5), Value::Float(1.5)]);

        let squares = DataIter::from_values(vec![3_i64]).pow(2_i64);
        assert_eq!(collect_values(squares), vec![Value::Int(9)]);
    }

    #[test]
    fn test_it_length_never_reads_past_source() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulled);
        let source = (0..5_i64).map(move |i| {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(Element::Scalar(Value::Int(i)))
        });
        let mut long = DataIter::new(source).it_length(20);
        assert_eq!(long.to_narray(None).unwrap().len(), 5);
        assert_eq!(pulled.load(AtomicOrdering::SeqCst), 5);

        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulled);
        let source = (0..100_i64).map(move |i| {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(Element::Scalar(Value::Int(i)))
        });
        let mut short = DataIter::new(source).it_length(3);
        assert_eq!(short.to_narray(None).unwrap().len(), 3);
        assert_eq!(pulled.load(AtomicOrdering::SeqCst), 3);
    }

    #[test]
    fn test_it_length_cuts_last_chunk() {
        let it = DataIter::from_values(0..10_i64).to_chunks(4).unwrap().it_length(6);
        assert_eq!(it.num_splits(), Some(2));
        assert_eq!(chunk_rows(it), vec![4, 2]);
    }

    #[test]
    fn test_exhausted_source_is_terminal() {
        let mut it = DataIter::from_values(vec![1.0_f64, 2.0]);
        assert_eq!(it.to_narray(None).unwrap().len(), 2);
        assert!(it.is_exhausted());
        assert!(matches!(it.to_narray(None), Err(Error::ExhaustedSource)));
    }

    #[test]
    fn test_to_df_uses_field_names() {
        let table = Table::from_columns([
            ("id", Array::from_vec(vec![1_i64, 2, 3])),
            ("score", Array::from_vec(vec![0.5_f64, 0.25, 0.125])),
        ])
        .unwrap();
        let mut it = DataIter::from_table(table.clone()).to_chunks(2).unwrap();
        assert_eq!(it.to_df().unwrap(), table);
    }

    #[test]
    fn test_group_batches_to_narray() {
        let x = ndarray::Array2::<f64>::ones((10, 3)).into_dyn();
        let group = Group::from_arrays([
            ("x", Array::from(x)),
            ("y", Array::from_vec((0..10_i64).collect::<Vec<_>>())),
        ])
        .unwrap();
        let mut it = group.batches(4).unwrap();
        assert_eq!(it.num_splits(), Some(3));
        assert_eq!(it.group_shape().unwrap().to_tuple(), &[10, 4]);
        assert_eq!(it.to_narray(None).unwrap().shape(), &[10, 4]);
    }

    #[test]
    fn test_compose_concat_unique() {
        let doubled = DataIter::from_values(vec![1_i64, 2]).compose(|e| e.apply_scalar(BinaryOp::Mul, &Value::Int(2)));
        let mut joined = doubled.concat(DataIter::from_values(vec![2_i64, 5]));
        let counts = joined.unique().unwrap();
        assert_eq!(counts.get(&Value::Int(2)), Some(&2));
        assert_eq!(counts.get(&Value::Int(4)), Some(&1));
        assert_eq!(counts.get(&Value::Int(5)), Some(&1));
    }

    #[test]
    fn test_to_memory_picks_layout() {
        let mut plain = DataIter::from_values(0..10_i64);
        match plain.to_memory(Some(4)).unwrap() {
            InMemory::Array(a) => assert_eq!(a.len(), 4),
            InMemory::Table(_) => panic!("plain stream should give an array"),
        }
        let mut rows = DataIter::from_rows(vec![vec![Value::Int(1)]]);
        assert!(matches!(rows.to_memory(None).unwrap(), InMemory::Table(_)));
    }

    proptest! {
        #[test]
        fn prop_chunk_transparency(values in proptest::collection::vec(-1000i64..1000, 1..60), rows in 1usize..9) {
            let round_trip = DataIter::from_values(values.clone())
                .to_chunks(rows).unwrap()
                .flat().unwrap()
                .to_chunks(rows).unwrap();
            let expected: Vec<Value> = values.into_iter().map(Value::Int).collect();
            prop_assert_eq!(collect_values(round_trip.clean_chunks().unwrap()), expected);
        }
    }
}
