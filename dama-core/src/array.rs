//! Dense n-dimensional arrays of a single dtype
//!
//! `Array` is the unit that moves between groups, iterators and drivers. The
//! leading axis is always the row axis.

use std::ops::Range;

use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Slice};

use crate::error::{Error, Result};
use crate::schema::DataType;
use crate::value::{BinaryOp, Value};

/// A dense array tagged with its dtype
#[derive(Debug, Clone, PartialEq)]
pub enum Array {
    /// Boolean values
    Boolean(ArrayD<bool>),

    /// 32-bit integers
    Int32(ArrayD<i32>),

    /// 64-bit integers
    Int64(ArrayD<i64>),

    /// 32-bit floats
    Float32(ArrayD<f32>),

    /// 64-bit floats
    Float64(ArrayD<f64>),

    /// Strings
    Utf8(ArrayD<String>),
}

/// Run `$body` with `$a` bound to the inner `ArrayD` of any variant
macro_rules! for_each_variant {
    ($value:expr, $a:ident => $body:expr) => {
        match $value {
            Array::Boolean($a) => $body,
            Array::Int32($a) => $body,
            Array::Int64($a) => $body,
            Array::Float32($a) => $body,
            Array::Float64($a) => $body,
            Array::Utf8($a) => $body,
        }
    };
}

/// Like `for_each_variant!` but rewraps the result in the same variant
macro_rules! map_variant {
    ($value:expr, $a:ident => $body:expr) => {
        match $value {
            Array::Boolean($a) => Array::Boolean($body),
            Array::Int32($a) => Array::Int32($body),
            Array::Int64($a) => Array::Int64($body),
            Array::Float32($a) => Array::Float32($body),
            Array::Float64($a) => Array::Float64($body),
            Array::Utf8($a) => Array::Utf8($body),
        }
    };
}

/// Run `$body` with `$t` aliased to the element type of `$dtype`
macro_rules! with_element {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            DataType::Boolean => {
                type $t = bool;
                $body
            }
            DataType::Int32 => {
                type $t = i32;
                $body
            }
            DataType::Int64 => {
                type $t = i64;
                $body
            }
            DataType::Float32 => {
                type $t = f32;
                $body
            }
            DataType::Float64 => {
                type $t = f64;
                $body
            }
            DataType::Utf8 => {
                type $t = String;
                $body
            }
        }
    };
}

/// Rust types that can be stored in an [`Array`]
pub trait Element: Clone + Send + Sync + 'static {
    /// The dtype tag for this element type
    const DTYPE: DataType;

    /// Wrap a typed array into the tagged enum
    fn wrap(array: ArrayD<Self>) -> Array;

    /// Borrow the typed array if the variant matches
    fn view(array: &Array) -> Option<&ArrayD<Self>>;

    /// Mutably borrow the typed array if the variant matches
    fn view_mut(array: &mut Array) -> Option<&mut ArrayD<Self>>;

    /// Convert to a scalar value
    fn to_value(&self) -> Value;

    /// Convert from a scalar value, casting losslessly
    fn from_value(value: &Value) -> Result<Self>;

    /// Filler for nulls and freshly allocated rows
    fn null() -> Self;

    /// Append a deterministic byte encoding of this element
    fn write_token(&self, out: &mut Vec<u8>);
}

macro_rules! impl_element {
    ($t:ty, $variant:ident, $null:expr, $to:expr, $from:expr, $token:expr) => {
        impl Element for $t {
            const DTYPE: DataType = DataType::$variant;

            fn wrap(array: ArrayD<Self>) -> Array {
                Array::$variant(array)
            }

            fn view(array: &Array) -> Option<&ArrayD<Self>> {
                match array {
                    Array::$variant(a) => Some(a),
                    _ => None,
                }
            }

            fn view_mut(array: &mut Array) -> Option<&mut ArrayD<Self>> {
                match array {
                    Array::$variant(a) => Some(a),
                    _ => None,
                }
            }

            fn to_value(&self) -> Value {
                let to: fn(&$t) -> Value = $to;
                to(self)
            }

            fn from_value(value: &Value) -> Result<Self> {
                if value.is_null() {
                    return Ok(Self::null());
                }
                let from: fn(Value) -> Option<$t> = $from;
                let cast = value.cast(DataType::$variant)?;
                from(cast).ok_or_else(|| Error::type_mismatch(DataType::$variant, value.type_name()))
            }

            fn null() -> Self {
                $null
            }

            fn write_token(&self, out: &mut Vec<u8>) {
                let token: fn(&$t, &mut Vec<u8>) = $token;
                token(self, out);
            }
        }
    };
}

impl_element!(
    bool,
    Boolean,
    false,
    |v| Value::Bool(*v),
    |v| match v {
        Value::Bool(b) => Some(b),
        _ => None,
    },
    |v, out| out.push(u8::from(*v))
);
impl_element!(
    i32,
    Int32,
    0,
    |v| Value::Int(i64::from(*v)),
    |v| v.as_i64().and_then(|i| i32::try_from(i).ok()),
    |v, out| out.extend_from_slice(&v.to_le_bytes())
);
impl_element!(
    i64,
    Int64,
    0,
    |v| Value::Int(*v),
    |v| v.as_i64(),
    |v, out| out.extend_from_slice(&v.to_le_bytes())
);
impl_element!(
    f32,
    Float32,
    f32::NAN,
    |v| Value::Float(f64::from(*v)),
    |v| v.as_f64().map(|x| x as f32),
    |v, out| out.extend_from_slice(&v.to_le_bytes())
);
impl_element!(
    f64,
    Float64,
    f64::NAN,
    |v| Value::Float(*v),
    |v| v.as_f64(),
    |v, out| out.extend_from_slice(&v.to_le_bytes())
);
impl_element!(
    String,
    Utf8,
    String::new(),
    |v| Value::Text(v.clone()),
    |v| match v {
        Value::Text(s) => Some(s),
        _ => None,
    },
    |v, out| {
        out.extend_from_slice(&(v.len() as u64).to_le_bytes());
        out.extend_from_slice(v.as_bytes());
    }
);

impl<T: Element> From<ArrayD<T>> for Array {
    fn from(array: ArrayD<T>) -> Self {
        T::wrap(array)
    }
}

fn build<T: Element>(shape: &[usize], values: &[Value]) -> Result<Array> {
    let data = values
        .iter()
        .map(T::from_value)
        .collect::<Result<Vec<_>>>()?;
    Ok(T::wrap(ArrayD::from_shape_vec(IxDyn(shape), data)?))
}

fn filled<T: Element>(shape: &[usize], value: &Value) -> Result<Array> {
    let fill = T::from_value(value)?;
    Ok(T::wrap(ArrayD::from_elem(IxDyn(shape), fill)))
}

fn concat_typed<T: Element>(parts: &[Array]) -> Result<Array> {
    let views = parts
        .iter()
        .map(|p| {
            T::view(p)
                .map(|a| a.view())
                .ok_or_else(|| Error::type_mismatch(T::DTYPE, p.dtype()))
        })
        .collect::<Result<Vec<ArrayViewD<'_, T>>>>()?;
    Ok(T::wrap(ndarray::concatenate(Axis(0), &views)?))
}

fn assign_typed<T: Element>(
    target: &mut Array,
    axis: usize,
    range: Range<usize>,
    src: &Array,
) -> Result<()> {
    let src = T::view(src).ok_or_else(|| Error::type_mismatch(T::DTYPE, src.dtype()))?;
    let dtype = target.dtype();
    let target = T::view_mut(target).ok_or_else(|| Error::type_mismatch(T::DTYPE, dtype))?;
    let mut window = target.slice_axis_mut(Axis(axis), Slice::from(range));
    if window.shape() == src.shape() {
        window.assign(src);
        return Ok(());
    }
    let broadcast = src.broadcast(window.raw_dim()).ok_or_else(|| {
        Error::SchemaConflict(format!(
            "cannot place array of shape {:?} into window of shape {:?}",
            src.shape(),
            window.shape()
        ))
    })?;
    window.assign(&broadcast);
    Ok(())
}

impl Array {
    /// Allocate an array of `shape` filled with the dtype's null value
    pub fn zeros(dtype: DataType, shape: &[usize]) -> Array {
        with_element!(dtype, T => T::wrap(ArrayD::from_elem(IxDyn(shape), T::null())))
    }

    /// Allocate an array of `shape` filled with `value`
    pub fn full(dtype: DataType, shape: &[usize], value: &Value) -> Result<Array> {
        with_element!(dtype, T => filled::<T>(shape, value))
    }

    /// Build an array from values in logical (row-major) order
    pub fn from_values(dtype: DataType, shape: &[usize], values: &[Value]) -> Result<Array> {
        with_element!(dtype, T => build::<T>(shape, values))
    }

    /// Build a 1-D array from a typed vector
    pub fn from_vec<T: Element>(values: Vec<T>) -> Array {
        T::wrap(ndarray::Array1::from_vec(values).into_dyn())
    }

    /// Build an array of `shape` from a typed vector
    pub fn from_shape_vec<T: Element>(shape: &[usize], values: Vec<T>) -> Result<Array> {
        Ok(T::wrap(ArrayD::from_shape_vec(IxDyn(shape), values)?))
    }

    /// Stack rows of identical shape along a new leading axis
    pub fn from_rows(rows: &[Array]) -> Result<Array> {
        let expanded: Vec<Array> = rows
            .iter()
            .map(|r| map_variant!(r, a => a.clone().insert_axis(Axis(0))))
            .collect();
        Array::concat_rows(&expanded)
    }

    /// Concatenate arrays along the row axis, widening to the global dtype
    pub fn concat_rows(parts: &[Array]) -> Result<Array> {
        let dtype = DataType::max_of(parts.iter().map(|p| p.dtype_ref()))
            .ok_or_else(|| Error::InvalidArgument("nothing to concatenate".to_string()))?;
        let cast = parts
            .iter()
            .map(|p| p.cast(dtype))
            .collect::<Result<Vec<_>>>()?;
        with_element!(dtype, T => concat_typed::<T>(&cast))
    }

    /// Dtype of the elements
    pub fn dtype(&self) -> DataType {
        *self.dtype_ref()
    }

    fn dtype_ref(&self) -> &'static DataType {
        match self {
            Array::Boolean(_) => &DataType::Boolean,
            Array::Int32(_) => &DataType::Int32,
            Array::Int64(_) => &DataType::Int64,
            Array::Float32(_) => &DataType::Float32,
            Array::Float64(_) => &DataType::Float64,
            Array::Utf8(_) => &DataType::Utf8,
        }
    }

    /// Full shape of the array
    pub fn shape(&self) -> &[usize] {
        for_each_variant!(self, a => a.shape())
    }

    /// Number of dimensions
    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Number of rows; a rank-0 array counts as one row
    pub fn len(&self) -> usize {
        self.shape().first().copied().unwrap_or(1)
    }

    /// Whether the array has no rows
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of elements
    pub fn num_elements(&self) -> usize {
        for_each_variant!(self, a => a.len())
    }

    /// Elements per row
    pub fn row_width(&self) -> usize {
        self.shape().iter().skip(1).product()
    }

    /// Approximate in-memory footprint
    pub fn nbytes(&self) -> usize {
        self.num_elements() * self.dtype().size_bytes()
    }

    /// Copy of the rows in `range`, clamped to the row count
    pub fn slice_rows(&self, range: Range<usize>) -> Array {
        if self.ndim() == 0 {
            return self.clone();
        }
        let end = range.end.min(self.len());
        let start = range.start.min(end);
        map_variant!(self, a => a.slice_axis(Axis(0), Slice::from(start..end)).to_owned())
    }

    /// Copy of the columns in `range` along axis 1
    pub fn select_columns(&self, range: Range<usize>) -> Result<Array> {
        if self.ndim() < 2 {
            return Err(Error::SchemaConflict(format!(
                "column selection needs rank >= 2, got shape {:?}",
                self.shape()
            )));
        }
        let width = self.shape()[1];
        if range.end > width {
            return Err(Error::IndexOutOfBounds {
                index: range.end - 1,
                len: width,
            });
        }
        Ok(map_variant!(self, a => a.slice_axis(Axis(1), Slice::from(range.clone())).to_owned()))
    }

    /// Gather rows by index
    pub fn take_rows(&self, indices: &[usize]) -> Result<Array> {
        let len = self.len();
        if let Some(&index) = indices.iter().find(|&&i| i >= len) {
            return Err(Error::IndexOutOfBounds { index, len });
        }
        Ok(map_variant!(self, a => a.select(Axis(0), indices)))
    }

    /// One row as an array of rank `ndim - 1`
    pub fn row(&self, index: usize) -> Result<Array> {
        let len = self.len();
        if index >= len || self.ndim() == 0 {
            return Err(Error::IndexOutOfBounds { index, len });
        }
        Ok(map_variant!(self, a => a.index_axis(Axis(0), index).to_owned()))
    }

    /// Truncate, or grow with null rows, to exactly `rows` rows
    pub fn resize_rows(&self, rows: usize) -> Result<Array> {
        let len = self.len();
        if rows <= len {
            return Ok(self.slice_rows(0..rows));
        }
        let mut shape = self.shape().to_vec();
        if shape.is_empty() {
            shape.push(1);
        }
        shape[0] = rows - len;
        let tail = Array::zeros(self.dtype(), &shape);
        Array::concat_rows(&[self.clone(), tail])
    }

    /// Convert to another dtype without losing information
    pub fn cast(&self, to: DataType) -> Result<Array> {
        if self.dtype() == to {
            return Ok(self.clone());
        }
        Array::from_values(to, self.shape(), &self.values())
    }

    /// Reshape into a single axis
    pub fn flatten(&self) -> Array {
        map_variant!(self, a => {
            let n = a.len();
            ArrayD::from_shape_vec(IxDyn(&[n]), a.iter().cloned().collect())
                .unwrap_or_else(|_| a.clone())
        })
    }

    /// Reshape keeping the element order
    pub fn reshape(&self, shape: &[usize]) -> Result<Array> {
        Ok(map_variant!(self, a => {
            ArrayD::from_shape_vec(IxDyn(shape), a.iter().cloned().collect())?
        }))
    }

    /// All elements in logical order
    pub fn values(&self) -> Vec<Value> {
        for_each_variant!(self, a => a.iter().map(Element::to_value).collect())
    }

    /// Elements of one row in logical order
    pub fn row_values(&self, index: usize) -> Result<Vec<Value>> {
        if self.ndim() <= 1 {
            let len = self.len();
            let value = for_each_variant!(self, a => a.iter().nth(index).map(Element::to_value))
                .ok_or(Error::IndexOutOfBounds { index, len })?;
            return Ok(vec![value]);
        }
        Ok(self.row(index)?.values())
    }

    /// First element, for rank-0 and single-element arrays
    pub fn first_value(&self) -> Option<Value> {
        for_each_variant!(self, a => a.iter().next().map(Element::to_value))
    }

    /// Overwrite rows `start..start + src.len()` with `src`
    pub fn set_rows(&mut self, start: usize, src: &Array) -> Result<()> {
        let end = start + src.len();
        if end > self.len() {
            return Err(Error::IndexOutOfBounds {
                index: end.saturating_sub(1),
                len: self.len(),
            });
        }
        let src = src.cast(self.dtype())?;
        let dtype = self.dtype();
        with_element!(dtype, T => assign_typed::<T>(self, 0, start..end, &src))
    }

    /// Write `src` into columns `offset..offset + width` along axis 1
    ///
    /// `src` either has the rank of `self` or holds one element per row, in
    /// which case it is broadcast across the window.
    pub fn set_columns(&mut self, offset: usize, width: usize, src: &Array) -> Result<()> {
        if self.ndim() < 2 {
            return Err(Error::SchemaConflict(format!(
                "column window needs rank >= 2, got shape {:?}",
                self.shape()
            )));
        }
        let rows = self.len();
        let src = src.cast(self.dtype())?.resize_rows(rows)?;
        let src = if src.ndim() == self.ndim() {
            src
        } else if src.row_width() == 1 {
            let mut shape = vec![1; self.ndim()];
            shape[0] = rows;
            src.reshape(&shape)?
        } else {
            return Err(Error::SchemaConflict(format!(
                "cannot place array of shape {:?} into {:?}",
                src.shape(),
                self.shape()
            )));
        };
        let dtype = self.dtype();
        with_element!(dtype, T => assign_typed::<T>(self, 1, offset..offset + width, &src))
    }

    /// Elementwise `self op value`
    pub fn apply_scalar(&self, op: BinaryOp, value: &Value) -> Result<Array> {
        let out = self
            .values()
            .iter()
            .map(|v| v.apply(op, value))
            .collect::<Result<Vec<_>>>()?;
        Array::from_computed(self.shape(), &out)
    }

    /// Elementwise `self op other` for arrays of the same shape
    pub fn apply(&self, op: BinaryOp, other: &Array) -> Result<Array> {
        if self.shape() != other.shape() {
            return Err(Error::SchemaConflict(format!(
                "operand shapes differ: {:?} vs {:?}",
                self.shape(),
                other.shape()
            )));
        }
        let out = self
            .values()
            .iter()
            .zip(other.values().iter())
            .map(|(a, b)| a.apply(op, b))
            .collect::<Result<Vec<_>>>()?;
        Array::from_computed(self.shape(), &out)
    }

    fn from_computed(shape: &[usize], values: &[Value]) -> Result<Array> {
        let dtype = values
            .iter()
            .filter_map(Value::data_type)
            .max()
            .unwrap_or(DataType::Float64);
        Array::from_values(dtype, shape, values)
    }

    /// Deterministic byte encoding of dtype, shape and contents
    pub fn token(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.nbytes() + 32);
        out.extend_from_slice(self.dtype().name().as_bytes());
        for dim in self.shape() {
            out.extend_from_slice(&(*dim as u64).to_le_bytes());
        }
        for_each_variant!(self, a => {
            for v in a {
                v.write_token(&mut out);
            }
        });
        out
    }

    /// Borrow as a typed `ndarray`
    pub fn as_typed<T: Element>(&self) -> Option<&ArrayD<T>> {
        T::view(self)
    }
}
