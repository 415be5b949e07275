//! Scalar values and the elementwise operators applied to them

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::schema::DataType;

/// A single scalar cell
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// Missing value
    Null,

    /// Boolean value
    Bool(bool),

    /// Integer value
    Int(i64),

    /// Floating point value
    Float(f64),

    /// Text value
    Text(String),
}

/// Elementwise binary operators supported by iterators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// Addition
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// True division, always floating point
    Div,
    /// Exponentiation
    Pow,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "**",
        };
        f.write_str(symbol)
    }
}

impl Value {
    /// The natural dtype of this value, `None` for nulls
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(DataType::Boolean),
            Value::Int(_) => Some(DataType::Int64),
            Value::Float(_) => Some(DataType::Float64),
            Value::Text(_) => Some(DataType::Utf8),
        }
    }

    /// Name of the natural dtype, used in error messages
    pub fn type_name(&self) -> &'static str {
        self.data_type().map_or("null", |t| t.name())
    }

    /// Check if this value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convert to `to` without losing information
    pub fn cast(&self, to: DataType) -> Result<Value> {
        let mismatch = || Error::type_mismatch(to, self.type_name());
        match (self, to) {
            (Value::Null, _) => Ok(Value::Null),
            (Value::Bool(b), DataType::Boolean) => Ok(Value::Bool(*b)),
            (Value::Bool(b), DataType::Int32 | DataType::Int64) => Ok(Value::Int(i64::from(*b))),
            (Value::Bool(b), DataType::Float32 | DataType::Float64) => {
                Ok(Value::Float(if *b { 1.0 } else { 0.0 }))
            }
            (Value::Int(i), DataType::Int32) => {
                i32::try_from(*i).map(|_| Value::Int(*i)).map_err(|_| mismatch())
            }
            (Value::Int(i), DataType::Int64) => Ok(Value::Int(*i)),
            #[allow(clippy::cast_precision_loss)]
            (Value::Int(i), DataType::Float32 | DataType::Float64) => Ok(Value::Float(*i as f64)),
            (Value::Float(x), DataType::Float32 | DataType::Float64) => Ok(Value::Float(*x)),
            (Value::Text(s), DataType::Utf8) => Ok(Value::Text(s.clone())),
            (v, DataType::Utf8) => Ok(Value::Text(v.to_string())),
            _ => Err(mismatch()),
        }
    }

    /// Numeric view of this value
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            #[allow(clippy::cast_precision_loss)]
            Value::Int(i) => Some(*i as f64),
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    /// Integer view of this value
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Text view of this value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Apply `op` with `self` on the left
    ///
    /// Integer operands stay integral except for division, negative powers
    /// and overflow, which promote to floating point.
    pub fn apply(&self, op: BinaryOp, rhs: &Value) -> Result<Value> {
        if self.is_null() || rhs.is_null() {
            return Ok(Value::Null);
        }
        if let (Some(a), Some(b)) = (self.as_i64(), rhs.as_i64()) {
            let exact = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Sub => a.checked_sub(b),
                BinaryOp::Mul => a.checked_mul(b),
                BinaryOp::Div => None,
                BinaryOp::Pow => u32::try_from(b).ok().and_then(|e| a.checked_pow(e)),
            };
            if let Some(v) = exact {
                return Ok(Value::Int(v));
            }
        }
        match (self.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::Float(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                BinaryOp::Pow => a.powf(b),
            })),
            _ => Err(Error::type_mismatch(
                "numeric operands",
                format!("{} {op} {}", self.type_name(), rhs.type_name()),
            )),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(x) => x.to_bits().hash(state),
            Value::Text(s) => s.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Value::Int(3), BinaryOp::Add, Value::Int(4), Value::Int(7); "int add stays int")]
    #[test_case(Value::Int(3), BinaryOp::Div, Value::Int(2), Value::Float(1.5); "div promotes")]
    #[test_case(Value::Int(2), BinaryOp::Pow, Value::Int(10), Value::Int(1024); "int pow")]
    #[test_case(Value::Int(2), BinaryOp::Pow, Value::Int(-1), Value::Float(0.5); "negative pow")]
    #[test_case(Value::Float(1.5), BinaryOp::Mul, Value::Int(2), Value::Float(3.0); "mixed mul")]
    fn test_apply(lhs: Value, op: BinaryOp, rhs: Value, expected: Value) {
        assert_eq!(lhs.apply(op, &rhs).unwrap(), expected);
    }

    #[test]
    fn test_apply_text_is_type_mismatch() {
        let err = Value::from("a").apply(BinaryOp::Add, &Value::Int(1)).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn test_cast_is_lossless() {
        assert_eq!(Value::Int(4).cast(DataType::Float64).unwrap(), Value::Float(4.0));
        assert!(Value::Float(4.5).cast(DataType::Int64).is_err());
        assert!(Value::Int(i64::MAX).cast(DataType::Int32).is_err());
        assert_eq!(Value::Int(7).cast(DataType::Utf8).unwrap(), Value::from("7"));
    }
}
