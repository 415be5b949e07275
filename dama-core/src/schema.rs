//! Schema definition for dataset groups

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Data type for column values
///
/// Variants are declared in widening order, so `Ord` gives the global dtype
/// of a set of columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Boolean type (stored as one byte)
    Boolean,

    /// 32-bit signed integer
    Int32,

    /// 64-bit signed integer
    Int64,

    /// 32-bit floating point
    Float32,

    /// 64-bit floating point
    Float64,

    /// UTF-8 encoded string
    Utf8,
}

impl DataType {
    /// Get the size of this type in bytes
    ///
    /// Strings count as one object reference, which is what a chunk of them
    /// costs before their payload is touched.
    pub fn size_bytes(&self) -> usize {
        match self {
            DataType::Boolean => 1,
            DataType::Int32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::Float64 | DataType::Utf8 => 8,
        }
    }

    /// Check if this type is a fixed-width type
    pub fn is_fixed_width(&self) -> bool {
        !matches!(self, DataType::Utf8)
    }

    /// Check if this type is a numeric type
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DataType::Int32 | DataType::Int64 | DataType::Float32 | DataType::Float64
        )
    }

    /// Check if this type is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    /// Widest of a set of types, `None` for an empty set
    pub fn max_of<'a>(types: impl IntoIterator<Item = &'a DataType>) -> Option<DataType> {
        types.into_iter().copied().max()
    }

    /// Declared SQL column type used by relational backends
    ///
    /// Every name maps to the affinity SQLite uses for it, while still telling
    /// the widths apart when read back.
    pub fn sql_type(&self) -> &'static str {
        match self {
            DataType::Boolean => "BOOLEAN",
            DataType::Int32 => "INT",
            DataType::Int64 => "INTEGER",
            DataType::Float32 => "FLOAT",
            DataType::Float64 => "REAL",
            DataType::Utf8 => "TEXT",
        }
    }

    /// Map a declared SQL column type back to a dtype
    pub fn from_sql_type(sql_type: &str) -> DataType {
        match sql_type.to_ascii_lowercase().as_str() {
            "boolean" | "bool" => DataType::Boolean,
            "int" | "int4" | "smallint" => DataType::Int32,
            "integer" | "bigint" | "int8" => DataType::Int64,
            "float" | "float4" => DataType::Float32,
            "real" | "double" | "double precision" => DataType::Float64,
            _ => DataType::Utf8,
        }
    }

    /// Lower-case name used in manifests and catalog rows
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Boolean => "boolean",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::Utf8 => "utf8",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "boolean" | "bool" => Ok(DataType::Boolean),
            "int32" | "i32" => Ok(DataType::Int32),
            "int64" | "i64" | "int" => Ok(DataType::Int64),
            "float32" | "f32" => Ok(DataType::Float32),
            "float64" | "f64" | "float" => Ok(DataType::Float64),
            "utf8" | "str" | "string" | "text" => Ok(DataType::Utf8),
            other => Err(Error::InvalidArgument(format!("Unknown data type: {other}"))),
        }
    }
}

/// A named, typed field of a schema
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    /// Name of the field
    pub name: String,

    /// Data type of the field
    pub data_type: DataType,
}

impl Field {
    /// Create a new field
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }

    /// Get the name of this field
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the data type of this field
    pub fn data_type(&self) -> DataType {
        self.data_type
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.data_type)
    }
}

/// An ordered list of fields describing a group's columns
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Field>", into = "Vec<Field>")]
pub struct Schema {
    /// Fields in this schema
    fields: Vec<Field>,

    /// Field indices by name for faster lookup
    field_indices: HashMap<String, usize>,
}

impl From<Vec<Field>> for Schema {
    fn from(fields: Vec<Field>) -> Self {
        Self::new(fields)
    }
}

impl From<Schema> for Vec<Field> {
    fn from(schema: Schema) -> Self {
        schema.fields
    }
}

impl Schema {
    /// Create a new schema with the given fields
    ///
    /// A repeated name keeps its first position.
    pub fn new(fields: Vec<Field>) -> Self {
        let mut field_indices = HashMap::with_capacity(fields.len());
        for (i, field) in fields.iter().enumerate() {
            field_indices.entry(field.name.clone()).or_insert(i);
        }

        Self {
            fields,
            field_indices,
        }
    }

    /// Build a schema from `(name, dtype)` pairs
    pub fn from_pairs<S: Into<String>>(pairs: impl IntoIterator<Item = (S, DataType)>) -> Self {
        Self::new(pairs.into_iter().map(|(n, t)| Field::new(n, t)).collect())
    }

    /// Get all fields in this schema
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Get a field by index
    pub fn field(&self, index: usize) -> &Field {
        &self.fields[index]
    }

    /// Get a field by name
    pub fn field_by_name(&self, name: &str) -> Result<&Field> {
        let index = self.index_of(name)?;
        Ok(&self.fields[index])
    }

    /// Get the index of a field by name
    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.field_indices
            .get(name)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("Field not found: {name}")))
    }

    /// Whether a field with this name exists
    pub fn contains(&self, name: &str) -> bool {
        self.field_indices.contains_key(name)
    }

    /// Field names in order
    pub fn names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Get the number of fields in this schema
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if this schema is empty
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Widest dtype across all fields
    pub fn global_dtype(&self) -> Option<DataType> {
        DataType::max_of(self.fields.iter().map(|f| &f.data_type))
    }

    /// Create a projection of this schema with only the specified field names
    pub fn project_by_names(&self, names: &[&str]) -> Result<Self> {
        let fields = names
            .iter()
            .map(|name| self.field_by_name(name).cloned())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(fields))
    }

    /// Split the fields at a position, keeping order on both sides
    pub fn split_at(&self, at: usize) -> (Self, Self) {
        let at = at.min(self.fields.len());
        let (left, right) = self.fields.split_at(at);
        (Self::new(left.to_vec()), Self::new(right.to_vec()))
    }

    /// Rename one field, returning the new schema
    pub fn rename(&self, old: &str, new: &str) -> Result<Self> {
        let index = self.index_of(old)?;
        let mut fields = self.fields.clone();
        fields[index].name = new.to_string();
        Ok(Self::new(fields))
    }

    /// Compare this (expected) schema against `actual`
    pub fn diff(&self, actual: &Schema) -> SchemaDiff {
        let mut diff = SchemaDiff::default();
        for field in &self.fields {
            match actual.field_by_name(&field.name) {
                Ok(found) if found.data_type != field.data_type => {
                    diff.retyped
                        .push((field.name.clone(), field.data_type, found.data_type));
                }
                Ok(_) => {}
                Err(_) => diff.missing.push(field.name.clone()),
            }
        }
        for field in &actual.fields {
            if !self.contains(&field.name) {
                diff.extra.push(field.name.clone());
            }
        }
        diff
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "({field})")?;
        }
        write!(f, "]")
    }
}

/// Differences between an expected and an actual schema
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDiff {
    /// Expected fields absent from the actual schema
    pub missing: Vec<String>,

    /// Actual fields not in the expected schema
    pub extra: Vec<String>,

    /// Fields present on both sides with different dtypes: (name, expected, actual)
    pub retyped: Vec<(String, DataType, DataType)>,
}

impl SchemaDiff {
    /// No differences at all
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty() && self.retyped.is_empty()
    }

    /// Only columns were added on the actual side
    pub fn is_additive(&self) -> bool {
        self.missing.is_empty() && self.retyped.is_empty()
    }
}

impl fmt::Display for SchemaDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "missing {:?}, extra {:?}, retyped {:?}",
            self.missing, self.extra, self.retyped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_dtype_is_widest() {
        let schema = Schema::from_pairs([("a", DataType::Int32), ("b", DataType::Float64)]);
        assert_eq!(schema.global_dtype(), Some(DataType::Float64));
        assert_eq!(Schema::default().global_dtype(), None);
    }

    #[test]
    fn test_schema_json_round_trip_rebuilds_index() {
        let schema = Schema::from_pairs([("x", DataType::Float64), ("y", DataType::Int64)]);
        let json = serde_json::to_string(&schema).unwrap();
        let back: Schema = serde_json::from_str(&json).unwrap();
        assert_eq!(back.index_of("y").unwrap(), 1);
    }

    #[test]
    fn test_diff_additive_drift() {
        let expected = Schema::from_pairs([("x", DataType::Float64)]);
        let actual = Schema::from_pairs([("x", DataType::Float64), ("z", DataType::Utf8)]);
        let diff = expected.diff(&actual);
        assert!(diff.is_additive());
        assert_eq!(diff.extra, vec!["z".to_string()]);

        let retyped = Schema::from_pairs([("x", DataType::Utf8)]);
        assert!(!expected.diff(&retyped).is_additive());
    }

    #[test]
    fn test_sql_type_round_trip() {
        for dtype in [DataType::Boolean, DataType::Int32, DataType::Int64, DataType::Float32, DataType::Float64, DataType::Utf8] {
            assert_eq!(DataType::from_sql_type(dtype.sql_type()), dtype);
        }
        assert_eq!(DataType::from_sql_type("BIGINT"), DataType::Int64);
        assert_eq!(DataType::from_sql_type("TEXT"), DataType::Utf8);
        assert_eq!("float".parse::<DataType>().unwrap(), DataType::Float64);
    }
}
