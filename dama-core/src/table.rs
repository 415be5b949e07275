//! Named tables of equal-length 1-D columns

use std::ops::Range;

use indexmap::IndexMap;

use crate::array::Array;
use crate::error::{Error, Result};
use crate::schema::{Field, Schema};
use crate::value::Value;

/// An ordered set of named 1-D arrays sharing one length
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: IndexMap<String, Array>,
}

impl Table {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(name, column)` pairs
    pub fn from_columns<S: Into<String>>(columns: impl IntoIterator<Item = (S, Array)>) -> Result<Self> {
        let mut table = Table::new();
        for (name, column) in columns {
            table.push_column(name, column)?;
        }
        Ok(table)
    }

    /// Split a 1-D or 2-D array into columns named `c0`, `c1`, ...
    pub fn from_array(array: &Array) -> Result<Self> {
        match array.ndim() {
            0 | 1 => Table::from_columns([("c0", array.flatten())]),
            2 => {
                let rows = array.len();
                let columns = (0..array.shape()[1])
                    .map(|i| {
                        let column = array.select_columns(i..i + 1)?.reshape(&[rows])?;
                        Ok((format!("c{i}"), column))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Table::from_columns(columns)
            }
            _ => Err(Error::SchemaConflict(format!(
                "cannot tabulate array of shape {:?}",
                array.shape()
            ))),
        }
    }

    /// Append a column
    pub fn push_column(&mut self, name: impl Into<String>, column: Array) -> Result<()> {
        let name = name.into();
        if column.ndim() != 1 {
            return Err(Error::SchemaConflict(format!(
                "table column {name} must be 1-D, got shape {:?}",
                column.shape()
            )));
        }
        if self.columns.contains_key(&name) {
            return Err(Error::SchemaConflict(format!("Column already exists: {name}")));
        }
        if let Some(rows) = self.columns.values().next().map(Array::len) {
            if rows != column.len() {
                return Err(Error::SchemaConflict(format!(
                    "column {name} has {} rows, table has {rows}",
                    column.len()
                )));
            }
        }
        self.columns.insert(name, column);
        Ok(())
    }

    /// Column by name
    pub fn column(&self, name: &str) -> Result<&Array> {
        self.columns
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Column not found: {name}")))
    }

    /// `(name, column)` pairs in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Array)> {
        self.columns.iter().map(|(n, c)| (n.as_str(), c))
    }

    /// Column names in order
    pub fn names(&self) -> Vec<String> {
        self.columns.keys().cloned().collect()
    }

    /// Names and dtypes
    pub fn schema(&self) -> Schema {
        Schema::new(
            self.columns
                .iter()
                .map(|(n, c)| Field::new(n.clone(), c.dtype()))
                .collect(),
        )
    }

    /// Number of rows
    pub fn num_rows(&self) -> usize {
        self.columns.values().next().map_or(0, Array::len)
    }

    /// Number of columns
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Whether the table has no rows
    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    /// One row as values
    pub fn row(&self, index: usize) -> Result<Vec<Value>> {
        self.columns
            .values()
            .map(|c| {
                c.row_values(index)
                    .map(|mut v| v.pop().unwrap_or(Value::Null))
            })
            .collect()
    }

    /// Copy of the rows in `range`
    pub fn slice_rows(&self, range: Range<usize>) -> Table {
        Table {
            columns: self
                .columns
                .iter()
                .map(|(n, c)| (n.clone(), c.slice_rows(range.clone())))
                .collect(),
        }
    }

    /// Stack tables with the same column names
    pub fn concat(tables: &[Table]) -> Result<Table> {
        let Some(first) = tables.first() else {
            return Ok(Table::new());
        };
        let mut out = Table::new();
        for name in first.columns.keys() {
            let parts = tables
                .iter()
                .map(|t| t.column(name).cloned())
                .collect::<Result<Vec<_>>>()?;
            out.push_column(name.clone(), Array::concat_rows(&parts)?)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_from_array_names_columns() {
        let table = Table::from_array(&Array::from(array![[1, 2], [3, 4], [5, 6]].into_dyn())).unwrap();
        assert_eq!(table.names(), vec!["c0", "c1"]);
        assert_eq!(table.row(2).unwrap(), vec![Value::Int(5), Value::Int(6)]);
    }

    #[test]
    fn test_push_column_checks_length() {
        let mut table = Table::from_columns([("a", Array::from_vec(vec![1_i64, 2]))]).unwrap();
        assert!(table.push_column("b", Array::from_vec(vec![1.0_f64])).is_err());
        assert!(table.push_column("a", Array::from_vec(vec![1_i64, 2])).is_err());
    }

    #[test]
    fn test_concat_stacks_rows() {
        let a = Table::from_columns([("x", Array::from_vec(vec![1_i64]))]).unwrap();
        let b = Table::from_columns([("x", Array::from_vec(vec![2_i64, 3]))]).unwrap();
        let out = Table::concat(&[a, b]).unwrap();
        assert_eq!(out.num_rows(), 3);
        assert_eq!(out.schema().names(), vec!["x"]);
    }
}
