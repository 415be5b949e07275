//! Per-group chunk sizing

use std::fmt;

use indexmap::IndexMap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::memory::MemoryBudget;
use crate::schema::Schema;
use crate::shape::Shape;

/// An explicit chunk request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkSpec {
    /// Number of rows for every group
    Rows(usize),

    /// Exact dims for every group
    Dims(Vec<usize>),
}

impl From<usize> for ChunkSpec {
    fn from(rows: usize) -> Self {
        ChunkSpec::Rows(rows)
    }
}

impl From<Vec<usize>> for ChunkSpec {
    fn from(dims: Vec<usize>) -> Self {
        ChunkSpec::Dims(dims)
    }
}

/// Recommended chunk dims for each group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chunks {
    groups: IndexMap<String, Vec<usize>>,
}

impl Chunks {
    pub(crate) fn from_groups(groups: IndexMap<String, Vec<usize>>) -> Self {
        Self { groups }
    }

    /// Give every group exactly the requested chunk
    pub fn build_from<S: AsRef<str>>(spec: &ChunkSpec, groups: &[S]) -> Result<Chunks> {
        let dims = match spec {
            ChunkSpec::Rows(rows) => vec![*rows],
            ChunkSpec::Dims(dims) => dims.clone(),
        };
        if dims.first() == Some(&0) || dims.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "chunk length must be positive, got {dims:?}"
            )));
        }
        Ok(Chunks {
            groups: groups
                .iter()
                .map(|g| (g.as_ref().to_string(), dims.clone()))
                .collect(),
        })
    }

    /// Size chunks so one chunk of every group fits in the memory budget
    ///
    /// Every group gets the same number of rows: the smallest that any group
    /// allows, capped at the dataset length and never below one.
    pub fn build_from_shape(shape: &Shape, dtypes: &Schema, budget: &MemoryBudget) -> Result<Chunks> {
        let allowed = budget.allowed_bytes();
        let num_groups = shape.num_groups().max(1);
        let per_group = allowed / num_groups;

        let mut rows = usize::MAX;
        for (name, dims) in shape.iter() {
            let dtype = dtypes.field_by_name(name)?.data_type();
            let row_bytes = dims.iter().skip(1).product::<usize>().max(1) * dtype.size_bytes();
            rows = rows.min(per_group / row_bytes);
        }
        let rows = rows.min(shape.max_length()).max(1);
        debug!(rows, allowed, "Sized chunks from shape {}", shape);

        Ok(Chunks {
            groups: shape
                .iter()
                .map(|(name, dims)| {
                    let mut chunk = dims.to_vec();
                    if let Some(first) = chunk.first_mut() {
                        *first = rows;
                    }
                    (name.to_string(), chunk)
                })
                .collect(),
        })
    }

    /// Longest chunk across groups
    pub fn length(&self) -> usize {
        self.groups
            .values()
            .filter_map(|d| d.first().copied())
            .max()
            .unwrap_or(0)
    }

    /// Chunk dims of one group
    pub fn group(&self, name: &str) -> Option<&[usize]> {
        self.groups.get(name).map(Vec::as_slice)
    }

    /// `(group, dims)` pairs in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[usize])> {
        self.groups.iter().map(|(n, d)| (n.as_str(), d.as_slice()))
    }

    /// Number of groups
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether no group is chunked
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl fmt::Display for Chunks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .groups
            .iter()
            .map(|(name, dims)| format!("{name}: {dims:?}"))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DataType;

    fn shape_and_dtypes() -> (Shape, Schema) {
        let shape = Shape::from_groups([("x", vec![1000, 10]), ("y", vec![1000])]);
        let dtypes = Schema::from_pairs([("x", DataType::Float64), ("y", DataType::Int32)]);
        (shape, dtypes)
    }

    #[test]
    fn test_build_from_gives_exact_value() {
        let chunks = Chunks::build_from(&ChunkSpec::Rows(4), &["x", "y"]).unwrap();
        assert_eq!(chunks.group("y"), Some(&[4][..]));
        assert_eq!(chunks.length(), 4);
        assert!(Chunks::build_from(&ChunkSpec::Rows(0), &["x"]).is_err());
    }

    #[test]
    fn test_build_from_shape_shares_min_rows() {
        let (shape, dtypes) = shape_and_dtypes();
        // 1600 bytes per group: x rows cost 80 bytes, y rows 4
        let budget = MemoryBudget::fixed(1600 * 2, 1.0);
        let chunks = Chunks::build_from_shape(&shape, &dtypes, &budget).unwrap();
        assert_eq!(chunks.group("x"), Some(&[20, 10][..]));
        assert_eq!(chunks.group("y"), Some(&[20][..]));
    }

    #[test]
    fn test_build_from_shape_caps_and_floors() {
        let (shape, dtypes) = shape_and_dtypes();
        let roomy = MemoryBudget::fixed(usize::MAX / 2, 0.9);
        assert_eq!(Chunks::build_from_shape(&shape, &dtypes, &roomy).unwrap().length(), 1000);

        let tiny = MemoryBudget::fixed(1, 0.5);
        assert_eq!(Chunks::build_from_shape(&shape, &dtypes, &tiny).unwrap().length(), 1);
    }

    #[test]
    fn test_build_from_shape_needs_every_dtype() {
        let (shape, _) = shape_and_dtypes();
        let dtypes = Schema::from_pairs([("x", DataType::Float64)]);
        let err = Chunks::build_from_shape(&shape, &dtypes, &MemoryBudget::fixed(1024, 1.0));
        assert!(err.unwrap_err().is_not_found());
    }
}
