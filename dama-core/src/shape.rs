//! Per-group dimensions and their reconciled logical shape

use std::fmt;
use std::sync::OnceLock;

use indexmap::IndexMap;

use crate::chunks::Chunks;
use crate::error::{Error, Result};

/// Dimensions of every group of a dataset
///
/// `to_tuple` folds the groups into one logical shape. The result is memoised
/// and only `rename`, `set_group` and `remove_group` reset it.
#[derive(Debug, Clone, Default)]
pub struct Shape {
    /// Dimensions by group name, in group order
    groups: IndexMap<String, Vec<usize>>,

    /// Memoised `to_tuple` result
    tuple: OnceLock<Vec<usize>>,
}

impl PartialEq for Shape {
    fn eq(&self, other: &Self) -> bool {
        self.groups == other.groups
    }
}

impl Eq for Shape {}

impl Shape {
    /// Create an empty shape
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(group, dims)` pairs
    pub fn from_groups<S: Into<String>>(groups: impl IntoIterator<Item = (S, Vec<usize>)>) -> Self {
        Self {
            groups: groups.into_iter().map(|(n, d)| (n.into(), d)).collect(),
            tuple: OnceLock::new(),
        }
    }

    /// The reconciled logical shape
    ///
    /// With several groups the leading dim is the longest group and the second
    /// dim sums each group's width. A group counts as width 1 when it is
    /// rank 0 or 1, or when its rank differs from the highest rank present.
    /// Further dims come from the first group of highest rank.
    pub fn to_tuple(&self) -> &[usize] {
        self.tuple.get_or_init(|| self.reconcile())
    }

    fn reconcile(&self) -> Vec<usize> {
        match self.groups.len() {
            0 => vec![0],
            1 => self.groups[0].clone(),
            _ => {
                let max_rank = self.groups.values().map(Vec::len).max().unwrap_or(0);
                let lead = self
                    .groups
                    .values()
                    .map(|d| d.first().copied().unwrap_or(0))
                    .max()
                    .unwrap_or(0);
                let width: usize = self
                    .groups
                    .values()
                    .map(|d| {
                        if d.len() <= 1 || d.len() != max_rank {
                            1
                        } else {
                            d[1]
                        }
                    })
                    .sum();
                let mut tuple = vec![lead, width];
                if let Some(widest) = self.groups.values().find(|d| d.len() == max_rank) {
                    tuple.extend(widest.iter().skip(2));
                }
                if lead == 0 && max_rank == 0 {
                    tuple[0] = 1;
                }
                tuple
            }
        }
    }

    /// Number of logical dims
    pub fn len(&self) -> usize {
        self.to_tuple().len()
    }

    /// Whether no group is present
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// One logical dim
    pub fn dim(&self, index: usize) -> Option<usize> {
        self.to_tuple().get(index).copied()
    }

    /// Leading dim of the logical shape
    pub fn max_length(&self) -> usize {
        self.dim(0).unwrap_or(0)
    }

    /// Dims of one group
    pub fn group(&self, name: &str) -> Option<&[usize]> {
        self.groups.get(name).map(Vec::as_slice)
    }

    /// Group names in order
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// `(group, dims)` pairs in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[usize])> {
        self.groups.iter().map(|(n, d)| (n.as_str(), d.as_slice()))
    }

    /// Number of groups
    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    /// New shape with every leading dim set to `min(length, current)`
    pub fn change_length(&self, length: usize) -> Shape {
        Shape::from_groups(self.groups.iter().map(|(name, dims)| {
            let mut dims = dims.clone();
            if let Some(first) = dims.first_mut() {
                *first = (*first).min(length);
            }
            (name.clone(), dims)
        }))
    }

    /// Chunks of at most `rows` rows per group
    pub fn to_chunks(&self, rows: usize) -> Chunks {
        Chunks::from_groups(self.change_length(rows).groups)
    }

    /// Rename a group in place, keeping its position
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let index = self
            .groups
            .get_index_of(old)
            .ok_or_else(|| Error::NotFound(format!("Group not found: {old}")))?;
        if old != new && self.groups.contains_key(new) {
            return Err(Error::SchemaConflict(format!("Group already exists: {new}")));
        }
        let groups = std::mem::take(&mut self.groups);
        self.groups = groups
            .into_iter()
            .enumerate()
            .map(|(i, (n, d))| if i == index { (new.to_string(), d) } else { (n, d) })
            .collect();
        self.tuple.take();
        Ok(())
    }

    /// Insert or replace the dims of a group
    pub fn set_group(&mut self, name: impl Into<String>, dims: Vec<usize>) {
        self.groups.insert(name.into(), dims);
        self.tuple.take();
    }

    /// Drop a group, returning its dims
    pub fn remove_group(&mut self, name: &str) -> Option<Vec<usize>> {
        let removed = self.groups.shift_remove(name);
        if removed.is_some() {
            self.tuple.take();
        }
        removed
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.to_tuple().iter().map(ToString::to_string).collect();
        write!(f, "({})", dims.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case(vec![], vec![0]; "no groups")]
    #[test_case(vec![("x", vec![10, 3])], vec![10, 3]; "single group")]
    #[test_case(vec![("x", vec![10, 3]), ("y", vec![10])], vec![10, 4]; "matrix and vector")]
    #[test_case(vec![("a", vec![5]), ("b", vec![7])], vec![7, 2]; "vectors of different length")]
    #[test_case(vec![("a", vec![4, 2, 2]), ("b", vec![4, 3]), ("c", vec![4])], vec![4, 4, 2]; "rank mismatch counts as one")]
    #[test_case(vec![("a", vec![]), ("b", vec![])], vec![1, 2]; "scalars force one row")]
    fn test_to_tuple(groups: Vec<(&str, Vec<usize>)>, expected: Vec<usize>) {
        assert_eq!(Shape::from_groups(groups).to_tuple(), expected.as_slice());
    }

    #[test]
    fn test_rename_invalidates_memo() {
        let mut shape = Shape::from_groups([("x", vec![10, 3]), ("y", vec![10])]);
        assert_eq!(shape.to_tuple(), &[10, 4]);
        shape.set_group("y", vec![10, 2]);
        assert_eq!(shape.to_tuple(), &[10, 5]);
        shape.rename("x", "features").unwrap();
        assert_eq!(shape.groups().collect::<Vec<_>>(), vec!["features", "y"]);
        assert!(shape.rename("missing", "z").unwrap_err().is_not_found());
        shape.remove_group("y");
        assert_eq!(shape.to_tuple(), &[10, 3]);
    }

    #[test]
    fn test_change_length_takes_min() {
        let shape = Shape::from_groups([("x", vec![10, 3]), ("y", vec![6])]);
        let cut = shape.change_length(8);
        assert_eq!(cut.group("x"), Some(&[8, 3][..]));
        assert_eq!(cut.group("y"), Some(&[6][..]));
    }

    proptest! {
        #[test]
        fn prop_leading_dim_is_max(lengths in proptest::collection::vec(0usize..50, 2..6)) {
            let shape = Shape::from_groups(
                lengths.iter().enumerate().map(|(i, l)| (format!("g{i}"), vec![*l])),
            );
            let expected = lengths.iter().copied().max().unwrap_or(0);
            prop_assert_eq!(shape.to_tuple()[0], expected);
        }
    }
}
