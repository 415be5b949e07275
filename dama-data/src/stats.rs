//! Per-group summary statistics computed batch by batch

use std::collections::HashSet;
use std::fmt;

use dama_core::{DataType, Group, Value};
use serde::Serialize;

use crate::error::Result;

/// Summary of one stored group
///
/// Numeric groups get moments and extremes over their non-NaN cells;
/// quartiles only for 1-D groups. Text and boolean groups get a unique
/// count instead, nulls counted as the empty string.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStats {
    /// Group name
    pub group: String,
    /// Stored type
    pub dtype: DataType,
    /// Mean of non-NaN cells
    pub mean: Option<f64>,
    /// Population standard deviation of non-NaN cells
    pub std_dev: Option<f64>,
    /// Smallest non-NaN cell
    pub min: Option<f64>,
    /// Largest non-NaN cell
    pub max: Option<f64>,
    /// 25th, 50th and 75th percentiles, linearly interpolated
    pub quartiles: Option<[f64; 3]>,
    /// Cells different from zero
    pub nonzero: Option<usize>,
    /// Cells that are neither null nor NaN
    pub non_null: usize,
    /// Distinct values
    pub unique: Option<usize>,
}

/// Statistics of every group plus the dataset's row count
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    /// Rows in the dataset
    pub rows: usize,
    /// One entry per group, in schema order
    pub groups: Vec<GroupStats>,
}

#[derive(Default)]
struct Moments {
    count: usize,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
    nonzero: usize,
}

impl Moments {
    fn push(&mut self, x: f64) {
        if x != 0.0 {
            self.nonzero += 1;
        }
        if x.is_nan() {
            return;
        }
        if self.count == 0 {
            self.min = x;
            self.max = x;
        } else {
            self.min = self.min.min(x);
            self.max = self.max.max(x);
        }
        self.count += 1;
        #[allow(clippy::cast_precision_loss)]
        let n = self.count as f64;
        let delta = x - self.mean;
        self.mean += delta / n;
        self.m2 += delta * (x - self.mean);
    }

    #[allow(clippy::cast_precision_loss)]
    fn std_dev(&self) -> f64 {
        (self.m2 / self.count as f64).sqrt()
    }
}

/// Percentile of sorted values, interpolating between neighbours
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

fn numeric_stats(name: &str, dtype: DataType, group: &Group, len: usize, step: usize, one_dim: bool) -> Result<GroupStats> {
    let mut moments = Moments::default();
    let mut non_null = 0;
    let mut kept = Vec::new();
    for start in (0..len).step_by(step) {
        let chunk = group.get(start..(start + step).min(len))?.column(name)?;
        for value in chunk.values() {
            let Some(x) = value.as_f64() else {
                continue;
            };
            moments.push(x);
            if !x.is_nan() {
                non_null += 1;
                if one_dim {
                    kept.push(x);
                }
            }
        }
    }
    kept.sort_by(f64::total_cmp);
    let seen = moments.count > 0;
    Ok(GroupStats {
        group: name.to_string(),
        dtype,
        mean: seen.then_some(moments.mean),
        std_dev: seen.then(|| moments.std_dev()),
        min: seen.then_some(moments.min),
        max: seen.then_some(moments.max),
        quartiles: (!kept.is_empty()).then(|| [25.0, 50.0, 75.0].map(|p| percentile(&kept, p))),
        nonzero: Some(moments.nonzero),
        non_null,
        unique: None,
    })
}

fn categorical_stats(name: &str, dtype: DataType, group: &Group, len: usize, step: usize) -> Result<GroupStats> {
    let mut distinct = HashSet::new();
    let mut non_null = 0;
    for start in (0..len).step_by(step) {
        let chunk = group.get(start..(start + step).min(len))?.column(name)?;
        for value in chunk.values() {
            let key = match value {
                Value::Null => String::new(),
                Value::Text(s) => {
                    non_null += 1;
                    s
                }
                other => {
                    non_null += 1;
                    other.to_string()
                }
            };
            distinct.insert(key);
        }
    }
    Ok(GroupStats {
        group: name.to_string(),
        dtype,
        mean: None,
        std_dev: None,
        min: None,
        max: None,
        quartiles: None,
        nonzero: None,
        non_null,
        unique: Some(distinct.len()),
    })
}

/// Summarise every group of `group`, reading `step` rows at a time
pub(crate) fn compute(group: &Group, step: usize) -> Result<Statistics> {
    let shape = group.shape()?;
    let len = group.len()?;
    let step = step.max(1);
    let mut groups = Vec::new();
    for field in group.dtypes().fields() {
        let name = field.name();
        let dtype = field.data_type();
        let stats = if dtype.is_numeric() {
            let one_dim = shape.group(name).map_or(true, |dims| dims.len() <= 1);
            numeric_stats(name, dtype, group, len, step, one_dim)?
        } else {
            categorical_stats(name, dtype, group, len, step)?
        };
        groups.push(stats);
    }
    Ok(Statistics { rows: len, groups })
}

fn cell(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |x| format!("{x:.3}"))
}

fn count(value: Option<usize>) -> String {
    value.map_or_else(|| "-".to_string(), |n| n.to_string())
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# rows {}", self.rows)?;
        writeln!(
            f,
            "{:<12} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>8} {:>8} {:>8} {}",
            "group", "mean", "std dev", "min", "25%", "50%", "75%", "max", "nonzero", "nonan", "unique", "dtype"
        )?;
        for s in &self.groups {
            let [q1, q2, q3] = s.quartiles.map_or([None; 3], |q| q.map(Some));
            writeln!(
                f,
                "{:<12} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>8} {:>8} {:>8} {}",
                s.group,
                cell(s.mean),
                cell(s.std_dev),
                cell(s.min),
                cell(q1),
                cell(q2),
                cell(q3),
                cell(s.max),
                count(s.nonzero),
                s.non_null,
                count(s.unique),
                s.dtype
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dama_core::Array;

    fn sample() -> Group {
        Group::from_arrays([
            ("v", Array::from_vec(vec![4.0_f64, 0.0, f64::NAN, 2.0, 6.0])),
            ("m", Array::from_shape_vec(&[5, 2], (0..10_i64).collect::<Vec<_>>()).unwrap()),
            ("tag", Array::from_vec(["a", "b", "a", "c", "a"].map(String::from).to_vec())),
        ])
        .unwrap()
    }

    #[test]
    fn test_numeric_group_skips_nan() {
        let stats = compute(&sample(), 2).unwrap();
        assert_eq!(stats.rows, 5);
        let v = &stats.groups[0];
        assert_eq!(v.mean, Some(3.0));
        assert_eq!(v.min, Some(0.0));
        assert_eq!(v.max, Some(6.0));
        assert!((v.std_dev.unwrap() - 5.0_f64.sqrt()).abs() < 1e-12);
        assert_eq!(v.quartiles, Some([1.5, 3.0, 4.5]));
        assert_eq!(v.non_null, 4);
        assert_eq!(v.nonzero, Some(4));
        assert_eq!(v.unique, None);
    }

    #[test]
    fn test_multi_dimensional_group_has_no_quartiles() {
        let stats = compute(&sample(), 3).unwrap();
        let m = &stats.groups[1];
        assert_eq!(m.mean, Some(4.5));
        assert_eq!(m.max, Some(9.0));
        assert_eq!(m.quartiles, None);
        assert_eq!(m.nonzero, Some(9));
    }

    #[test]
    fn test_text_group_counts_unique() {
        let stats = compute(&sample(), 2).unwrap();
        let tag = &stats.groups[2];
        assert_eq!(tag.unique, Some(3));
        assert_eq!(tag.non_null, 5);
        assert_eq!(tag.mean, None);
        let table = stats.to_string();
        assert!(table.starts_with("# rows 5"));
        assert!(table.contains("tag"));
    }
}
