//! Write orchestrator
//!
//! Consumes a chunked [`DataIter`] and forwards every chunk to whichever
//! writer capability the driver declares.

use dama_core::{Array, DataIter, Element, Error as CoreError, Group};
use tracing::{debug, info};

use crate::driver::{Driver, Writer};
use crate::error::Result;

/// Rows written per chunk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// Row count of every written chunk, in order
    pub chunks: Vec<usize>,
}

impl WriteReport {
    /// Total rows written
    pub fn rows(&self) -> usize {
        self.chunks.iter().sum()
    }

    /// Number of chunks written
    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }
}

/// View a stream element as a group of columns
fn chunk_group(element: Element, groups: &[String]) -> Result<Group> {
    match element {
        Element::Group(group) => Ok(group),
        Element::Array(array) => {
            let name = groups.first().map_or("c0", String::as_str);
            Ok(Group::from_arrays([(name, array)])?)
        }
        Element::Scalar(value) => {
            let name = groups.first().map_or("c0", String::as_str);
            let dtype = value.data_type().unwrap_or(dama_core::DataType::Float64);
            Ok(Group::from_arrays([(name, Array::from_values(dtype, &[1], &[value])?)])?)
        }
        Element::Row(values) => Err(CoreError::type_mismatch(
            "chunk",
            format!("row of {} values", values.len()),
        )
        .into()),
    }
}

/// Write every chunk of `batches` through the driver's writer
pub fn write_batches<D: Driver + ?Sized>(driver: &mut D, batches: DataIter) -> Result<WriteReport> {
    write_batches_at(driver, batches, 0)
}

/// Write every chunk of `batches`, the first one landing at row `start`
pub fn write_batches_at<D: Driver + ?Sized>(
    driver: &mut D,
    batches: DataIter,
    mut start: usize,
) -> Result<WriteReport> {
    let groups = driver.groups()?;
    let kind = driver.kind();
    let mut report = WriteReport::default();

    match driver.writer()? {
        Writer::Rows(writer) => {
            info!(driver = %kind, start, "Writing rows");
            for chunk in batches {
                let group = chunk_group(chunk?, &groups)?;
                let rows = writer.write_rows(start, &group)?;
                debug!(start, rows, "Wrote row chunk");
                start += rows;
                report.chunks.push(rows);
            }
            writer.flush()?;
        }
        Writer::ColumnSlabs(writer) => {
            info!(driver = %kind, start, "Writing column slabs");
            for chunk in batches {
                let group = chunk_group(chunk?, &groups)?;
                let rows = writer.write_slab(start, &group)?;
                debug!(start, rows, "Wrote column slab");
                start += rows;
                report.chunks.push(rows);
            }
            writer.flush()?;
        }
    }

    info!(driver = %kind, rows = report.rows(), chunks = report.num_chunks(), "Write finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriverConfig, DriverKind, Mode};
    use crate::driver::{with_open, SchemaOptions};
    use crate::memory::MemoryDriver;
    use dama_core::Schema;

    fn scenario_group() -> Group {
        let x = ndarray::Array2::from_shape_fn((10, 3), |(i, j)| (i * 3 + j) as f64).into_dyn();
        Group::from_arrays([
            ("x", Array::from(x)),
            ("y", Array::from_vec((0..10_i64).collect::<Vec<_>>())),
        ])
        .unwrap()
    }

    #[test]
    fn test_chunks_reported_in_order() {
        let group = scenario_group();
        let config = DriverConfig::new(DriverKind::Memory, "unused").with_mode(Mode::Write);
        let mut driver = MemoryDriver::new(config, "scenario", None);
        let report = with_open(&mut driver, |d| {
            d.set_schema(&group.dtypes(), &SchemaOptions::new())?;
            write_batches(d, group.batches(4)?)
        })
        .unwrap();
        assert_eq!(report.chunks, vec![4, 4, 2]);
        assert_eq!(report.rows(), 10);
    }

    #[test]
    fn test_plain_chunks_use_first_group_name() {
        let config = DriverConfig::new(DriverKind::Memory, "unused").with_mode(Mode::Write);
        let mut driver = MemoryDriver::new(config, "plain", None);
        driver.open().unwrap();
        driver
            .set_schema(&Schema::from_pairs([("v", dama_core::DataType::Int64)]), &SchemaOptions::new())
            .unwrap();
        let batches = DataIter::from_values(0..5_i64).to_chunks(2).unwrap();
        let report = write_batches(&mut driver, batches).unwrap();
        assert_eq!(report.chunks, vec![2, 2, 1]);
        let stored = driver.manager(None).unwrap().column("v").unwrap();
        assert_eq!(stored.len(), 5);
    }

    #[test]
    fn test_write_at_offset_keeps_leading_rows() {
        let config = DriverConfig::new(DriverKind::Memory, "unused").with_mode(Mode::Write);
        let mut driver = MemoryDriver::new(config, "offset", None);
        driver.open().unwrap();
        driver
            .set_schema(&Schema::from_pairs([("v", dama_core::DataType::Int64)]), &SchemaOptions::new())
            .unwrap();
        write_batches(&mut driver, DataIter::from_values(0..3_i64).to_chunks(2).unwrap()).unwrap();
        let report =
            write_batches_at(&mut driver, DataIter::from_values(10..12_i64).to_chunks(2).unwrap(), 3).unwrap();
        assert_eq!(report.chunks, vec![2]);
        let stored = driver.manager(None).unwrap().column("v").unwrap();
        assert_eq!(stored, Array::from_vec(vec![0_i64, 1, 2, 10, 11]));
    }
}
