//! Normalisation of ingest sources into chunked streams

use dama_core::{
    Array, ChunkSpec, Chunks, DataIter, Group, IterDtype, MemoryBudget, Schema, Shape, Table,
};
use indexmap::IndexMap;
use tracing::debug;

use crate::error::{Error, Result};

/// Group name given to unnamed sources
pub const DEFAULT_GROUP: &str = "c0";

/// Anything `Data::from_data` can ingest
#[derive(Debug)]
pub enum DataSource {
    /// A dense array, stored as one group
    Array(Array),
    /// A table, one group per column
    Table(Table),
    /// Named arrays sharing their leading dimension
    Arrays(IndexMap<String, Array>),
    /// An in-memory or driver-backed group
    Group(Group),
    /// A stream of rows or chunks
    Iter(DataIter),
}

impl From<Array> for DataSource {
    fn from(array: Array) -> Self {
        DataSource::Array(array)
    }
}

impl From<Table> for DataSource {
    fn from(table: Table) -> Self {
        DataSource::Table(table)
    }
}

impl From<IndexMap<String, Array>> for DataSource {
    fn from(arrays: IndexMap<String, Array>) -> Self {
        DataSource::Arrays(arrays)
    }
}

impl From<Group> for DataSource {
    fn from(group: Group) -> Self {
        DataSource::Group(group)
    }
}

impl From<DataIter> for DataSource {
    fn from(it: DataIter) -> Self {
        DataSource::Iter(it)
    }
}

/// A source ready to be written
#[derive(Debug)]
pub(crate) struct Prepared {
    pub schema: Schema,
    pub shape: Shape,
    pub chunks: Chunks,
    pub batches: DataIter,
}

fn chunk_policy(spec: Option<&ChunkSpec>, shape: &Shape, schema: &Schema, budget: &MemoryBudget) -> Result<Chunks> {
    Ok(match spec {
        Some(spec) => Chunks::build_from(spec, &shape.groups().collect::<Vec<_>>())?,
        None => Chunks::build_from_shape(shape, schema, budget)?,
    })
}

impl DataSource {
    /// Chunk the source per `spec`, or per the memory budget when unset
    ///
    /// Streams of unknown length cannot be sized from their shape and fall
    /// back to `fallback_rows` per chunk.
    pub(crate) fn prepare(
        self,
        spec: Option<&ChunkSpec>,
        budget: &MemoryBudget,
        fallback_rows: usize,
    ) -> Result<Prepared> {
        let group = match self {
            DataSource::Iter(it) => return prepare_stream(it, spec, budget, fallback_rows),
            DataSource::Array(array) => Group::from_arrays([(DEFAULT_GROUP, array)])?,
            DataSource::Table(table) => Group::from_table(&table)?,
            DataSource::Arrays(arrays) => Group::from_arrays(arrays)?,
            DataSource::Group(group) => group,
        };
        let shape = group.shape()?;
        let schema = group.dtypes();
        let chunks = chunk_policy(spec, &shape, &schema, budget)?;
        debug!(shape = %shape, chunks = %chunks, "Prepared group source");
        let batches = group.batches(chunks.length().max(1))?;
        Ok(Prepared {
            schema,
            shape,
            chunks,
            batches,
        })
    }
}

fn prepare_stream(
    mut it: DataIter,
    spec: Option<&ChunkSpec>,
    budget: &MemoryBudget,
    fallback_rows: usize,
) -> Result<Prepared> {
    let schema = match it.dtype()? {
        Some(IterDtype::Fields(schema)) => schema,
        Some(IterDtype::Plain(dtype)) => Schema::from_pairs([(DEFAULT_GROUP, dtype)]),
        None => {
            return Err(Error::Core(dama_core::Error::InvalidArgument(
                "cannot store an empty stream".to_string(),
            )))
        }
    };
    let shape = it.group_shape()?;
    let chunks = match (spec, it.length()) {
        (None, None) => Chunks::build_from(
            &ChunkSpec::Rows(fallback_rows.max(1)),
            &shape.groups().collect::<Vec<_>>(),
        )?,
        (spec, _) => chunk_policy(spec, &shape, &schema, budget)?,
    };
    debug!(shape = %shape, chunks = %chunks, "Prepared stream source");
    let batches = it.to_chunks(chunks.length().max(1))?;
    Ok(Prepared {
        schema,
        shape,
        chunks,
        batches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dama_core::{DataType, Element, Value};

    fn budget() -> MemoryBudget {
        MemoryBudget::fixed(1 << 20, 0.9)
    }

    #[test]
    fn test_arrays_chunked_by_spec() {
        let mut arrays = IndexMap::new();
        arrays.insert("x".to_string(), Array::zeros(DataType::Float64, &[10, 3]));
        arrays.insert("y".to_string(), Array::zeros(DataType::Int64, &[10]));
        let prepared = DataSource::from(arrays)
            .prepare(Some(&ChunkSpec::Rows(4)), &budget(), 258)
            .unwrap();

        assert_eq!(prepared.shape.to_tuple(), &[10, 4]);
        assert_eq!(prepared.schema.names(), vec!["x", "y"]);
        let rows: Vec<usize> = prepared.batches.map(|c| c.unwrap().rows().unwrap()).collect();
        assert_eq!(rows, vec![4, 4, 2]);
    }

    #[test]
    fn test_array_becomes_default_group() {
        let prepared = DataSource::from(Array::zeros(DataType::Int32, &[5, 2]))
            .prepare(None, &budget(), 258)
            .unwrap();
        assert_eq!(prepared.schema.names(), vec![DEFAULT_GROUP]);
        assert_eq!(prepared.chunks.length(), 5);
    }

    #[test]
    fn test_unsized_stream_uses_fallback_rows() {
        let it = DataIter::new((0..7i64).map(|i| Ok(Element::Scalar(Value::Int(i)))));
        let prepared = DataSource::from(it).prepare(None, &budget(), 3).unwrap();
        assert_eq!(prepared.chunks.length(), 3);
        let rows: Vec<usize> = prepared.batches.map(|c| c.unwrap().rows().unwrap()).collect();
        assert_eq!(rows, vec![3, 3, 1]);
    }

    #[test]
    fn test_empty_stream_is_rejected() {
        let err = DataSource::from(DataIter::empty()).prepare(None, &budget(), 3).unwrap_err();
        assert!(matches!(err, Error::Core(dama_core::Error::InvalidArgument(_))));
    }
}
