use dama_core::{Array, DataIter, DataType, HashAlgorithm, Schema, Settings, Table, Value};
use dama_data::{CatalogFilter, Data};
use dama_drivers::{DriverConfig, DriverKind, Login, Mode};
use indexmap::IndexMap;
use tempfile::TempDir;
use test_case::test_case;

fn settings(dir: &TempDir) -> Settings {
    Settings::default()
        .with_data_path(dir.path().join("data"))
        .with_metadata_path(dir.path().join("metadata"))
        .with_memory_limit(1 << 24)
}

fn dataset(settings: &Settings, kind: DriverKind, mode: Mode, name: &str) -> Data {
    let config = DriverConfig::new(kind, &settings.data_path).with_mode(mode);
    Data::new(name, config, None, settings)
}

fn features() -> IndexMap<String, Array> {
    let x: Vec<f64> = (0..30).map(f64::from).collect();
    let y: Vec<i64> = (0..10).collect();
    let mut arrays = IndexMap::new();
    arrays.insert("x".to_string(), Array::from_shape_vec(&[10, 3], x).unwrap());
    arrays.insert("y".to_string(), Array::from_vec(y));
    arrays
}

fn columns() -> IndexMap<String, Array> {
    let mut arrays = IndexMap::new();
    arrays.insert("a".to_string(), Array::from_vec((0..10i64).collect::<Vec<_>>()));
    arrays.insert("b".to_string(), Array::from_vec((0..10).map(|i| f64::from(i) / 2.0).collect::<Vec<_>>()));
    arrays
}

fn store(settings: &Settings, kind: DriverKind, name: &str, arrays: IndexMap<String, Array>) -> String {
    let mut data = dataset(settings, kind, Mode::Write, name).with_chunks(4);
    data.with_open(|d| {
        d.set_author("dama")?;
        d.from_data(arrays, Some(HashAlgorithm::Sha1), None)?;
        Ok(d.hash()?.unwrap_or_default())
    })
    .unwrap()
}

#[test_case(DriverKind::Slab, features() ; "slab")]
#[test_case(DriverKind::Memory, features() ; "memory")]
#[test_case(DriverKind::Sqlite, columns() ; "sqlite")]
fn ingest_writes_chunks_and_catalogs(kind: DriverKind, arrays: IndexMap<String, Array>) {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir);
    let width = if arrays.contains_key("x") { 4 } else { 2 };

    let mut data = dataset(&settings, kind, Mode::Write, "scenario").with_chunks(4);
    data.open().unwrap();
    let report = data.from_data(arrays, Some(HashAlgorithm::Sha1), None).unwrap();
    assert_eq!(report.chunks, vec![4, 4, 2]);
    assert_eq!(data.shape().unwrap().to_tuple(), &[10, width]);

    let hash = data.hash().unwrap().unwrap();
    assert!(hash.starts_with("sha1."));
    let entry = data.catalog().get(&hash).unwrap();
    if kind == DriverKind::Memory {
        assert!(entry.is_none());
    } else {
        let entry = entry.unwrap();
        assert!(entry.is_valid);
        assert_eq!(entry.name, "scenario");
        assert_eq!(entry.driver_name, kind.name());
        assert_eq!(entry.num_groups, 2);
        assert!(entry.size > 0);
    }
    data.close().unwrap();
}

#[test_case(DriverKind::Slab, features() ; "slab")]
#[test_case(DriverKind::Sqlite, columns() ; "sqlite")]
fn reopen_read_only_recomputes_same_hash(kind: DriverKind, arrays: IndexMap<String, Array>) {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir);
    let expected = arrays.clone();
    let hash = store(&settings, kind, "scenario", arrays);

    let mut data = dataset(&settings, kind, Mode::Read, "scenario");
    data.with_open(|d| {
        for (name, array) in &expected {
            let stored = d.get(name.as_str())?.to_ndarray(None)?;
            assert_eq!(stored.shape(), array.shape());
            assert_eq!(stored.values(), array.values());
        }
        assert_eq!(d.author()?.as_deref(), Some("dama"));
        assert_eq!(d.calc_hash(HashAlgorithm::Sha1)?, hash);
        Ok(())
    })
    .unwrap();
}

#[test]
fn read_only_group_shapes() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir);
    let hash = store(&settings, DriverKind::Slab, "scenario", features());

    let mut data = Data::load(&hash, &settings).unwrap();
    data.open().unwrap();
    assert!(data.chunks().is_some());
    assert_eq!(data.get("x").unwrap().to_ndarray(None).unwrap().shape(), &[10, 3]);
    assert_eq!(data.get("y").unwrap().to_ndarray(None).unwrap().shape(), &[10]);
    assert_eq!(data.size().unwrap(), 10);
    data.close().unwrap();
}

#[test_case(DriverKind::Slab, features() ; "slab")]
#[test_case(DriverKind::Sqlite, columns() ; "sqlite")]
fn destroy_invalidates_and_removes(kind: DriverKind, arrays: IndexMap<String, Array>) {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir);
    let hash = store(&settings, kind, "scenario", arrays);

    let mut data = Data::load(&hash, &settings).unwrap();
    let url = data.url();
    assert!(url.exists());
    data.open().unwrap();
    data.destroy().unwrap();

    assert!(!url.exists());
    let err = Data::load(&hash, &settings).unwrap_err();
    assert!(err.is_not_found());
    let row = data.catalog().get_any(&hash).unwrap().unwrap();
    assert!(!row.is_valid);
}

#[test]
fn rewriting_same_dataset_keeps_one_row() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir);
    let first = store(&settings, DriverKind::Slab, "scenario", features());
    let second = store(&settings, DriverKind::Slab, "scenario", features());
    assert_eq!(first, second);

    let data = dataset(&settings, DriverKind::Slab, Mode::Read, "scenario");
    assert_eq!(data.catalog().count_valid().unwrap(), 1);
}

#[test]
fn changing_one_cell_changes_hash() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir);
    let first = store(&settings, DriverKind::Slab, "scenario", features());

    let mut changed = features();
    let mut y = changed["y"].clone();
    y.set_rows(3, &Array::from_vec(vec![99i64])).unwrap();
    changed.insert("y".to_string(), y);
    let second = store(&settings, DriverKind::Slab, "scenario", changed);
    assert_ne!(first, second);

    let data = dataset(&settings, DriverKind::Slab, Mode::Read, "scenario");
    let catalog = data.catalog();
    assert_eq!(catalog.count_valid().unwrap(), 1);
    assert!(catalog.is_valid(&second).unwrap());
    assert!(!catalog.exists(&first).unwrap());
}

#[test]
fn different_groups_are_separate_datasets() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir);
    for (group, scale) in [("train", 1i64), ("test", 2i64)] {
        let config = DriverConfig::new(DriverKind::Slab, &settings.data_path).with_mode(Mode::Write);
        let mut data = Data::new("split", config, Some(group), &settings);
        data.with_open(|d| {
            d.from_data(Array::from_vec(vec![scale; 5]), Some(HashAlgorithm::Sha256), None)?;
            Ok(())
        })
        .unwrap();
    }

    let data = dataset(&settings, DriverKind::Slab, Mode::Read, "split");
    let catalog = data.catalog();
    let rows = catalog.list(&CatalogFilter::new().with_group("test")).unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].hash.starts_with("sha256."));

    let mut loaded = Data::load(&rows[0].hash, &settings).unwrap();
    assert_eq!(loaded.group_name(), Some("test"));
    let values = loaded.with_open(|d| Ok(d.to_ndarray(None)?.values())).unwrap();
    assert_eq!(values, vec![Value::Int(2); 5]);
}

#[test]
fn table_stream_ingest() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir).with_batch_size(3);
    let table = Table::from_columns([
        ("id", Array::from_vec((0..7i64).collect::<Vec<_>>())),
        ("label", Array::from_values(DataType::Utf8, &[7], &vec![Value::Text("a".into()); 7]).unwrap()),
    ])
    .unwrap();

    let mut data = dataset(&settings, DriverKind::Slab, Mode::Write, "stream");
    let report = data
        .with_open(|d| d.from_data(DataIter::from_table(table), Some(HashAlgorithm::Md5), None))
        .unwrap();
    assert_eq!(report.rows(), 7);

    let mut reopened = dataset(&settings, DriverKind::Slab, Mode::Read, "stream");
    let df = reopened.with_open(|d| d.to_df()).unwrap();
    assert_eq!(df.names(), vec!["id", "label"]);
    assert_eq!(df.num_rows(), 7);
}

#[test]
fn sqlite_login_table_survives_load() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir);
    let config = DriverConfig::new(DriverKind::Sqlite, &settings.data_path)
        .with_mode(Mode::Write)
        .with_login(Login::with_table("t1"));
    let mut data = Data::new("scenario", config, None, &settings).with_chunks(4);
    let hash = data
        .with_open(|d| {
            d.from_data(columns(), Some(HashAlgorithm::Sha1), None)?;
            Ok(d.hash()?.unwrap_or_default())
        })
        .unwrap();

    let mut loaded = Data::load(&hash, &settings).unwrap();
    loaded
        .with_open(|d| {
            assert_eq!(d.size()?, 10);
            assert_eq!(d.hash()?.as_deref(), Some(hash.as_str()));
            assert_eq!(d.calc_hash(HashAlgorithm::Sha1)?, hash);
            assert_eq!(d.get("a")?.to_ndarray(None)?.values(), columns()["a"].values());
            Ok(())
        })
        .unwrap();
}

#[test_case(DriverKind::Slab ; "slab")]
#[test_case(DriverKind::Sqlite ; "sqlite")]
fn append_lands_after_stored_rows(kind: DriverKind) {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir);
    let column = |values: Vec<i64>| {
        let mut arrays = IndexMap::new();
        arrays.insert("v".to_string(), Array::from_vec(values));
        arrays
    };

    let mut data = dataset(&settings, kind, Mode::Write, "growing").with_chunks(4);
    data.open().unwrap();
    data.from_data(column((0..10).collect()), None, None).unwrap();
    data.close().unwrap();

    let mut data = dataset(&settings, kind, Mode::Append, "growing").with_chunks(4);
    data.open().unwrap();
    let report = data.from_data(column((100..104).collect()), Some(HashAlgorithm::Sha1), None).unwrap();
    assert_eq!(report.rows(), 4);
    assert_eq!(data.size().unwrap(), 14);
    let expected: Vec<Value> = (0..10).chain(100..104).map(Value::Int).collect();
    assert_eq!(data.to_ndarray(None).unwrap().values(), expected);
    let hash = data.hash().unwrap().unwrap();
    data.close().unwrap();

    let entry = dataset(&settings, kind, Mode::Read, "growing").catalog().get(&hash).unwrap().unwrap();
    assert_eq!(entry.name, "growing");
}

#[test]
fn expected_dtypes_checked_on_open() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir);
    store(&settings, DriverKind::Slab, "scenario", features());

    let drifted = Schema::from_pairs([("x", DataType::Float64), ("y", DataType::Int64), ("z", DataType::Utf8)]);
    let mut data = dataset(&settings, DriverKind::Slab, Mode::Append, "scenario").with_dtypes(drifted);
    data.open().unwrap();
    assert_eq!(data.size().unwrap(), 10);

    let mut other = IndexMap::new();
    other.insert("x".to_string(), Array::from_vec(vec!["a".to_string()]));
    let err = data.from_data(other, None, None).unwrap_err();
    assert!(matches!(
        err,
        dama_data::Error::Driver(dama_drivers::Error::Core(dama_core::Error::SchemaConflict(_)))
    ));
    data.close().unwrap();
}
