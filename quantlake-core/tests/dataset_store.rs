//! Integration tests for the partitioned dataset store.

use std::fs;

use chrono::NaiveDate;
use polars::prelude::*;
use quantlake_core::fields::HIVE_NULL_PARTITION;
use quantlake_core::{
    Dataset, DateGranularity, EtlError, FieldSpec, PartitionPolicy, QueryError, ReadRequest,
    SchemaDescriptor,
};

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn quote_schema() -> SchemaDescriptor {
    SchemaDescriptor::new(vec![
        FieldSpec::date_string("trade_date").not_null(),
        FieldSpec::string("instrument_code").not_null(),
        FieldSpec::string("exchange").partitioned(),
        FieldSpec::float64("close"),
    ])
    .unwrap()
}

fn quotes() -> DataFrame {
    df!(
        "trade_date" => ["2022-02-15", "20220520", "2022/08/01", "2022-11-30", "2022-11-30"],
        "instrument_code" => ["000001", "600000", "000001", "600000", "BOND01"],
        "exchange" => [Some("SZ"), Some("SH"), Some("SZ"), Some("SH"), None],
        "close" => [10.0, 20.0, 11.0, 21.0, 99.5],
    )
    .unwrap()
}

fn str_values(frame: &DataFrame, column: &str) -> Vec<Option<String>> {
    frame
        .column(column)
        .unwrap()
        .str()
        .unwrap()
        .into_iter()
        .map(|v| v.map(str::to_string))
        .collect()
}

#[test]
fn quarter_and_declared_partitions_nest_and_prune() {
    let dir = tempfile::tempdir().unwrap();
    let schema = quote_schema();
    let policy = PartitionPolicy::by_date(DateGranularity::Quarter);
    let dataset = Dataset::new("BondQuote", dir.path().join("BondQuote"), &schema, &policy);

    assert_eq!(dataset.write(&quotes(), "all").unwrap(), 5);

    let root = dataset.path();
    assert!(root.join("exchange=SZ").join("quarter=20221").is_dir());
    assert!(root.join("exchange=SH").join("quarter=20222").is_dir());
    assert!(root.join("exchange=SH").join("quarter=20224").is_dir());
    assert!(root.join(format!("exchange={HIVE_NULL_PARTITION}")).is_dir());

    let all = dataset.read(&ReadRequest::new()).unwrap();
    assert_eq!(all.height(), 5);
    // Dates were canonicalized on write.
    assert_eq!(
        str_values(&all, "trade_date"),
        vec![
            Some("2022-11-30".to_string()),
            Some("2022-11-30".to_string()),
            Some("2022-08-01".to_string()),
            Some("2022-05-20".to_string()),
            Some("2022-02-15".to_string()),
        ]
    );
    // The null partition reads back as null.
    assert_eq!(all.column("exchange").unwrap().null_count(), 1);

    let sz_h2 = dataset
        .read(
            &ReadRequest::new()
                .eq("exchange", "SZ")
                .between(d(2022, 7, 1), d(2022, 12, 31)),
        )
        .unwrap();
    assert_eq!(str_values(&sz_h2, "instrument_code"), vec![Some("000001".to_string())]);
}

#[test]
fn hidden_and_temporary_entries_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let schema = quote_schema();
    let policy = PartitionPolicy::default();
    let dataset = Dataset::new("Quotes", dir.path().join("Quotes"), &schema, &policy);
    dataset.write(&quotes(), "all").unwrap();

    fs::create_dir_all(dataset.path().join("_staging")).unwrap();
    fs::write(dataset.path().join("_staging/part-0.parquet"), b"not parquet").unwrap();
    fs::write(dataset.path().join(".part-9.parquet"), b"not parquet").unwrap();
    fs::write(dataset.path().join("exchange=SZ/part-1.parquet.tmp"), b"partial").unwrap();

    let rows = dataset.read(&ReadRequest::new()).unwrap();
    assert_eq!(rows.height(), 5);
}

#[test]
fn stored_column_with_wrong_type_is_query_error() {
    let dir = tempfile::tempdir().unwrap();
    let schema = SchemaDescriptor::new(vec![
        FieldSpec::date_string("trade_date"),
        FieldSpec::float64("close"),
    ])
    .unwrap();
    let policy = PartitionPolicy::default();
    let dataset = Dataset::new("Broken", dir.path().join("Broken"), &schema, &policy);
    dataset.ensure_dir().unwrap();

    let mut bad = df!(
        "trade_date" => ["2022-01-03"],
        "close" => ["not a number"],
    )
    .unwrap();
    let file = fs::File::create(dataset.path().join("part-0.parquet")).unwrap();
    ParquetWriter::new(file).finish(&mut bad).unwrap();

    let err = dataset.read(&ReadRequest::new()).unwrap_err();
    assert!(matches!(
        err,
        EtlError::Query {
            source: QueryError::TypeMismatch { .. },
            ..
        }
    ));
}

#[test]
fn date_filter_is_dropped_without_date_column() {
    let dir = tempfile::tempdir().unwrap();
    let schema = SchemaDescriptor::new(vec![
        FieldSpec::string("instrument_code"),
        FieldSpec::string("industry"),
    ])
    .unwrap();
    let policy = PartitionPolicy::default();
    let dataset = Dataset::new("Industry", dir.path().join("Industry"), &schema, &policy);
    let rows = df!(
        "instrument_code" => ["000001", "600000"],
        "industry" => ["Bank", "Bank"],
    )
    .unwrap();
    dataset.write(&rows, "all").unwrap();

    let read = dataset
        .read(&ReadRequest::new().between(d(2030, 1, 1), d(2030, 12, 31)))
        .unwrap();
    assert_eq!(read.height(), 2);

    let filtered = dataset
        .read(&ReadRequest::new().secu_codes(["600000"]))
        .unwrap();
    assert_eq!(filtered.height(), 1);
}

#[test]
fn date_partitioning_without_date_column_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let schema = SchemaDescriptor::new(vec![FieldSpec::string("instrument_code")]).unwrap();
    let policy = PartitionPolicy::by_date(DateGranularity::Month);
    let dataset = Dataset::new("NoDate", dir.path().join("NoDate"), &schema, &policy);
    let rows = df!("instrument_code" => ["000001"]).unwrap();
    assert!(dataset.write(&rows, "all").unwrap_err().is_config());
}

#[test]
fn plain_string_date_column_is_canonicalized_without_date_partitioning() {
    let dir = tempfile::tempdir().unwrap();
    let schema = SchemaDescriptor::new(vec![
        FieldSpec::string("trade_date"),
        FieldSpec::string("instrument_code"),
        FieldSpec::float64("close"),
    ])
    .unwrap();
    let policy = PartitionPolicy::default();
    let dataset = Dataset::new("Compact", dir.path().join("Compact"), &schema, &policy);
    let rows = df!(
        "trade_date" => ["20220103", "20220104", "2022/01/05"],
        "instrument_code" => ["000001", "000001", "000001"],
        "close" => [1.0, 2.0, 3.0],
    )
    .unwrap();
    dataset.write(&rows, "all").unwrap();

    let read = dataset
        .read(&ReadRequest::new().between(d(2022, 1, 1), d(2022, 1, 31)))
        .unwrap();
    assert_eq!(read.height(), 3);
    assert_eq!(
        str_values(&read, "trade_date"),
        vec![
            Some("2022-01-05".to_string()),
            Some("2022-01-04".to_string()),
            Some("2022-01-03".to_string()),
        ]
    );
}

#[test]
fn float_partition_directories_are_pruned_by_numeric_value() {
    let dir = tempfile::tempdir().unwrap();
    let schema = SchemaDescriptor::new(vec![
        FieldSpec::string("instrument_code"),
        FieldSpec::float64("tenor").partitioned(),
        FieldSpec::float64("yield"),
    ])
    .unwrap();
    let policy = PartitionPolicy::default();
    let dataset = Dataset::new("Curve", dir.path().join("Curve"), &schema, &policy);
    let rows = df!(
        "instrument_code" => ["CGB1Y", "CGB30M"],
        "tenor" => [1.0, 2.5],
        "yield" => [0.021, 0.024],
    )
    .unwrap();
    dataset.write(&rows, "all").unwrap();

    let one_year = dataset.read(&ReadRequest::new().eq("tenor", 1.0)).unwrap();
    assert_eq!(str_values(&one_year, "instrument_code"), vec![Some("CGB1Y".to_string())]);

    let int_literal = dataset.read(&ReadRequest::new().eq("tenor", 1i64)).unwrap();
    assert_eq!(int_literal.height(), 1);

    let both = dataset
        .read(&ReadRequest::new().is_in("tenor", [1.0, 2.5]))
        .unwrap();
    assert_eq!(both.height(), 2);
}

#[test]
fn split_files_read_back_in_write_order() {
    let dir = tempfile::tempdir().unwrap();
    let schema = SchemaDescriptor::new(vec![
        FieldSpec::string("instrument_code"),
        FieldSpec::int64("seq"),
    ])
    .unwrap();
    let policy = PartitionPolicy::default().with_max_rows_per_file(1);
    let dataset = Dataset::new("Ledger", dir.path().join("Ledger"), &schema, &policy);
    let seq: Vec<i64> = (0..12).collect();
    let codes: Vec<String> = seq.iter().map(|i| format!("{i:06}")).collect();
    let rows = df!("instrument_code" => codes, "seq" => seq.clone()).unwrap();
    dataset.write(&rows, "all").unwrap();
    assert!(dataset.path().join("part-11.parquet").exists());

    let read = dataset.read(&ReadRequest::new()).unwrap();
    let got: Vec<i64> = read
        .column("seq")
        .unwrap()
        .i64()
        .unwrap()
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(got, seq);
}
