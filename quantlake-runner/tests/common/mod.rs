//! Shared fixtures for runner integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use chrono::{Datelike, NaiveDate};
use polars::prelude::*;

use quantlake_core::{
    Entity, FieldSpec, MemoryRunRecordStore, PartitionPolicy, RowSet, SchemaDescriptor,
};
use quantlake_runner::{EtlRunner, EtlSettings};

static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

pub fn temp_root(label: &str) -> PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let root = std::env::temp_dir().join(format!(
        "quantlake_runner_{label}_{}_{id}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&root);
    root
}

pub fn settings(root: &Path) -> EtlSettings {
    EtlSettings::default().with_save_path(root)
}

pub fn runner(root: &Path) -> (EtlRunner, Arc<MemoryRunRecordStore>) {
    runner_with(settings(root))
}

pub fn runner_with(settings: EtlSettings) -> (EtlRunner, Arc<MemoryRunRecordStore>) {
    init_tracing();
    let records = Arc::new(MemoryRunRecordStore::new());
    let runner = EtlRunner::with_record_store(settings, records.clone()).unwrap();
    (runner, records)
}

/// How the mock upstream answers a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Normal,
    /// Rows lack the `close` column.
    MissingClose,
    /// The upstream query fails.
    Fail,
    /// No rows and no columns.
    Empty,
    /// Only the sub-range starting in this month fails.
    FailMonth(u32),
    /// Earlier sub-ranges answer later, so completion order runs backwards.
    EarlierSlower,
}

/// Daily close per instrument, one row per calendar day.
pub struct DailyQuotes {
    name: String,
    category: String,
    schema: SchemaDescriptor,
    policy: PartitionPolicy,
    codes: Vec<String>,
    fetches: AtomicUsize,
    bump: Mutex<f64>,
    mode: Mutex<FetchMode>,
}

impl DailyQuotes {
    pub fn new(name: &str, policy: PartitionPolicy) -> Self {
        Self::with_schema(name, policy, Self::schema())
    }

    /// Same rows, but the store keeps them in arrival order instead of sorting by date.
    pub fn undated(name: &str) -> Self {
        Self::with_schema(
            name,
            PartitionPolicy::default(),
            Self::schema().without_date_column(),
        )
    }

    fn schema() -> SchemaDescriptor {
        SchemaDescriptor::new(vec![
            FieldSpec::date_string("trade_date").not_null(),
            FieldSpec::string("instrument_code").not_null(),
            FieldSpec::float64("close"),
        ])
        .unwrap()
    }

    fn with_schema(name: &str, policy: PartitionPolicy, schema: SchemaDescriptor) -> Self {
        Self {
            name: name.to_string(),
            category: "MarketData".into(),
            schema,
            policy,
            codes: vec!["000001".into(), "000002".into()],
            fetches: AtomicUsize::new(0),
            bump: Mutex::new(0.0),
            mode: Mutex::new(FetchMode::Normal),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Shift every close returned from now on.
    pub fn set_bump(&self, bump: f64) {
        *self.bump.lock().unwrap() = bump;
    }

    pub fn set_mode(&self, mode: FetchMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn expected_close(code: &str, date: NaiveDate) -> f64 {
        let base = if code == "000001" { 0.0 } else { 1000.0 };
        base + date.ordinal() as f64
    }
}

impl Entity for DailyQuotes {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> &str {
        &self.category
    }

    fn description(&self) -> &str {
        "Daily quotes"
    }

    fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    fn partition_policy(&self) -> PartitionPolicy {
        self.policy.clone()
    }

    fn fetch_data(
        &self,
        secu_codes: Option<&[String]>,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> anyhow::Result<RowSet> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();
        let bump = *self.bump.lock().unwrap();
        match mode {
            FetchMode::Fail => anyhow::bail!("upstream timeout"),
            FetchMode::Empty => return Ok(DataFrame::empty()),
            FetchMode::FailMonth(month) if start_date.month() == month => {
                anyhow::bail!("upstream timeout for month {month}")
            }
            FetchMode::EarlierSlower => {
                let anchor = NaiveDate::from_ymd_opt(2022, 6, 1).context("anchor date")?;
                let lag = (anchor - start_date).num_days().clamp(0, 1000) as u64;
                std::thread::sleep(Duration::from_millis(lag));
            }
            FetchMode::Normal | FetchMode::MissingClose | FetchMode::FailMonth(_) => {}
        }

        let codes: Vec<&String> = self
            .codes
            .iter()
            .filter(|c| secu_codes.map_or(true, |wanted| wanted.contains(*c)))
            .collect();
        let mut dates = Vec::new();
        let mut ids = Vec::new();
        let mut closes = Vec::new();
        let mut day = start_date;
        while day <= end_date {
            for code in &codes {
                dates.push(day.format("%Y-%m-%d").to_string());
                ids.push(code.to_string());
                closes.push(Self::expected_close(code, day) + bump);
            }
            day = day.succ_opt().context("date overflow")?;
        }

        let frame = if mode == FetchMode::MissingClose {
            df!("trade_date" => dates, "instrument_code" => ids)?
        } else {
            df!("trade_date" => dates, "instrument_code" => ids, "close" => closes)?
        };
        Ok(frame)
    }
}

/// Fund look-through holdings; `down_flag` marks drilled-down rows.
pub struct FundHoldings {
    schema: SchemaDescriptor,
}

impl FundHoldings {
    pub fn new() -> Self {
        let schema = SchemaDescriptor::new(vec![
            FieldSpec::date_string("trade_date").not_null(),
            FieldSpec::string("instrument_code"),
            FieldSpec::string("holding_code"),
            FieldSpec::string("down_flag"),
            FieldSpec::float64("weight"),
        ])
        .unwrap();
        Self { schema }
    }
}

impl Entity for FundHoldings {
    fn name(&self) -> &str {
        "FundHoldings"
    }

    fn category(&self) -> &str {
        "Portfolio"
    }

    fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    fn drill_down_column(&self) -> Option<&str> {
        Some("down_flag")
    }

    fn fetch_data(
        &self,
        _secu_codes: Option<&[String]>,
        start_date: NaiveDate,
        _end_date: NaiveDate,
    ) -> anyhow::Result<RowSet> {
        let date = start_date.format("%Y-%m-%d").to_string();
        Ok(df!(
            "trade_date" => [date.clone(), date.clone(), date],
            "instrument_code" => ["F001", "F001", "F001"],
            "holding_code" => ["F002", "600000", "600036"],
            "down_flag" => ["0", "1", "1"],
            "weight" => [1.0, 0.6, 0.4],
        )?)
    }
}

pub fn str_values(frame: &DataFrame, column: &str) -> Vec<String> {
    frame
        .column(column)
        .unwrap()
        .str()
        .unwrap()
        .into_iter()
        .map(|v| v.unwrap_or_default().to_string())
        .collect()
}

pub fn f64_values(frame: &DataFrame, column: &str) -> Vec<f64> {
    frame
        .column(column)
        .unwrap()
        .f64()
        .unwrap()
        .into_iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect()
}
