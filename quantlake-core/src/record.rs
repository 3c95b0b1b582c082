//! Run records: the persisted lifecycle status of each model's ETL.
//!
//! One record per model, created on the first run and updated once per run
//! to a terminal status. Records are the only state shared across runs
//! besides the dataset files.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::EtlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Etl,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    #[default]
    None,
    Started,
    Completed,
    Failed,
}

/// Lifecycle record of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub model_name: String,
    pub event_type: EventType,
    pub status: RunStatus,
    pub business_date: Option<NaiveDate>,
    pub message: String,
    pub updated_at: NaiveDateTime,
}

impl RunRecord {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            event_type: EventType::Etl,
            status: RunStatus::None,
            business_date: None,
            message: String::new(),
            updated_at: chrono::Local::now().naive_local(),
        }
    }

    /// Move to `status` for `business_date`.
    pub fn transition(
        &mut self,
        status: RunStatus,
        business_date: NaiveDate,
        message: impl Into<String>,
    ) {
        self.status = status;
        self.business_date = Some(business_date);
        self.message = message.into();
        self.updated_at = chrono::Local::now().naive_local();
    }

    /// True when a completed run already covers `end_date`.
    pub fn is_completed(&self, end_date: NaiveDate) -> bool {
        self.status == RunStatus::Completed && self.business_date.is_some_and(|d| d >= end_date)
    }
}

/// Backing store for run records.
pub trait RunRecordStore: Send + Sync {
    fn get(&self, model_name: &str) -> Result<Option<RunRecord>, EtlError>;

    fn upsert(&self, record: &RunRecord) -> Result<(), EtlError>;

    /// All records, ordered by model name.
    fn list(&self) -> Result<Vec<RunRecord>, EtlError>;
}

/// In-process store, for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryRunRecordStore {
    records: Mutex<BTreeMap<String, RunRecord>>,
}

impl MemoryRunRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunRecordStore for MemoryRunRecordStore {
    fn get(&self, model_name: &str) -> Result<Option<RunRecord>, EtlError> {
        let records = self
            .records
            .lock()
            .map_err(|_| EtlError::RunRecord("record table lock poisoned".into()))?;
        Ok(records.get(model_name).cloned())
    }

    fn upsert(&self, record: &RunRecord) -> Result<(), EtlError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| EtlError::RunRecord("record table lock poisoned".into()))?;
        records.insert(record.model_name.clone(), record.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<RunRecord>, EtlError> {
        let records = self
            .records
            .lock()
            .map_err(|_| EtlError::RunRecord("record table lock poisoned".into()))?;
        Ok(records.values().cloned().collect())
    }
}

/// Records kept as one JSON document keyed by model name.
///
/// The document is rewritten atomically (write `.tmp`, rename) on every
/// upsert, so a crash never leaves a half-written table behind.
pub struct JsonRunRecordStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl JsonRunRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, RunRecord>, EtlError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(EtlError::RunRecord(format!("read {}: {e}", self.path.display()))),
        };
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content)
            .map_err(|e| EtlError::RunRecord(format!("parse {}: {e}", self.path.display())))
    }

    fn store(&self, records: &BTreeMap<String, RunRecord>) -> Result<(), EtlError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| EtlError::RunRecord(format!("create record dir: {e}")))?;
        }
        let json = serde_json::to_string_pretty(records)
            .map_err(|e| EtlError::RunRecord(format!("serialize records: {e}")))?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json)
            .map_err(|e| EtlError::RunRecord(format!("write records: {e}")))?;
        fs::rename(&tmp_path, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            EtlError::RunRecord(format!("atomic rename failed: {e}"))
        })
    }
}

impl RunRecordStore for JsonRunRecordStore {
    fn get(&self, model_name: &str) -> Result<Option<RunRecord>, EtlError> {
        let _guard = self
            .guard
            .lock()
            .map_err(|_| EtlError::RunRecord("record file lock poisoned".into()))?;
        Ok(self.load()?.remove(model_name))
    }

    fn upsert(&self, record: &RunRecord) -> Result<(), EtlError> {
        let _guard = self
            .guard
            .lock()
            .map_err(|_| EtlError::RunRecord("record file lock poisoned".into()))?;
        let mut records = self.load()?;
        records.insert(record.model_name.clone(), record.clone());
        self.store(&records)
    }

    fn list(&self) -> Result<Vec<RunRecord>, EtlError> {
        let _guard = self
            .guard
            .lock()
            .map_err(|_| EtlError::RunRecord("record file lock poisoned".into()))?;
        Ok(self.load()?.into_values().collect())
    }
}
