//! The ETL run coordinator.
//!
//! One call to [`EtlRunner::run`] does, for a single model:
//! 1. Take the model lease (one run per model at a time)
//! 2. Check the run record and skip when a completed run already covers `end_date`
//! 3. Purge the dataset when re-initializing
//! 4. Fetch, sequentially or per month sub-range on the worker pool
//! 5. Save, as one write or one write per sub-range
//! 6. Record the terminal status

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use quantlake_core::fields::DEFAULT_DOWN_FLAG;
use quantlake_core::partition::DEFAULT_MAX_ROWS_PER_GROUP;
use quantlake_core::{
    split_date_range, CondValue, Dataset, DateGranularity, Entity, EtlError, JsonRunRecordStore,
    ModelLease, PartitionPolicy, ReadRequest, RowSet, RunRecord, RunRecordStore, RunStatus,
    Scalar, SchemaDescriptor,
};

use crate::settings::EtlSettings;

/// Per-run options. Immutable once built; entities are never mutated by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Restrict the fetch to these instruments. `None` fetches all.
    pub secu_codes: Option<Vec<String>>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Fetch each calendar-month sub-range on the worker pool.
    pub concurrent_fetch: bool,
    /// Save each fetched sub-range separately instead of concatenating first.
    /// Only takes effect with `concurrent_fetch`; requires a month or day policy.
    pub concurrent_save: bool,
    /// Purge the dataset before writing and ignore a completed run record.
    pub force_reinit: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            secu_codes: None,
            start_date: NaiveDate::from_ymd_opt(2021, 1, 1).unwrap_or_default(),
            end_date: chrono::Local::now().date_naive(),
            concurrent_fetch: false,
            concurrent_save: false,
            force_reinit: false,
        }
    }
}

impl RunOptions {
    pub fn new(start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            start_date,
            end_date,
            ..Self::default()
        }
    }

    pub fn secu_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.secu_codes = Some(codes.into_iter().map(Into::into).collect());
        self
    }

    pub fn concurrent_fetch(mut self, enabled: bool) -> Self {
        self.concurrent_fetch = enabled;
        self
    }

    pub fn concurrent_save(mut self, enabled: bool) -> Self {
        self.concurrent_save = enabled;
        self
    }

    pub fn force_reinit(mut self, enabled: bool) -> Self {
        self.force_reinit = enabled;
        self
    }

    /// Reject option combinations that cannot run against `policy`.
    pub fn validate(&self, policy: &PartitionPolicy) -> Result<(), EtlError> {
        if self.start_date > self.end_date {
            return Err(EtlError::Config(format!(
                "start_date {} is after end_date {}",
                self.start_date, self.end_date
            )));
        }
        // Without concurrent_fetch there is one range and one save, so the flag is inert.
        if self.concurrent_save && self.concurrent_fetch {
            // Sub-range writes only stay disjoint when every bucket lies inside one month.
            if !matches!(policy.by_date, DateGranularity::Month | DateGranularity::Day) {
                return Err(EtlError::Config(format!(
                    "concurrent_save requires a month or day partition policy, got '{}'",
                    policy.by_date
                )));
            }
        }
        Ok(())
    }
}

/// What a run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A completed run already covered the requested end date.
    Skipped,
    Completed { rows: usize },
}

impl RunOutcome {
    pub fn rows(&self) -> usize {
        match self {
            RunOutcome::Skipped => 0,
            RunOutcome::Completed { rows } => *rows,
        }
    }
}

/// Runs ETLs and serves reads for any [`Entity`].
pub struct EtlRunner {
    settings: EtlSettings,
    records: Arc<dyn RunRecordStore>,
    pool: rayon::ThreadPool,
}

impl EtlRunner {
    /// Runner backed by the JSON run record document from `settings`.
    pub fn new(settings: EtlSettings) -> Result<Self, EtlError> {
        let records = Arc::new(JsonRunRecordStore::new(settings.event_store_path()));
        Self::with_record_store(settings, records)
    }

    pub fn with_record_store(
        settings: EtlSettings,
        records: Arc<dyn RunRecordStore>,
    ) -> Result<Self, EtlError> {
        settings.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.worker_threads)
            .thread_name(|i| format!("etl-worker-{i}"))
            .build()
            .map_err(|e| EtlError::Config(format!("failed to build worker pool: {e}")))?;
        Ok(Self {
            settings,
            records,
            pool,
        })
    }

    pub fn settings(&self) -> &EtlSettings {
        &self.settings
    }

    pub fn records(&self) -> &dyn RunRecordStore {
        self.records.as_ref()
    }

    /// Dataset directory of `entity` under the configured save path.
    pub fn dataset_dir(&self, entity: &dyn Entity) -> PathBuf {
        entity.dataset_dir(&self.settings.save_path())
    }

    /// The entity's partition policy with the configured row-group cap applied.
    pub fn policy_for(&self, entity: &dyn Entity) -> PartitionPolicy {
        let mut policy = entity.partition_policy();
        if let Some(rows) = self.settings.max_rows_per_group {
            if policy.max_rows_per_group == DEFAULT_MAX_ROWS_PER_GROUP {
                policy.max_rows_per_group = rows;
            }
        }
        policy
    }

    /// Run the ETL for one model.
    pub fn run(&self, entity: &dyn Entity, options: &RunOptions) -> Result<RunOutcome, EtlError> {
        let started = Instant::now();
        let model = entity.name();
        let policy = self.policy_for(entity);
        options.validate(&policy)?;

        let lease_key = format!("{}.{}", entity.category(), model);
        let _lease = ModelLease::acquire(
            &self.settings.lock_dir(),
            &lease_key,
            self.settings.lease_stale_after(),
        )?;

        let mut record = None;
        if self.settings.enable_event {
            match self.records.get(model)? {
                Some(existing) => {
                    if existing.is_completed(options.end_date) {
                        debug!(model, end_date = %options.end_date, "run record already completed");
                        if !options.force_reinit {
                            info!(model, end_date = %options.end_date, "ETL already completed, skipping");
                            return Ok(RunOutcome::Skipped);
                        }
                    }
                    record = Some(existing);
                }
                None => {
                    let mut fresh = RunRecord::new(model);
                    fresh.transition(RunStatus::Started, options.end_date, "");
                    self.records.upsert(&fresh)?;
                    record = Some(fresh);
                }
            }
        }

        let result = self.execute(entity, &policy, options);

        if let Some(mut record) = record {
            match &result {
                Ok(_) => record.transition(RunStatus::Completed, options.end_date, "OK"),
                Err(e) => record.transition(
                    RunStatus::Failed,
                    options.end_date,
                    format!("Run etl error: {e}"),
                ),
            }
            if let Err(update_err) = self.records.upsert(&record) {
                warn!(model, error = %update_err, "failed to update run record");
                if result.is_ok() {
                    return Err(update_err);
                }
            }
        }

        let rows = result.map_err(|e| {
            warn!(model, error = %e, "ETL failed");
            e
        })?;
        info!(
            model,
            rows,
            start_date = %options.start_date,
            end_date = %options.end_date,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ETL completed"
        );
        Ok(RunOutcome::Completed { rows })
    }

    fn execute(
        &self,
        entity: &dyn Entity,
        policy: &PartitionPolicy,
        options: &RunOptions,
    ) -> Result<usize, EtlError> {
        let model = entity.name();
        let dataset = Dataset::new(model, self.dataset_dir(entity), entity.schema(), policy);
        if options.force_reinit {
            info!(model, path = %dataset.path().display(), "re-initializing dataset");
            dataset.purge()?;
        }
        dataset.ensure_dir()?;

        let codes = options.secu_codes.as_deref();
        let fetch_started = Instant::now();

        if !options.concurrent_fetch {
            let rows = fetch(entity, codes, options.start_date, options.end_date)?;
            info!(
                model,
                rows = rows.height(),
                elapsed_ms = fetch_started.elapsed().as_millis() as u64,
                "fetched data"
            );
            return dataset.write(&rows, "all");
        }

        let ranges = split_date_range(options.start_date, options.end_date);
        let parts: Vec<RowSet> = self.pool.install(|| {
            ranges
                .par_iter()
                .map(|&(start, end)| fetch(entity, codes, start, end))
                .collect::<Result<Vec<_>, _>>()
        })?;
        let parts: Vec<(usize, RowSet)> = parts
            .into_iter()
            .enumerate()
            .filter(|(_, part)| part.height() > 0)
            .collect();
        info!(
            model,
            sub_ranges = ranges.len(),
            non_empty = parts.len(),
            rows = parts.iter().map(|(_, p)| p.height()).sum::<usize>(),
            elapsed_ms = fetch_started.elapsed().as_millis() as u64,
            "fetched data"
        );

        if options.concurrent_save {
            let written = self.pool.install(|| {
                parts
                    .par_iter()
                    .map(|(i, part)| dataset.write(part, &format!("range-{i}")))
                    .collect::<Result<Vec<usize>, _>>()
            })?;
            return Ok(written.into_iter().sum());
        }

        let combined = concat_parts(entity.schema(), parts.into_iter().map(|(_, p)| p))?;
        dataset.write(&combined, "all")
    }

    /// Read a model's dataset.
    ///
    /// For drill-down entities the flag column is filtered on the request's
    /// `down_flag` (default `"1"`) unless the caller conditions on it directly.
    pub fn get_data(&self, entity: &dyn Entity, request: &ReadRequest) -> Result<RowSet, EtlError> {
        let policy = self.policy_for(entity);
        let mut request = request.clone();
        if let Some(column) = entity.drill_down_column() {
            if entity.schema().contains(column) && !request.cond.contains_key(column) {
                let flag = request
                    .down_flag
                    .clone()
                    .unwrap_or_else(|| DEFAULT_DOWN_FLAG.to_string());
                request
                    .cond
                    .insert(column.to_string(), CondValue::One(Scalar::Str(flag)));
            }
        }
        Dataset::new(entity.name(), self.dataset_dir(entity), entity.schema(), &policy)
            .read(&request)
    }

    /// [`get_data`](Self::get_data) followed by a post-read decoder.
    pub fn get_data_with<F>(
        &self,
        entity: &dyn Entity,
        request: &ReadRequest,
        decoder: F,
    ) -> Result<RowSet, EtlError>
    where
        F: FnOnce(RowSet) -> Result<RowSet, EtlError>,
    {
        let rows = self.get_data(entity, request)?;
        decoder(rows)
    }
}

fn fetch(
    entity: &dyn Entity,
    codes: Option<&[String]>,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<RowSet, EtlError> {
    debug!(model = entity.name(), %start, %end, "fetching");
    entity
        .fetch_data(codes, start, end)
        .map_err(|e| EtlError::Fetch {
            model: entity.name().to_string(),
            message: format!("{e:#}"),
        })
}

/// Conform each part to the schema and stack them in order.
fn concat_parts(
    schema: &SchemaDescriptor,
    parts: impl IntoIterator<Item = RowSet>,
) -> Result<RowSet, EtlError> {
    let mut combined: Option<RowSet> = None;
    for part in parts {
        let part = schema.conform(&part)?;
        match combined.as_mut() {
            None => combined = Some(part),
            Some(acc) => {
                acc.vstack_mut(&part)
                    .map_err(|e| EtlError::Save(format!("concatenate fetch results: {e}")))?;
            }
        }
    }
    Ok(combined.unwrap_or_default())
}
