//! Batch runs: many models on a bounded pool.
//!
//! A failing model is recorded in the summary and never aborts the others.
//!
//! Plans can be loaded from TOML:
//!
//! ```toml
//! [models.StockDailyQuote]
//! start_date = "2015-01-01"
//! concurrent_fetch = true
//!
//! [models.FundHolding]
//! force_reinit = true
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde::Deserialize;
use tracing::{info, warn};

use quantlake_core::{Entity, EtlError};

use crate::coordinator::{EtlRunner, RunOptions, RunOutcome};
use crate::registry::EntityRegistry;

/// One model to run with its options.
#[derive(Clone)]
pub struct BatchJob {
    pub entity: Arc<dyn Entity>,
    pub options: RunOptions,
}

impl BatchJob {
    pub fn new(entity: Arc<dyn Entity>, options: RunOptions) -> Self {
        Self { entity, options }
    }
}

/// Per-model options keyed by model name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchPlan {
    #[serde(default)]
    pub models: BTreeMap<String, RunOptions>,
}

impl BatchPlan {
    pub fn from_file(path: &Path) -> Result<Self, EtlError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EtlError::Config(format!("read batch plan {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, EtlError> {
        toml::from_str(content).map_err(|e| EtlError::Config(format!("parse batch plan: {e}")))
    }

    /// Resolve the plan against `registry`. `force_reinit` forces a rebuild
    /// of every model in addition to what each entry asks for.
    pub fn jobs(
        &self,
        registry: &EntityRegistry,
        force_reinit: bool,
    ) -> Result<Vec<BatchJob>, EtlError> {
        self.models
            .iter()
            .map(|(model, options)| {
                let entity = registry.get(model).ok_or_else(|| EtlError::UnknownModel {
                    category: None,
                    model: Some(model.clone()),
                })?;
                let options = options.clone().force_reinit(options.force_reinit || force_reinit);
                Ok(BatchJob::new(entity, options))
            })
            .collect()
    }
}

/// Outcome of a batch run.
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub total: usize,
    /// Model names with their outcome, in job order.
    pub succeeded: Vec<(String, RunOutcome)>,
    /// Model names with the error that stopped them, in job order.
    pub failed: Vec<(String, EtlError)>,
}

impl BatchSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn succeeded_models(&self) -> Vec<&str> {
        self.succeeded.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn failed_models(&self) -> Vec<&str> {
        self.failed.iter().map(|(name, _)| name.as_str()).collect()
    }
}

impl EtlRunner {
    /// Run every job on a pool of `batch_workers` threads.
    pub fn run_batch(&self, jobs: &[BatchJob]) -> Result<BatchSummary, EtlError> {
        let started = Instant::now();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings().batch_workers)
            .thread_name(|i| format!("etl-batch-{i}"))
            .build()
            .map_err(|e| EtlError::Config(format!("failed to build batch pool: {e}")))?;

        let results: Vec<(String, Result<RunOutcome, EtlError>)> = pool.install(|| {
            jobs.par_iter()
                .map(|job| {
                    let name = job.entity.name().to_string();
                    let result = self.run(job.entity.as_ref(), &job.options);
                    if let Err(e) = &result {
                        warn!(model = %name, error = %e, "batch model failed");
                    }
                    (name, result)
                })
                .collect()
        });

        let mut summary = BatchSummary {
            total: jobs.len(),
            ..BatchSummary::default()
        };
        for (name, result) in results {
            match result {
                Ok(outcome) => summary.succeeded.push((name, outcome)),
                Err(e) => summary.failed.push((name, e)),
            }
        }

        info!(
            total = summary.total,
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch finished"
        );
        Ok(summary)
    }
}
