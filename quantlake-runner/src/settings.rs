//! ETL settings, loaded from TOML.
//!
//! ```toml
//! run_env = "prod"
//! save_path = "/data/qlib-prod"
//! enable_event = true
//! worker_threads = 8
//! batch_workers = 5
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use quantlake_core::EtlError;

/// Environment variable overriding `save_path`.
pub const SAVE_PATH_ENV: &str = "QUANTLAKE_SAVE_PATH";
/// Environment variable overriding `run_env`.
pub const RUN_ENV_ENV: &str = "QUANTLAKE_RUN_ENV";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtlSettings {
    /// Deployment environment name; selects the default storage root.
    pub run_env: String,
    /// Dataset root. Defaults to `static/qlib-{run_env}`.
    pub save_path: Option<PathBuf>,
    /// Track run records (enables the skip-if-complete check).
    pub enable_event: bool,
    /// Threads used for sub-range fetches and concurrent saves.
    pub worker_threads: usize,
    /// Models run in parallel by a batch.
    pub batch_workers: usize,
    /// Row-group cap applied to models that keep the default.
    pub max_rows_per_group: Option<usize>,
    /// Age after which a model lease is considered abandoned.
    pub lease_stale_after_secs: u64,
    /// Run record document. Defaults to `{save_path}/_meta/etl_events.json`.
    pub event_store_path: Option<PathBuf>,
}

impl Default for EtlSettings {
    fn default() -> Self {
        Self {
            run_env: "dev".into(),
            save_path: None,
            enable_event: true,
            worker_threads: 4,
            batch_workers: 5,
            max_rows_per_group: None,
            lease_stale_after_secs: 6 * 60 * 60,
            event_store_path: None,
        }
    }
}

impl EtlSettings {
    /// Load settings from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, EtlError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EtlError::Config(format!("read settings {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse settings from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, EtlError> {
        let settings: Self =
            toml::from_str(content).map_err(|e| EtlError::Config(format!("parse settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `QUANTLAKE_SAVE_PATH` / `QUANTLAKE_RUN_ENV` when set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(path) = std::env::var(SAVE_PATH_ENV) {
            if !path.is_empty() {
                self.save_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(env) = std::env::var(RUN_ENV_ENV) {
            if !env.is_empty() {
                self.run_env = env;
            }
        }
        self
    }

    pub fn with_save_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_path = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<(), EtlError> {
        if self.worker_threads == 0 {
            return Err(EtlError::Config("worker_threads must be at least 1".into()));
        }
        if self.batch_workers == 0 {
            return Err(EtlError::Config("batch_workers must be at least 1".into()));
        }
        if self.max_rows_per_group == Some(0) {
            return Err(EtlError::Config("max_rows_per_group must be positive".into()));
        }
        Ok(())
    }

    /// Root directory of every dataset.
    pub fn save_path(&self) -> PathBuf {
        self.save_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("static").join(format!("qlib-{}", self.run_env)))
    }

    pub fn event_store_path(&self) -> PathBuf {
        self.event_store_path
            .clone()
            .unwrap_or_else(|| self.save_path().join("_meta").join("etl_events.json"))
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.save_path().join("_meta").join("locks")
    }

    pub fn lease_stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_stale_after_secs as i64)
    }
}
