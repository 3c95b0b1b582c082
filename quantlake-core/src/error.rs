//! Structured error types for ETL operations.
//!
//! The variants separate "never ran" (`NotFound`) from "ran but the read failed"
//! (`Query`) so callers can pick between surfacing a configuration problem and
//! falling back to an empty result.

use std::path::PathBuf;

use polars::prelude::PolarsError;
use thiserror::Error;

/// Errors raised by the read path when a dataset exists but cannot be queried.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("unknown column '{column}'")]
    UnknownColumn { column: String },

    #[error("condition on '{column}' expects {expected}, got {actual}")]
    TypeMismatch {
        column: String,
        expected: String,
        actual: String,
    },

    #[error("column '{column}' has type {dtype}, which cannot be filtered")]
    UnsupportedFilter { column: String, dtype: String },

    #[error("failed to read {path}: {reason}")]
    Read { path: PathBuf, reason: String },
}

/// Top-level error for the ETL core and runner.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("ETL output for model '{model}' not found at {path}; run the ETL first")]
    NotFound { model: String, path: PathBuf },

    #[error("query error on '{model}': {source}")]
    Query {
        model: String,
        #[source]
        source: QueryError,
    },

    #[error("fetch failed for '{model}': {message}")]
    Fetch { model: String, message: String },

    #[error("save error: {0}")]
    Save(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("model '{model}' is locked by another run ({holder})")]
    Busy { model: String, holder: String },

    #[error("run record store error: {0}")]
    RunRecord(String),

    #[error("no ETL model matches category={category:?} model={model:?}")]
    UnknownModel {
        category: Option<String>,
        model: Option<String>,
    },
}

impl EtlError {
    pub fn query(model: &str, source: QueryError) -> Self {
        EtlError::Query {
            model: model.to_string(),
            source,
        }
    }

    /// True for the "ETL never ran" condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EtlError::NotFound { .. })
    }

    pub fn is_config(&self) -> bool {
        matches!(self, EtlError::Config(_))
    }
}

/// Wrap a polars failure on the write path.
pub(crate) fn save_err(context: &str) -> impl Fn(PolarsError) -> EtlError + '_ {
    move |e| EtlError::Save(format!("{context}: {e}"))
}

/// Wrap an I/O failure on the write path.
pub(crate) fn save_io(context: &str) -> impl Fn(std::io::Error) -> EtlError + '_ {
    move |e| EtlError::Save(format!("{context}: {e}"))
}
