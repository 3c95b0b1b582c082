//! The entity contract: what every concrete data model supplies to the core.
//!
//! An entity encodes one upstream query and one schema. The core never looks
//! inside `fetch_data`; it only relies on the returned row-set carrying the
//! declared columns.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::partition::PartitionPolicy;
use crate::schema::{RowSet, SchemaDescriptor};

/// A concrete data model (e.g. "bond daily quotes").
///
/// Implementations should issue parameterized queries; `secu_codes` and dates
/// are values, never SQL fragments.
pub trait Entity: Send + Sync {
    /// Model name, unique within its category. Used for the dataset directory
    /// and the run record key.
    fn name(&self) -> &str;

    /// Category directory (e.g. `MarketData`, `Portfolio`).
    fn category(&self) -> &str {
        "Uncategorized"
    }

    /// Human-readable description for schema catalogs.
    fn description(&self) -> &str {
        ""
    }

    fn schema(&self) -> &SchemaDescriptor;

    fn partition_policy(&self) -> PartitionPolicy {
        PartitionPolicy::default()
    }

    /// Column that carries the drill-down flag, for look-through datasets.
    fn drill_down_column(&self) -> Option<&str> {
        None
    }

    /// Fetch rows for the given instruments and inclusive date range.
    fn fetch_data(
        &self,
        secu_codes: Option<&[String]>,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> anyhow::Result<RowSet>;

    /// Dataset directory under `root`: `{root}/{category}/{name}`.
    fn dataset_dir(&self, root: &Path) -> PathBuf {
        root.join(self.category()).join(self.name())
    }
}
