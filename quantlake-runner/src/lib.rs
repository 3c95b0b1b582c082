//! QuantLake Runner: ETL orchestration.
//!
//! - [`EtlRunner`] runs one model's ETL (record check, lease, fetch, save) and
//!   serves reads with drill-down handling
//! - [`EntityRegistry`] selects models and exports the schema catalog
//! - [`EtlRunner::run_batch`] runs many models on a bounded pool
//! - [`EtlSettings`] is the TOML-backed configuration

pub mod batch;
pub mod coordinator;
pub mod registry;
pub mod settings;

pub use batch::{BatchJob, BatchPlan, BatchSummary};
pub use coordinator::{EtlRunner, RunOptions, RunOutcome};
pub use registry::{EntityRegistry, SchemaCatalogRow, ALL};
pub use settings::EtlSettings;
