//! QuantLake Core: schema descriptors, partition planning, partitioned parquet store.
//!
//! This crate holds everything below the run coordinator:
//! - Schema descriptors (ordered, typed, partition-annotated columns)
//! - Partition planning (date buckets, hive segments, month-aligned fetch ranges)
//! - Dataset store with delete-and-replace writes and pruned, filtered reads
//! - The entity contract concrete data models implement
//! - Run records and the per-model lease

pub mod entity;
pub mod error;
pub mod fields;
pub mod lease;
pub mod partition;
pub mod query;
pub mod record;
pub mod schema;
pub mod store;

pub use entity::Entity;
pub use error::{EtlError, QueryError};
pub use lease::ModelLease;
pub use partition::{
    derive_bucket_value, partition_spec, split_date_range, DateGranularity, PartitionColumn,
    PartitionKind, PartitionPolicy,
};
pub use query::{CondValue, Conditions, ReadRequest, Scalar};
pub use record::{
    JsonRunRecordStore, MemoryRunRecordStore, RunRecord, RunRecordStore, RunStatus,
};
pub use schema::{FieldSpec, RowSet, SchemaDescriptor, SemanticType, SourceRef};
pub use store::Dataset;
