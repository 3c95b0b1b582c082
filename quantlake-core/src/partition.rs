//! Partition planning: date bucketing, hive path segments, fetch range splitting.
//!
//! Layout produced by the store for a month-partitioned dataset with an explicit
//! instrument column:
//!
//! ```text
//! {dataset}/instrument_code={CODE}/month={YYYYMM}/part-0.parquet
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, NaiveDate};
use polars::prelude::DataType;
use serde::{Deserialize, Serialize};

use crate::error::EtlError;
use crate::fields::HIVE_NULL_PARTITION;
use crate::schema::SchemaDescriptor;

/// Default parquet row-group cap.
pub const DEFAULT_MAX_ROWS_PER_GROUP: usize = 1024 * 1024;

/// Date bucketing scheme of a dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateGranularity {
    #[default]
    None,
    Year,
    Quarter,
    Month,
    Day,
}

impl DateGranularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            DateGranularity::None => "none",
            DateGranularity::Year => "year",
            DateGranularity::Quarter => "quarter",
            DateGranularity::Month => "month",
            DateGranularity::Day => "day",
        }
    }

    pub fn is_date_based(&self) -> bool {
        !matches!(self, DateGranularity::None)
    }

    /// Name of the derived bucket column, if this granularity needs one.
    ///
    /// `day` reuses the date column itself.
    pub fn bucket_column(&self) -> Option<&'static str> {
        match self {
            DateGranularity::Year | DateGranularity::Quarter | DateGranularity::Month => {
                Some(self.as_str())
            }
            DateGranularity::None | DateGranularity::Day => None,
        }
    }
}

impl fmt::Display for DateGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DateGranularity {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "" => Ok(DateGranularity::None),
            "year" => Ok(DateGranularity::Year),
            "quarter" => Ok(DateGranularity::Quarter),
            "month" => Ok(DateGranularity::Month),
            "day" => Ok(DateGranularity::Day),
            other => Err(EtlError::Config(format!(
                "unsupported date partitioning '{other}' (expected none, year, quarter, month or day)"
            ))),
        }
    }
}

/// Static partitioning policy of one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPolicy {
    pub by_date: DateGranularity,
    /// Explicit partition columns. When empty, schema fields flagged as
    /// partition columns are used.
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub max_rows_per_file: Option<usize>,
    #[serde(default = "default_max_rows_per_group")]
    pub max_rows_per_group: usize,
}

fn default_max_rows_per_group() -> usize {
    DEFAULT_MAX_ROWS_PER_GROUP
}

impl Default for PartitionPolicy {
    fn default() -> Self {
        Self {
            by_date: DateGranularity::None,
            columns: Vec::new(),
            max_rows_per_file: None,
            max_rows_per_group: DEFAULT_MAX_ROWS_PER_GROUP,
        }
    }
}

impl PartitionPolicy {
    pub fn by_date(granularity: DateGranularity) -> Self {
        Self {
            by_date: granularity,
            ..Self::default()
        }
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_rows_per_file(mut self, rows: usize) -> Self {
        self.max_rows_per_file = Some(rows);
        self
    }

    pub fn with_max_rows_per_group(mut self, rows: usize) -> Self {
        self.max_rows_per_group = rows;
        self
    }

    /// Row-group size actually used when writing.
    ///
    /// A file cannot hold a row group larger than its own row cap, so the group
    /// size is clamped down to `max_rows_per_file` when that is smaller.
    pub fn effective_row_group_size(&self) -> usize {
        let group = self.max_rows_per_group.max(1);
        match self.max_rows_per_file {
            Some(file_cap) if file_cap > 0 && file_cap < group => file_cap,
            _ => group,
        }
    }
}

/// Role of a physical partition column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    /// A declared schema column, partitioned verbatim.
    Declared,
    /// The date column itself (day granularity).
    Date,
    /// A string bucket derived from the date column.
    DateBucket(DateGranularity),
}

/// One physical partition column, in directory nesting order.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionColumn {
    pub name: String,
    pub dtype: DataType,
    pub kind: PartitionKind,
}

/// Derive the physical partition columns for a schema under a policy.
pub fn partition_spec(
    schema: &SchemaDescriptor,
    policy: &PartitionPolicy,
) -> Result<Vec<PartitionColumn>, EtlError> {
    let declared: Vec<String> = if policy.columns.is_empty() {
        schema
            .partition_columns()
            .into_iter()
            .map(|f| f.name.clone())
            .collect()
    } else {
        policy.columns.clone()
    };

    let mut spec = Vec::with_capacity(declared.len() + 1);
    for name in declared {
        let field = schema.field(&name).ok_or_else(|| {
            EtlError::Config(format!("partition column '{name}' is not a schema field"))
        })?;
        spec.push(PartitionColumn {
            dtype: field.semantic_type.dtype(),
            name,
            kind: PartitionKind::Declared,
        });
    }

    if !policy.by_date.is_date_based() {
        return Ok(spec);
    }

    let date_column = schema.date_column().ok_or_else(|| {
        EtlError::Config(format!(
            "'{}' partitioning requires a date column in the schema",
            policy.by_date
        ))
    })?;

    match policy.by_date.bucket_column() {
        None => {
            // Day: the date column is the partition key.
            spec.retain(|c| c.name != date_column);
            spec.push(PartitionColumn {
                name: date_column.to_string(),
                dtype: DataType::String,
                kind: PartitionKind::Date,
            });
        }
        Some(bucket) => {
            if schema.contains(bucket) {
                return Err(EtlError::Config(format!(
                    "derived partition column '{bucket}' collides with a schema field"
                )));
            }
            spec.push(PartitionColumn {
                name: bucket.to_string(),
                dtype: DataType::String,
                kind: PartitionKind::DateBucket(policy.by_date),
            });
        }
    }
    Ok(spec)
}

/// Bucket string for a date: `YYYYMM`, `YYYY`, `YYYY` + quarter, or the date itself for `day`.
pub fn derive_bucket_value(date: NaiveDate, granularity: DateGranularity) -> Result<String, EtlError> {
    match granularity {
        DateGranularity::Month => Ok(date.format("%Y%m").to_string()),
        DateGranularity::Year => Ok(date.year().to_string()),
        DateGranularity::Quarter => Ok(format!("{}{}", date.year(), (date.month() - 1) / 3 + 1)),
        DateGranularity::Day => Ok(format_date(date)),
        DateGranularity::None => Err(EtlError::Config(
            "no date bucket for an unpartitioned dataset".into(),
        )),
    }
}

/// Split `[start, end]` into calendar-month-aligned sub-ranges.
///
/// Every sub-range but the last ends on the last day of its month. Returns an
/// empty list when `start > end`.
pub fn split_date_range(start: NaiveDate, end: NaiveDate) -> Vec<(NaiveDate, NaiveDate)> {
    let mut ranges = Vec::new();
    if start > end {
        return ranges;
    }
    let mut sub_start = start;
    let mut m_end = month_end(sub_start);
    while m_end < end {
        ranges.push((sub_start, m_end));
        sub_start = m_end + Duration::days(1);
        m_end = month_end(sub_start);
    }
    ranges.push((sub_start, end));
    ranges
}

pub fn month_begin(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

pub fn month_end(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .map(|next| next - Duration::days(1))
        .unwrap_or(date)
}

/// Parse `YYYY-MM-DD`, `YYYYMMDD` or `YYYY/MM/DD`.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    ["%Y-%m-%d", "%Y%m%d", "%Y/%m/%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
}

/// Canonical storage form of a date.
pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Whether a partition directory value can hold rows inside `[start, end]`.
///
/// Declared (non-date) partitions always may.
pub fn partition_may_overlap(
    value: &str,
    kind: PartitionKind,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> bool {
    let granularity = match kind {
        PartitionKind::Declared => return true,
        PartitionKind::Date => DateGranularity::Day,
        PartitionKind::DateBucket(g) => g,
    };
    if value == HIVE_NULL_PARTITION {
        return false;
    }
    // Bucket strings are fixed width, so lexical order is chronological.
    if let Some(start) = start {
        match derive_bucket_value(start, granularity) {
            Ok(lower) if value < lower.as_str() => return false,
            _ => {}
        }
    }
    if let Some(end) = end {
        match derive_bucket_value(end, granularity) {
            Ok(upper) if value > upper.as_str() => return false,
            _ => {}
        }
    }
    true
}

/// Encode a partition value as a single path segment.
pub fn encode_segment(value: Option<&str>) -> String {
    let Some(value) = value else {
        return HIVE_NULL_PARTITION.to_string();
    };
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '\\' => out.push_str("%5C"),
            '=' => out.push_str("%3D"),
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`encode_segment`] for non-null values.
pub fn decode_segment(segment: &str) -> String {
    segment
        .replace("%2F", "/")
        .replace("%5C", "\\")
        .replace("%3D", "=")
        .replace("%25", "%")
}
