//! Well-known dimension names shared by every entity.

/// Business date of a row, stored as `YYYY-MM-DD`.
pub const TRADE_DATE: &str = "trade_date";

/// Security / instrument identifier used by `secu_codes` filters.
pub const INSTRUMENT_CODE: &str = "instrument_code";

/// Drill-down marker for penetrated (look-through) datasets.
pub const DOWN_FLAG: &str = "down_flag";

/// Default value injected for [`DOWN_FLAG`] when the caller does not choose one.
pub const DEFAULT_DOWN_FLAG: &str = "1";

/// Directory name used for null partition values.
pub const HIVE_NULL_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";
