//! Partitioned parquet dataset store.
//!
//! Layout: `{dataset}/[col=value/...]part-{n}.parquet`
//!
//! - Delete-and-replace per touched partition: a write replaces every parquet
//!   file of the partition directories it touches and leaves the others alone.
//! - Atomic file writes (write to `.tmp`, rename into place).
//! - Month-partitioned writes merge with stored rows of the same months; new
//!   rows win for any date present in the new batch.
//! - Reads prune partition directories before opening files, then filter,
//!   project and sort by date descending.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use polars::prelude::*;
use tracing::{debug, info};

use crate::error::{save_err, save_io, EtlError, QueryError};
use crate::fields::HIVE_NULL_PARTITION;
use crate::partition::{
    decode_segment, derive_bucket_value, encode_segment, format_date, month_begin, month_end,
    parse_date, partition_may_overlap, partition_spec, DateGranularity, PartitionColumn,
    PartitionKind, PartitionPolicy,
};
use crate::query::{condition_mask, date_range_mask, CondValue, Conditions, ReadRequest, Scalar};
use crate::schema::{RowSet, SchemaDescriptor};

/// A parquet file found under the dataset root with the hive segments leading to it.
#[derive(Debug, Clone)]
struct StoredFile {
    path: PathBuf,
    /// `(column, value)` pairs; `None` marks the null partition.
    segments: Vec<(String, Option<String>)>,
}

/// One model's on-disk dataset.
pub struct Dataset<'a> {
    model: &'a str,
    path: PathBuf,
    schema: &'a SchemaDescriptor,
    policy: &'a PartitionPolicy,
}

impl<'a> Dataset<'a> {
    pub fn new(
        model: &'a str,
        path: impl Into<PathBuf>,
        schema: &'a SchemaDescriptor,
        policy: &'a PartitionPolicy,
    ) -> Self {
        Self {
            model,
            path: path.into(),
            schema,
            policy,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the dataset directory exists (the ETL ran at least once).
    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// Ensure the dataset directory exists.
    pub fn ensure_dir(&self) -> Result<(), EtlError> {
        fs::create_dir_all(&self.path).map_err(save_io("create dataset dir"))
    }

    /// Delete everything stored for this dataset.
    pub fn purge(&self) -> Result<(), EtlError> {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EtlError::Save(format!("purge {}: {e}", self.path.display()))),
        }
    }

    /// Write a row-set, replacing the partitions it touches.
    ///
    /// Returns the number of rows of `rows` that were stored (0 for an empty
    /// row-set, in which case nothing is written).
    pub fn write(&self, rows: &RowSet, label: &str) -> Result<usize, EtlError> {
        let started = Instant::now();
        let spec = partition_spec(self.schema, self.policy)?;

        if rows.width() == 0 {
            info!(model = self.model, label, "row-set is empty, nothing written");
            return Ok(0);
        }
        let mut frame = self.schema.conform(rows)?;
        let batch_rows = frame.height();
        if batch_rows == 0 {
            info!(model = self.model, label, "row-set is empty, nothing written");
            return Ok(0);
        }

        // Reads compare the date column as `YYYY-MM-DD`, whatever its declared type.
        if let Some(date_column) = self.schema.date_column() {
            canonicalize_dates(&mut frame, date_column, self.policy.by_date.is_date_based())?;
        }

        if self.policy.by_date == DateGranularity::Month {
            frame = self.merge_stored_months(frame)?;
        }

        for column in &spec {
            if let PartitionKind::DateBucket(granularity) = column.kind {
                attach_bucket(&mut frame, self.schema, column, granularity)?;
            }
        }

        let groups = partition_groups(&frame, &spec)?;
        let row_group = self.policy.effective_row_group_size();
        for (segments, indices) in &groups {
            let idx = IdxCa::from_vec("idx".into(), indices.clone());
            let part = frame.take(&idx).map_err(save_err("select partition rows"))?;
            let dir = segments.iter().fold(self.path.clone(), |p, s| p.join(s));
            replace_partition(&dir, &part, self.policy.max_rows_per_file, row_group)?;
        }

        info!(
            model = self.model,
            label,
            rows = batch_rows,
            stored_rows = frame.height(),
            partitions = groups.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            path = %self.path.display(),
            "saved dataset"
        );
        Ok(batch_rows)
    }

    /// Read rows back with pruning, filtering and projection.
    ///
    /// Fails with [`EtlError::NotFound`] when the dataset directory is absent.
    pub fn read(&self, request: &ReadRequest) -> Result<RowSet, EtlError> {
        let started = Instant::now();
        if !self.exists() {
            return Err(EtlError::NotFound {
                model: self.model.to_string(),
                path: self.path.clone(),
            });
        }
        let spec = partition_spec(self.schema, self.policy)?;

        let mut cond = request.cond.clone();
        if let Some(codes) = request.secu_codes.as_ref().filter(|c| !c.is_empty()) {
            let code_column = self.schema.code_column().ok_or_else(|| {
                EtlError::query(
                    self.model,
                    QueryError::UnknownColumn {
                        column: "secu_codes (no code column declared)".into(),
                    },
                )
            })?;
            cond.insert(
                code_column.to_string(),
                CondValue::Many(codes.iter().map(Scalar::from).collect()),
            );
        }
        for column in cond.keys() {
            if !self.schema.contains(column) {
                return Err(EtlError::query(
                    self.model,
                    QueryError::UnknownColumn {
                        column: column.clone(),
                    },
                ));
            }
        }

        let date_filter = match self.schema.date_column() {
            Some(column) if request.has_date_filter() => Some(column),
            _ => {
                if request.has_date_filter() {
                    debug!(model = self.model, "dataset has no date column, date filter dropped");
                }
                None
            }
        };
        let projection = self.projection(request, &cond, date_filter)?;

        let date_bounds = date_filter.map(|_| (request.start_date, request.end_date));
        let files = self.list_files(&spec, &cond, date_bounds)?;
        let mut frame = self.load_files(&files)?;

        let mut keep = vec![true; frame.height()];
        if let Some(column) = date_filter {
            let start = request.start_date.map(format_date);
            let end = request.end_date.map(format_date);
            let col = frame
                .column(column)
                .map_err(|e| self.read_err(&self.path, e))?;
            let mask = date_range_mask(col, start.as_deref(), end.as_deref())
                .map_err(|e| EtlError::query(self.model, e))?;
            and_mask(&mut keep, &mask);
        }
        for (column, value) in &cond {
            let col = frame
                .column(column)
                .map_err(|e| self.read_err(&self.path, e))?;
            let mask =
                condition_mask(col, value.values()).map_err(|e| EtlError::query(self.model, e))?;
            and_mask(&mut keep, &mask);
        }
        if keep.iter().any(|k| !k) {
            frame = frame
                .filter(&BooleanChunked::from_slice("keep".into(), &keep))
                .map_err(|e| self.read_err(&self.path, e))?;
        }

        if let Some(columns) = projection {
            frame = frame
                .select(columns)
                .map_err(|e| self.read_err(&self.path, e))?;
        }

        if let Some(date_column) = self.schema.date_column() {
            if frame.column(date_column).is_ok() {
                frame = frame
                    .sort(
                        [date_column],
                        SortMultipleOptions::default()
                            .with_order_descending(true)
                            .with_maintain_order(true),
                    )
                    .map_err(|e| self.read_err(&self.path, e))?;
            }
        }

        info!(
            model = self.model,
            files = files.len(),
            rows = frame.height(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "loaded dataset"
        );
        Ok(frame)
    }

    /// Columns to return, or `None` for every declared column.
    fn projection(
        &self,
        request: &ReadRequest,
        cond: &Conditions,
        date_filter: Option<&str>,
    ) -> Result<Option<Vec<String>>, EtlError> {
        let Some(requested) = &request.columns else {
            return Ok(None);
        };
        let mut columns: Vec<String> = Vec::with_capacity(requested.len() + cond.len() + 1);
        for column in requested {
            if !self.schema.contains(column) {
                return Err(EtlError::query(
                    self.model,
                    QueryError::UnknownColumn {
                        column: column.clone(),
                    },
                ));
            }
            if !columns.contains(column) {
                columns.push(column.clone());
            }
        }
        // Filter columns stay visible to the caller.
        let forced = date_filter
            .into_iter()
            .map(str::to_string)
            .chain(cond.keys().cloned());
        for column in forced {
            if !columns.contains(&column) {
                columns.push(column);
            }
        }
        Ok(Some(columns))
    }

    /// Month-partitioned writes keep stored rows of the touched months whose
    /// date is absent from the new batch.
    fn merge_stored_months(&self, frame: DataFrame) -> Result<DataFrame, EtlError> {
        let Some(date_column) = self.schema.date_column() else {
            return Ok(frame);
        };
        let dates = string_values(&frame, date_column)?;
        let (Some(first), Some(last)) = (dates.first(), dates.last()) else {
            return Ok(frame);
        };
        let (Some(first), Some(last)) = (parse_date(first), parse_date(last)) else {
            return Ok(frame);
        };

        let span = ReadRequest::new().between(month_begin(first), month_end(last));
        let stored = match self.read(&span) {
            Ok(stored) => stored,
            Err(e) if e.is_not_found() => return Ok(frame),
            Err(e) => {
                return Err(EtlError::Save(format!(
                    "merge with stored data of '{}': {e}",
                    self.model
                )))
            }
        };
        if stored.height() == 0 {
            return Ok(frame);
        }

        let keep: Vec<bool> = stored
            .column(date_column)
            .and_then(|c| c.str().cloned())
            .map_err(save_err("stored date column"))?
            .into_iter()
            .map(|v| v.map_or(true, |d| !dates.contains(d)))
            .collect();
        let retained = stored
            .filter(&BooleanChunked::from_slice("keep".into(), &keep))
            .map_err(save_err("filter stored rows"))?;
        debug!(
            model = self.model,
            stored = stored.height(),
            retained = retained.height(),
            "merging with stored month data"
        );

        let mut merged = frame;
        merged
            .vstack_mut(&retained)
            .map_err(save_err("merge stored rows"))?;
        merged
            .sort(
                [date_column],
                SortMultipleOptions::default()
                    .with_order_descending(true)
                    .with_maintain_order(true),
            )
            .map_err(save_err("sort merged rows"))
    }

    fn list_files(
        &self,
        spec: &[PartitionColumn],
        cond: &Conditions,
        date_bounds: Option<(Option<chrono::NaiveDate>, Option<chrono::NaiveDate>)>,
    ) -> Result<Vec<StoredFile>, EtlError> {
        let mut files = Vec::new();
        collect_files(&self.path, &[], &mut files).map_err(|e| {
            EtlError::query(
                self.model,
                QueryError::Read {
                    path: self.path.clone(),
                    reason: e.to_string(),
                },
            )
        })?;

        files.retain(|file| {
            file.segments.iter().all(|(name, value)| {
                let Some(column) = spec.iter().find(|c| &c.name == name) else {
                    return true;
                };
                match column.kind {
                    PartitionKind::Declared => match (cond.get(name), value) {
                        (None, _) => true,
                        (Some(_), None) => false,
                        (Some(wanted), Some(v)) => {
                            wanted
                                .values()
                                .iter()
                                .any(|s| s.matches_partition(&column.dtype, v))
                        }
                    },
                    kind => match (date_bounds, value) {
                        (None, _) => true,
                        (Some(_), None) => false,
                        (Some((start, end)), Some(v)) => partition_may_overlap(v, kind, start, end),
                    },
                }
            })
        });
        Ok(files)
    }

    /// Read files into one frame holding the declared columns.
    fn load_files(&self, files: &[StoredFile]) -> Result<DataFrame, EtlError> {
        let mut frame = self.schema.empty_row_set();
        for file in files {
            let handle = fs::File::open(&file.path).map_err(|e| {
                EtlError::query(
                    self.model,
                    QueryError::Read {
                        path: file.path.clone(),
                        reason: e.to_string(),
                    },
                )
            })?;
            let df = ParquetReader::new(handle)
                .finish()
                .map_err(|e| self.read_err(&file.path, e))?;
            let df = self.align_stored(df, &file.path)?;
            frame
                .vstack_mut(&df)
                .map_err(|e| self.read_err(&file.path, e))?;
        }
        Ok(frame)
    }

    /// Select declared columns of a stored file, casting to declared types.
    fn align_stored(&self, df: DataFrame, path: &Path) -> Result<DataFrame, EtlError> {
        let mut columns = Vec::with_capacity(self.schema.fields().len());
        for field in self.schema.fields() {
            let column = df.column(&field.name).map_err(|_| {
                EtlError::query(
                    self.model,
                    QueryError::Read {
                        path: path.to_path_buf(),
                        reason: format!("stored file lacks column '{}'", field.name),
                    },
                )
            })?;
            let target = field.semantic_type.dtype();
            let column = if column.dtype() == &target {
                column.clone()
            } else {
                column.strict_cast(&target).map_err(|_| {
                    EtlError::query(
                        self.model,
                        QueryError::TypeMismatch {
                            column: field.name.clone(),
                            expected: field.semantic_type.to_string(),
                            actual: column.dtype().to_string(),
                        },
                    )
                })?
            };
            columns.push(column);
        }
        DataFrame::new(columns).map_err(|e| self.read_err(path, e))
    }

    fn read_err(&self, path: &Path, e: PolarsError) -> EtlError {
        EtlError::query(
            self.model,
            QueryError::Read {
                path: path.to_path_buf(),
                reason: e.to_string(),
            },
        )
    }
}

// ── Write helpers ───────────────────────────────────────────────────

fn canonicalize_dates(frame: &mut DataFrame, column: &str, required: bool) -> Result<(), EtlError> {
    let values: Vec<Option<String>> = {
        let ca = frame
            .column(column)
            .and_then(|c| c.str().cloned())
            .map_err(save_err("date column"))?;
        let mut out = Vec::with_capacity(ca.len());
        for value in ca.into_iter() {
            match value {
                None if required => {
                    return Err(EtlError::Save(format!(
                        "null value in date column '{column}' of a date-partitioned dataset"
                    )))
                }
                None => out.push(None),
                Some(raw) => {
                    let date = parse_date(raw).ok_or_else(|| {
                        EtlError::Save(format!("unparseable date '{raw}' in column '{column}'"))
                    })?;
                    out.push(Some(format_date(date)));
                }
            }
        }
        out
    };
    frame
        .with_column(Column::new(column.into(), values))
        .map_err(save_err("replace date column"))?;
    Ok(())
}

fn attach_bucket(
    frame: &mut DataFrame,
    schema: &SchemaDescriptor,
    column: &PartitionColumn,
    granularity: DateGranularity,
) -> Result<(), EtlError> {
    let date_column = schema
        .date_column()
        .ok_or_else(|| EtlError::Config("date partitioning without a date column".into()))?;
    let buckets = {
        let ca = frame
            .column(date_column)
            .and_then(|c| c.str().cloned())
            .map_err(save_err("date column"))?;
        ca.into_iter()
            .map(|value| {
                let date = value.and_then(parse_date).ok_or_else(|| {
                    EtlError::Save(format!("cannot derive {granularity} bucket from {value:?}"))
                })?;
                derive_bucket_value(date, granularity)
            })
            .collect::<Result<Vec<String>, EtlError>>()?
    };
    frame
        .with_column(Column::new(column.name.as_str().into(), buckets))
        .map_err(save_err("append bucket column"))?;
    Ok(())
}

/// Group row indices by their partition directory path.
fn partition_groups(
    frame: &DataFrame,
    spec: &[PartitionColumn],
) -> Result<BTreeMap<Vec<String>, Vec<IdxSize>>, EtlError> {
    let height = frame.height();
    let mut groups: BTreeMap<Vec<String>, Vec<IdxSize>> = BTreeMap::new();
    if spec.is_empty() {
        groups.insert(Vec::new(), (0..height as IdxSize).collect());
        return Ok(groups);
    }

    let mut rendered: Vec<Vec<Option<String>>> = Vec::with_capacity(spec.len());
    for column in spec {
        let as_text = frame
            .column(&column.name)
            .and_then(|c| c.cast(&DataType::String))
            .map_err(|e| {
                EtlError::Config(format!(
                    "partition column '{}' cannot be rendered as a path: {e}",
                    column.name
                ))
            })?;
        let ca = as_text.str().map_err(save_err("partition column"))?;
        rendered.push(ca.into_iter().map(|v| v.map(str::to_string)).collect());
    }

    for row in 0..height {
        let key = spec
            .iter()
            .zip(&rendered)
            .map(|(column, values)| {
                format!("{}={}", column.name, encode_segment(values[row].as_deref()))
            })
            .collect();
        groups.entry(key).or_default().push(row as IdxSize);
    }
    Ok(groups)
}

/// Replace every parquet file in `dir` with the rows of `part`.
fn replace_partition(
    dir: &Path,
    part: &DataFrame,
    max_rows_per_file: Option<usize>,
    row_group: usize,
) -> Result<(), EtlError> {
    fs::create_dir_all(dir).map_err(save_io("create partition dir"))?;

    let height = part.height();
    let per_file = max_rows_per_file.filter(|n| *n > 0).unwrap_or(height.max(1));
    let mut staged = Vec::new();
    let mut offset = 0;
    while offset < height {
        let len = per_file.min(height - offset);
        let mut slice = part.slice(offset as i64, len);
        let path = dir.join(format!("part-{}.parquet", staged.len()));
        let tmp_path = path.with_extension("parquet.tmp");
        write_parquet(&mut slice, &tmp_path, row_group)?;
        staged.push((tmp_path, path));
        offset += len;
    }

    let entries = fs::read_dir(dir).map_err(save_io("list partition dir"))?;
    for entry in entries {
        let path = entry.map_err(save_io("partition dir entry"))?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("parquet") {
            fs::remove_file(&path).map_err(save_io("remove replaced file"))?;
        }
    }

    for (tmp_path, path) in staged {
        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            EtlError::Save(format!("atomic rename failed: {e}"))
        })?;
    }
    Ok(())
}

fn write_parquet(df: &mut DataFrame, path: &Path, row_group: usize) -> Result<(), EtlError> {
    let file = fs::File::create(path).map_err(save_io("create file"))?;
    ParquetWriter::new(file)
        .with_row_group_size(Some(row_group))
        .finish(df)
        .map_err(save_err("write parquet"))?;
    Ok(())
}

// ── Read helpers ────────────────────────────────────────────────────

/// Index `n` of a `part-{n}.parquet` file; other entries sort after all parts.
fn part_index(name: &str) -> u64 {
    name.strip_prefix("part-")
        .and_then(|rest| rest.strip_suffix(".parquet"))
        .and_then(|n| n.parse().ok())
        .unwrap_or(u64::MAX)
}

fn collect_files(
    dir: &Path,
    segments: &[(String, Option<String>)],
    out: &mut Vec<StoredFile>,
) -> std::io::Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    // `part-10` follows `part-9`, so split files read back in write order.
    entries.sort_by_cached_key(|e| {
        let name = e.file_name().to_string_lossy().into_owned();
        (part_index(&name), name)
    });

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || name.starts_with('_') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            // Only hive directories belong to this dataset.
            let Some((column, raw)) = name.split_once('=') else {
                continue;
            };
            let value = (raw != HIVE_NULL_PARTITION).then(|| decode_segment(raw));
            let mut nested = segments.to_vec();
            nested.push((column.to_string(), value));
            collect_files(&path, &nested, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("parquet") {
            out.push(StoredFile {
                path,
                segments: segments.to_vec(),
            });
        }
    }
    Ok(())
}

/// Distinct non-null values of a string column, sorted.
fn string_values(frame: &DataFrame, column: &str) -> Result<BTreeSet<String>, EtlError> {
    let ca = frame
        .column(column)
        .and_then(|c| c.str().cloned())
        .map_err(save_err("date column"))?;
    Ok(ca.into_iter().flatten().map(str::to_string).collect())
}

fn and_mask(keep: &mut [bool], mask: &[bool]) {
    for (k, m) in keep.iter_mut().zip(mask) {
        *k = *k && *m;
    }
}
