//! Declarative schema descriptors.
//!
//! A descriptor is the single source of truth for column order and typing of a
//! dataset. Fetched row-sets are conformed to it before anything touches disk.

use std::collections::HashSet;
use std::fmt;

use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::EtlError;
use crate::fields;

/// The in-memory row-set exchanged between entities, the coordinator and the store.
pub type RowSet = DataFrame;

/// Semantic column type, independent of the physical storage type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    String,
    Int64,
    Float64,
    Bool,
    /// Calendar date carried as a `YYYY-MM-DD` string.
    DateString,
    List(Box<SemanticType>),
}

impl SemanticType {
    /// Physical polars dtype used in memory and on disk.
    pub fn dtype(&self) -> DataType {
        match self {
            SemanticType::String | SemanticType::DateString => DataType::String,
            SemanticType::Int64 => DataType::Int64,
            SemanticType::Float64 => DataType::Float64,
            SemanticType::Bool => DataType::Boolean,
            SemanticType::List(inner) => DataType::List(Box::new(inner.dtype())),
        }
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SemanticType::String => write!(f, "string"),
            SemanticType::Int64 => write!(f, "int64"),
            SemanticType::Float64 => write!(f, "float64"),
            SemanticType::Bool => write!(f, "bool"),
            SemanticType::DateString => write!(f, "date_string"),
            SemanticType::List(inner) => write!(f, "list<{inner}>"),
        }
    }
}

/// Upstream provenance of a field. Documentation only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub table: String,
    pub column: String,
}

/// One declared column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub semantic_type: SemanticType,
    pub nullable: bool,
    /// Whether the column participates in on-disk partitioning.
    pub partition: bool,
    pub description: String,
    pub sources: Vec<SourceRef>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, semantic_type: SemanticType) -> Self {
        Self {
            name: name.into(),
            semantic_type,
            nullable: true,
            partition: false,
            description: String::new(),
            sources: Vec::new(),
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, SemanticType::String)
    }

    pub fn int64(name: impl Into<String>) -> Self {
        Self::new(name, SemanticType::Int64)
    }

    pub fn float64(name: impl Into<String>) -> Self {
        Self::new(name, SemanticType::Float64)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, SemanticType::Bool)
    }

    pub fn date_string(name: impl Into<String>) -> Self {
        Self::new(name, SemanticType::DateString)
    }

    pub fn list(name: impl Into<String>, inner: SemanticType) -> Self {
        Self::new(name, SemanticType::List(Box::new(inner)))
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn partitioned(mut self) -> Self {
        self.partition = true;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Record an upstream `table.column` this field is fed from.
    pub fn source(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.sources.push(SourceRef {
            table: table.into(),
            column: column.into(),
        });
        self
    }
}

/// Ordered, immutable list of declared columns for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    fields: Vec<FieldSpec>,
    date_column: Option<String>,
    code_column: Option<String>,
}

impl SchemaDescriptor {
    /// Build and validate a descriptor.
    ///
    /// `trade_date` becomes the date column and `instrument_code` the code column
    /// when present; use [`with_date_column`](Self::with_date_column) and
    /// [`with_code_column`](Self::with_code_column) to pick others.
    pub fn new(fields: Vec<FieldSpec>) -> Result<Self, EtlError> {
        if fields.is_empty() {
            return Err(EtlError::Config("schema has no fields".into()));
        }
        let mut seen = HashSet::new();
        for field in &fields {
            if field.name.is_empty() {
                return Err(EtlError::Config("schema field with empty name".into()));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(EtlError::Config(format!(
                    "duplicate schema field '{}'",
                    field.name
                )));
            }
        }

        let date_column = fields
            .iter()
            .find(|f| f.name == fields::TRADE_DATE && is_date_like(&f.semantic_type))
            .map(|f| f.name.clone());
        let code_column = fields
            .iter()
            .find(|f| f.name == fields::INSTRUMENT_CODE)
            .map(|f| f.name.clone());

        Ok(Self {
            fields,
            date_column,
            code_column,
        })
    }

    /// Use `name` as the business-date column.
    pub fn with_date_column(mut self, name: &str) -> Result<Self, EtlError> {
        let field = self.field(name).ok_or_else(|| {
            EtlError::Config(format!("date column '{name}' is not a schema field"))
        })?;
        if !is_date_like(&field.semantic_type) {
            return Err(EtlError::Config(format!(
                "date column '{name}' must be date_string or string, found {}",
                field.semantic_type
            )));
        }
        self.date_column = Some(name.to_string());
        Ok(self)
    }

    /// Declare that the dataset carries no business-date column.
    pub fn without_date_column(mut self) -> Self {
        self.date_column = None;
        self
    }

    /// Use `name` as the column that `secu_codes` filter on.
    pub fn with_code_column(mut self, name: &str) -> Result<Self, EtlError> {
        if self.field(name).is_none() {
            return Err(EtlError::Config(format!(
                "code column '{name}' is not a schema field"
            )));
        }
        self.code_column = Some(name.to_string());
        Ok(self)
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Column names in declared order.
    pub fn columns(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Fields flagged as partition columns, in declared order.
    pub fn partition_columns(&self) -> Vec<&FieldSpec> {
        self.fields.iter().filter(|f| f.partition).collect()
    }

    pub fn date_column(&self) -> Option<&str> {
        self.date_column.as_deref()
    }

    pub fn code_column(&self) -> Option<&str> {
        self.code_column.as_deref()
    }

    /// Polars schema in declared order.
    pub fn polars_schema(&self) -> Schema {
        Schema::from_iter(
            self.fields
                .iter()
                .map(|f| Field::new(f.name.as_str().into(), f.semantic_type.dtype())),
        )
    }

    /// An empty row-set carrying every declared column.
    pub fn empty_row_set(&self) -> RowSet {
        DataFrame::empty_with_schema(&self.polars_schema())
    }

    /// Select, reorder and type the declared columns of `rows`.
    ///
    /// Columns not declared are dropped. A declared column missing from `rows`
    /// is a configuration error; a value that cannot be stored as the declared
    /// type, or a null in a non-nullable column, is a save error.
    pub fn conform(&self, rows: &RowSet) -> Result<RowSet, EtlError> {
        let mut columns = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let column = rows.column(&field.name).map_err(|_| {
                EtlError::Config(format!(
                    "declared column '{}' is missing from the fetched row-set",
                    field.name
                ))
            })?;

            let target = field.semantic_type.dtype();
            let column = if column.dtype() == &target {
                column.clone()
            } else {
                column.strict_cast(&target).map_err(|e| {
                    EtlError::Save(format!(
                        "column '{}' cannot be stored as {}: {e}",
                        field.name, field.semantic_type
                    ))
                })?
            };

            if !field.nullable && column.null_count() > 0 {
                return Err(EtlError::Save(format!(
                    "column '{}' is not nullable but has {} null value(s)",
                    field.name,
                    column.null_count()
                )));
            }
            columns.push(column);
        }

        DataFrame::new(columns).map_err(|e| EtlError::Save(format!("conform row-set: {e}")))
    }
}

fn is_date_like(ty: &SemanticType) -> bool {
    matches!(ty, SemanticType::DateString | SemanticType::String)
}
