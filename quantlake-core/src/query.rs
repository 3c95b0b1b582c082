//! Read requests and predicate evaluation.
//!
//! Conditions are ANDed; a condition on one column is either an equality test
//! or a set-membership test.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::QueryError;

/// A literal compared against a stored column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    pub fn type_name(&self) -> &'static str {
        match self {
            Scalar::Bool(_) => "bool",
            Scalar::Int(_) => "int64",
            Scalar::Float(_) => "float64",
            Scalar::Str(_) => "string",
        }
    }

    /// Whether a hive directory value of a column typed `dtype` equals this literal.
    ///
    /// Segments are parsed back to the column type, so `tenor=1.0` matches
    /// both `1.0` and `1`.
    pub fn matches_partition(&self, dtype: &DataType, segment: &str) -> bool {
        match (self, dtype) {
            (Scalar::Bool(b), DataType::Boolean) => segment.parse::<bool>().is_ok_and(|v| v == *b),
            (Scalar::Int(i), dt) if dt.is_integer() => segment.parse::<i64>().is_ok_and(|v| v == *i),
            (Scalar::Int(i), dt) if dt.is_float() => {
                segment.parse::<f64>().is_ok_and(|v| v == *i as f64)
            }
            (Scalar::Float(f), dt) if dt.is_float() || dt.is_integer() => {
                segment.parse::<f64>().is_ok_and(|v| v == *f)
            }
            (Scalar::Str(s), _) => s == segment,
            (Scalar::Bool(b), _) => b.to_string() == segment,
            (Scalar::Int(i), _) => i.to_string() == segment,
            (Scalar::Float(f), _) => f.to_string() == segment,
        }
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Str(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Str(v)
    }
}

impl From<&String> for Scalar {
    fn from(v: &String) -> Self {
        Scalar::Str(v.clone())
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Scalar::Int(v as i64)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

/// Right-hand side of one condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CondValue {
    One(Scalar),
    Many(Vec<Scalar>),
}

impl CondValue {
    pub fn values(&self) -> &[Scalar] {
        match self {
            CondValue::One(v) => std::slice::from_ref(v),
            CondValue::Many(vs) => vs,
        }
    }
}

/// Column → condition, evaluated in key order.
pub type Conditions = BTreeMap<String, CondValue>;

/// Everything a caller can ask of a stored dataset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadRequest {
    pub secu_codes: Option<Vec<String>>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub cond: Conditions,
    pub columns: Option<Vec<String>>,
    /// Drill-down value for entities that declare a drill-down column.
    pub down_flag: Option<String>,
}

impl ReadRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn secu_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.secu_codes = Some(codes.into_iter().map(Into::into).collect());
        self
    }

    pub fn start(mut self, date: NaiveDate) -> Self {
        self.start_date = Some(date);
        self
    }

    pub fn end(mut self, date: NaiveDate) -> Self {
        self.end_date = Some(date);
        self
    }

    pub fn between(self, start: NaiveDate, end: NaiveDate) -> Self {
        self.start(start).end(end)
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.cond.insert(column.into(), CondValue::One(value.into()));
        self
    }

    pub fn is_in<I, V>(mut self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Scalar>,
    {
        self.cond.insert(
            column.into(),
            CondValue::Many(values.into_iter().map(Into::into).collect()),
        );
        self
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn down_flag(mut self, flag: impl Into<String>) -> Self {
        self.down_flag = Some(flag.into());
        self
    }

    pub fn has_date_filter(&self) -> bool {
        self.start_date.is_some() || self.end_date.is_some()
    }
}

/// Row mask for `column IN values` (or `==` for a single value).
pub(crate) fn condition_mask(column: &Column, values: &[Scalar]) -> Result<Vec<bool>, QueryError> {
    let name = column.name().to_string();
    let mismatch = |expected: &str, actual: &Scalar| QueryError::TypeMismatch {
        column: name.clone(),
        expected: expected.to_string(),
        actual: actual.type_name().to_string(),
    };

    match column.dtype() {
        DataType::String => {
            let wanted = values
                .iter()
                .map(|v| match v {
                    Scalar::Str(s) => Ok(s.as_str()),
                    other => Err(mismatch("string", other)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            let ca = column.str().map_err(|e| read_failure(&name, e))?;
            Ok(ca
                .into_iter()
                .map(|v| v.is_some_and(|s| wanted.contains(&s)))
                .collect())
        }
        DataType::Int64 => {
            let wanted = values
                .iter()
                .map(|v| match v {
                    Scalar::Int(i) => Ok(*i),
                    other => Err(mismatch("int64", other)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            let ca = column.i64().map_err(|e| read_failure(&name, e))?;
            Ok(ca
                .into_iter()
                .map(|v| v.is_some_and(|i| wanted.contains(&i)))
                .collect())
        }
        DataType::Float64 => {
            let wanted = values
                .iter()
                .map(|v| match v {
                    Scalar::Float(f) => Ok(*f),
                    Scalar::Int(i) => Ok(*i as f64),
                    other => Err(mismatch("float64", other)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            let ca = column.f64().map_err(|e| read_failure(&name, e))?;
            Ok(ca
                .into_iter()
                .map(|v| v.is_some_and(|f| wanted.contains(&f)))
                .collect())
        }
        DataType::Boolean => {
            let wanted = values
                .iter()
                .map(|v| match v {
                    Scalar::Bool(b) => Ok(*b),
                    other => Err(mismatch("bool", other)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            let ca = column.bool().map_err(|e| read_failure(&name, e))?;
            Ok(ca
                .into_iter()
                .map(|v| v.is_some_and(|b| wanted.contains(&b)))
                .collect())
        }
        other => Err(QueryError::UnsupportedFilter {
            column: name,
            dtype: other.to_string(),
        }),
    }
}

/// Row mask for `start <= column <= end` over canonical date strings.
pub(crate) fn date_range_mask(
    column: &Column,
    start: Option<&str>,
    end: Option<&str>,
) -> Result<Vec<bool>, QueryError> {
    let name = column.name().to_string();
    let ca = column.str().map_err(|_| QueryError::TypeMismatch {
        column: name.clone(),
        expected: column.dtype().to_string(),
        actual: "date".to_string(),
    })?;
    Ok(ca
        .into_iter()
        .map(|v| match v {
            None => false,
            Some(s) => start.map_or(true, |lo| s >= lo) && end.map_or(true, |hi| s <= hi),
        })
        .collect())
}

fn read_failure(column: &str, e: PolarsError) -> QueryError {
    QueryError::Read {
        path: column.into(),
        reason: e.to_string(),
    }
}
