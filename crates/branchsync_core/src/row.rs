//! Source row value model.
//!
//! Drivers convert whatever their wire types are into [`SourceValue`]s.
//! Column names are case-insensitive, as they are in SQL Server.

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single column value as read from the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SourceValue {
    /// SQL NULL.
    Null,
    /// `bit`.
    Bool(bool),
    /// Any integer type.
    Int(i64),
    /// `float`, `real`, `decimal`, `money`.
    Float(f64),
    /// Character data.
    Text(String),
    /// `datetime`/`datetime2`/`smalldatetime`, without offset.
    DateTime(NaiveDateTime),
    /// `datetimeoffset`.
    DateTimeOffset(DateTime<FixedOffset>),
}

impl SourceValue {
    /// Name of the value's type, for error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            SourceValue::Null => "null",
            SourceValue::Bool(_) => "bool",
            SourceValue::Int(_) => "int",
            SourceValue::Float(_) => "float",
            SourceValue::Text(_) => "text",
            SourceValue::DateTime(_) => "datetime",
            SourceValue::DateTimeOffset(_) => "datetimeoffset",
        }
    }

    /// Returns true for SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, SourceValue::Null)
    }
}

impl From<i64> for SourceValue {
    fn from(value: i64) -> Self {
        SourceValue::Int(value)
    }
}

impl From<f64> for SourceValue {
    fn from(value: f64) -> Self {
        SourceValue::Float(value)
    }
}

impl From<bool> for SourceValue {
    fn from(value: bool) -> Self {
        SourceValue::Bool(value)
    }
}

impl From<&str> for SourceValue {
    fn from(value: &str) -> Self {
        SourceValue::Text(value.to_string())
    }
}

impl From<String> for SourceValue {
    fn from(value: String) -> Self {
        SourceValue::Text(value)
    }
}

impl From<NaiveDateTime> for SourceValue {
    fn from(value: NaiveDateTime) -> Self {
        SourceValue::DateTime(value)
    }
}

impl<T: Into<SourceValue>> From<Option<T>> for SourceValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SourceValue::Null)
    }
}

/// One row from a source table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    columns: BTreeMap<String, SourceValue>,
}

impl SourceRow {
    /// Creates an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style column insert.
    pub fn with(mut self, column: &str, value: impl Into<SourceValue>) -> Self {
        self.set(column, value);
        self
    }

    /// Sets a column value.
    pub fn set(&mut self, column: &str, value: impl Into<SourceValue>) {
        self.columns.insert(column.to_ascii_lowercase(), value.into());
    }

    /// Returns a column value; absent columns are `None`.
    pub fn get(&self, column: &str) -> Option<&SourceValue> {
        self.columns.get(&column.to_ascii_lowercase())
    }

    /// Returns a column value, treating NULL as absent.
    pub fn non_null(&self, column: &str) -> Option<&SourceValue> {
        self.get(column).filter(|value| !value.is_null())
    }

    /// Removes a column (used to simulate schema drift).
    pub fn remove(&mut self, column: &str) -> Option<SourceValue> {
        self.columns.remove(&column.to_ascii_lowercase())
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true if the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Iterates columns in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SourceValue)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }
}
