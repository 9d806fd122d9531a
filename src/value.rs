//! Casting of loosely typed remote cell values into typed local values.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use duckdb::types::{ToSql, ToSqlOutput, Value};
use regex::Regex;
use serde_json::Value as JsonValue;
use std::sync::LazyLock;

use crate::types::DataType;

static TRUTHY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(true|yes|y|1|on|x)$").expect("truthy pattern is valid")
});

/// A typed cell value on the local side.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    DateTime(DateTime<Utc>),
    Text(String),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Text form stored in the change log.
    pub fn to_text(&self) -> Option<String> {
        match self {
            CellValue::Null => None,
            CellValue::Int(i) => Some(i.to_string()),
            CellValue::Float(f) => Some(f.to_string()),
            CellValue::Bool(b) => Some(b.to_string()),
            CellValue::DateTime(dt) => Some(format_timestamp(dt)),
            CellValue::Text(s) => Some(s.clone()),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            CellValue::Null => JsonValue::Null,
            CellValue::Int(i) => JsonValue::from(*i),
            CellValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            CellValue::Bool(b) => JsonValue::Bool(*b),
            CellValue::DateTime(dt) => JsonValue::String(format_timestamp(dt)),
            CellValue::Text(s) => JsonValue::String(s.clone()),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Int(value)
    }
}

impl ToSql for CellValue {
    fn to_sql(&self) -> duckdb::Result<ToSqlOutput<'_>> {
        let value = match self {
            CellValue::Null => Value::Null,
            CellValue::Int(i) => Value::BigInt(*i),
            CellValue::Float(f) => Value::Double(*f),
            CellValue::Bool(b) => Value::Boolean(*b),
            // DuckDB casts the text to the column type on assignment.
            CellValue::DateTime(dt) => Value::Text(format_timestamp(dt)),
            CellValue::Text(s) => Value::Text(s.clone()),
        };
        Ok(ToSqlOutput::Owned(value))
    }
}

/// Cast a remote scalar to the local representation of `data_type`.
pub fn cast_value(raw: &JsonValue, data_type: DataType) -> CellValue {
    if raw.is_null() {
        return CellValue::Null;
    }
    if data_type != DataType::Text && raw.as_str().is_some_and(|s| s.trim().is_empty()) {
        return CellValue::Null;
    }

    match data_type {
        DataType::Integer => to_integer(raw),
        DataType::Real => to_real(raw),
        DataType::Boolean => to_boolean(raw),
        DataType::Datetime => to_datetime(raw),
        DataType::Text => to_text(raw),
    }
}

fn to_integer(raw: &JsonValue) -> CellValue {
    match raw {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .map(CellValue::Int)
            .unwrap_or(CellValue::Null),
        JsonValue::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map(|f| f.trunc() as i64)
                })
                .map(CellValue::Int)
                .unwrap_or(CellValue::Null)
        }
        _ => CellValue::Null,
    }
}

fn to_real(raw: &JsonValue) -> CellValue {
    match raw {
        JsonValue::Number(n) => n.as_f64().map(CellValue::Float).unwrap_or(CellValue::Null),
        JsonValue::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(CellValue::Float)
            .unwrap_or(CellValue::Null),
        _ => CellValue::Null,
    }
}

fn to_boolean(raw: &JsonValue) -> CellValue {
    match raw {
        JsonValue::Bool(b) => CellValue::Bool(*b),
        JsonValue::Number(n) => CellValue::Bool(n.as_f64().is_some_and(|f| f != 0.0)),
        JsonValue::String(s) => CellValue::Bool(TRUTHY.is_match(s.trim())),
        _ => CellValue::Null,
    }
}

fn to_datetime(raw: &JsonValue) -> CellValue {
    match raw {
        JsonValue::String(s) => parse_datetime(s.trim())
            .map(CellValue::DateTime)
            .unwrap_or_else(|| CellValue::Text(s.clone())),
        other => to_text(other),
    }
}

fn to_text(raw: &JsonValue) -> CellValue {
    match raw {
        JsonValue::Null => CellValue::Null,
        JsonValue::String(s) => CellValue::Text(s.clone()),
        other => CellValue::Text(other.to_string()),
    }
}

/// Parse the datetime shapes spreadsheets commonly emit, all taken as UTC.
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Canonical text form for timestamps kept in the store.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}
