//! Shared record types for sheet synchronization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A cell edit made on the remote document, waiting to be pulled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub sheet: String,
    pub row: i64,
    pub col: u32,
    #[serde(default)]
    pub old_value: serde_json::Value,
    #[serde(default)]
    pub new_value: serde_json::Value,
    #[serde(default)]
    pub source: Option<String>,
}

/// Outcome recorded in the remote-origin audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Applied,
    Conflict,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Applied => "applied",
            AuditStatus::Conflict => "conflict",
        }
    }
}

/// A persisted remote change together with how it was resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub change: RemoteChange,
    pub status: AuditStatus,
    pub recorded_at: DateTime<Utc>,
}

/// A local mutation captured by the change tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangelogEntry {
    pub id: i64,
    pub table_name: String,
    pub row_id: i64,
    pub column_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub changed_at: DateTime<Utc>,
    pub pushed_to_sheet: bool,
    pub push_attempts: i64,
    pub last_push_error: Option<String>,
}

/// How often the pull side runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Only explicit calls sync.
    #[default]
    Manual,
    /// A recurring task syncs on an interval.
    Periodic,
    /// The remote side delivers changes as they happen.
    Realtime,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Manual => "manual",
            SyncMode::Periodic => "periodic",
            SyncMode::Realtime => "realtime",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "manual" => Ok(SyncMode::Manual),
            "periodic" => Ok(SyncMode::Periodic),
            "realtime" => Ok(SyncMode::Realtime),
            other => anyhow::bail!("Unknown sync mode: {}", other),
        }
    }
}

/// Singleton row describing the sync target and cumulative counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub remote_target: Option<String>,
    pub document_id: Option<String>,
    pub sync_mode: SyncMode,
    pub last_pull: Option<DateTime<Utc>>,
    pub last_push: Option<DateTime<Utc>>,
    pub total_pulls: i64,
    pub total_pushes: i64,
    pub total_conflicts: i64,
}

/// Local column type a remote value is cast to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Integer,
    Real,
    Boolean,
    Datetime,
    #[default]
    Text,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Integer => "integer",
            DataType::Real => "real",
            DataType::Boolean => "boolean",
            DataType::Datetime => "datetime",
            DataType::Text => "text",
        }
    }

    /// DuckDB column type used when a column of this kind is created.
    ///
    /// Datetimes are kept as RFC 3339 text like every other timestamp in the
    /// store, so a value that does not parse is stored verbatim.
    pub fn sql_type(&self) -> &'static str {
        match self {
            DataType::Integer => "BIGINT",
            DataType::Real => "DOUBLE",
            DataType::Boolean => "BOOLEAN",
            DataType::Datetime => "VARCHAR",
            DataType::Text => "VARCHAR",
        }
    }

    /// Kind of value a DuckDB column of type `sql_type` holds.
    pub fn from_sql_type(sql_type: &str) -> DataType {
        let sql_type = sql_type.trim().to_uppercase();
        match sql_type.as_str() {
            "BIGINT" | "INTEGER" | "SMALLINT" | "TINYINT" | "HUGEINT" | "UBIGINT" | "UINTEGER" => {
                DataType::Integer
            }
            "DOUBLE" | "FLOAT" | "REAL" => DataType::Real,
            "BOOLEAN" => DataType::Boolean,
            "DATE" => DataType::Datetime,
            s if s.starts_with("DECIMAL") => DataType::Real,
            s if s.starts_with("TIMESTAMP") => DataType::Datetime,
            _ => DataType::Text,
        }
    }
}

impl FromStr for DataType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "integer" | "int" | "bigint" => Ok(DataType::Integer),
            "real" | "float" | "double" => Ok(DataType::Real),
            "boolean" | "bool" => Ok(DataType::Boolean),
            "datetime" | "timestamp" | "date" => Ok(DataType::Datetime),
            "text" | "varchar" | "string" => Ok(DataType::Text),
            other => anyhow::bail!("Unknown data type: {}", other),
        }
    }
}

/// Where a remote column lands locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMapping {
    pub local_column: String,
    pub data_type: DataType,
}

/// What the schema resolver had to do to produce a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolveAction {
    Created,
    Renamed,
    Matched,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnResolution {
    pub action: ResolveAction,
    pub mapping: ColumnMapping,
}

/// Header text of one remote column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnHeader {
    pub index: u32,
    pub header: String,
}

/// A single cell write sent to the remote document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellUpdate {
    pub sheet: String,
    pub row: i64,
    pub col: u32,
    pub value: serde_json::Value,
}

/// Result of applying one remote change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeOutcome {
    pub applied: bool,
    pub conflict: bool,
    pub new_column: bool,
    pub renamed_column: bool,
}

/// Totals for one pull episode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResult {
    pub applied: usize,
    pub conflicts: usize,
    pub new_columns: usize,
    pub renamed_columns: usize,
    pub errors: Vec<String>,
}

impl PullResult {
    pub(crate) fn record(&mut self, outcome: &ChangeOutcome) {
        if outcome.applied {
            self.applied += 1;
        }
        if outcome.conflict {
            self.conflicts += 1;
        }
        if outcome.new_column {
            self.new_columns += 1;
        }
        if outcome.renamed_column {
            self.renamed_columns += 1;
        }
    }
}

/// Totals for one push episode, counted per cell change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResult {
    pub pushed: usize,
    pub failed: usize,
}

/// Both halves of a bidirectional cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BidirectionalResult {
    pub push: PushResult,
    pub pull: PullResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duckdb_type_names_map_back_to_kinds() {
        assert_eq!(DataType::from_sql_type("BIGINT"), DataType::Integer);
        assert_eq!(DataType::from_sql_type("DECIMAL(18,3)"), DataType::Real);
        assert_eq!(DataType::from_sql_type("boolean"), DataType::Boolean);
        assert_eq!(DataType::from_sql_type("TIMESTAMP WITH TIME ZONE"), DataType::Datetime);
        assert_eq!(DataType::from_sql_type(DataType::Datetime.sql_type()), DataType::Text);
        assert_eq!(DataType::from_sql_type("BLOB"), DataType::Text);
    }

    #[test]
    fn remote_change_uses_camel_case_wire_format() {
        let change: RemoteChange = serde_json::from_value(serde_json::json!({
            "id": "c-1",
            "timestamp": "2024-01-01T00:00:00Z",
            "sheet": "Sheet1",
            "row": 5,
            "col": 2,
            "oldValue": null,
            "newValue": "42",
            "source": "user@example.com"
        }))
        .unwrap();

        assert_eq!(change.row, 5);
        assert_eq!(change.new_value, serde_json::json!("42"));
        assert_eq!(change.timestamp.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn sync_mode_parses_case_insensitively() {
        assert_eq!("Periodic".parse::<SyncMode>().unwrap(), SyncMode::Periodic);
        assert_eq!(SyncMode::default(), SyncMode::Manual);
        assert!("hourly".parse::<SyncMode>().is_err());
    }

    #[test]
    fn pull_result_counts_outcomes() {
        let mut result = PullResult::default();
        result.record(&ChangeOutcome {
            applied: true,
            new_column: true,
            ..Default::default()
        });
        result.record(&ChangeOutcome {
            conflict: true,
            ..Default::default()
        });

        assert_eq!(result.applied, 1);
        assert_eq!(result.conflicts, 1);
        assert_eq!(result.new_columns, 1);
        assert_eq!(result.renamed_columns, 0);
    }
}
