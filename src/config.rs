//! File-based configuration.
//!
//! Every field has a default, so an empty or missing file yields a usable
//! configuration for local-only commands. Remote commands additionally need
//! `remote.endpoint` and `remote.document_id`.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::pull::DEFAULT_HEADER_ROW;
use crate::push::DEFAULT_PUSH_BATCH_LIMIT;
use crate::types::SyncMode;

const APP_NAME: &str = "sheet-sync";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub database: DatabaseConfig,
    pub remote: RemoteConfig,
    pub sync: SyncSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// DuckDB file holding synced tables and sync bookkeeping.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let path = project_dirs()
            .map(|dirs| dirs.data_dir().join("sheet-sync.duckdb"))
            .unwrap_or_else(|| PathBuf::from("sheet-sync.duckdb"));
        Self { path }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// RPC endpoint of the remote document.
    pub endpoint: String,
    pub document_id: String,
    /// Address the remote side uses to deliver realtime changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            document_id: String::new(),
            target_url: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub mode: SyncMode,
    pub interval_ms: u64,
    pub header_row: i64,
    pub push_batch_limit: usize,
    /// Tables whose columns get change tracking at startup.
    pub tables: Vec<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            mode: SyncMode::Manual,
            interval_ms: 60_000,
            header_row: DEFAULT_HEADER_ROW,
            push_batch_limit: DEFAULT_PUSH_BATCH_LIMIT,
            tables: Vec::new(),
        }
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `tracing` filter, overridden by `RUST_LOG`.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl SyncConfig {
    /// `<config dir>/sheet-sync/config.toml` for the current user.
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load and validate the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: SyncConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else the default path if that file exists, else
    /// defaults.
    pub fn discover(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.mode == SyncMode::Periodic && self.sync.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sync.interval_ms must be positive in periodic mode".to_string(),
            ));
        }
        if self.sync.header_row < 1 {
            return Err(ConfigError::Invalid(format!(
                "sync.header_row must be at least 1, got {}",
                self.sync.header_row
            )));
        }
        if self.sync.push_batch_limit == 0 {
            return Err(ConfigError::Invalid(
                "sync.push_batch_limit must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Check the fields needed to reach the remote document.
    pub fn require_remote(&self) -> Result<(), ConfigError> {
        if self.remote.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("remote.endpoint is not set".to_string()));
        }
        if self.remote.document_id.trim().is_empty() {
            return Err(ConfigError::Invalid("remote.document_id is not set".to_string()));
        }
        Ok(())
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn empty_file_gives_defaults() {
        let file = write_config("");
        let config = SyncConfig::load(file.path()).unwrap();

        assert_eq!(config.sync.mode, SyncMode::Manual);
        assert_eq!(config.sync.header_row, 1);
        assert_eq!(config.sync.push_batch_limit, DEFAULT_PUSH_BATCH_LIMIT);
        assert_eq!(config.remote.timeout_secs, 30);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn parses_all_sections() {
        let file = write_config(
            r#"
[database]
path = "/tmp/sync.duckdb"

[remote]
endpoint = "https://example.test/rpc"
document_id = "doc-1"
target_url = "https://tunnel.example.test"

[sync]
mode = "periodic"
interval_ms = 5000
tables = ["items", "orders"]

[logging]
level = "debug"
"#,
        );
        let config = SyncConfig::load(file.path()).unwrap();

        assert_eq!(config.database.path, PathBuf::from("/tmp/sync.duckdb"));
        assert_eq!(config.remote.document_id, "doc-1");
        assert_eq!(
            config.remote.target_url.as_deref(),
            Some("https://tunnel.example.test")
        );
        assert_eq!(config.sync.mode, SyncMode::Periodic);
        assert_eq!(config.sync.interval(), Duration::from_secs(5));
        assert_eq!(config.sync.tables, vec!["items", "orders"]);
        assert_eq!(config.logging.level, "debug");
        config.require_remote().unwrap();
    }

    #[test]
    fn rejects_zero_interval_in_periodic_mode() {
        let file = write_config("[sync]\nmode = \"periodic\"\ninterval_ms = 0\n");
        let err = SyncConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn reports_parse_errors_with_path() {
        let file = write_config("[sync\nmode = ");
        let err = SyncConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = SyncConfig::discover(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn remote_fields_are_required_for_remote_commands() {
        let config = SyncConfig::default();
        assert!(config.require_remote().is_err());
    }
}
