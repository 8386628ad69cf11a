//! Configuration handling.
//!
//! The binary parses CLI arguments and environment variables via `clap` and
//! loads the subsystem configuration from a JSON file; the library only
//! consumes the typed structs.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::engine::EngineRegistry;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionConfig, EngineKind, QueueKind};

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_MAX_DATABASES: usize = 10;

/// Command line interface for the router binary.
#[derive(Debug, Parser)]
#[command(
    name = "db-queue-router",
    about = "Multi-engine database queue subsystem",
    version
)]
pub struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, env = "DBQR_CONFIG")]
    pub config: PathBuf,

    /// Log filter, e.g. "info" or "db_queue_router=debug".
    #[arg(long, default_value = "info", env = "DBQR_LOG_LEVEL")]
    pub log_level: String,

    /// Emit JSON-formatted logs.
    #[arg(long, env = "DBQR_JSON_LOGS")]
    pub json_logs: bool,
}

/// Startup flag for one queue tier.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueTier {
    /// Whether this tier gets a dedicated worker at startup.
    #[serde(default)]
    pub start: bool,
}

/// Per-tier startup configuration for one database.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueStartup {
    #[serde(default)]
    pub slow: QueueTier,
    #[serde(default)]
    pub medium: QueueTier,
    #[serde(default)]
    pub fast: QueueTier,
    #[serde(default)]
    pub cache: QueueTier,
}

impl QueueStartup {
    /// Whether the given tier should get a dedicated worker at startup.
    pub fn starts(&self, kind: QueueKind) -> bool {
        match kind {
            QueueKind::Slow => self.slow.start,
            QueueKind::Medium => self.medium.start,
            QueueKind::Fast => self.fast.start,
            QueueKind::Cache => self.cache.start,
            QueueKind::Lead => false,
        }
    }
}

/// Configuration for one managed database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    /// Engine name ("postgresql", "mysql", "sqlite", "db2"). May be omitted
    /// when the connection string's form names the engine.
    #[serde(default)]
    pub engine: Option<String>,
    /// Full connection string, used verbatim when present.
    #[serde(default)]
    pub connection_string: Option<String>,
    /// Individual connection parameters, assembled into a connection string
    /// by the engine driver when no full string is given.
    #[serde(default)]
    pub connection: Option<ConnectionConfig>,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Executed once by the lead queue after its first connection.
    #[serde(default)]
    pub bootstrap_query: Option<String>,
    #[serde(default)]
    pub queues: QueueStartup,
}

fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

impl DatabaseConfig {
    /// Resolve the engine, from the explicit name or the connection string.
    pub fn engine_kind(&self) -> DbResult<EngineKind> {
        if let Some(name) = self.engine.as_deref() {
            return EngineKind::from_name(name)
                .ok_or_else(|| DbError::invalid_input(format!("Unknown engine '{}'", name)));
        }
        if let Some(s) = self.connection_string.as_deref() {
            return EngineKind::from_connection_string(s).ok_or_else(|| {
                DbError::invalid_input(format!(
                    "Cannot infer engine for '{}'; set the engine field",
                    self.name
                ))
            });
        }
        Err(DbError::invalid_input(format!(
            "Database '{}' names no engine and no connection string",
            self.name
        )))
    }

    /// The connection string for this database: the configured full string,
    /// or one assembled by the engine driver from the connection fields.
    pub fn resolved_connection_string(&self, registry: &EngineRegistry) -> DbResult<String> {
        let kind = self.engine_kind()?;
        if let Some(s) = self.connection_string.as_deref() {
            if !registry.validate_connection_string(kind, s) {
                return Err(DbError::invalid_input(format!(
                    "Invalid {} connection string for database '{}'",
                    kind, self.name
                )));
            }
            return Ok(s.to_string());
        }
        let connection = self.connection.as_ref().ok_or_else(|| {
            DbError::invalid_input(format!(
                "Database '{}' has neither connection string nor connection parameters",
                self.name
            ))
        })?;
        registry.build_connection_string(kind, connection)
    }
}

/// Top-level subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_max_databases")]
    pub max_databases: usize,
    pub databases: Vec<DatabaseConfig>,
}

fn default_max_databases() -> usize {
    DEFAULT_MAX_DATABASES
}

impl Config {
    /// Load and parse the JSON configuration file.
    pub fn from_file(path: &Path) -> DbResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            DbError::invalid_input(format!("Cannot read config {}: {}", path.display(), e))
        })?;
        let config: Config = serde_json::from_str(&contents).map_err(|e| {
            DbError::invalid_input(format!("Cannot parse config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the subsystem cannot start with.
    pub fn validate(&self) -> DbResult<()> {
        if self.max_databases == 0 {
            return Err(DbError::invalid_input("max_databases must be at least 1"));
        }
        if self.databases.len() > self.max_databases {
            return Err(DbError::capacity(format!(
                "{} databases configured, max_databases is {}",
                self.databases.len(),
                self.max_databases
            )));
        }
        let mut names = std::collections::HashSet::new();
        for db in &self.databases {
            if db.name.is_empty() {
                return Err(DbError::invalid_input("Database name cannot be empty"));
            }
            if !names.insert(db.name.as_str()) {
                return Err(DbError::invalid_input(format!(
                    "Duplicate database name '{}'",
                    db.name
                )));
            }
            db.engine_kind()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Config {
        serde_json::from_str(json).expect("config json")
    }

    #[test]
    fn test_minimal_config() {
        let config = parse(
            r#"{
                "databases": [
                    {"name": "orders", "engine": "sqlite", "connection_string": ":memory:"}
                ]
            }"#,
        );
        assert_eq!(config.max_databases, DEFAULT_MAX_DATABASES);
        assert_eq!(config.databases.len(), 1);
        assert_eq!(
            config.databases[0].engine_kind().unwrap(),
            EngineKind::SQLite
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_engine_inferred_from_connection_string() {
        let config = parse(
            r#"{
                "databases": [
                    {"name": "main", "connection_string": "postgres://u:p@h:5432/db"}
                ]
            }"#,
        );
        assert_eq!(
            config.databases[0].engine_kind().unwrap(),
            EngineKind::PostgreSQL
        );
    }

    #[test]
    fn test_queue_startup_flags() {
        let config = parse(
            r#"{
                "databases": [
                    {
                        "name": "orders",
                        "engine": "sqlite",
                        "connection_string": ":memory:",
                        "queues": {"fast": {"start": true}, "cache": {"start": true}}
                    }
                ]
            }"#,
        );
        let queues = &config.databases[0].queues;
        assert!(queues.starts(QueueKind::Fast));
        assert!(queues.starts(QueueKind::Cache));
        assert!(!queues.starts(QueueKind::Slow));
        assert!(!queues.starts(QueueKind::Lead));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let config = parse(
            r#"{
                "databases": [
                    {"name": "a", "engine": "sqlite", "connection_string": ":memory:"},
                    {"name": "a", "engine": "sqlite", "connection_string": ":memory:"}
                ]
            }"#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_too_many_databases_rejected() {
        let config = parse(
            r#"{
                "max_databases": 1,
                "databases": [
                    {"name": "a", "engine": "sqlite", "connection_string": ":memory:"},
                    {"name": "b", "engine": "sqlite", "connection_string": ":memory:"}
                ]
            }"#,
        );
        assert!(matches!(config.validate(), Err(DbError::Capacity { .. })));
    }

    #[test]
    fn test_unknown_engine_rejected() {
        let config = parse(
            r#"{
                "databases": [
                    {"name": "a", "engine": "oracle", "connection_string": "x"}
                ]
            }"#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolved_connection_string_validates() {
        let registry = EngineRegistry::with_builtin_engines();
        let config = parse(
            r#"{
                "databases": [
                    {"name": "a", "engine": "mysql", "connection_string": "not-a-url"}
                ]
            }"#,
        );
        assert!(
            config.databases[0]
                .resolved_connection_string(&registry)
                .is_err()
        );
    }
}
