//! Migration executor.
//!
//! Discovers ordered `NNNN_name.sql` files in a directory and applies each
//! pending one as a single transaction against a live connection, tracking
//! the applied set in a `schema_migrations` table. Everything goes through
//! the engine abstraction's public contract; this module never reaches into
//! queue internals.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::engine::{DatabaseHandle, EngineRegistry};
use crate::error::{DbError, DbResult};
use crate::models::{IsolationLevel, QueryRequest};

/// One discovered migration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub id: i64,
    pub name: String,
    pub path: PathBuf,
}

pub struct MigrationRunner {
    directory: PathBuf,
}

impl MigrationRunner {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Discover migration files, ordered by id. Files that do not match the
    /// `NNNN_name.sql` pattern are skipped with a log line; duplicate ids
    /// are an error.
    pub fn discover(&self) -> DbResult<Vec<MigrationFile>> {
        let entries = std::fs::read_dir(&self.directory).map_err(|e| {
            DbError::invalid_input(format!(
                "Cannot read migration directory {}: {}",
                self.directory.display(),
                e
            ))
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| DbError::internal(format!("Directory walk: {}", e)))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            match parse_migration_name(&path) {
                Some((id, name)) => files.push(MigrationFile { id, name, path }),
                None => {
                    warn!(file = %path.display(), "Skipping unrecognized migration file name");
                }
            }
        }
        files.sort_by_key(|f| f.id);

        for pair in files.windows(2) {
            if pair[0].id == pair[1].id {
                return Err(DbError::invalid_input(format!(
                    "Duplicate migration id {:04} ({} and {})",
                    pair[0].id,
                    pair[0].path.display(),
                    pair[1].path.display()
                )));
            }
        }
        Ok(files)
    }

    /// Apply every pending migration, each as its own transaction. Returns
    /// the number applied. A failure rolls back the failing migration and
    /// stops; already-applied migrations stay applied.
    pub async fn apply_pending(
        &self,
        registry: &EngineRegistry,
        handle: &mut DatabaseHandle,
        designator: &str,
    ) -> DbResult<u32> {
        self.ensure_tracking_table(registry, handle).await?;
        let applied = self.applied_ids(registry, handle).await?;
        let files = self.discover()?;

        let mut count = 0u32;
        for file in files {
            if applied.contains(&file.id) {
                continue;
            }
            info!(
                designator = designator,
                migration = %file.path.display(),
                "Applying migration"
            );
            let sql = tokio::fs::read_to_string(&file.path).await.map_err(|e| {
                DbError::invalid_input(format!("Cannot read {}: {}", file.path.display(), e))
            })?;

            registry
                .begin_transaction(handle, IsolationLevel::ReadCommitted)
                .await?;
            match self.apply_one(registry, handle, &file, &sql).await {
                Ok(()) => {
                    registry.commit_transaction(handle).await?;
                    count += 1;
                }
                Err(e) => {
                    warn!(
                        designator = designator,
                        migration = %file.path.display(),
                        error = %e,
                        "Migration failed; rolling back"
                    );
                    if let Err(rollback_err) = registry.rollback_transaction(handle).await {
                        warn!(
                            designator = designator,
                            error = %rollback_err,
                            "Rollback after failed migration also failed"
                        );
                    }
                    return Err(e);
                }
            }
        }

        info!(designator = designator, applied = count, "Migrations up to date");
        Ok(count)
    }

    async fn apply_one(
        &self,
        registry: &EngineRegistry,
        handle: &mut DatabaseHandle,
        file: &MigrationFile,
        sql: &str,
    ) -> DbResult<()> {
        for statement in split_statements(sql) {
            registry
                .execute(handle, &QueryRequest::new(statement))
                .await?;
        }
        let record = format!(
            "INSERT INTO schema_migrations (migration_id, name) VALUES ({}, '{}')",
            file.id,
            file.name.replace('\'', "''")
        );
        registry.execute(handle, &QueryRequest::new(record)).await?;
        Ok(())
    }

    async fn ensure_tracking_table(
        &self,
        registry: &EngineRegistry,
        handle: &mut DatabaseHandle,
    ) -> DbResult<()> {
        let create = QueryRequest::new(
            "CREATE TABLE IF NOT EXISTS schema_migrations (\
             migration_id BIGINT PRIMARY KEY, name VARCHAR(255))",
        );
        if let Err(e) = registry.execute(handle, &create).await {
            // Engines without IF NOT EXISTS report an existing table here.
            debug!(error = %e, "schema_migrations create skipped");
        }
        Ok(())
    }

    async fn applied_ids(
        &self,
        registry: &EngineRegistry,
        handle: &mut DatabaseHandle,
    ) -> DbResult<HashSet<i64>> {
        let result = registry
            .execute(
                handle,
                &QueryRequest::new("SELECT migration_id FROM schema_migrations"),
            )
            .await?;
        let mut ids = HashSet::new();
        for row in &result.rows {
            if let Some(id) = row.get("migration_id").and_then(|v| v.as_i64()) {
                ids.insert(id);
            }
        }
        Ok(ids)
    }
}

/// Parse `NNNN_name.sql` into (id, name).
fn parse_migration_name(path: &Path) -> Option<(i64, String)> {
    let stem = path.file_stem()?.to_str()?;
    let (id_part, name_part) = stem.split_once('_')?;
    let id: i64 = id_part.parse().ok()?;
    if name_part.is_empty() {
        return None;
    }
    Some((id, name_part.to_string()))
}

/// Split a migration file into statements on semicolons, skipping those
/// inside string literals. Empty fragments are dropped.
fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    for ch in sql.chars() {
        match ch {
            '\'' => {
                in_string = !in_string;
                current.push(ch);
            }
            ';' if !in_string => {
                let statement = current.trim().to_string();
                if !statement.is_empty() {
                    statements.push(statement);
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    let tail = current.trim().to_string();
    if !tail.is_empty() {
        statements.push(tail);
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineRegistry;
    use crate::models::{ConnectionConfig, EngineKind};
    use std::sync::Arc;

    #[test]
    fn test_parse_migration_name() {
        assert_eq!(
            parse_migration_name(Path::new("0001_create_users.sql")),
            Some((1, "create_users".to_string()))
        );
        assert_eq!(
            parse_migration_name(Path::new("0420_add_index.sql")),
            Some((420, "add_index".to_string()))
        );
        assert_eq!(parse_migration_name(Path::new("notamigration.sql")), None);
        assert_eq!(parse_migration_name(Path::new("0001_.sql")), None);
    }

    #[test]
    fn test_split_statements() {
        let sql = "CREATE TABLE a (x INT);\nINSERT INTO a VALUES (1);\n";
        let statements = split_statements(sql);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0], "CREATE TABLE a (x INT)");
    }

    #[test]
    fn test_split_statements_respects_strings() {
        let sql = "INSERT INTO a VALUES ('x;y');INSERT INTO a VALUES ('z')";
        let statements = split_statements(sql);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0], "INSERT INTO a VALUES ('x;y')");
    }

    #[tokio::test]
    async fn test_discover_orders_and_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0002_second.sql"), "SELECT 2;").unwrap();
        std::fs::write(dir.path().join("0001_first.sql"), "SELECT 1;").unwrap();
        std::fs::write(dir.path().join("README.md"), "not sql").unwrap();

        let runner = MigrationRunner::new(dir.path());
        let files = runner.discover().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].id, 1);
        assert_eq!(files[1].id, 2);

        std::fs::write(dir.path().join("0001_dup.sql"), "SELECT 1;").unwrap();
        assert!(runner.discover().is_err());
    }

    #[tokio::test]
    async fn test_apply_pending_is_incremental() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("0001_create.sql"),
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("0002_seed.sql"),
            "INSERT INTO users (name) VALUES ('alice');\nINSERT INTO users (name) VALUES ('bob');",
        )
        .unwrap();

        let registry = Arc::new(EngineRegistry::with_builtin_engines());
        let config = ConnectionConfig::from_connection_string(":memory:");
        let mut handle = registry
            .connect(EngineKind::SQLite, &config, Some("DQM-test-00-SMFC"))
            .await
            .unwrap();

        let runner = MigrationRunner::new(dir.path());
        let applied = runner
            .apply_pending(&registry, &mut handle, "DQM-test-00-SMFC")
            .await
            .unwrap();
        assert_eq!(applied, 2);

        // Re-running applies nothing further.
        let applied = runner
            .apply_pending(&registry, &mut handle, "DQM-test-00-SMFC")
            .await
            .unwrap();
        assert_eq!(applied, 0);

        let result = registry
            .execute(
                &mut handle,
                &QueryRequest::new("SELECT count(*) AS n FROM users"),
            )
            .await
            .unwrap();
        assert_eq!(
            result.rows[0].get("n").and_then(|v| v.as_i64()),
            Some(2)
        );
    }
}
