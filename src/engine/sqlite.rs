//! SQLite engine driver.
//!
//! Implements the engine contract over a dedicated `sqlx::SqliteConnection`.
//! Connection strings are filesystem paths or the literal `:memory:`.
//! SQLite has no named server-side prepared statements, so the prepared
//! cache is connection-local and `execute_prepared` runs the cached template
//! through the regular (still parameter-bound) query path.

use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions};
use sqlx::{ConnectOptions, Connection, Executor};
use tracing::{debug, error, warn};

use crate::error::{DbError, DbResult};
use crate::models::{
    ConnectionConfig, EngineKind, IsolationLevel, PreparedStatement, QueryParam, QueryRequest,
    QueryResult, Transaction,
};

use super::types::RowToJson;
use super::{
    DatabaseEngine, DatabaseHandle, EngineCapabilities, EngineConnection,
    ensure_no_active_transaction, returns_rows, take_active_transaction, validate_statement_name,
    with_timeout,
};

pub struct SqliteEngine {
    capabilities: EngineCapabilities,
}

impl SqliteEngine {
    pub fn new() -> Self {
        Self {
            capabilities: EngineCapabilities {
                native_ping: true,
                native_prepare: false,
                statement_timeout: false,
                server_side_escape: false,
            },
        }
    }
}

impl Default for SqliteEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn sqlite_conn(handle: &mut DatabaseHandle) -> DbResult<&mut sqlx::SqliteConnection> {
    match handle.conn.as_mut() {
        Some(EngineConnection::Sqlite(conn)) => Ok(conn),
        Some(_) => Err(DbError::internal(
            "Connection handle does not belong to the SQLite engine",
        )),
        None => Err(DbError::connection("Connection is not established")),
    }
}

fn bind_param<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
    }
}

async fn run_query(
    conn: &mut sqlx::SqliteConnection,
    request: &QueryRequest,
    started: Instant,
) -> DbResult<QueryResult> {
    let sql = request.sql_template.as_str();
    let timeout = Duration::from_secs(request.effective_timeout_secs());

    if returns_rows(sql) {
        let rows = if request.params.is_empty() {
            with_timeout("query execution", timeout, (&mut *conn).fetch_all(sql)).await?
        } else {
            let mut query = sqlx::query(sql);
            for param in &request.params {
                query = bind_param(query, param);
            }
            with_timeout("query execution", timeout, query.fetch_all(&mut *conn)).await?
        };

        let execution_time_ms = started.elapsed().as_millis() as u64;
        if rows.is_empty() {
            return Ok(QueryResult::empty(execution_time_ms));
        }
        Ok(QueryResult {
            columns: rows[0].column_names(),
            rows: rows.iter().map(|r| r.to_json_map()).collect(),
            rows_affected: None,
            execution_time_ms,
        })
    } else {
        let result = if request.params.is_empty() {
            with_timeout("write execution", timeout, (&mut *conn).execute(sql)).await?
        } else {
            let mut query = sqlx::query(sql);
            for param in &request.params {
                query = bind_param(query, param);
            }
            with_timeout("write execution", timeout, query.execute(&mut *conn)).await?
        };
        Ok(QueryResult::write_result(
            result.rows_affected(),
            started.elapsed().as_millis() as u64,
        ))
    }
}

#[async_trait]
impl DatabaseEngine for SqliteEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::SQLite
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn capabilities(&self) -> EngineCapabilities {
        self.capabilities
    }

    async fn connect(
        &self,
        config: &ConnectionConfig,
        designator: Option<&str>,
    ) -> DbResult<DatabaseHandle> {
        let conn_string = self.build_connection_string(config)?;
        let options = SqliteConnectOptions::from_str(&conn_string)
            .map_err(|e| DbError::connection(format!("Invalid SQLite connection string: {}", e)))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(config.effective_timeout_secs()));

        let connect_timeout = Duration::from_secs(config.effective_timeout_secs());
        let conn = match tokio::time::timeout(connect_timeout, options.connect()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                error!(
                    designator = designator.unwrap_or("database"),
                    error = %e,
                    "SQLite open failed"
                );
                return Err(DbError::from(e));
            }
            Err(_) => {
                return Err(DbError::timeout("connect", connect_timeout.as_secs()));
            }
        };

        debug!(
            designator = designator.unwrap_or("database"),
            "SQLite connection established"
        );
        Ok(DatabaseHandle::new(
            EngineKind::SQLite,
            EngineConnection::Sqlite(conn),
            config.clone(),
            designator,
        ))
    }

    async fn disconnect(&self, handle: &mut DatabaseHandle) -> DbResult<()> {
        match handle.conn.take() {
            Some(EngineConnection::Sqlite(conn)) => {
                if let Err(e) = conn.close().await {
                    warn!(designator = handle.designator(), error = %e, "Close failed");
                }
            }
            Some(other) => {
                handle.conn = Some(other);
                return Err(DbError::internal(
                    "Connection handle does not belong to the SQLite engine",
                ));
            }
            None => {}
        }
        handle.mark_disconnected();
        Ok(())
    }

    async fn health_check(&self, handle: &mut DatabaseHandle) -> DbResult<()> {
        let timeout = Duration::from_secs(handle.config().effective_timeout_secs());
        let conn = sqlite_conn(handle)?;
        match with_timeout("health check", timeout, conn.ping()).await {
            Ok(()) => {
                handle.record_health_success();
                Ok(())
            }
            Err(e) => {
                handle.record_health_failure();
                Err(e)
            }
        }
    }

    async fn reset_connection(&self, handle: &mut DatabaseHandle) -> DbResult<()> {
        // No reset semantics for an embedded database; clear failure
        // tracking and keep the handle as-is.
        if handle.current_transaction.is_some() {
            let _ = self.rollback_transaction(handle).await;
        }
        handle.clear_failures();
        handle.mark_connected();
        Ok(())
    }

    async fn execute_query(
        &self,
        handle: &mut DatabaseHandle,
        request: &QueryRequest,
    ) -> DbResult<QueryResult> {
        let started = Instant::now();
        let conn = sqlite_conn(handle)?;
        run_query(conn, request, started).await
    }

    async fn execute_prepared(
        &self,
        handle: &mut DatabaseHandle,
        statement_name: &str,
        request: &QueryRequest,
    ) -> DbResult<QueryResult> {
        let template = handle
            .find_statement(statement_name)
            .map(|s| s.sql_template.clone())
            .ok_or_else(|| {
                DbError::invalid_input(format!(
                    "Statement '{}' is not prepared on this connection",
                    statement_name
                ))
            })?;
        let started = Instant::now();
        let prepared_request = QueryRequest {
            sql_template: template,
            params: request.params.clone(),
            prepared_statement_name: None,
            timeout_secs: request.timeout_secs,
        };
        let conn = sqlite_conn(handle)?;
        let result = run_query(conn, &prepared_request, started).await?;
        handle.bump_statement_usage(statement_name);
        Ok(result)
    }

    async fn begin_transaction(
        &self,
        handle: &mut DatabaseHandle,
        level: IsolationLevel,
    ) -> DbResult<Transaction> {
        ensure_no_active_transaction(handle)?;
        let timeout = Duration::from_secs(handle.config().effective_timeout_secs());
        // SQLite transactions are serializable by nature; the requested
        // level is recorded on the transaction for uniformity.
        let conn = sqlite_conn(handle)?;
        with_timeout("begin transaction", timeout, (&mut *conn).execute("BEGIN")).await?;
        let tx = Transaction::begin(level);
        handle.current_transaction = Some(tx.clone());
        Ok(tx)
    }

    async fn commit_transaction(&self, handle: &mut DatabaseHandle) -> DbResult<Transaction> {
        let mut tx = take_active_transaction(handle)?;
        let timeout = Duration::from_secs(handle.config().effective_timeout_secs());
        let conn = match sqlite_conn(handle) {
            Ok(conn) => conn,
            Err(e) => {
                handle.current_transaction = Some(tx);
                return Err(e);
            }
        };
        match with_timeout("commit", timeout, (&mut *conn).execute("COMMIT")).await {
            Ok(_) => {
                tx.active = false;
                Ok(tx)
            }
            Err(e) => {
                error!(
                    designator = handle.designator(),
                    transaction_id = %tx.transaction_id,
                    error = %e,
                    "Commit failed"
                );
                handle.current_transaction = Some(tx);
                Err(e)
            }
        }
    }

    async fn rollback_transaction(&self, handle: &mut DatabaseHandle) -> DbResult<Transaction> {
        let mut tx = take_active_transaction(handle)?;
        let timeout = Duration::from_secs(handle.config().effective_timeout_secs());
        let conn = match sqlite_conn(handle) {
            Ok(conn) => conn,
            Err(e) => {
                handle.current_transaction = Some(tx);
                return Err(e);
            }
        };
        match with_timeout("rollback", timeout, (&mut *conn).execute("ROLLBACK")).await {
            Ok(_) => {
                tx.active = false;
                Ok(tx)
            }
            Err(e) => {
                error!(
                    designator = handle.designator(),
                    transaction_id = %tx.transaction_id,
                    error = %e,
                    "Rollback failed"
                );
                handle.current_transaction = Some(tx);
                Err(e)
            }
        }
    }

    async fn prepare_statement(
        &self,
        handle: &mut DatabaseHandle,
        name: &str,
        sql: &str,
    ) -> DbResult<()> {
        validate_statement_name(name)?;
        // Cache-only: SQLite has no named server-side prepared statements.
        handle.cache_statement(PreparedStatement::new(name, sql));
        Ok(())
    }

    async fn unprepare_statement(&self, handle: &mut DatabaseHandle, name: &str) -> DbResult<()> {
        validate_statement_name(name)?;
        if handle.uncache_statement(name).is_none() {
            return Err(DbError::invalid_input(format!(
                "Statement '{}' is not prepared on this connection",
                name
            )));
        }
        Ok(())
    }

    fn build_connection_string(&self, config: &ConnectionConfig) -> DbResult<String> {
        if let Some(s) = config.connection_string.as_deref() {
            return Ok(normalize_sqlite_path(s));
        }
        let database = config
            .database
            .as_deref()
            .ok_or_else(|| DbError::invalid_input("SQLite connection requires a database path"))?;
        Ok(normalize_sqlite_path(database))
    }

    fn validate_connection_string(&self, connection_string: &str) -> bool {
        let s = connection_string.trim();
        if s.is_empty() {
            return false;
        }
        if s == ":memory:" || s == "sqlite::memory:" {
            return true;
        }
        let path = s.strip_prefix("sqlite://").or_else(|| s.strip_prefix("sqlite:")).unwrap_or(s);
        // A filesystem path: anything without a foreign URL scheme.
        !path.is_empty() && !path.contains("://")
    }

    fn escape_string(&self, _handle: &DatabaseHandle, input: &str) -> String {
        input.replace('\'', "''")
    }
}

/// Accept bare paths and `:memory:` alongside the `sqlite:` URL form sqlx
/// expects.
fn normalize_sqlite_path(s: &str) -> String {
    if s == ":memory:" {
        return "sqlite::memory:".to_string();
    }
    if s.starts_with("sqlite:") {
        return s.to_string();
    }
    format!("sqlite:{}", s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> SqliteEngine {
        SqliteEngine::new()
    }

    #[test]
    fn test_normalize_sqlite_path() {
        assert_eq!(normalize_sqlite_path(":memory:"), "sqlite::memory:");
        assert_eq!(normalize_sqlite_path("data.db"), "sqlite:data.db");
        assert_eq!(normalize_sqlite_path("sqlite:data.db"), "sqlite:data.db");
    }

    #[test]
    fn test_validate_connection_string() {
        let e = engine();
        assert!(e.validate_connection_string(":memory:"));
        assert!(e.validate_connection_string("/var/lib/app/data.db"));
        assert!(e.validate_connection_string("sqlite:data.db"));
        assert!(!e.validate_connection_string(""));
        assert!(!e.validate_connection_string("postgres://localhost/db"));
    }

    #[test]
    fn test_round_trip_connection_string() {
        let e = engine();
        let config = ConnectionConfig {
            database: Some("orders.db".to_string()),
            ..ConnectionConfig::default()
        };
        let built = e.build_connection_string(&config).unwrap();
        assert!(e.validate_connection_string(&built));
    }

    #[tokio::test]
    async fn test_connect_execute_and_disconnect_in_memory() {
        let e = engine();
        let config = ConnectionConfig::from_connection_string(":memory:");
        let mut handle = e.connect(&config, Some("DQM-test-00-SMFC")).await.unwrap();
        assert!(handle.is_connected());

        let create = QueryRequest::new("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)");
        e.execute_query(&mut handle, &create).await.unwrap();

        let insert = QueryRequest::new("INSERT INTO t (name) VALUES (?1)")
            .with_param(QueryParam::String("widget".to_string()));
        let result = e.execute_query(&mut handle, &insert).await.unwrap();
        assert_eq!(result.rows_affected, Some(1));

        let select = QueryRequest::new("SELECT id, name FROM t");
        let result = e.execute_query(&mut handle, &select).await.unwrap();
        assert_eq!(result.row_count(), 1);
        assert_eq!(result.column_count(), 2);
        assert_eq!(result.columns, vec!["id", "name"]);

        e.disconnect(&mut handle).await.unwrap();
        assert!(!handle.is_connected());
        // Disconnect is idempotent at the wrapper level.
        e.disconnect(&mut handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_transaction_exclusivity() {
        let e = engine();
        let config = ConnectionConfig::from_connection_string(":memory:");
        let mut handle = e.connect(&config, None).await.unwrap();

        let tx = e
            .begin_transaction(&mut handle, IsolationLevel::Serializable)
            .await
            .unwrap();
        assert!(tx.active);

        let second = e
            .begin_transaction(&mut handle, IsolationLevel::Serializable)
            .await;
        assert!(matches!(second, Err(DbError::Transaction { .. })));
        assert!(handle.current_transaction().is_some_and(|t| t.active));

        let finished = e.commit_transaction(&mut handle).await.unwrap();
        assert!(!finished.active);
        assert!(handle.current_transaction().is_none());
    }

    #[tokio::test]
    async fn test_prepared_statement_cache_round_trip() {
        let e = engine();
        let config = ConnectionConfig::from_connection_string(":memory:");
        let mut handle = e.connect(&config, None).await.unwrap();
        e.execute_query(&mut handle, &QueryRequest::new("CREATE TABLE t (n INTEGER)"))
            .await
            .unwrap();

        e.prepare_statement(&mut handle, "ins_t", "INSERT INTO t (n) VALUES (?1)")
            .await
            .unwrap();
        assert!(handle.find_statement("ins_t").is_some());

        // Dedup on insert: preparing the same name again is a no-op.
        e.prepare_statement(&mut handle, "ins_t", "INSERT INTO t (n) VALUES (?1)")
            .await
            .unwrap();
        assert_eq!(handle.prepared_statements().len(), 1);

        let request = QueryRequest::new("").with_param(QueryParam::Int(7));
        let result = e.execute_prepared(&mut handle, "ins_t", &request).await.unwrap();
        assert_eq!(result.rows_affected, Some(1));
        assert_eq!(handle.find_statement("ins_t").map(|s| s.usage_count), Some(1));

        e.unprepare_statement(&mut handle, "ins_t").await.unwrap();
        assert!(handle.find_statement("ins_t").is_none());
        assert!(e.unprepare_statement(&mut handle, "ins_t").await.is_err());
    }

    #[tokio::test]
    async fn test_health_check_updates_counters() {
        let e = engine();
        let config = ConnectionConfig::from_connection_string(":memory:");
        let mut handle = e.connect(&config, None).await.unwrap();
        e.health_check(&mut handle).await.unwrap();
        assert_eq!(handle.consecutive_failures(), 0);
        assert!(handle.last_health_check().is_some());
    }
}
