//! Engine abstraction layer.
//!
//! Provides the uniform driver contract implemented by every backend
//! (PostgreSQL, MySQL, SQLite, DB2), the connection handle that carries a
//! backend's private state, and the process-wide engine registry through
//! which all dispatch flows.
//!
//! Dispatch fails closed: any operation against an unregistered engine, or
//! against a handle whose backend state does not match the driver, returns
//! an error and performs no side effect.

pub mod db2;
pub mod mysql;
pub mod postgres;
pub mod sqlite;
pub mod types;

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{DbError, DbResult};
use crate::models::connection::ENGINE_KIND_COUNT;
use crate::models::{
    ConnectionConfig, ConnectionStatus, EngineKind, IsolationLevel, PreparedStatement, QueryRequest,
    QueryResult, Transaction,
};

pub use db2::Db2Engine;
pub use mysql::MySqlEngine;
pub use postgres::PostgresEngine;
pub use sqlite::SqliteEngine;

/// What a driver can do natively, decided once at driver construction (or,
/// for DB2, at native-library load) and consulted instead of re-probing on
/// every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineCapabilities {
    /// Lightweight liveness ping without issuing SQL.
    pub native_ping: bool,
    /// Real server-side prepared statements (named PREPARE/DEALLOCATE).
    pub native_prepare: bool,
    /// Statement-level timeout configurable on the session.
    pub statement_timeout: bool,
    /// Escaping that depends on server-side connection state.
    pub server_side_escape: bool,
}

/// Engine-private connection state. A closed sum over the four backends;
/// each driver only ever operates on its own variant.
pub enum EngineConnection {
    Postgres(sqlx::PgConnection),
    MySql(sqlx::MySqlConnection),
    Sqlite(sqlx::SqliteConnection),
    Db2(db2::Db2Connection),
}

impl EngineConnection {
    /// The engine this state belongs to.
    pub fn kind(&self) -> EngineKind {
        match self {
            Self::Postgres(_) => EngineKind::PostgreSQL,
            Self::MySql(_) => EngineKind::MySQL,
            Self::Sqlite(_) => EngineKind::SQLite,
            Self::Db2(_) => EngineKind::DB2,
        }
    }
}

/// One live backend connection.
///
/// Invariant: `conn` is `Some` exactly while `status == Connected`, and only
/// the driver matching `engine_kind` ever operates on it. Exclusive use is
/// structural: the owning queue keeps the handle behind an async mutex, so a
/// connection is used by one worker at a time.
pub struct DatabaseHandle {
    engine_kind: EngineKind,
    pub(crate) conn: Option<EngineConnection>,
    config: ConnectionConfig,
    status: ConnectionStatus,
    connected_since: Option<DateTime<Utc>>,
    pub(crate) current_transaction: Option<Transaction>,
    prepared_statements: Vec<PreparedStatement>,
    last_health_check: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    designator: Option<String>,
}

impl DatabaseHandle {
    pub(crate) fn new(
        engine_kind: EngineKind,
        conn: EngineConnection,
        config: ConnectionConfig,
        designator: Option<&str>,
    ) -> Self {
        Self {
            engine_kind,
            conn: Some(conn),
            config,
            status: ConnectionStatus::Connected,
            connected_since: Some(Utc::now()),
            current_transaction: None,
            prepared_statements: Vec::new(),
            last_health_check: None,
            consecutive_failures: 0,
            designator: designator.map(String::from),
        }
    }

    /// A handle with no native connection, in Disconnected state. Used for
    /// operations that do not require a live connection and for exercising
    /// fail-closed paths.
    pub fn detached(engine_kind: EngineKind, config: ConnectionConfig) -> Self {
        Self {
            engine_kind,
            conn: None,
            config,
            status: ConnectionStatus::Disconnected,
            connected_since: None,
            current_transaction: None,
            prepared_statements: Vec::new(),
            last_health_check: None,
            consecutive_failures: 0,
            designator: None,
        }
    }

    pub fn engine_kind(&self) -> EngineKind {
        self.engine_kind
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn connected_since(&self) -> Option<DateTime<Utc>> {
        self.connected_since
    }

    pub fn current_transaction(&self) -> Option<&Transaction> {
        self.current_transaction.as_ref()
    }

    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        self.last_health_check
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Logging label for lines tied to this connection.
    pub fn designator(&self) -> &str {
        self.designator.as_deref().unwrap_or("database")
    }

    pub fn prepared_statements(&self) -> &[PreparedStatement] {
        &self.prepared_statements
    }

    pub(crate) fn mark_disconnected(&mut self) {
        self.conn = None;
        self.status = ConnectionStatus::Disconnected;
        self.connected_since = None;
    }

    pub(crate) fn mark_connected(&mut self) {
        if self.conn.is_some() {
            self.status = ConnectionStatus::Connected;
        }
    }

    pub(crate) fn record_health_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_health_check = Some(Utc::now());
    }

    pub(crate) fn record_health_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub(crate) fn clear_failures(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Cache a prepared statement. Linear dedup on insert: caching an
    /// already-present name is a no-op returning `false`.
    pub(crate) fn cache_statement(&mut self, stmt: PreparedStatement) -> bool {
        if self.find_statement(&stmt.name).is_some() {
            return false;
        }
        self.prepared_statements.push(stmt);
        true
    }

    pub(crate) fn uncache_statement(&mut self, name: &str) -> Option<PreparedStatement> {
        let idx = self.prepared_statements.iter().position(|s| s.name == name)?;
        Some(self.prepared_statements.swap_remove(idx))
    }

    pub fn find_statement(&self, name: &str) -> Option<&PreparedStatement> {
        self.prepared_statements.iter().find(|s| s.name == name)
    }

    pub(crate) fn bump_statement_usage(&mut self, name: &str) {
        if let Some(stmt) = self.prepared_statements.iter_mut().find(|s| s.name == name) {
            stmt.usage_count += 1;
        }
    }
}

/// Whether a SQL statement is expected to produce a row set. Statements that
/// do not are executed through the write path so affected-row counts are
/// reported.
pub(crate) fn returns_rows(sql: &str) -> bool {
    let first_word = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_uppercase();
    matches!(
        first_word.as_str(),
        "SELECT" | "WITH" | "SHOW" | "EXPLAIN" | "PRAGMA" | "VALUES" | "DESCRIBE"
    )
}

/// Run a native future under a bounded timeout, mapping both failure modes
/// into the error taxonomy. The timeout here is future-level: a wedged
/// native call inside a blocking task is detected, not interrupted.
pub(crate) async fn with_timeout<T, F>(
    operation: &str,
    duration: std::time::Duration,
    future: F,
) -> DbResult<T>
where
    F: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(DbError::from(e)),
        Err(_) => Err(DbError::timeout(operation, duration.as_secs())),
    }
}

/// Validate a prepared-statement name before it is spliced into PREPARE /
/// DEALLOCATE statements.
pub(crate) fn validate_statement_name(name: &str) -> DbResult<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        || name.chars().next().is_some_and(|c| c.is_ascii_digit())
    {
        return Err(DbError::invalid_input(format!(
            "Invalid prepared statement name: '{}'",
            name
        )));
    }
    Ok(())
}

/// Returns an error when the handle already carries an active transaction.
pub(crate) fn ensure_no_active_transaction(handle: &DatabaseHandle) -> DbResult<()> {
    if let Some(tx) = handle.current_transaction() {
        if tx.active {
            return Err(DbError::transaction(
                "Connection already has an active transaction",
                tx.transaction_id.clone(),
            ));
        }
    }
    Ok(())
}

/// Takes the active transaction off the handle, or errors.
pub(crate) fn take_active_transaction(handle: &mut DatabaseHandle) -> DbResult<Transaction> {
    match handle.current_transaction.take() {
        Some(tx) if tx.active => Ok(tx),
        Some(tx) => {
            let id = tx.transaction_id.clone();
            handle.current_transaction = Some(tx);
            Err(DbError::transaction("Transaction is no longer active", id))
        }
        None => Err(DbError::transaction("No active transaction", "none")),
    }
}

/// The uniform capability contract implemented by every backend driver.
///
/// Drivers are immutable after registration and never unregistered during
/// normal operation.
#[async_trait]
pub trait DatabaseEngine: Send + Sync {
    fn kind(&self) -> EngineKind;
    fn name(&self) -> &'static str;
    fn capabilities(&self) -> EngineCapabilities;

    /// Open a dedicated backend connection. `designator` is an optional
    /// logging label propagated into the handle. On failure nothing is
    /// leaked: any partially constructed state is dropped before returning.
    async fn connect(
        &self,
        config: &ConnectionConfig,
        designator: Option<&str>,
    ) -> DbResult<DatabaseHandle>;

    /// Release the native connection. Safe to call on a handle that is
    /// already disconnected.
    async fn disconnect(&self, handle: &mut DatabaseHandle) -> DbResult<()>;

    /// Liveness check: native ping when available, otherwise a trivial
    /// query under a bounded timeout. Updates the handle's failure counter.
    async fn health_check(&self, handle: &mut DatabaseHandle) -> DbResult<()>;

    /// Best-effort recovery. Engines without meaningful reset semantics
    /// clear the failure counter and re-mark the handle Connected; a new
    /// native connection is never fabricated silently.
    async fn reset_connection(&self, handle: &mut DatabaseHandle) -> DbResult<()>;

    async fn execute_query(
        &self,
        handle: &mut DatabaseHandle,
        request: &QueryRequest,
    ) -> DbResult<QueryResult>;

    /// Execute via a previously prepared statement. Engines without native
    /// prepared-statement support fall back to [`Self::execute_query`] on
    /// the cached template; the contract stays uniform either way.
    async fn execute_prepared(
        &self,
        handle: &mut DatabaseHandle,
        statement_name: &str,
        request: &QueryRequest,
    ) -> DbResult<QueryResult>;

    async fn begin_transaction(
        &self,
        handle: &mut DatabaseHandle,
        level: IsolationLevel,
    ) -> DbResult<Transaction>;

    /// Commit the handle's active transaction, returning the finished
    /// record with `active == false`.
    async fn commit_transaction(&self, handle: &mut DatabaseHandle) -> DbResult<Transaction>;

    /// Roll back the handle's active transaction, returning the finished
    /// record with `active == false`.
    async fn rollback_transaction(&self, handle: &mut DatabaseHandle) -> DbResult<Transaction>;

    /// Prepare a named statement and cache it on the handle. The native
    /// call happens first so the cache and server state never diverge.
    async fn prepare_statement(
        &self,
        handle: &mut DatabaseHandle,
        name: &str,
        sql: &str,
    ) -> DbResult<()>;

    async fn unprepare_statement(&self, handle: &mut DatabaseHandle, name: &str) -> DbResult<()>;

    /// Assemble this engine's connection string from config fields, or
    /// return the configured full string verbatim.
    fn build_connection_string(&self, config: &ConnectionConfig) -> DbResult<String>;

    fn validate_connection_string(&self, connection_string: &str) -> bool;

    /// Escape a string literal for inline inclusion in SQL. Takes the
    /// handle because correct escaping may depend on connection state.
    fn escape_string(&self, handle: &DatabaseHandle, input: &str) -> String;
}

/// Process-wide table mapping an engine kind to its registered driver.
///
/// A fixed-size slot array guarded by one lock; registration happens once
/// at startup and the table is effectively read-only afterward. First
/// registration wins: a second driver for an occupied slot is rejected.
pub struct EngineRegistry {
    slots: RwLock<[Option<Arc<dyn DatabaseEngine>>; ENGINE_KIND_COUNT]>,
}

impl EngineRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(std::array::from_fn(|_| None)),
        }
    }

    /// Create a registry with all built-in drivers registered. This is the
    /// subsystem's engine-init entry point; the DB2 driver registers even
    /// when its native library is absent (its operations fail closed until
    /// the library loads).
    pub fn with_builtin_engines() -> Self {
        let registry = Self::new();
        for engine in [
            Arc::new(PostgresEngine::new()) as Arc<dyn DatabaseEngine>,
            Arc::new(MySqlEngine::new()),
            Arc::new(SqliteEngine::new()),
            Arc::new(Db2Engine::new()),
        ] {
            // Slots start empty, so registration cannot fail here.
            if let Err(e) = registry.register(engine) {
                warn!(error = %e, "Builtin engine registration rejected");
            }
        }
        registry
    }

    /// Register a driver. Fails if a driver already occupies the slot; the
    /// original registration is unaffected.
    pub fn register(&self, engine: Arc<dyn DatabaseEngine>) -> DbResult<()> {
        let kind = engine.kind();
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if slots[kind.index()].is_some() {
            return Err(DbError::invalid_input(format!(
                "Engine already registered for {}",
                kind
            )));
        }
        debug!(engine = engine.name(), "Registered database engine");
        slots[kind.index()] = Some(engine);
        Ok(())
    }

    /// Look up a driver by kind.
    pub fn get(&self, kind: EngineKind) -> Option<Arc<dyn DatabaseEngine>> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots[kind.index()].clone()
    }

    /// Look up a driver by name. Linear scan; the registry is small and
    /// bounded.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn DatabaseEngine>> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots
            .iter()
            .flatten()
            .find(|e| e.name() == name)
            .cloned()
    }

    /// Names of all registered drivers.
    pub fn supported_engines(&self) -> Vec<&'static str> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots.iter().flatten().map(|e| e.name()).collect()
    }

    fn resolve(&self, kind: EngineKind) -> DbResult<Arc<dyn DatabaseEngine>> {
        self.get(kind)
            .ok_or_else(|| DbError::engine_unavailable(kind.display_name(), "not registered"))
    }

    /// Open a connection through the registered driver for `kind`.
    pub async fn connect(
        &self,
        kind: EngineKind,
        config: &ConnectionConfig,
        designator: Option<&str>,
    ) -> DbResult<DatabaseHandle> {
        self.resolve(kind)?.connect(config, designator).await
    }

    /// Execute a query through the handle's engine. When the request names
    /// a prepared statement that is cached on the handle, the prepared path
    /// is used; otherwise this falls back to regular execution.
    pub async fn execute(
        &self,
        handle: &mut DatabaseHandle,
        request: &QueryRequest,
    ) -> DbResult<QueryResult> {
        let engine = self.resolve(handle.engine_kind())?;
        if let Some(name) = request.prepared_statement_name.as_deref() {
            if handle.find_statement(name).is_some() {
                let name = name.to_string();
                return engine.execute_prepared(handle, &name, request).await;
            }
        }
        engine.execute_query(handle, request).await
    }

    pub async fn health_check(&self, handle: &mut DatabaseHandle) -> DbResult<()> {
        self.resolve(handle.engine_kind())?.health_check(handle).await
    }

    pub async fn reset_connection(&self, handle: &mut DatabaseHandle) -> DbResult<()> {
        self.resolve(handle.engine_kind())?
            .reset_connection(handle)
            .await
    }

    pub async fn begin_transaction(
        &self,
        handle: &mut DatabaseHandle,
        level: IsolationLevel,
    ) -> DbResult<Transaction> {
        self.resolve(handle.engine_kind())?
            .begin_transaction(handle, level)
            .await
    }

    pub async fn commit_transaction(&self, handle: &mut DatabaseHandle) -> DbResult<Transaction> {
        self.resolve(handle.engine_kind())?
            .commit_transaction(handle)
            .await
    }

    pub async fn rollback_transaction(&self, handle: &mut DatabaseHandle) -> DbResult<Transaction> {
        self.resolve(handle.engine_kind())?
            .rollback_transaction(handle)
            .await
    }

    pub async fn prepare_statement(
        &self,
        handle: &mut DatabaseHandle,
        name: &str,
        sql: &str,
    ) -> DbResult<()> {
        self.resolve(handle.engine_kind())?
            .prepare_statement(handle, name, sql)
            .await
    }

    pub async fn unprepare_statement(
        &self,
        handle: &mut DatabaseHandle,
        name: &str,
    ) -> DbResult<()> {
        self.resolve(handle.engine_kind())?
            .unprepare_statement(handle, name)
            .await
    }

    pub fn build_connection_string(
        &self,
        kind: EngineKind,
        config: &ConnectionConfig,
    ) -> DbResult<String> {
        self.resolve(kind)?.build_connection_string(config)
    }

    pub fn validate_connection_string(&self, kind: EngineKind, connection_string: &str) -> bool {
        match self.get(kind) {
            Some(engine) => engine.validate_connection_string(connection_string),
            None => false,
        }
    }

    /// Tear down a connection: disconnect if a driver is available, then
    /// drop the prepared-statement cache. Idempotent against a handle whose
    /// sub-state is already gone.
    pub async fn cleanup_connection(&self, handle: &mut DatabaseHandle) {
        if let Some(engine) = self.get(handle.engine_kind()) {
            if let Err(e) = engine.disconnect(handle).await {
                warn!(
                    designator = handle.designator(),
                    error = %e,
                    "Disconnect during cleanup failed"
                );
            }
        }
        handle.prepared_statements.clear();
        handle.mark_disconnected();
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_first_registration_wins() {
        let registry = EngineRegistry::new();
        registry
            .register(Arc::new(SqliteEngine::new()))
            .expect("first registration");
        let second = registry.register(Arc::new(SqliteEngine::new()));
        assert!(second.is_err());
        assert!(registry.get(EngineKind::SQLite).is_some());
    }

    #[test]
    fn test_registry_get_by_name() {
        let registry = EngineRegistry::with_builtin_engines();
        assert!(registry.get_by_name("postgresql").is_some());
        assert!(registry.get_by_name("sqlite").is_some());
        assert!(registry.get_by_name("db2").is_some());
        assert!(registry.get_by_name("oracle").is_none());
    }

    #[test]
    fn test_registry_miss_returns_none() {
        let registry = EngineRegistry::new();
        assert!(registry.get(EngineKind::PostgreSQL).is_none());
        assert!(!registry.validate_connection_string(EngineKind::PostgreSQL, "postgres://x/y"));
    }

    #[test]
    fn test_builtin_registry_covers_all_kinds() {
        let registry = EngineRegistry::with_builtin_engines();
        for kind in EngineKind::all() {
            assert!(registry.get(kind).is_some(), "missing driver for {}", kind);
        }
        assert_eq!(registry.supported_engines().len(), ENGINE_KIND_COUNT);
    }

    #[tokio::test]
    async fn test_dispatch_fails_closed_without_driver() {
        let registry = EngineRegistry::new();
        let result = registry
            .connect(
                EngineKind::MySQL,
                &ConnectionConfig::from_connection_string("mysql://u:p@localhost/db"),
                None,
            )
            .await;
        assert!(matches!(result, Err(DbError::EngineUnavailable { .. })));
    }
}
