//! DB2 engine driver.
//!
//! Implements the engine contract over the DB2 call-level interface, loaded
//! dynamically at first use (see [`cli`]). CLI calls are genuinely blocking,
//! so they run under `spawn_blocking`; the timeout check is wall-clock and
//! happens after the native call returns. A wedged native call can therefore
//! overrun its nominal budget - callers must not assume hard timeout
//! enforcement on this engine.
//!
//! Parameters are inlined as escaped literals (the CLI binding path is not
//! wired up), which loses native parameter binding; prepared statements are
//! cache-only and execute through the same path.

pub(crate) mod cli;

use std::ffi::c_void;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::{debug, error, warn};

use crate::error::{DbError, DbResult};
use crate::models::{
    ConnectionConfig, EngineKind, IsolationLevel, PreparedStatement, QueryParam, QueryRequest,
    QueryResult, Transaction,
};

use self::cli::{
    Db2Cli, SQL_ATTR_AUTOCOMMIT, SQL_ATTR_ODBC_VERSION, SQL_ATTR_QUERY_TIMEOUT,
    SQL_ATTR_TXN_ISOLATION, SQL_AUTOCOMMIT_OFF, SQL_AUTOCOMMIT_ON, SQL_BIGINT, SQL_C_CHAR,
    SQL_COMMIT, SQL_DECIMAL, SQL_DOUBLE, SQL_DRIVER_NOPROMPT, SQL_FLOAT, SQL_HANDLE_DBC,
    SQL_HANDLE_ENV, SQL_HANDLE_STMT, SQL_INTEGER, SQL_NO_DATA, SQL_NTS, SQL_NULL_DATA,
    SQL_NULL_HANDLE, SQL_NUMERIC, SQL_OV_ODBC3, SQL_REAL, SQL_ROLLBACK, SQL_SMALLINT,
    SQL_SUCCESS, SqlHandle, succeeded,
};
use super::{
    DatabaseEngine, DatabaseHandle, EngineCapabilities, EngineConnection,
    ensure_no_active_transaction, take_active_transaction, validate_statement_name,
};

/// Native DB2 connection state: environment and connection handles.
pub struct Db2Connection {
    henv: SqlHandle,
    hdbc: SqlHandle,
}

impl Db2Connection {
    fn close(&mut self, cli: &Db2Cli) {
        if self.hdbc != SQL_NULL_HANDLE {
            unsafe {
                (cli.disconnect)(self.hdbc);
                (cli.free_handle)(SQL_HANDLE_DBC, self.hdbc);
            }
            self.hdbc = SQL_NULL_HANDLE;
        }
        if self.henv != SQL_NULL_HANDLE {
            unsafe {
                (cli.free_handle)(SQL_HANDLE_ENV, self.henv);
            }
            self.henv = SQL_NULL_HANDLE;
        }
    }
}

impl Drop for Db2Connection {
    fn drop(&mut self) {
        if let Some(cli) = cli::try_get() {
            self.close(cli);
        }
    }
}

pub struct Db2Engine;

impl Db2Engine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Db2Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn db2_conn(handle: &mut DatabaseHandle) -> DbResult<&mut Db2Connection> {
    match handle.conn.as_mut() {
        Some(EngineConnection::Db2(conn)) => Ok(conn),
        Some(_) => Err(DbError::internal(
            "Connection handle does not belong to the DB2 engine",
        )),
        None => Err(DbError::connection("Connection is not established")),
    }
}

/// Wall-clock overrun check, applied after a blocking native call returns.
fn check_elapsed(operation: &str, started: Instant, timeout_secs: u64) -> DbResult<()> {
    let elapsed = started.elapsed().as_secs();
    if elapsed > timeout_secs {
        warn!(
            operation = operation,
            elapsed_secs = elapsed,
            timeout_secs = timeout_secs,
            "DB2 call overran its timeout budget"
        );
        return Err(DbError::timeout(operation, elapsed));
    }
    Ok(())
}

/// Render a parameter as a SQL literal.
fn literal(param: &QueryParam) -> String {
    match param {
        QueryParam::Null => "NULL".to_string(),
        QueryParam::Bool(true) => "1".to_string(),
        QueryParam::Bool(false) => "0".to_string(),
        QueryParam::Int(v) => v.to_string(),
        QueryParam::Float(v) => v.to_string(),
        QueryParam::String(v) => format!("'{}'", v.replace('\'', "''")),
    }
}

/// Substitute `?` placeholders with escaped literals. Placeholders inside
/// string literals are left untouched.
fn inline_params(sql: &str, params: &[QueryParam]) -> DbResult<String> {
    let mut out = String::with_capacity(sql.len() + 32);
    let mut remaining = params.iter();
    let mut in_string = false;
    for ch in sql.chars() {
        match ch {
            '\'' => {
                in_string = !in_string;
                out.push(ch);
            }
            '?' if !in_string => {
                let param = remaining.next().ok_or_else(|| {
                    DbError::invalid_input("More placeholders than parameters")
                })?;
                out.push_str(&literal(param));
            }
            _ => out.push(ch),
        }
    }
    if remaining.next().is_some() {
        return Err(DbError::invalid_input("More parameters than placeholders"));
    }
    Ok(out)
}

fn connect_blocking(cli: &'static Db2Cli, conn_string: &str) -> DbResult<Db2Connection> {
    let mut henv: SqlHandle = SQL_NULL_HANDLE;
    let rc = unsafe { (cli.alloc_handle)(SQL_HANDLE_ENV, SQL_NULL_HANDLE, &mut henv) };
    if !succeeded(rc) {
        return Err(DbError::connection("Failed to allocate DB2 environment handle"));
    }
    // From here on the partially built connection owns the handles, so every
    // failure path releases them by drop.
    let mut conn = Db2Connection {
        henv,
        hdbc: SQL_NULL_HANDLE,
    };

    let rc = unsafe {
        (cli.set_env_attr)(
            conn.henv,
            SQL_ATTR_ODBC_VERSION,
            SQL_OV_ODBC3 as *mut c_void,
            0,
        )
    };
    if !succeeded(rc) {
        return Err(DbError::connection("Failed to set DB2 environment attributes"));
    }

    let mut hdbc: SqlHandle = SQL_NULL_HANDLE;
    let rc = unsafe { (cli.alloc_handle)(SQL_HANDLE_DBC, conn.henv, &mut hdbc) };
    if !succeeded(rc) {
        return Err(DbError::connection("Failed to allocate DB2 connection handle"));
    }
    conn.hdbc = hdbc;

    let mut bytes = conn_string.as_bytes().to_vec();
    bytes.push(0);
    let mut out_len: i16 = 0;
    let rc = unsafe {
        (cli.driver_connect)(
            conn.hdbc,
            std::ptr::null_mut(),
            bytes.as_ptr(),
            SQL_NTS as i16,
            std::ptr::null_mut(),
            0,
            &mut out_len,
            SQL_DRIVER_NOPROMPT,
        )
    };
    if !succeeded(rc) {
        let diag = cli.diagnostic(SQL_HANDLE_DBC, conn.hdbc);
        return Err(DbError::connection(format!("DB2 connect failed: {}", diag)));
    }
    Ok(conn)
}

/// Decode one column of the current row through SQLGetData, looping for
/// character data that exceeds the transfer buffer.
fn get_column_value(
    cli: &Db2Cli,
    hstmt: SqlHandle,
    column: u16,
    data_type: i16,
) -> DbResult<JsonValue> {
    let mut buf = vec![0u8; 8192];
    let mut out: Vec<u8> = Vec::new();
    loop {
        let mut indicator: i64 = 0;
        let rc = unsafe {
            (cli.get_data)(
                hstmt,
                column,
                SQL_C_CHAR,
                buf.as_mut_ptr() as *mut c_void,
                buf.len() as i64,
                &mut indicator,
            )
        };
        if rc == SQL_NO_DATA {
            break;
        }
        if !succeeded(rc) {
            return Err(DbError::database(
                cli.diagnostic(SQL_HANDLE_STMT, hstmt),
                None,
            ));
        }
        if indicator == SQL_NULL_DATA {
            return Ok(JsonValue::Null);
        }
        let chunk = if indicator < 0 || indicator as usize >= buf.len() {
            buf.len() - 1
        } else {
            indicator as usize
        };
        out.extend_from_slice(&buf[..chunk]);
        if rc == SQL_SUCCESS {
            break;
        }
    }
    let text = String::from_utf8_lossy(&out).to_string();
    match data_type {
        SQL_SMALLINT | SQL_INTEGER | SQL_BIGINT => text
            .trim()
            .parse::<i64>()
            .map(|v| JsonValue::Number(v.into()))
            .or(Ok(JsonValue::String(text))),
        SQL_NUMERIC | SQL_DECIMAL => Ok(JsonValue::String(text.trim().to_string())),
        SQL_FLOAT | SQL_REAL | SQL_DOUBLE => match text.trim().parse::<f64>() {
            Ok(v) => Ok(serde_json::Number::from_f64(v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::String(text))),
            Err(_) => Ok(JsonValue::String(text)),
        },
        _ => Ok(JsonValue::String(text)),
    }
}

type ExecOutcome = (Vec<String>, Vec<serde_json::Map<String, JsonValue>>, Option<u64>);

fn exec_blocking(
    cli: &'static Db2Cli,
    hdbc: SqlHandle,
    sql: &str,
    timeout_secs: Option<u64>,
) -> DbResult<ExecOutcome> {
    let mut hstmt: SqlHandle = SQL_NULL_HANDLE;
    let rc = unsafe { (cli.alloc_handle)(SQL_HANDLE_STMT, hdbc, &mut hstmt) };
    if !succeeded(rc) {
        return Err(DbError::database(
            cli.diagnostic(SQL_HANDLE_DBC, hdbc),
            None,
        ));
    }
    let result = exec_on_statement(cli, hstmt, sql, timeout_secs);
    unsafe {
        (cli.free_handle)(SQL_HANDLE_STMT, hstmt);
    }
    result
}

fn exec_on_statement(
    cli: &Db2Cli,
    hstmt: SqlHandle,
    sql: &str,
    timeout_secs: Option<u64>,
) -> DbResult<ExecOutcome> {
    if let (Some(secs), Some(set_stmt_attr)) = (timeout_secs, cli.set_stmt_attr) {
        let rc = unsafe {
            set_stmt_attr(hstmt, SQL_ATTR_QUERY_TIMEOUT, secs as usize as *mut c_void, 0)
        };
        if !succeeded(rc) {
            debug!("SQL_ATTR_QUERY_TIMEOUT rejected by the DB2 client");
        }
    }

    let mut bytes = sql.as_bytes().to_vec();
    bytes.push(0);
    let rc = unsafe { (cli.exec_direct)(hstmt, bytes.as_ptr(), SQL_NTS) };
    if !succeeded(rc) && rc != SQL_NO_DATA {
        return Err(DbError::database(
            cli.diagnostic(SQL_HANDLE_STMT, hstmt),
            None,
        ));
    }

    let mut column_count: i16 = 0;
    let rc = unsafe { (cli.num_result_cols)(hstmt, &mut column_count) };
    if !succeeded(rc) {
        return Err(DbError::database(
            cli.diagnostic(SQL_HANDLE_STMT, hstmt),
            None,
        ));
    }

    if column_count <= 0 {
        let mut affected: i64 = 0;
        let rc = unsafe { (cli.row_count)(hstmt, &mut affected) };
        let affected = if succeeded(rc) { affected.max(0) as u64 } else { 0 };
        return Ok((Vec::new(), Vec::new(), Some(affected)));
    }

    let mut columns = Vec::with_capacity(column_count as usize);
    let mut column_types = Vec::with_capacity(column_count as usize);
    for col in 1..=column_count as u16 {
        let mut name_buf = [0u8; 256];
        let mut name_len: i16 = 0;
        let mut data_type: i16 = 0;
        let mut col_size: u64 = 0;
        let mut decimals: i16 = 0;
        let mut nullable: i16 = 0;
        let rc = unsafe {
            (cli.describe_col)(
                hstmt,
                col,
                name_buf.as_mut_ptr(),
                name_buf.len() as i16,
                &mut name_len,
                &mut data_type,
                &mut col_size,
                &mut decimals,
                &mut nullable,
            )
        };
        if !succeeded(rc) {
            return Err(DbError::database(
                cli.diagnostic(SQL_HANDLE_STMT, hstmt),
                None,
            ));
        }
        let name_len = (name_len.max(0) as usize).min(name_buf.len());
        columns.push(String::from_utf8_lossy(&name_buf[..name_len]).to_string());
        column_types.push(data_type);
    }

    let mut rows = Vec::new();
    loop {
        let rc = unsafe { (cli.fetch)(hstmt) };
        if rc == SQL_NO_DATA {
            break;
        }
        if !succeeded(rc) {
            return Err(DbError::database(
                cli.diagnostic(SQL_HANDLE_STMT, hstmt),
                None,
            ));
        }
        let mut row = serde_json::Map::new();
        for (idx, name) in columns.iter().enumerate() {
            let value = get_column_value(cli, hstmt, (idx + 1) as u16, column_types[idx])?;
            row.insert(name.clone(), value);
        }
        rows.push(row);
    }

    Ok((columns, rows, None))
}

async fn run_blocking<T, F>(task: F) -> DbResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> DbResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| DbError::internal(format!("Blocking task failed: {}", e)))?
}

#[async_trait]
impl DatabaseEngine for Db2Engine {
    fn kind(&self) -> EngineKind {
        EngineKind::DB2
    }

    fn name(&self) -> &'static str {
        "db2"
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            native_ping: false,
            native_prepare: false,
            statement_timeout: cli::try_get().is_some_and(|c| c.set_stmt_attr.is_some()),
            server_side_escape: false,
        }
    }

    async fn connect(
        &self,
        config: &ConnectionConfig,
        designator: Option<&str>,
    ) -> DbResult<DatabaseHandle> {
        let cli = cli::load()?;
        let conn_string = self.build_connection_string(config)?;
        let timeout_secs = config.effective_timeout_secs();
        let started = Instant::now();

        let conn = run_blocking(move || connect_blocking(cli, &conn_string)).await;
        let conn = match conn {
            Ok(conn) => conn,
            Err(e) => {
                error!(
                    designator = designator.unwrap_or("database"),
                    error = %e,
                    "DB2 connect failed"
                );
                return Err(e);
            }
        };
        check_elapsed("connect", started, timeout_secs)?;

        debug!(
            designator = designator.unwrap_or("database"),
            "DB2 connection established"
        );
        Ok(DatabaseHandle::new(
            EngineKind::DB2,
            EngineConnection::Db2(conn),
            config.clone(),
            designator,
        ))
    }

    async fn disconnect(&self, handle: &mut DatabaseHandle) -> DbResult<()> {
        match handle.conn.take() {
            Some(EngineConnection::Db2(conn)) => {
                run_blocking(move || {
                    drop(conn);
                    Ok(())
                })
                .await?;
            }
            Some(other) => {
                handle.conn = Some(other);
                return Err(DbError::internal(
                    "Connection handle does not belong to the DB2 engine",
                ));
            }
            None => {}
        }
        handle.mark_disconnected();
        Ok(())
    }

    async fn health_check(&self, handle: &mut DatabaseHandle) -> DbResult<()> {
        let timeout_secs = handle.config().effective_timeout_secs();
        let hdbc = db2_conn(handle)?.hdbc;
        let cli = cli::load()?;
        let started = Instant::now();
        let outcome = run_blocking(move || {
            exec_blocking(
                cli,
                hdbc,
                "SELECT 1 FROM SYSIBM.SYSDUMMY1",
                Some(timeout_secs),
            )
        })
        .await
        .and_then(|_| check_elapsed("health check", started, timeout_secs));
        match outcome {
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
        let timeout_secs = request.effective_timeout_secs();
        let sql = if request.params.is_empty() {
            request.sql_template.clone()
        } else {
            inline_params(&request.sql_template, &request.params)?
        };
        let hdbc = db2_conn(handle)?.hdbc;
        let cli = cli::load()?;

        let (columns, rows, rows_affected) =
            run_blocking(move || exec_blocking(cli, hdbc, &sql, Some(timeout_secs))).await?;
        check_elapsed("query execution", started, timeout_secs)?;

        Ok(QueryResult {
            columns,
            rows,
            rows_affected,
            execution_time_ms: started.elapsed().as_millis() as u64,
        })
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
        let prepared_request = QueryRequest {
            sql_template: template,
            params: request.params.clone(),
            prepared_statement_name: None,
            timeout_secs: request.timeout_secs,
        };
        let result = self.execute_query(handle, &prepared_request).await?;
        handle.bump_statement_usage(statement_name);
        Ok(result)
    }

    async fn begin_transaction(
        &self,
        handle: &mut DatabaseHandle,
        level: IsolationLevel,
    ) -> DbResult<Transaction> {
        ensure_no_active_transaction(handle)?;
        let hdbc = db2_conn(handle)?.hdbc;
        let cli = cli::load()?;
        let isolation: usize = match level {
            IsolationLevel::ReadUncommitted => 1,
            IsolationLevel::ReadCommitted => 2,
            IsolationLevel::RepeatableRead => 4,
            IsolationLevel::Serializable => 8,
        };
        run_blocking(move || {
            let rc = unsafe {
                (cli.set_connect_attr)(
                    hdbc,
                    SQL_ATTR_TXN_ISOLATION,
                    isolation as *mut c_void,
                    0,
                )
            };
            if !succeeded(rc) {
                return Err(DbError::transaction(
                    cli.diagnostic(SQL_HANDLE_DBC, hdbc),
                    "begin",
                ));
            }
            let rc = unsafe {
                (cli.set_connect_attr)(
                    hdbc,
                    SQL_ATTR_AUTOCOMMIT,
                    SQL_AUTOCOMMIT_OFF as *mut c_void,
                    0,
                )
            };
            if !succeeded(rc) {
                return Err(DbError::transaction(
                    cli.diagnostic(SQL_HANDLE_DBC, hdbc),
                    "begin",
                ));
            }
            Ok(())
        })
        .await?;
        let tx = Transaction::begin(level);
        handle.current_transaction = Some(tx.clone());
        Ok(tx)
    }

    async fn commit_transaction(&self, handle: &mut DatabaseHandle) -> DbResult<Transaction> {
        let mut tx = take_active_transaction(handle)?;
        let resolved = db2_conn(handle)
            .map(|c| c.hdbc)
            .and_then(|hdbc| cli::load().map(|cli| (hdbc, cli)));
        let (hdbc, cli) = match resolved {
            Ok(v) => v,
            Err(e) => {
                handle.current_transaction = Some(tx);
                return Err(e);
            }
        };
        let outcome = run_blocking(move || end_transaction(cli, hdbc, SQL_COMMIT)).await;
        match outcome {
            Ok(()) => {
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
        let resolved = db2_conn(handle)
            .map(|c| c.hdbc)
            .and_then(|hdbc| cli::load().map(|cli| (hdbc, cli)));
        let (hdbc, cli) = match resolved {
            Ok(v) => v,
            Err(e) => {
                handle.current_transaction = Some(tx);
                return Err(e);
            }
        };
        let outcome = run_blocking(move || end_transaction(cli, hdbc, SQL_ROLLBACK)).await;
        match outcome {
            Ok(()) => {
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
        // Cache-only; execution goes through the regular query path.
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
            return Ok(s.to_string());
        }
        let database = config
            .database
            .as_deref()
            .ok_or_else(|| DbError::invalid_input("DB2 connection requires a database or DSN"))?;
        let mut parts = Vec::new();
        if let Some(host) = config.host.as_deref() {
            parts.push(format!("DATABASE={}", database));
            parts.push(format!("HOSTNAME={}", host));
            parts.push(format!("PORT={}", config.port.unwrap_or(50000)));
            parts.push("PROTOCOL=TCPIP".to_string());
        } else {
            // No host: treat the database name as a catalogued DSN.
            parts.push(format!("DSN={}", database));
        }
        if let Some(user) = config.username.as_deref() {
            parts.push(format!("UID={}", user));
        }
        if let Some(pass) = config.password.as_deref() {
            parts.push(format!("PWD={}", pass));
        }
        Ok(format!("{};", parts.join(";")))
    }

    fn validate_connection_string(&self, connection_string: &str) -> bool {
        let s = connection_string.trim();
        if s.is_empty() {
            return false;
        }
        let upper = s.to_uppercase();
        if upper.contains("DSN=") {
            return true;
        }
        if upper.contains("DATABASE=") && upper.contains("HOSTNAME=") {
            return true;
        }
        // A bare DSN name.
        !s.contains('=') && !s.contains(char::is_whitespace)
    }

    fn escape_string(&self, _handle: &DatabaseHandle, input: &str) -> String {
        input.replace('\'', "''")
    }
}

fn end_transaction(cli: &'static Db2Cli, hdbc: SqlHandle, completion: i16) -> DbResult<()> {
    let rc = unsafe { (cli.end_tran)(SQL_HANDLE_DBC, hdbc, completion) };
    if !succeeded(rc) {
        return Err(DbError::transaction(
            cli.diagnostic(SQL_HANDLE_DBC, hdbc),
            if completion == SQL_COMMIT { "commit" } else { "rollback" },
        ));
    }
    let rc = unsafe {
        (cli.set_connect_attr)(hdbc, SQL_ATTR_AUTOCOMMIT, SQL_AUTOCOMMIT_ON as *mut c_void, 0)
    };
    if !succeeded(rc) {
        warn!("Failed to restore DB2 autocommit after transaction end");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Db2Engine {
        Db2Engine::new()
    }

    #[test]
    fn test_build_connection_string_tcpip_form() {
        let config = ConnectionConfig {
            host: Some("db2.internal".to_string()),
            port: Some(50001),
            database: Some("SAMPLE".to_string()),
            username: Some("app".to_string()),
            password: Some("secret".to_string()),
            ..ConnectionConfig::default()
        };
        let s = engine().build_connection_string(&config).unwrap();
        assert_eq!(
            s,
            "DATABASE=SAMPLE;HOSTNAME=db2.internal;PORT=50001;PROTOCOL=TCPIP;UID=app;PWD=secret;"
        );
    }

    #[test]
    fn test_build_connection_string_dsn_fallback() {
        let config = ConnectionConfig {
            database: Some("SAMPLE".to_string()),
            username: Some("app".to_string()),
            ..ConnectionConfig::default()
        };
        let s = engine().build_connection_string(&config).unwrap();
        assert_eq!(s, "DSN=SAMPLE;UID=app;");
    }

    #[test]
    fn test_validate_connection_string() {
        let e = engine();
        assert!(e.validate_connection_string("DSN=SAMPLE;UID=app;PWD=x;"));
        assert!(e.validate_connection_string(
            "DATABASE=SAMPLE;HOSTNAME=h;PORT=50000;PROTOCOL=TCPIP;"
        ));
        assert!(e.validate_connection_string("SAMPLE"));
        assert!(!e.validate_connection_string(""));
        assert!(!e.validate_connection_string("not a dsn"));
    }

    #[test]
    fn test_round_trip_connection_string() {
        let e = engine();
        let config = ConnectionConfig {
            host: Some("h".to_string()),
            database: Some("SAMPLE".to_string()),
            ..ConnectionConfig::default()
        };
        let built = e.build_connection_string(&config).unwrap();
        assert!(e.validate_connection_string(&built));
    }

    #[test]
    fn test_inline_params() {
        let params = vec![
            QueryParam::Int(7),
            QueryParam::String("o'brien".to_string()),
            QueryParam::Null,
        ];
        let sql = inline_params("SELECT * FROM t WHERE a = ? AND b = ? AND c IS ?", &params)
            .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM t WHERE a = 7 AND b = 'o''brien' AND c IS NULL"
        );
    }

    #[test]
    fn test_inline_params_skips_placeholders_in_strings() {
        let params = vec![QueryParam::Int(1)];
        let sql = inline_params("SELECT '?' FROM t WHERE a = ?", &params).unwrap();
        assert_eq!(sql, "SELECT '?' FROM t WHERE a = 1");
    }

    #[test]
    fn test_inline_params_arity_mismatch() {
        assert!(inline_params("SELECT ?", &[]).is_err());
        assert!(inline_params("SELECT 1", &[QueryParam::Int(1)]).is_err());
    }

    #[tokio::test]
    async fn test_operations_fail_closed_without_connection() {
        let e = engine();
        let mut handle = DatabaseHandle::detached(EngineKind::DB2, ConnectionConfig::default());
        let result = e
            .execute_query(&mut handle, &QueryRequest::new("SELECT 1"))
            .await;
        assert!(result.is_err());
        assert!(handle.current_transaction().is_none());
    }
}
