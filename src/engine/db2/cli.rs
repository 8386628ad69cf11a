//! Dynamically loaded DB2 call-level interface.
//!
//! The DB2 client library is resolved at first use from an ordered list of
//! candidate names. Every required symbol must resolve or the load fails and
//! the library handle is released; the driver then stays unavailable and all
//! dependent operations fail closed. Optional symbols degrade the driver's
//! capability set instead of failing the load.
//!
//! Handles are opaque pointers on the C side, carried here as `usize` so
//! they can cross into blocking tasks.

use std::ffi::c_void;
use std::sync::OnceLock;

use libloading::Library;
use tracing::{info, warn};

use crate::error::{DbError, DbResult};

pub(crate) type SqlHandle = usize;
pub(crate) type SqlReturn = i16;

pub(crate) const SQL_HANDLE_ENV: i16 = 1;
pub(crate) const SQL_HANDLE_DBC: i16 = 2;
pub(crate) const SQL_HANDLE_STMT: i16 = 3;
pub(crate) const SQL_NULL_HANDLE: SqlHandle = 0;

pub(crate) const SQL_SUCCESS: SqlReturn = 0;
pub(crate) const SQL_SUCCESS_WITH_INFO: SqlReturn = 1;
pub(crate) const SQL_NO_DATA: SqlReturn = 100;

pub(crate) const SQL_ATTR_ODBC_VERSION: i32 = 200;
pub(crate) const SQL_OV_ODBC3: usize = 3;
pub(crate) const SQL_ATTR_AUTOCOMMIT: i32 = 102;
pub(crate) const SQL_AUTOCOMMIT_OFF: usize = 0;
pub(crate) const SQL_AUTOCOMMIT_ON: usize = 1;
pub(crate) const SQL_ATTR_TXN_ISOLATION: i32 = 108;
pub(crate) const SQL_ATTR_QUERY_TIMEOUT: i32 = 0;

pub(crate) const SQL_COMMIT: i16 = 0;
pub(crate) const SQL_ROLLBACK: i16 = 1;
pub(crate) const SQL_DRIVER_NOPROMPT: u16 = 0;
pub(crate) const SQL_NTS: i32 = -3;
pub(crate) const SQL_C_CHAR: i16 = 1;
pub(crate) const SQL_NULL_DATA: i64 = -1;

// Column data types reported by SQLDescribeCol.
pub(crate) const SQL_NUMERIC: i16 = 2;
pub(crate) const SQL_DECIMAL: i16 = 3;
pub(crate) const SQL_INTEGER: i16 = 4;
pub(crate) const SQL_SMALLINT: i16 = 5;
pub(crate) const SQL_FLOAT: i16 = 6;
pub(crate) const SQL_REAL: i16 = 7;
pub(crate) const SQL_DOUBLE: i16 = 8;
pub(crate) const SQL_BIGINT: i16 = -5;

type SqlAllocHandleFn = unsafe extern "C" fn(i16, SqlHandle, *mut SqlHandle) -> SqlReturn;
type SqlFreeHandleFn = unsafe extern "C" fn(i16, SqlHandle) -> SqlReturn;
type SqlSetEnvAttrFn = unsafe extern "C" fn(SqlHandle, i32, *mut c_void, i32) -> SqlReturn;
type SqlSetConnectAttrFn = unsafe extern "C" fn(SqlHandle, i32, *mut c_void, i32) -> SqlReturn;
type SqlSetStmtAttrFn = unsafe extern "C" fn(SqlHandle, i32, *mut c_void, i32) -> SqlReturn;
type SqlDriverConnectFn = unsafe extern "C" fn(
    SqlHandle,
    *mut c_void,
    *const u8,
    i16,
    *mut u8,
    i16,
    *mut i16,
    u16,
) -> SqlReturn;
type SqlDisconnectFn = unsafe extern "C" fn(SqlHandle) -> SqlReturn;
type SqlExecDirectFn = unsafe extern "C" fn(SqlHandle, *const u8, i32) -> SqlReturn;
type SqlNumResultColsFn = unsafe extern "C" fn(SqlHandle, *mut i16) -> SqlReturn;
type SqlDescribeColFn = unsafe extern "C" fn(
    SqlHandle,
    u16,
    *mut u8,
    i16,
    *mut i16,
    *mut i16,
    *mut u64,
    *mut i16,
    *mut i16,
) -> SqlReturn;
type SqlFetchFn = unsafe extern "C" fn(SqlHandle) -> SqlReturn;
type SqlGetDataFn = unsafe extern "C" fn(SqlHandle, u16, i16, *mut c_void, i64, *mut i64) -> SqlReturn;
type SqlRowCountFn = unsafe extern "C" fn(SqlHandle, *mut i64) -> SqlReturn;
type SqlEndTranFn = unsafe extern "C" fn(i16, SqlHandle, i16) -> SqlReturn;
type SqlGetDiagRecFn =
    unsafe extern "C" fn(i16, SqlHandle, i16, *mut u8, *mut i32, *mut u8, i16, *mut i16) -> SqlReturn;

/// Ordered candidates for the DB2 client library; first successful load wins.
const LIBRARY_CANDIDATES: &[&str] = &["libdb2.so", "libdb2.so.1"];

/// Resolved CLI entry points. Function pointers stay valid for the process
/// lifetime because the `Library` is stored alongside them.
pub(crate) struct Db2Cli {
    _lib: Library,
    pub alloc_handle: SqlAllocHandleFn,
    pub free_handle: SqlFreeHandleFn,
    pub set_env_attr: SqlSetEnvAttrFn,
    pub set_connect_attr: SqlSetConnectAttrFn,
    pub driver_connect: SqlDriverConnectFn,
    pub disconnect: SqlDisconnectFn,
    pub exec_direct: SqlExecDirectFn,
    pub num_result_cols: SqlNumResultColsFn,
    pub describe_col: SqlDescribeColFn,
    pub fetch: SqlFetchFn,
    pub get_data: SqlGetDataFn,
    pub row_count: SqlRowCountFn,
    pub end_tran: SqlEndTranFn,
    pub get_diag_rec: SqlGetDiagRecFn,
    /// Optional: absent on older clients; statement timeouts are skipped.
    pub set_stmt_attr: Option<SqlSetStmtAttrFn>,
}

static CLI: OnceLock<Result<Db2Cli, String>> = OnceLock::new();

/// Load (or observe the already-loaded) CLI. Safe to call concurrently and
/// repeatedly; the failure reason is latched after the first attempt.
pub(crate) fn load() -> DbResult<&'static Db2Cli> {
    match CLI.get_or_init(Db2Cli::load_from_candidates) {
        Ok(cli) => Ok(cli),
        Err(reason) => Err(DbError::engine_unavailable("DB2", reason.clone())),
    }
}

/// The CLI if a previous [`load`] succeeded; never triggers a load.
pub(crate) fn try_get() -> Option<&'static Db2Cli> {
    CLI.get().and_then(|r| r.as_ref().ok())
}

pub(crate) fn succeeded(rc: SqlReturn) -> bool {
    rc == SQL_SUCCESS || rc == SQL_SUCCESS_WITH_INFO
}

macro_rules! required_symbol {
    ($lib:expr, $name:literal) => {
        unsafe {
            *$lib.get($name).map_err(|e| {
                format!(
                    "missing required symbol {}: {}",
                    String::from_utf8_lossy(&$name[..$name.len() - 1]),
                    e
                )
            })?
        }
    };
}

impl Db2Cli {
    fn load_from_candidates() -> Result<Self, String> {
        let mut last_error = String::from("no candidate libraries");
        for name in LIBRARY_CANDIDATES {
            match unsafe { Library::new(name) } {
                Ok(lib) => match Self::resolve(lib) {
                    Ok(cli) => {
                        info!(library = name, "Loaded DB2 client library");
                        return Ok(cli);
                    }
                    // The library handle was released when `resolve` dropped it.
                    Err(e) => last_error = e,
                },
                Err(e) => last_error = format!("{}: {}", name, e),
            }
        }
        warn!(error = %last_error, "DB2 client library unavailable");
        Err(last_error)
    }

    fn resolve(lib: Library) -> Result<Self, String> {
        let alloc_handle: SqlAllocHandleFn = required_symbol!(lib, b"SQLAllocHandle\0");
        let free_handle: SqlFreeHandleFn = required_symbol!(lib, b"SQLFreeHandle\0");
        let set_env_attr: SqlSetEnvAttrFn = required_symbol!(lib, b"SQLSetEnvAttr\0");
        let set_connect_attr: SqlSetConnectAttrFn = required_symbol!(lib, b"SQLSetConnectAttr\0");
        let driver_connect: SqlDriverConnectFn = required_symbol!(lib, b"SQLDriverConnect\0");
        let disconnect: SqlDisconnectFn = required_symbol!(lib, b"SQLDisconnect\0");
        let exec_direct: SqlExecDirectFn = required_symbol!(lib, b"SQLExecDirect\0");
        let num_result_cols: SqlNumResultColsFn = required_symbol!(lib, b"SQLNumResultCols\0");
        let describe_col: SqlDescribeColFn = required_symbol!(lib, b"SQLDescribeCol\0");
        let fetch: SqlFetchFn = required_symbol!(lib, b"SQLFetch\0");
        let get_data: SqlGetDataFn = required_symbol!(lib, b"SQLGetData\0");
        let row_count: SqlRowCountFn = required_symbol!(lib, b"SQLRowCount\0");
        let end_tran: SqlEndTranFn = required_symbol!(lib, b"SQLEndTran\0");
        let get_diag_rec: SqlGetDiagRecFn = required_symbol!(lib, b"SQLGetDiagRec\0");

        let set_stmt_attr: Option<SqlSetStmtAttrFn> =
            unsafe { lib.get(b"SQLSetStmtAttr\0").ok().map(|s| *s) };
        if set_stmt_attr.is_none() {
            warn!("SQLSetStmtAttr not exported; DB2 statement timeouts disabled");
        }

        Ok(Self {
            _lib: lib,
            alloc_handle,
            free_handle,
            set_env_attr,
            set_connect_attr,
            driver_connect,
            disconnect,
            exec_direct,
            num_result_cols,
            describe_col,
            fetch,
            get_data,
            row_count,
            end_tran,
            get_diag_rec,
            set_stmt_attr,
        })
    }

    /// First diagnostic record for a handle, formatted as `[SQLSTATE] text`.
    pub(crate) fn diagnostic(&self, handle_type: i16, handle: SqlHandle) -> String {
        let mut state = [0u8; 6];
        let mut native: i32 = 0;
        let mut message = [0u8; 512];
        let mut length: i16 = 0;
        let rc = unsafe {
            (self.get_diag_rec)(
                handle_type,
                handle,
                1,
                state.as_mut_ptr(),
                &mut native,
                message.as_mut_ptr(),
                message.len() as i16,
                &mut length,
            )
        };
        if succeeded(rc) {
            let text_len = (length.max(0) as usize).min(message.len());
            format!(
                "[{}] {}",
                String::from_utf8_lossy(&state[..5]),
                String::from_utf8_lossy(&message[..text_len])
            )
        } else {
            "no diagnostic available".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeded_codes() {
        assert!(succeeded(SQL_SUCCESS));
        assert!(succeeded(SQL_SUCCESS_WITH_INFO));
        assert!(!succeeded(SQL_NO_DATA));
        assert!(!succeeded(-1));
    }

    #[test]
    fn test_load_is_latched() {
        // Whatever the outcome on this machine, repeated loads observe the
        // same state and never panic.
        let first = load().is_ok();
        let second = load().is_ok();
        assert_eq!(first, second);
    }
}
