//! Data models for connections, transactions, and queued queries.

pub mod connection;
pub mod query;

pub use connection::{
    ConnectionConfig, ConnectionStatus, EngineKind, IsolationLevel, PreparedStatement, Transaction,
};
pub use query::{
    DEFAULT_QUERY_TIMEOUT_SECS, MAX_QUERY_TIMEOUT_SECS, QueryParam, QueryRequest, QueryResult,
    QueueKind, QueuedQuery,
};
