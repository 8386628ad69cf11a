//! Multi-engine database queue subsystem.
//!
//! Routes SQL work across heterogeneous database backends (PostgreSQL,
//! MySQL, SQLite, DB2) through priority-tiered queues, each with one
//! dedicated worker and one persistent connection. Backends implement a
//! uniform engine contract and are resolved through a process-wide registry;
//! a database's lead queue can elastically spawn and retire per-tier child
//! queues.

pub mod config;
pub mod engine;
pub mod error;
pub mod migrate;
pub mod models;
pub mod queue;

pub use config::Config;
pub use engine::{DatabaseEngine, DatabaseHandle, EngineCapabilities, EngineRegistry};
pub use error::{DbError, DbResult};
pub use models::{EngineKind, IsolationLevel, QueryRequest, QueryResult, QueueKind, QueuedQuery};
pub use queue::{DatabaseQueue, DatabaseSubsystem, QueueManager};
