//! Integration tests for the engine registry.
//!
//! These tests verify registration semantics (first registration wins) and
//! that dispatch fails closed when a driver is absent.

use std::sync::Arc;

use db_queue_router::engine::{EngineRegistry, PostgresEngine, SqliteEngine};
use db_queue_router::error::DbError;
use db_queue_router::models::{ConnectionConfig, EngineKind};

/// A second registration for an occupied slot fails and the original
/// registration is unaffected.
#[test]
fn test_second_registration_rejected() {
    let registry = EngineRegistry::new();
    registry
        .register(Arc::new(PostgresEngine::new()))
        .expect("first registration");

    let second = registry.register(Arc::new(PostgresEngine::new()));
    assert!(second.is_err(), "second registration should fail");

    let resolved = registry.get(EngineKind::PostgreSQL);
    assert!(resolved.is_some(), "original registration must survive");
    assert_eq!(resolved.unwrap().name(), "postgresql");
}

/// The builtin registry covers all four engines, addressable by name.
#[test]
fn test_builtin_registry_by_name() {
    let registry = EngineRegistry::with_builtin_engines();
    for name in ["postgresql", "mysql", "sqlite", "db2"] {
        let engine = registry.get_by_name(name);
        assert!(engine.is_some(), "missing engine '{}'", name);
        assert_eq!(engine.unwrap().name(), name);
    }
    assert!(registry.get_by_name("oracle").is_none());

    let mut supported = registry.supported_engines();
    supported.sort_unstable();
    assert_eq!(supported, vec!["db2", "mysql", "postgresql", "sqlite"]);
}

/// Lookups on an empty registry miss without panicking.
#[test]
fn test_empty_registry_misses() {
    let registry = EngineRegistry::new();
    for kind in EngineKind::all() {
        assert!(registry.get(kind).is_none());
    }
    assert!(registry.supported_engines().is_empty());
}

/// Every dispatch path returns failure (not a panic, no side effects) when
/// no driver is registered for the engine.
#[tokio::test]
async fn test_dispatch_fails_closed() {
    let registry = EngineRegistry::new();
    registry
        .register(Arc::new(SqliteEngine::new()))
        .expect("sqlite registration");

    // Connect against the unregistered MySQL slot.
    let config = ConnectionConfig::from_connection_string("mysql://u:p@localhost:3306/db");
    let result = registry.connect(EngineKind::MySQL, &config, None).await;
    assert!(matches!(result, Err(DbError::EngineUnavailable { .. })));

    // String utilities fail closed too.
    assert!(
        registry
            .build_connection_string(EngineKind::MySQL, &config)
            .is_err()
    );
    assert!(!registry.validate_connection_string(EngineKind::MySQL, "mysql://u:p@h/db"));
}

/// Operations against a handle whose engine has a registered driver but no
/// live connection fail with a connection error and leave no state behind.
#[tokio::test]
async fn test_handle_without_connection_fails_closed() {
    use db_queue_router::DatabaseHandle;
    use db_queue_router::models::{IsolationLevel, QueryRequest};

    let registry = EngineRegistry::with_builtin_engines();
    let mut handle = DatabaseHandle::detached(EngineKind::SQLite, ConnectionConfig::default());

    let result = registry
        .execute(&mut handle, &QueryRequest::new("SELECT 1"))
        .await;
    assert!(matches!(result, Err(DbError::Connection { .. })));

    let result = registry
        .begin_transaction(&mut handle, IsolationLevel::ReadCommitted)
        .await;
    assert!(result.is_err());
    assert!(handle.current_transaction().is_none());
}
