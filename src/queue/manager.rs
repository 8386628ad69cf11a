//! Queue manager and subsystem lifecycle.
//!
//! The manager is the process-wide registry of lead queues across all
//! configured databases. [`DatabaseSubsystem`] is the explicitly constructed
//! context owning the engine registry and the manager; it is created once at
//! startup and destroyed once at shutdown, and its teardown is the single
//! path that destroys every managed lead queue (cascading to children).

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tracing::{info, warn};

use crate::config::{Config, DatabaseConfig};
use crate::engine::EngineRegistry;
use crate::error::{DbError, DbResult};
use crate::models::{QueuedQuery};

use super::database_queue::{DatabaseQueue, QueueOptions};
use super::results::{PendingResult, ResultRouter};

/// Aggregate statistics across all managed queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerStats {
    pub total_submitted: u64,
    pub total_processed: u64,
    pub failed: u64,
    pub successful: u64,
}

pub struct QueueManager {
    databases: StdMutex<Vec<Arc<DatabaseQueue>>>,
    max_databases: usize,
    next_database_index: AtomicUsize,
    total_submitted: AtomicU64,
}

impl QueueManager {
    pub fn new(max_databases: usize) -> Self {
        Self {
            databases: StdMutex::new(Vec::new()),
            max_databases,
            next_database_index: AtomicUsize::new(0),
            total_submitted: AtomicU64::new(0),
        }
    }

    pub fn max_databases(&self) -> usize {
        self.max_databases
    }

    pub fn database_count(&self) -> usize {
        let databases = self.databases.lock().unwrap_or_else(|e| e.into_inner());
        databases.len()
    }

    /// Register a lead queue. Fails at capacity, for non-lead queues, and
    /// for duplicate database names.
    pub fn add_database(&self, lead: Arc<DatabaseQueue>) -> DbResult<()> {
        if !lead.is_lead() {
            return Err(DbError::invalid_input(
                "Only lead queues can be added to the manager",
            ));
        }
        let mut databases = self.databases.lock().unwrap_or_else(|e| e.into_inner());
        if databases.len() >= self.max_databases {
            return Err(DbError::capacity("queue manager databases"));
        }
        if databases
            .iter()
            .any(|q| q.database_name() == lead.database_name())
        {
            return Err(DbError::invalid_input(format!(
                "Database '{}' is already managed",
                lead.database_name()
            )));
        }
        info!(queue = %lead.label(), "Database added to queue manager");
        databases.push(lead);
        Ok(())
    }

    /// Look up a lead queue by database name. Linear scan under the manager
    /// lock.
    pub fn get_database(&self, name: &str) -> Option<Arc<DatabaseQueue>> {
        let databases = self.databases.lock().unwrap_or_else(|e| e.into_inner());
        databases.iter().find(|q| q.database_name() == name).cloned()
    }

    /// Round-robin over the managed databases.
    pub fn next_database(&self) -> Option<Arc<DatabaseQueue>> {
        let databases = self.databases.lock().unwrap_or_else(|e| e.into_inner());
        if databases.is_empty() {
            return None;
        }
        let index = self.next_database_index.fetch_add(1, Ordering::SeqCst);
        Some(Arc::clone(&databases[index % databases.len()]))
    }

    /// All managed lead queues.
    pub fn databases(&self) -> Vec<Arc<DatabaseQueue>> {
        let databases = self.databases.lock().unwrap_or_else(|e| e.into_inner());
        databases.clone()
    }

    /// Submit a query to a database's queue hierarchy, routed by its tier
    /// hint. The returned slot is awaited by the caller; resubmission on
    /// failure is the caller's decision.
    pub fn submit_query(&self, database_name: &str, query: QueuedQuery) -> DbResult<PendingResult> {
        let lead = self.get_database(database_name).ok_or_else(|| {
            DbError::queue_unavailable(database_name, "database is not managed")
        })?;
        let pending = lead.submit_query(query)?;
        self.total_submitted.fetch_add(1, Ordering::SeqCst);
        Ok(pending)
    }

    /// Aggregate statistics over every lead and its children.
    pub fn stats(&self) -> ManagerStats {
        let mut processed = 0u64;
        let mut failed = 0u64;
        for lead in self.databases() {
            processed += lead.total_queries_processed();
            failed += lead.failed_queries();
            let children = lead.children.lock().unwrap_or_else(|e| e.into_inner());
            for child in children.iter() {
                processed += child.total_queries_processed();
                failed += child.failed_queries();
            }
        }
        ManagerStats {
            total_submitted: self.total_submitted.load(Ordering::SeqCst),
            total_processed: processed,
            failed,
            successful: processed.saturating_sub(failed),
        }
    }

    /// Destroy every managed lead queue, cascading to children. The manager
    /// is empty afterwards; safe to call repeatedly.
    pub async fn shutdown(&self) {
        let databases: Vec<Arc<DatabaseQueue>> = {
            let mut guard = self.databases.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for lead in databases {
            lead.shutdown().await;
        }
        info!("Queue manager destroyed");
    }
}

/// The explicitly constructed database subsystem context: engine registry
/// plus queue manager. Construction-once / destroy-once lifecycle; the
/// process should not proceed if [`DatabaseSubsystem::init`] fails.
pub struct DatabaseSubsystem {
    registry: Arc<EngineRegistry>,
    manager: Arc<QueueManager>,
    results: Arc<ResultRouter>,
}

impl DatabaseSubsystem {
    /// Build the registry with the built-in engines, create one lead queue
    /// per configured database (starting its worker and any startup
    /// children), and register everything with the manager.
    ///
    /// Must be called from within a Tokio runtime; workers are spawned
    /// immediately.
    pub fn init(config: &Config) -> DbResult<Self> {
        config.validate()?;
        let subsystem = Self {
            registry: Arc::new(EngineRegistry::with_builtin_engines()),
            manager: Arc::new(QueueManager::new(config.max_databases)),
            results: Arc::new(ResultRouter::new()),
        };
        for db_config in &config.databases {
            subsystem.add_database(db_config)?;
        }
        Ok(subsystem)
    }

    /// Create, start, and register the lead queue for one database.
    pub fn add_database(&self, db_config: &DatabaseConfig) -> DbResult<Arc<DatabaseQueue>> {
        let engine_kind = db_config.engine_kind()?;
        let connection_string = db_config.resolved_connection_string(self.registry.as_ref())?;
        let options = QueueOptions {
            heartbeat_interval: std::time::Duration::from_secs(db_config.heartbeat_interval_secs),
            max_child_queues: crate::models::QueueKind::TIERS.len(),
            bootstrap_query: db_config.bootstrap_query.clone(),
        };
        let lead = DatabaseQueue::create_lead(
            &db_config.name,
            engine_kind,
            &connection_string,
            Arc::clone(&self.registry),
            Arc::clone(&self.results),
            options,
        );
        self.manager.add_database(Arc::clone(&lead))?;
        lead.start_worker()?;
        lead.launch_startup_children(&db_config.queues);
        Ok(lead)
    }

    /// Remove a database's lead queue from the manager and destroy it (with
    /// its children). Fails when the database is not managed.
    pub async fn remove_database(&self, name: &str) -> DbResult<()> {
        let lead = {
            let mut databases = self
                .manager
                .databases
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let index = databases.iter().position(|q| q.database_name() == name);
            match index {
                Some(index) => databases.swap_remove(index),
                None => {
                    return Err(DbError::queue_unavailable(name, "database is not managed"));
                }
            }
        };
        lead.shutdown().await;
        Ok(())
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<QueueManager> {
        &self.manager
    }

    pub fn results(&self) -> &Arc<ResultRouter> {
        &self.results
    }

    /// Health check across every managed queue.
    pub fn health_check(&self) -> bool {
        let databases = self.manager.databases();
        if databases.is_empty() {
            warn!("Subsystem health check with no managed databases");
        }
        databases.iter().all(|lead| lead.health_check())
    }

    /// Single teardown path invoked at process shutdown.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
        info!("Database subsystem shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EngineKind, QueueKind};

    fn sqlite_lead(name: &str) -> Arc<DatabaseQueue> {
        let registry = Arc::new(EngineRegistry::with_builtin_engines());
        let results = Arc::new(ResultRouter::new());
        DatabaseQueue::create_lead(
            name,
            EngineKind::SQLite,
            ":memory:",
            registry,
            results,
            QueueOptions::default(),
        )
    }

    #[test]
    fn test_add_and_get_database() {
        let manager = QueueManager::new(4);
        manager.add_database(sqlite_lead("orders")).unwrap();
        manager.add_database(sqlite_lead("billing")).unwrap();
        assert_eq!(manager.database_count(), 2);
        assert!(manager.get_database("orders").is_some());
        assert!(manager.get_database("missing").is_none());
    }

    #[test]
    fn test_capacity_enforced() {
        let manager = QueueManager::new(1);
        manager.add_database(sqlite_lead("orders")).unwrap();
        let result = manager.add_database(sqlite_lead("billing"));
        assert!(matches!(result, Err(DbError::Capacity { .. })));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let manager = QueueManager::new(4);
        manager.add_database(sqlite_lead("orders")).unwrap();
        assert!(manager.add_database(sqlite_lead("orders")).is_err());
    }

    #[test]
    fn test_round_robin_cycles() {
        let manager = QueueManager::new(4);
        manager.add_database(sqlite_lead("a")).unwrap();
        manager.add_database(sqlite_lead("b")).unwrap();
        let first = manager.next_database().unwrap();
        let second = manager.next_database().unwrap();
        let third = manager.next_database().unwrap();
        assert_ne!(first.database_name(), second.database_name());
        assert_eq!(first.database_name(), third.database_name());
    }

    #[test]
    fn test_submit_to_unknown_database_fails() {
        let manager = QueueManager::new(4);
        let query = QueuedQuery::new("SELECT 1", QueueKind::Medium);
        assert!(matches!(
            manager.submit_query("ghost", query),
            Err(DbError::QueueUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_manager_shutdown_cascades_and_empties() {
        let manager = QueueManager::new(4);
        let lead = sqlite_lead("orders");
        lead.start_worker().unwrap();
        lead.spawn_child_queue(QueueKind::Fast).unwrap();
        manager.add_database(lead).unwrap();

        manager.shutdown().await;
        assert_eq!(manager.database_count(), 0);
        // Idempotent.
        manager.shutdown().await;
    }
}
