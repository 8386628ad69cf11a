//! Lead queue child management.
//!
//! A lead queue owns zero or more child worker queues, one per tier at most.
//! It starts out serving all four tiers itself and hands a tier to a
//! dedicated child when one is spawned, taking it back when the child is
//! retired. The children array is the single source of truth for tier
//! ownership; the lead's tag string is a derived logging hint.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::QueueStartup;
use crate::error::{DbError, DbResult};
use crate::models::QueueKind;

use super::database_queue::DatabaseQueue;

impl DatabaseQueue {
    /// Number of live children. Zero for non-lead queues.
    pub fn child_queue_count(&self) -> usize {
        let children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        children.len()
    }

    /// Whether a child of the given tier exists.
    pub fn has_child(&self, kind: QueueKind) -> bool {
        let children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        children.iter().any(|c| c.kind() == kind)
    }

    /// Spawn a dedicated child queue for a tier.
    ///
    /// At most one child per tier may exist: spawning a tier that already
    /// has a child is a no-op success. Fails at child-count capacity. The
    /// new child receives the lowest unused positive queue number (the lead
    /// reserves 00), its worker is started before it becomes routable, and
    /// the tier's tag moves from the lead to the child.
    pub fn spawn_child_queue(self: &Arc<Self>, kind: QueueKind) -> DbResult<()> {
        if !self.is_lead() || !self.can_spawn_queues() {
            return Err(DbError::invalid_input(format!(
                "{} cannot spawn child queues",
                self.label()
            )));
        }
        if kind == QueueKind::Lead {
            return Err(DbError::invalid_input("Cannot spawn a Lead child queue"));
        }

        let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        if children.iter().any(|c| c.kind() == kind) {
            return Ok(());
        }
        if children.len() >= self.options.max_child_queues {
            return Err(DbError::capacity(format!(
                "child queues for {}",
                self.label()
            )));
        }

        let mut queue_number = 1;
        while children.iter().any(|c| c.queue_number() == queue_number) {
            queue_number += 1;
        }

        let child = DatabaseQueue::create_worker(
            &self.database_name,
            self.engine_kind,
            &self.connection_string,
            kind,
            queue_number,
            Arc::clone(&self.registry),
            Arc::clone(&self.results),
            self.options.clone(),
        );
        child.start_worker()?;
        children.push(Arc::clone(&child));
        drop(children);

        self.remove_tag(kind.tag());
        info!(
            queue = %self.label(),
            child = %child.label(),
            "Spawned child queue"
        );
        Ok(())
    }

    /// Retire the child queue serving a tier.
    ///
    /// The child is stopped and destroyed, the array compacted, and the
    /// tier's tag returns to the lead. Fails without side effects when no
    /// child of that tier exists.
    pub async fn shutdown_child_queue(&self, kind: QueueKind) -> DbResult<()> {
        if !self.is_lead() {
            return Err(DbError::invalid_input(format!(
                "{} has no child queues",
                self.label()
            )));
        }

        let child = {
            let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
            let index = children.iter().position(|c| c.kind() == kind);
            match index {
                Some(index) => children.swap_remove(index),
                None => {
                    return Err(DbError::queue_unavailable(
                        format!("{}/{}", self.database_name(), kind),
                        "no child queue of this type",
                    ));
                }
            }
        };

        child.stop_and_close().await;
        self.add_tag(kind.tag());
        info!(
            queue = %self.label(),
            tier = %kind,
            "Shut down child queue"
        );
        Ok(())
    }

    /// Spawn the children whose `start` flag is set in the database's queue
    /// configuration.
    pub fn launch_startup_children(self: &Arc<Self>, startup: &QueueStartup) {
        for kind in QueueKind::TIERS {
            if startup.starts(kind) {
                if let Err(e) = self.spawn_child_queue(kind) {
                    warn!(
                        queue = %self.label(),
                        tier = %kind,
                        error = %e,
                        "Failed to spawn startup child queue"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineRegistry;
    use crate::models::EngineKind;
    use crate::queue::results::ResultRouter;
    use crate::queue::database_queue::QueueOptions;

    fn lead() -> Arc<DatabaseQueue> {
        let registry = Arc::new(EngineRegistry::with_builtin_engines());
        let results = Arc::new(ResultRouter::new());
        DatabaseQueue::create_lead(
            "orders",
            EngineKind::SQLite,
            ":memory:",
            registry,
            results,
            QueueOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_spawn_child_is_unique_per_tier() {
        let lead = lead();
        lead.spawn_child_queue(QueueKind::Fast).unwrap();
        // Second spawn succeeds but results in exactly one child.
        lead.spawn_child_queue(QueueKind::Fast).unwrap();
        assert_eq!(lead.child_queue_count(), 1);
        assert!(lead.has_child(QueueKind::Fast));
        lead.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_assigns_lowest_unused_number_and_moves_tag() {
        let lead = lead();
        lead.spawn_child_queue(QueueKind::Fast).unwrap();
        lead.spawn_child_queue(QueueKind::Cache).unwrap();
        assert_eq!(lead.tags(), "LSM");

        // Retire fast (number 01); cache keeps 02; a new child reuses 01.
        lead.shutdown_child_queue(QueueKind::Fast).await.unwrap();
        assert_eq!(lead.tags(), "LSMF");
        lead.spawn_child_queue(QueueKind::Slow).unwrap();

        let numbers: Vec<u32> = {
            let children = lead.children.lock().unwrap();
            children.iter().map(|c| c.queue_number()).collect()
        };
        assert!(numbers.contains(&1));
        assert!(numbers.contains(&2));
        lead.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_child_twice_fails_second_time() {
        let lead = lead();
        lead.spawn_child_queue(QueueKind::Fast).unwrap();
        lead.shutdown_child_queue(QueueKind::Fast).await.unwrap();
        let second = lead.shutdown_child_queue(QueueKind::Fast).await;
        assert!(second.is_err());
        assert_eq!(lead.child_queue_count(), 0);
        lead.shutdown().await;
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let registry = Arc::new(EngineRegistry::with_builtin_engines());
        let results = Arc::new(ResultRouter::new());
        let options = QueueOptions {
            max_child_queues: 1,
            ..QueueOptions::default()
        };
        let lead = DatabaseQueue::create_lead(
            "orders",
            EngineKind::SQLite,
            ":memory:",
            registry,
            results,
            options,
        );
        lead.spawn_child_queue(QueueKind::Fast).unwrap();
        let result = lead.spawn_child_queue(QueueKind::Slow);
        assert!(matches!(result, Err(DbError::Capacity { .. })));
        lead.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_queue_cannot_spawn() {
        let registry = Arc::new(EngineRegistry::with_builtin_engines());
        let results = Arc::new(ResultRouter::new());
        let worker = DatabaseQueue::create_worker(
            "orders",
            EngineKind::SQLite,
            ":memory:",
            QueueKind::Fast,
            1,
            registry,
            results,
            QueueOptions::default(),
        );
        assert!(worker.spawn_child_queue(QueueKind::Slow).is_err());
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_routing_prefers_child_after_spawn() {
        let lead = lead();
        lead.start_worker().unwrap();
        lead.spawn_child_queue(QueueKind::Fast).unwrap();

        let query = crate::models::QueuedQuery::new("SELECT 1", QueueKind::Fast);
        let pending = lead.submit_query(query).unwrap();
        let result = pending
            .wait(std::time::Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(result.row_count(), 1);

        // The child served it, not the lead.
        let child_processed: u64 = {
            let children = lead.children.lock().unwrap();
            children.iter().map(|c| c.total_queries_processed()).sum()
        };
        assert_eq!(child_processed, 1);
        assert_eq!(lead.total_queries_processed(), 0);
        lead.shutdown().await;
    }
}
