//! A single named work queue with one dedicated worker.
//!
//! Each `DatabaseQueue` owns a generic priority queue, exactly one worker
//! task, and one persistent database connection. The worker blocks waiting
//! for work, executes dequeued queries through the engine registry, and
//! delivers outcomes through the result router. A heartbeat on a
//! configurable interval health-checks the connection and re-establishes it
//! when it drops; submitted queries are never retried by this layer.
//!
//! State machine: Created -> Running (worker active) -> ShutdownRequested ->
//! Stopped -> Destroyed. Teardown is idempotent.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{DatabaseHandle, EngineRegistry};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionConfig, EngineKind, QueueKind, QueuedQuery};

use super::results::{PendingResult, ResultRouter};
use super::work::WorkQueue;

/// Minimum spacing between connection attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Bounded wait for the worker task to finish during shutdown. Teardown
/// proceeds regardless once this elapses.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// Health-check failures tolerated before the connection is torn down and
/// re-established by the heartbeat.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Tunables shared by a database's lead queue and its children.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub heartbeat_interval: Duration,
    pub max_child_queues: usize,
    /// Executed once by the lead after its first successful connection.
    pub bootstrap_query: Option<String>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            max_child_queues: QueueKind::TIERS.len(),
            bootstrap_query: None,
        }
    }
}

pub struct DatabaseQueue {
    pub(crate) database_name: String,
    pub(crate) connection_string: String,
    pub(crate) engine_kind: EngineKind,
    kind: QueueKind,
    pub(crate) queue: WorkQueue,
    pub(crate) registry: Arc<EngineRegistry>,
    pub(crate) results: Arc<ResultRouter>,
    pub(crate) options: QueueOptions,

    queue_number: u32,
    tags: StdMutex<String>,
    is_lead: bool,
    can_spawn: bool,
    pub(crate) children: StdMutex<Vec<Arc<DatabaseQueue>>>,

    shutdown_tx: watch::Sender<bool>,
    worker: StdMutex<Option<JoinHandle<()>>>,
    worker_started: AtomicBool,

    pub(crate) connection: AsyncMutex<Option<DatabaseHandle>>,
    is_connected: AtomicBool,
    last_connection_attempt: StdMutex<Option<Instant>>,
    bootstrap_pending: StdMutex<Option<String>>,

    total_queries_processed: AtomicU64,
    failed_queries: AtomicU64,
}

impl DatabaseQueue {
    fn new(
        database_name: &str,
        engine_kind: EngineKind,
        connection_string: &str,
        kind: QueueKind,
        queue_number: u32,
        registry: Arc<EngineRegistry>,
        results: Arc<ResultRouter>,
        options: QueueOptions,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let is_lead = kind == QueueKind::Lead;
        let tags = if is_lead {
            "LSMFC".to_string()
        } else {
            kind.tag().to_string()
        };
        let bootstrap = if is_lead {
            options.bootstrap_query.clone()
        } else {
            None
        };
        Arc::new(Self {
            database_name: database_name.to_string(),
            connection_string: connection_string.to_string(),
            engine_kind,
            kind,
            queue: WorkQueue::new(format!("{}-{}", database_name, kind.as_str())),
            registry,
            results,
            options,
            queue_number,
            tags: StdMutex::new(tags),
            is_lead,
            can_spawn: is_lead,
            children: StdMutex::new(Vec::new()),
            shutdown_tx,
            worker: StdMutex::new(None),
            worker_started: AtomicBool::new(false),
            connection: AsyncMutex::new(None),
            is_connected: AtomicBool::new(false),
            last_connection_attempt: StdMutex::new(None),
            bootstrap_pending: StdMutex::new(bootstrap),
            total_queries_processed: AtomicU64::new(0),
            failed_queries: AtomicU64::new(0),
        })
    }

    /// Create the lead queue for a database. The lead reserves queue number
    /// 00 and initially carries virtual responsibility for all four tiers.
    pub fn create_lead(
        database_name: &str,
        engine_kind: EngineKind,
        connection_string: &str,
        registry: Arc<EngineRegistry>,
        results: Arc<ResultRouter>,
        options: QueueOptions,
    ) -> Arc<Self> {
        Self::new(
            database_name,
            engine_kind,
            connection_string,
            QueueKind::Lead,
            0,
            registry,
            results,
            options,
        )
    }

    /// Create a worker queue for one tier. `queue_number` is assigned by the
    /// spawning lead.
    pub fn create_worker(
        database_name: &str,
        engine_kind: EngineKind,
        connection_string: &str,
        kind: QueueKind,
        queue_number: u32,
        registry: Arc<EngineRegistry>,
        results: Arc<ResultRouter>,
        options: QueueOptions,
    ) -> Arc<Self> {
        Self::new(
            database_name,
            engine_kind,
            connection_string,
            kind,
            queue_number,
            registry,
            results,
            options,
        )
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn queue_number(&self) -> u32 {
        self.queue_number
    }

    pub fn is_lead(&self) -> bool {
        self.is_lead
    }

    pub fn can_spawn_queues(&self) -> bool {
        self.can_spawn
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    pub fn total_queries_processed(&self) -> u64 {
        self.total_queries_processed.load(Ordering::SeqCst)
    }

    pub fn failed_queries(&self) -> u64 {
        self.failed_queries.load(Ordering::SeqCst)
    }

    pub fn shutdown_requested(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn tags(&self) -> String {
        self.tags.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn add_tag(&self, tag: char) {
        let mut tags = self.tags.lock().unwrap_or_else(|e| e.into_inner());
        if !tags.contains(tag) {
            tags.push(tag);
        }
    }

    pub(crate) fn remove_tag(&self, tag: char) {
        let mut tags = self.tags.lock().unwrap_or_else(|e| e.into_inner());
        tags.retain(|c| c != tag);
    }

    /// The designator label used on every log line tied to this queue, e.g.
    /// `DQM-orders-00-SMFC`. For queue 00 the implied `L` tag is omitted.
    pub fn label(&self) -> String {
        let tags = self.tags();
        let shown: String = if self.queue_number == 0 {
            tags.chars().filter(|c| *c != 'L').collect()
        } else {
            tags
        };
        format!(
            "DQM-{}-{:02}-{}",
            self.database_name, self.queue_number, shown
        )
    }

    /// Depth of this queue, including live children for a lead.
    pub fn depth(&self) -> usize {
        let mut total = self.queue.depth();
        if self.is_lead {
            let children = self.children.lock().unwrap_or_else(|e| e.into_inner());
            for child in children.iter() {
                total += child.queue.depth();
            }
        }
        total
    }

    /// One-line statistics summary.
    pub fn stats_line(&self) -> String {
        if self.is_lead {
            let child_count = {
                let children = self.children.lock().unwrap_or_else(|e| e.into_inner());
                children.len()
            };
            format!(
                "Database {} [{}] - Active: {}, Queries: {}, Depth: {} (Lead + {} children)",
                self.database_name,
                self.kind,
                if self.is_connected() { "YES" } else { "NO" },
                self.total_queries_processed(),
                self.depth(),
                child_count
            )
        } else {
            format!(
                "Database {} [{}] - Active: {}, Queries: {}, Depth: {}",
                self.database_name,
                self.kind,
                if self.is_connected() { "YES" } else { "NO" },
                self.total_queries_processed(),
                self.queue.depth()
            )
        }
    }

    /// Queue-level liveness: not shut down, with a sane backlog.
    pub fn health_check(&self) -> bool {
        if self.shutdown_requested() {
            return false;
        }
        let depth = self.depth();
        if depth > 10_000 {
            warn!(queue = %self.label(), depth = depth, "Queue depth too high");
        }
        true
    }

    /// Spawn the single worker task for this queue. Fails if the worker was
    /// already started.
    pub fn start_worker(self: &Arc<Self>) -> DbResult<()> {
        if self.worker_started.swap(true, Ordering::SeqCst) {
            return Err(DbError::invalid_input(format!(
                "Worker already started for {}",
                self.label()
            )));
        }
        let queue = Arc::clone(self);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(worker_loop(queue, shutdown_rx));
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        *worker = Some(handle);
        Ok(())
    }

    /// Enqueue a query on this queue's own priority queue.
    pub fn submit(&self, query: &QueuedQuery) -> DbResult<()> {
        if self.shutdown_requested() {
            return Err(DbError::queue_unavailable(self.label(), "shutting down"));
        }
        let payload = query
            .to_payload()
            .map_err(|e| DbError::invalid_input(format!("Unserializable query: {}", e)))?;
        self.queue.push(payload, query.queue_hint.priority());
        debug!(
            queue = %self.label(),
            query_id = %query.query_id,
            depth = self.queue.depth(),
            "Query enqueued"
        );
        Ok(())
    }

    /// Submit a query, routing by its tier hint: a lead forwards to the
    /// matching child when one exists and otherwise serves the tier itself.
    /// Returns the pending result slot for the caller to await.
    pub fn submit_query(&self, query: QueuedQuery) -> DbResult<PendingResult> {
        let target = self.route_target(query.queue_hint);
        let pending = self.results.register(&query.query_id);
        match target {
            Some(child) => child.submit(&query)?,
            None => self.submit(&query)?,
        }
        Ok(pending)
    }

    fn route_target(&self, hint: QueueKind) -> Option<Arc<DatabaseQueue>> {
        if !self.is_lead {
            return None;
        }
        let children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        children.iter().find(|c| c.kind == hint).cloned()
    }

    /// Request shutdown, wake the worker, and join it with a bounded wait.
    /// Teardown proceeds even if the worker does not stop within budget.
    pub async fn stop_worker(&self) {
        // send_replace updates the flag even when the worker (the only
        // receiver) has not started or has already exited.
        self.shutdown_tx.send_replace(true);
        self.queue.wake();
        let handle = {
            let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
            worker.take()
        };
        if let Some(handle) = handle {
            if tokio::time::timeout(SHUTDOWN_WAIT, handle).await.is_err() {
                warn!(
                    queue = %self.label(),
                    "Worker did not stop within budget; proceeding with teardown"
                );
            }
        }
    }

    /// Stop the worker and release the persistent connection. Safe to call
    /// repeatedly and with any subset of sub-resources already released.
    pub(crate) async fn stop_and_close(&self) {
        self.stop_worker().await;
        // A worker that outlived its join budget may still hold the
        // connection lock; teardown must not block on it. The handle is
        // dropped with the worker's Arc in that case.
        match self.connection.try_lock() {
            Ok(mut guard) => {
                if let Some(handle) = guard.as_mut() {
                    self.registry.cleanup_connection(handle).await;
                }
                *guard = None;
            }
            Err(_) => {
                warn!(
                    queue = %self.label(),
                    "Connection busy during teardown; dropping without disconnect"
                );
            }
        }
        self.is_connected.store(false, Ordering::SeqCst);
    }

    /// Full teardown. For a lead this cascades to destroy all live children
    /// first, then the lead itself.
    pub async fn shutdown(&self) {
        if self.is_lead {
            let children: Vec<Arc<DatabaseQueue>> = {
                let mut guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
                guard.drain(..).collect()
            };
            for child in children {
                child.stop_and_close().await;
            }
        }
        self.stop_and_close().await;
        info!(queue = %self.label(), "Queue destroyed");
    }

    /// Attempt to establish the persistent connection, spaced by a backoff
    /// so a down database is not hammered.
    async fn ensure_connection(&self) {
        if self.is_connected() {
            return;
        }
        {
            let mut last = self
                .last_connection_attempt
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(at) = *last {
                if at.elapsed() < RECONNECT_BACKOFF {
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        let config = ConnectionConfig::from_connection_string(&self.connection_string);
        let label = self.label();
        match self
            .registry
            .connect(self.engine_kind, &config, Some(&label))
            .await
        {
            Ok(handle) => {
                let mut guard = self.connection.lock().await;
                *guard = Some(handle);
                self.is_connected.store(true, Ordering::SeqCst);
                info!(
                    queue = %label,
                    engine = %self.engine_kind,
                    "Database connection established"
                );
            }
            Err(e) => {
                warn!(queue = %label, error = %e, "Connection attempt failed");
            }
        }
    }

    /// Heartbeat: reconnect while disconnected, otherwise health-check the
    /// connection and tear it down after repeated failures so the next beat
    /// reconnects.
    async fn perform_heartbeat(&self) {
        if !self.is_connected() {
            self.ensure_connection().await;
            return;
        }
        let mut guard = self.connection.lock().await;
        let Some(handle) = guard.as_mut() else {
            self.is_connected.store(false, Ordering::SeqCst);
            return;
        };
        match self.registry.health_check(handle).await {
            Ok(()) => {
                debug!(queue = %self.label(), "Health check passed");
            }
            Err(e) => {
                let failures = handle.consecutive_failures();
                warn!(
                    queue = %self.label(),
                    error = %e,
                    consecutive_failures = failures,
                    "Health check failed"
                );
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    self.registry.cleanup_connection(handle).await;
                    *guard = None;
                    self.is_connected.store(false, Ordering::SeqCst);
                }
            }
        }
    }

    /// Run the lead's bootstrap query once, after the first successful
    /// connection.
    async fn run_bootstrap(&self) {
        if !self.is_connected() {
            return;
        }
        let sql = {
            let mut pending = self
                .bootstrap_pending
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            pending.take()
        };
        let Some(sql) = sql else { return };

        let label = self.label();
        let request = crate::models::QueryRequest::new(sql);
        let mut guard = self.connection.lock().await;
        let Some(handle) = guard.as_mut() else { return };
        match self.registry.execute(handle, &request).await {
            Ok(result) => {
                info!(
                    queue = %label,
                    rows = result.row_count(),
                    "Bootstrap query completed"
                );
            }
            Err(e) => {
                warn!(queue = %label, error = %e, "Bootstrap query failed");
            }
        }
    }

    /// Drain everything currently queued, executing each item.
    async fn drain_available(&self) {
        while let Some(payload) = self.queue.try_pop() {
            self.process_payload(payload).await;
        }
    }

    async fn process_payload(&self, payload: Vec<u8>) {
        let mut query = match QueuedQuery::from_payload(&payload) {
            Ok(query) => query,
            Err(e) => {
                warn!(queue = %self.label(), error = %e, "Dropping undecodable queue payload");
                return;
            }
        };
        query.processed_at = Some(Utc::now());

        let outcome = self.execute_queued(&query).await;
        self.total_queries_processed.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = &outcome {
            self.failed_queries.fetch_add(1, Ordering::SeqCst);
            debug!(
                queue = %self.label(),
                query_id = %query.query_id,
                error = %e,
                "Query failed"
            );
        }
        self.results.complete(&query.query_id, outcome);
    }

    async fn execute_queued(
        &self,
        query: &QueuedQuery,
    ) -> DbResult<crate::models::QueryResult> {
        let request = query
            .to_request()
            .map_err(|e| DbError::invalid_input(format!("Bad query parameters: {}", e)))?;
        let mut guard = self.connection.lock().await;
        let handle = guard.as_mut().ok_or_else(|| {
            DbError::queue_unavailable(self.label(), "no database connection")
        })?;
        self.registry.execute(handle, &request).await
    }
}

/// The single worker loop: connect, run the lead's bootstrap, then serve
/// work and heartbeats until shutdown is requested; drain what remains and
/// exit.
async fn worker_loop(queue: Arc<DatabaseQueue>, mut shutdown_rx: watch::Receiver<bool>) {
    let label = queue.label();
    info!(queue = %label, "Worker thread started");

    queue.ensure_connection().await;
    if queue.is_lead() {
        queue.run_bootstrap().await;
    }

    let mut heartbeat = tokio::time::interval(queue.options.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first interval tick fires immediately; consume it so the initial
    // connection attempt above is not repeated back-to-back.
    heartbeat.tick().await;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            _ = queue.queue.notified() => {
                queue.drain_available().await;
            }
            _ = heartbeat.tick() => {
                queue.perform_heartbeat().await;
                if queue.is_lead() {
                    queue.run_bootstrap().await;
                }
            }
            _ = shutdown_rx.changed() => {}
        }
    }

    queue.drain_available().await;
    info!(queue = %label, "Worker thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_queue(kind: QueueKind) -> Arc<DatabaseQueue> {
        let registry = Arc::new(EngineRegistry::with_builtin_engines());
        let results = Arc::new(ResultRouter::new());
        DatabaseQueue::new(
            "orders",
            EngineKind::SQLite,
            ":memory:",
            kind,
            if kind == QueueKind::Lead { 0 } else { 1 },
            registry,
            results,
            QueueOptions::default(),
        )
    }

    #[test]
    fn test_lead_label_filters_implied_tag() {
        let lead = sqlite_queue(QueueKind::Lead);
        assert_eq!(lead.label(), "DQM-orders-00-SMFC");
        assert_eq!(lead.tags(), "LSMFC");
    }

    #[test]
    fn test_worker_label_carries_tier_tag() {
        let fast = sqlite_queue(QueueKind::Fast);
        assert_eq!(fast.label(), "DQM-orders-01-F");
        assert!(!fast.is_lead());
        assert!(!fast.can_spawn_queues());
    }

    #[test]
    fn test_tag_add_remove() {
        let lead = sqlite_queue(QueueKind::Lead);
        lead.remove_tag('F');
        assert_eq!(lead.tags(), "LSMC");
        lead.add_tag('F');
        assert_eq!(lead.tags(), "LSMCF");
        // Adding a present tag is a no-op.
        lead.add_tag('F');
        assert_eq!(lead.tags(), "LSMCF");
    }

    #[test]
    fn test_submit_bumps_depth() {
        let lead = sqlite_queue(QueueKind::Lead);
        let query = QueuedQuery::new("SELECT 1", QueueKind::Fast);
        lead.submit(&query).unwrap();
        assert_eq!(lead.depth(), 1);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let lead = sqlite_queue(QueueKind::Lead);
        lead.stop_worker().await;
        let query = QueuedQuery::new("SELECT 1", QueueKind::Medium);
        assert!(matches!(
            lead.submit(&query),
            Err(DbError::QueueUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_worker_processes_submitted_query() {
        let lead = sqlite_queue(QueueKind::Lead);
        lead.start_worker().unwrap();

        let query = QueuedQuery::new("SELECT 1 AS one", QueueKind::Fast);
        let pending = lead.submit_query(query).unwrap();
        let result = pending.wait(Duration::from_secs(10)).await.unwrap();
        assert_eq!(result.row_count(), 1);
        assert_eq!(lead.total_queries_processed(), 1);

        lead.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_worker_twice_fails() {
        let lead = sqlite_queue(QueueKind::Lead);
        lead.start_worker().unwrap();
        assert!(lead.start_worker().is_err());
        lead.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let lead = sqlite_queue(QueueKind::Lead);
        lead.start_worker().unwrap();
        lead.shutdown().await;
        lead.shutdown().await;
        assert!(!lead.is_connected());
    }

    #[tokio::test]
    async fn test_failed_query_reports_error() {
        let lead = sqlite_queue(QueueKind::Lead);
        lead.start_worker().unwrap();

        let query = QueuedQuery::new("SELECT * FROM missing_table", QueueKind::Medium);
        let pending = lead.submit_query(query).unwrap();
        let result = pending.wait(Duration::from_secs(10)).await;
        assert!(result.is_err());
        assert_eq!(lead.failed_queries(), 1);

        lead.shutdown().await;
    }
}
