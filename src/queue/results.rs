//! Result routing for submitted queries.
//!
//! A submitting caller registers a one-shot slot keyed by query id and
//! receives a [`PendingResult`] to await; the worker that executes the query
//! completes the slot. Results for callers that went away are dropped, and a
//! caller that times out removes its own slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::models::QueryResult;

type QueryOutcome = DbResult<QueryResult>;

pub struct ResultRouter {
    slots: Mutex<HashMap<String, oneshot::Sender<QueryOutcome>>>,
}

impl ResultRouter {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Register a result slot for `query_id`. A second registration for the
    /// same id replaces the first (whose receiver then resolves as dropped).
    pub fn register(self: &Arc<Self>, query_id: &str) -> PendingResult {
        let (sender, receiver) = oneshot::channel();
        {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.insert(query_id.to_string(), sender);
        }
        PendingResult {
            query_id: query_id.to_string(),
            receiver,
            router: Arc::clone(self),
        }
    }

    /// Deliver an outcome. Returns false when no caller is waiting (the
    /// outcome is dropped).
    pub fn complete(&self, query_id: &str, outcome: QueryOutcome) -> bool {
        let sender = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.remove(query_id)
        };
        match sender {
            Some(sender) => sender.send(outcome).is_ok(),
            None => {
                debug!(query_id = query_id, "No caller waiting for result");
                false
            }
        }
    }

    /// Remove a slot without delivering, e.g. when the caller timed out.
    pub fn cancel(&self, query_id: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(query_id);
    }

    /// Number of callers currently waiting.
    pub fn pending(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.len()
    }
}

impl Default for ResultRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// The caller's side of a registered result slot.
pub struct PendingResult {
    query_id: String,
    receiver: oneshot::Receiver<QueryOutcome>,
    router: Arc<ResultRouter>,
}

impl PendingResult {
    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    /// Await the query outcome with a bounded wait. On timeout the slot is
    /// removed so the worker's eventual result is dropped rather than
    /// delivered to nobody.
    pub async fn wait(self, timeout: Duration) -> DbResult<QueryResult> {
        match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(DbError::internal(
                "Result slot dropped before query completion",
            )),
            Err(_) => {
                self.router.cancel(&self.query_id);
                Err(DbError::timeout("await query result", timeout.as_secs()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QueryResult;

    #[tokio::test]
    async fn test_complete_delivers_to_waiter() {
        let router = Arc::new(ResultRouter::new());
        let pending = router.register("q_1");
        assert_eq!(router.pending(), 1);

        assert!(router.complete("q_1", Ok(QueryResult::empty(1))));
        let result = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.execution_time_ms, 1);
        assert_eq!(router.pending(), 0);
    }

    #[tokio::test]
    async fn test_complete_without_waiter_is_dropped() {
        let router = Arc::new(ResultRouter::new());
        assert!(!router.complete("q_unknown", Ok(QueryResult::empty(0))));
    }

    #[tokio::test]
    async fn test_wait_timeout_cancels_slot() {
        let router = Arc::new(ResultRouter::new());
        let pending = router.register("q_2");
        let result = pending.wait(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(DbError::Timeout { .. })));
        assert_eq!(router.pending(), 0);
    }

    #[tokio::test]
    async fn test_error_outcome_propagates() {
        let router = Arc::new(ResultRouter::new());
        let pending = router.register("q_3");
        router.complete("q_3", Err(DbError::connection("gone")));
        let result = pending.wait(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(DbError::Connection { .. })));
    }
}
