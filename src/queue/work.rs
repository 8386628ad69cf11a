//! Generic thread-safe priority queue.
//!
//! Payload-type-agnostic: entries are opaque byte payloads with a priority.
//! Higher priority is served first; entries of equal priority are served in
//! arrival order (a monotonic sequence number breaks ties). The depth
//! counter is updated inside the queue lock, so it is exact under any
//! interleaving of producers and the consumer.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use tokio::sync::Notify;

struct Entry {
    priority: u8,
    seq: u64,
    payload: Vec<u8>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence (older) first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

/// A named, single-consumer priority queue.
pub struct WorkQueue {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
    depth: AtomicUsize,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
            depth: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a payload and wake the consumer.
    pub fn push(&self, payload: Vec<u8>, priority: u8) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Entry {
                priority,
                seq,
                payload,
            });
            self.depth.fetch_add(1, AtomicOrdering::SeqCst);
        }
        self.notify.notify_one();
    }

    /// Dequeue the highest-priority (oldest within priority) payload.
    pub fn try_pop(&self) -> Option<Vec<u8>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state.heap.pop()?;
        self.depth.fetch_sub(1, AtomicOrdering::SeqCst);
        Some(entry.payload)
    }

    /// Current number of queued payloads.
    pub fn depth(&self) -> usize {
        self.depth.load(AtomicOrdering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// Wait until a push signals new work. A signal sent while nobody is
    /// waiting is latched, so the consumer's pop-then-wait loop cannot miss
    /// work.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Wake the consumer without enqueuing, e.g. on shutdown.
    pub fn wake(&self) {
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_within_equal_priority() {
        let q = WorkQueue::new("test");
        q.push(b"a".to_vec(), 1);
        q.push(b"b".to_vec(), 1);
        q.push(b"c".to_vec(), 1);
        assert_eq!(q.try_pop(), Some(b"a".to_vec()));
        assert_eq!(q.try_pop(), Some(b"b".to_vec()));
        assert_eq!(q.try_pop(), Some(b"c".to_vec()));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn test_priority_ordering() {
        let q = WorkQueue::new("test");
        q.push(b"slow".to_vec(), 0);
        q.push(b"cache".to_vec(), 3);
        q.push(b"medium".to_vec(), 1);
        q.push(b"fast".to_vec(), 2);
        assert_eq!(q.try_pop(), Some(b"cache".to_vec()));
        assert_eq!(q.try_pop(), Some(b"fast".to_vec()));
        assert_eq!(q.try_pop(), Some(b"medium".to_vec()));
        assert_eq!(q.try_pop(), Some(b"slow".to_vec()));
    }

    #[test]
    fn test_depth_conservation_under_concurrency() {
        let q = Arc::new(WorkQueue::new("test"));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let q = Arc::clone(&q);
            handles.push(std::thread::spawn(move || {
                for i in 0..100u8 {
                    q.push(vec![i], i % 4);
                }
            }));
        }
        for h in handles {
            h.join().expect("producer thread");
        }
        assert_eq!(q.depth(), 800);

        let mut popped = 0;
        while q.try_pop().is_some() {
            popped += 1;
        }
        assert_eq!(popped, 800);
        assert_eq!(q.depth(), 0);
    }

    #[tokio::test]
    async fn test_notify_latches_signal() {
        let q = Arc::new(WorkQueue::new("test"));
        q.push(b"x".to_vec(), 0);
        // The push happened before anyone waited; the permit is latched.
        tokio::time::timeout(std::time::Duration::from_millis(100), q.notified())
            .await
            .expect("latched notification");
        assert_eq!(q.try_pop(), Some(b"x".to_vec()));
    }
}
