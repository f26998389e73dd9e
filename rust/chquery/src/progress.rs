//! In-process tracking of running queries and fan-out of their progress.
//!
//! State lives in this process only, so a multi-replica deployment needs a
//! shared store instead.

use crate::error::{Result, ServiceError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryProgress {
    pub read_rows: u64,
    pub read_bytes: u64,
    pub total_rows_to_read: u64,
    pub elapsed_ms: u64,
}

impl QueryProgress {
    /// Folds one progress packet from the store into the running totals.
    fn apply(&mut self, delta: &QueryProgress) {
        self.read_rows = self.read_rows.saturating_add(delta.read_rows);
        self.read_bytes = self.read_bytes.saturating_add(delta.read_bytes);
        self.total_rows_to_read = self
            .total_rows_to_read
            .saturating_add(delta.total_rows_to_read);
        self.elapsed_ms = self.elapsed_ms.max(delta.elapsed_ms);
    }
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueryProgress>,
    closed: bool,
    dropped: u64,
}

/// Bounded single-consumer queue. When full, the oldest snapshot is dropped so
/// publishers never wait on a slow reader.
struct SubscriberQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Returns false once the queue is closed.
    fn push(&self, progress: QueryProgress) -> bool {
        let dropped = {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            let dropped = if state.items.len() >= self.capacity {
                state.items.pop_front();
                state.dropped += 1;
                Some(state.dropped)
            } else {
                None
            };
            state.items.push_back(progress);
            dropped
        };
        if let Some(total) = dropped {
            warn!(dropped = total, "progress subscriber is lagging, dropped oldest snapshot");
        }
        self.notify.notify_one();
        true
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            drop(state);
            self.notify.notify_one();
        }
    }
}

#[derive(Default)]
struct Subscribers {
    queues: HashMap<Uuid, Arc<SubscriberQueue>>,
    closed: bool,
}

struct QueryTracker {
    progress: RwLock<QueryProgress>,
    subscribers: RwLock<Subscribers>,
}

impl QueryTracker {
    fn new() -> Self {
        Self {
            progress: RwLock::new(QueryProgress::default()),
            subscribers: RwLock::new(Subscribers::default()),
        }
    }

    fn publish(&self, snapshot: QueryProgress) {
        for queue in self.subscribers.read().queues.values() {
            queue.push(snapshot);
        }
    }

    /// Adds a queue, or closes it straight away when the query already ended.
    fn attach(&self, id: Uuid, queue: &Arc<SubscriberQueue>) {
        let mut subscribers = self.subscribers.write();
        if subscribers.closed {
            queue.close();
        } else {
            subscribers.queues.insert(id, Arc::clone(queue));
        }
    }

    fn close_all(&self) {
        let mut subscribers = self.subscribers.write();
        subscribers.closed = true;
        for (_, queue) in subscribers.queues.drain() {
            queue.close();
        }
    }
}

struct TrackerInner {
    queries: RwLock<HashMap<String, Arc<QueryTracker>>>,
    buffer: usize,
}

/// Process-wide registry of running queries. Cloning shares the registry.
#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<TrackerInner>,
}

impl ProgressTracker {
    /// `buffer` is the per-subscriber snapshot capacity.
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                queries: RwLock::new(HashMap::new()),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Registers a running query. Dropping the guard ends tracking and closes
    /// every subscription for it.
    pub fn report_query_started(&self, query_id: &str) -> Result<QueryProgressGuard> {
        let mut queries = self.inner.queries.write();
        if queries.contains_key(query_id) {
            return Err(ServiceError::AlreadyExists(format!(
                "query {query_id} already started"
            )));
        }
        queries.insert(query_id.to_string(), Arc::new(QueryTracker::new()));
        debug!(query_id, "tracking query progress");
        Ok(QueryProgressGuard {
            tracker: self.clone(),
            query_id: query_id.to_string(),
        })
    }

    pub fn report_query_progress(&self, query_id: &str, delta: &QueryProgress) -> Result<()> {
        let tracker = self.lookup(query_id)?;
        // Publishing under the write lock keeps snapshots in order.
        let mut progress = tracker.progress.write();
        progress.apply(delta);
        tracker.publish(*progress);
        Ok(())
    }

    pub fn subscribe(&self, query_id: &str) -> Result<ProgressSubscription> {
        let tracker = self.lookup(query_id)?;
        Ok(self.attach(&tracker))
    }

    fn attach(&self, tracker: &Arc<QueryTracker>) -> ProgressSubscription {
        let id = Uuid::new_v4();
        let queue = Arc::new(SubscriberQueue::new(self.inner.buffer));
        tracker.attach(id, &queue);
        ProgressSubscription {
            id,
            queue,
            tracker: Arc::downgrade(tracker),
        }
    }

    pub fn snapshot(&self, query_id: &str) -> Result<QueryProgress> {
        Ok(*self.lookup(query_id)?.progress.read())
    }

    pub fn is_tracking(&self, query_id: &str) -> bool {
        self.inner.queries.read().contains_key(query_id)
    }

    fn lookup(&self, query_id: &str) -> Result<Arc<QueryTracker>> {
        self.inner
            .queries
            .read()
            .get(query_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("query {query_id} doesn't exist")))
    }

    fn finish(&self, query_id: &str) {
        let removed = self.inner.queries.write().remove(query_id);
        if let Some(tracker) = removed {
            tracker.close_all();
            debug!(query_id, "query progress tracking finished");
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Scoped registration returned by [`ProgressTracker::report_query_started`].
pub struct QueryProgressGuard {
    tracker: ProgressTracker,
    query_id: String,
}

impl QueryProgressGuard {
    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn reporter(&self) -> ProgressReporter {
        ProgressReporter {
            tracker: self.tracker.clone(),
            query_id: self.query_id.clone(),
        }
    }
}

impl std::fmt::Debug for QueryProgressGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryProgressGuard")
            .field("query_id", &self.query_id)
            .finish_non_exhaustive()
    }
}

impl Drop for QueryProgressGuard {
    fn drop(&mut self) {
        self.tracker.finish(&self.query_id);
    }
}

/// Handle an executor uses to report progress for one query.
#[derive(Clone)]
pub struct ProgressReporter {
    tracker: ProgressTracker,
    query_id: String,
}

impl ProgressReporter {
    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn report(&self, delta: QueryProgress) -> Result<()> {
        self.tracker.report_query_progress(&self.query_id, &delta)
    }
}

pub struct ProgressSubscription {
    id: Uuid,
    queue: Arc<SubscriberQueue>,
    tracker: Weak<QueryTracker>,
}

impl ProgressSubscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next snapshot, or `None` once the query finished or the subscription
    /// was cancelled and the queue is drained.
    pub async fn recv(&mut self) -> Option<QueryProgress> {
        loop {
            {
                let mut state = self.queue.state.lock();
                if let Some(progress) = state.items.pop_front() {
                    return Some(progress);
                }
                if state.closed {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<QueryProgress> {
        self.queue.state.lock().items.pop_front()
    }

    /// Snapshots dropped because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.queue.state.lock().dropped
    }

    /// Stops delivery. Calling it again is a no-op.
    pub fn unsubscribe(&mut self) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.subscribers.write().queues.remove(&self.id);
        }
        self.queue.close();
    }
}

impl Drop for ProgressSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(rows: u64, bytes: u64, total: u64, elapsed: u64) -> QueryProgress {
        QueryProgress {
            read_rows: rows,
            read_bytes: bytes,
            total_rows_to_read: total,
            elapsed_ms: elapsed,
        }
    }

    #[test]
    fn duplicate_start_is_rejected() {
        let tracker = ProgressTracker::new(4);
        let _guard = tracker.report_query_started("q1").unwrap();
        let err = tracker.report_query_started("q1").unwrap_err();
        assert_eq!(err.to_string(), "already exists: query q1 already started");
    }

    #[test]
    fn unknown_query_is_not_found() {
        let tracker = ProgressTracker::new(4);
        let err = tracker
            .report_query_progress("missing", &QueryProgress::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "not found: query missing doesn't exist");
        assert!(tracker.subscribe("missing").is_err());
    }

    #[test]
    fn progress_accumulates() {
        let tracker = ProgressTracker::new(4);
        let _guard = tracker.report_query_started("q1").unwrap();
        tracker
            .report_query_progress("q1", &delta(10, 100, 50, 5))
            .unwrap();
        tracker
            .report_query_progress("q1", &delta(5, 50, 0, 3))
            .unwrap();
        assert_eq!(tracker.snapshot("q1").unwrap(), delta(15, 150, 50, 5));
    }

    #[test]
    fn guard_drop_closes_subscribers() {
        let tracker = ProgressTracker::new(4);
        let guard = tracker.report_query_started("q1").unwrap();
        let mut sub = tracker.subscribe("q1").unwrap();
        guard.reporter().report(delta(1, 1, 1, 1)).unwrap();
        drop(guard);

        assert!(!tracker.is_tracking("q1"));
        assert_eq!(sub.try_recv(), Some(delta(1, 1, 1, 1)));
        assert_eq!(sub.try_recv(), None);
        assert!(sub.queue.state.lock().closed);
    }

    #[tokio::test]
    async fn subscribing_after_finish_ends_immediately() {
        let tracker = ProgressTracker::new(4);
        let guard = tracker.report_query_started("q1").unwrap();
        let query = tracker.lookup("q1").unwrap();
        drop(guard);

        let mut sub = tracker.attach(&query);
        assert!(query.subscribers.read().queues.is_empty());
        assert_eq!(sub.recv().await, None);
    }

    #[test]
    fn slow_subscriber_drops_oldest() {
        let tracker = ProgressTracker::new(2);
        let _guard = tracker.report_query_started("q1").unwrap();
        let mut sub = tracker.subscribe("q1").unwrap();
        for elapsed in 1..=4 {
            tracker
                .report_query_progress("q1", &delta(1, 0, 0, elapsed))
                .unwrap();
        }
        assert_eq!(sub.dropped(), 2);
        assert_eq!(sub.try_recv().map(|p| p.read_rows), Some(3));
        assert_eq!(sub.try_recv().map(|p| p.read_rows), Some(4));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn unsubscribe_twice_is_harmless() {
        let tracker = ProgressTracker::new(4);
        let _guard = tracker.report_query_started("q1").unwrap();
        let mut sub = tracker.subscribe("q1").unwrap();
        sub.unsubscribe();
        sub.unsubscribe();
        tracker
            .report_query_progress("q1", &delta(1, 0, 0, 0))
            .unwrap();
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn recv_waits_for_publish() {
        let tracker = ProgressTracker::new(4);
        let guard = tracker.report_query_started("q1").unwrap();
        let mut sub = tracker.subscribe("q1").unwrap();
        let reporter = guard.reporter();

        let publisher = tokio::spawn(async move {
            reporter.report(delta(7, 70, 0, 1)).unwrap();
            drop(guard);
        });

        assert_eq!(sub.recv().await, Some(delta(7, 70, 0, 1)));
        assert_eq!(sub.recv().await, None);
        publisher.await.unwrap();
    }
}
