//! Deduplicating, rate-limited work queue.
//!
//! Every item is in at most one of these places at a time:
//! - `queue`: waiting to be handed to a worker (and also in `dirty`)
//! - `processing`: checked out by a worker
//! - `processing` and `dirty`: re-added while checked out, so it goes
//!   back on `queue` exactly once when the worker calls [`WorkQueue::done`]
//!
//! Delayed adds wait in `waiting` until their ready time, keeping only the
//! earliest ready time per item.

pub mod rate_limit;

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::trace;

use self::rate_limit::{RateLimiter, default_controller_rate_limiter};

/// Longest delay `add_after` honours; anything later is clamped to it.
const MAX_ADD_DELAY: Duration = Duration::from_secs(86400 * 365 * 30);

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    waiting: HashMap<T, Instant>,
    shutting_down: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    /// Signalled when an item is queued or the queue shuts down.
    available: Notify,
    /// Signalled when the processing set becomes empty.
    idle: Notify,
    shutdown_tx: watch::Sender<bool>,
    limiter: Box<dyn RateLimiter<T>>,
}

/// Work queue shared between the event producer and the worker pool.
///
/// This is cheaply cloneable; clones share the same queue.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create a queue using the default controller rate limiter.
    pub fn new() -> Self {
        Self::with_rate_limiter(default_controller_rate_limiter())
    }

    /// Create a queue with a custom rate limiter.
    pub fn with_rate_limiter(limiter: impl RateLimiter<T> + 'static) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    waiting: HashMap::new(),
                    shutting_down: false,
                }),
                available: Notify::new(),
                idle: Notify::new(),
                shutdown_tx,
                limiter: Box::new(limiter),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an item for processing.
    ///
    /// No-op if the item is already queued. If it is being processed it is
    /// marked dirty and queued again once the worker calls [`done`](Self::done).
    /// Ignored after shutdown.
    pub fn add(&self, item: T) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        if !state.dirty.insert(item.clone()) {
            return;
        }
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.available.notify_one();
    }

    /// Wait for the next item.
    ///
    /// Returns `None` once the queue is shut down and every queued item has
    /// been handed out. Every `Some` must be paired with a call to
    /// [`done`](Self::done).
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    if !state.queue.is_empty() {
                        self.inner.available.notify_one();
                    }
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark an item as finished processing.
    pub fn done(&self, item: &T) {
        let mut state = self.lock();
        state.processing.remove(item);
        let requeued = state.dirty.contains(item);
        if requeued {
            state.queue.push_back(item.clone());
        }
        let idle = state.processing.is_empty();
        drop(state);

        if requeued {
            self.inner.available.notify_one();
        }
        if idle {
            self.inner.idle.notify_waiters();
        }
    }

    /// Queue an item once `delay` has passed.
    ///
    /// If the item is already waiting, the earlier ready time wins. Must be
    /// called from within a Tokio runtime when `delay` is non-zero.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let ready_at = Instant::now() + delay.min(MAX_ADD_DELAY);
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            if let Some(existing) = state.waiting.get(&item)
                && *existing <= ready_at
            {
                return;
            }
            state.waiting.insert(item.clone(), ready_at);
        }

        let queue = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(ready_at) => queue.release_waiting(item, ready_at),
                _ = shutdown_rx.wait_for(|shutdown| *shutdown) => {}
            }
        });
    }

    fn release_waiting(&self, item: T, ready_at: Instant) {
        {
            let mut state = self.lock();
            if state.waiting.get(&item) != Some(&ready_at) {
                // Superseded by an earlier delayed add.
                return;
            }
            state.waiting.remove(&item);
        }
        self.add(item);
    }

    /// Queue an item after the rate limiter's delay for it.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.inner.limiter.when(&item);
        trace!(delay_ms = delay.as_millis() as u64, "rate limited re-add");
        self.add_after(item, delay);
    }

    /// Failures recorded for an item since it was last forgotten.
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.inner.limiter.num_requeues(item)
    }

    /// Clear an item's failure history. Does not touch queue presence.
    pub fn forget(&self, item: &T) {
        self.inner.limiter.forget(item);
    }

    /// Stop accepting new items and wake every waiting [`get`](Self::get).
    ///
    /// Items already queued are still handed out; after that `get` returns
    /// `None`. Pending delayed adds are discarded.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.inner.shutdown_tx.send_replace(true);
        self.inner.available.notify_waiters();
    }

    /// Shut down and wait until no item is checked out.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.lock().processing.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Whether [`shut_down`](Self::shut_down) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of items waiting to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no item is waiting to be handed out.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of items currently checked out.
    pub fn processing_len(&self) -> usize {
        self.lock().processing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::rate_limit::{BucketRateLimiter, ItemExponentialRateLimiter};
    use pretty_assertions::assert_eq;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::with_rate_limiter(ItemExponentialRateLimiter::new(
            Duration::from_millis(10),
            Duration::from_secs(1),
        ))
    }

    #[tokio::test]
    async fn test_add_deduplicates_pending_items() {
        let queue = queue();
        queue.add("a");
        queue.add("b");
        queue.add("a");
        queue.add("a");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_add_while_processing_redelivers_once() {
        let queue = queue();
        queue.add("a");
        let item = queue.get().await.unwrap();

        queue.add("a");
        queue.add("a");
        // Held back until done.
        assert_eq!(queue.len(), 0);

        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("a"));
        queue.done(&"a");
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_done_without_readd_does_not_requeue() {
        let queue = queue();
        queue.add("a");
        let item = queue.get().await.unwrap();
        queue.done(&item);
        assert!(queue.is_empty());
        assert_eq!(queue.processing_len(), 0);
    }

    #[tokio::test]
    async fn test_get_waits_for_add() {
        let queue = queue();
        let getter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::task::yield_now().await;
        queue.add("late");
        assert_eq!(getter.await.unwrap(), Some("late"));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_blocked_getters() {
        let queue = queue();
        let getters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            })
            .collect();

        tokio::task::yield_now().await;
        queue.shut_down();

        for getter in getters {
            assert_eq!(getter.await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_items_first() {
        let queue = queue();
        queue.add("a");
        queue.add("b");
        queue.shut_down();

        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
        assert_eq!(queue.get().await, None);
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn test_add_after_shutdown_is_ignored() {
        let queue = queue();
        queue.shut_down();
        queue.add("a");
        assert!(queue.is_empty());
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_delivers_when_ready() {
        let queue = queue();
        let start = Instant::now();
        queue.add_after("a", Duration::from_secs(5));
        assert!(queue.is_empty());

        let item = tokio::time::timeout(Duration::from_secs(10), queue.get())
            .await
            .expect("item should be released");
        assert_eq!(item, Some("a"));
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_keeps_earliest_ready_time() {
        let queue = queue();
        let start = Instant::now();
        queue.add_after("a", Duration::from_secs(10));
        queue.add_after("a", Duration::from_secs(1));
        queue.add_after("a", Duration::from_secs(30));

        assert_eq!(queue.get().await, Some("a"));
        assert!(start.elapsed() < Duration::from_secs(10));
        queue.done(&"a");

        // The superseded timers must not deliver the item again.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_rate_limited_backs_off() {
        let queue = queue();
        queue.add_rate_limited("a");
        queue.add_rate_limited("a");
        assert_eq!(queue.num_requeues(&"a"), 2);

        let start = Instant::now();
        assert_eq!(queue.get().await, Some("a"));
        // The second add waited longer, so the first ready time wins.
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert!(start.elapsed() < Duration::from_millis(20));

        queue.forget(&"a");
        assert_eq!(queue.num_requeues(&"a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_rate_limited_with_unbounded_delay_parks_item() {
        let queue = WorkQueue::with_rate_limiter(BucketRateLimiter::new(0.0, 1));
        queue.add_rate_limited("a");
        queue.add_rate_limited("b");
        assert_eq!(queue.len(), 1);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(queue.get().await, Some("a"));
        queue.done(&"a");
        assert!(queue.is_empty());

        queue.shut_down();
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_discards_delayed_adds() {
        let queue = queue();
        queue.add_after("a", Duration::from_secs(1));
        queue.shut_down();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn test_shut_down_with_drain_waits_for_done() {
        let queue = queue();
        queue.add("a");
        let item = queue.get().await.unwrap();

        let drain = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.shut_down_with_drain().await })
        };
        tokio::task::yield_now().await;
        assert!(!drain.is_finished());

        queue.done(&item);
        drain.await.unwrap();
        assert!(queue.is_shutting_down());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_workers_never_share_a_key() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let queue: WorkQueue<u32> = WorkQueue::new();
        let in_flight: Arc<Vec<AtomicUsize>> = Arc::new((0..4).map(|_| AtomicUsize::new(0)).collect());

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let queue = queue.clone();
                let in_flight = Arc::clone(&in_flight);
                tokio::spawn(async move {
                    let mut handled = 0usize;
                    while let Some(key) = queue.get().await {
                        let slot = &in_flight[key as usize];
                        assert_eq!(slot.fetch_add(1, Ordering::SeqCst), 0, "key {key} held twice");
                        tokio::task::yield_now().await;
                        slot.fetch_sub(1, Ordering::SeqCst);
                        queue.done(&key);
                        handled += 1;
                    }
                    handled
                })
            })
            .collect();

        for round in 0..200u32 {
            queue.add(round % 4);
            if round % 16 == 0 {
                tokio::task::yield_now().await;
            }
        }
        queue.shut_down_with_drain().await;

        let mut total = 0;
        for worker in workers {
            total += worker.await.unwrap();
        }
        assert!(total >= 4);
    }
}
