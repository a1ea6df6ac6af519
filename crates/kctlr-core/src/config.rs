//! Controller configuration.

use std::hash::Hash;
use std::time::Duration;

use crate::WorkQueue;
use crate::queue::rate_limit::{
    BucketRateLimiter, DEFAULT_BASE_DELAY, DEFAULT_BURST, DEFAULT_MAX_DELAY, DEFAULT_QPS,
    ItemExponentialRateLimiter, MaxOfRateLimiter,
};

/// Default number of worker loops.
pub const DEFAULT_WORKER_COUNT: usize = 2;

/// Default number of automatic retries before a key is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default interval between cache sync checks.
pub const DEFAULT_SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for a controller and its queue.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of worker loops draining the queue.
    pub worker_count: usize,
    /// Automatic retries per key before it is dropped and reported.
    pub max_retries: u32,
    /// Interval between `has_synced` checks while waiting for the cache.
    pub sync_poll_interval: Duration,
    /// First per-key backoff delay.
    pub base_delay: Duration,
    /// Largest per-key backoff delay.
    pub max_delay: Duration,
    /// Sustained overall requeue rate.
    pub qps: f64,
    /// Overall requeue burst.
    pub burst: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            max_retries: DEFAULT_MAX_RETRIES,
            sync_poll_interval: DEFAULT_SYNC_POLL_INTERVAL,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            qps: DEFAULT_QPS,
            burst: DEFAULT_BURST,
        }
    }
}

impl ControllerConfig {
    /// Rate limiter built from the backoff and bucket settings.
    pub fn rate_limiter<T>(&self) -> MaxOfRateLimiter<T>
    where
        T: Eq + Hash + Clone + Send + Sync + 'static,
    {
        MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialRateLimiter::new(self.base_delay, self.max_delay)),
            Box::new(BucketRateLimiter::new(self.qps, self.burst)),
        ])
    }

    /// Work queue using [`rate_limiter`](Self::rate_limiter).
    pub fn queue<T>(&self) -> WorkQueue<T>
    where
        T: Eq + Hash + Clone + Send + Sync + 'static,
    {
        WorkQueue::with_rate_limiter(self.rate_limiter())
    }
}
