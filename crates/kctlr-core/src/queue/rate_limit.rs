//! Rate limiters deciding how long a failed item waits before redelivery.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Base delay of the default per-item backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Cap of the default per-item backoff.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Sustained rate of the default overall bucket, in items per second.
pub const DEFAULT_QPS: f64 = 10.0;

/// Burst size of the default overall bucket.
pub const DEFAULT_BURST: u32 = 100;

/// Decides the delay for re-adding an item and tracks its failures.
pub trait RateLimiter<T>: Send + Sync {
    /// Delay before the item may be redelivered. Records one more failure.
    fn when(&self, item: &T) -> Duration;

    /// Failures recorded since the item was last forgotten.
    fn num_requeues(&self, item: &T) -> u32;

    /// Stop tracking the item.
    fn forget(&self, item: &T);
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ItemExponentialRateLimiter<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T> ItemExponentialRateLimiter<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Delay for an item that has already failed `failures` times.
    pub fn delay_for(&self, failures: u32) -> Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl<T> RateLimiter<T> for ItemExponentialRateLimiter<T>
where
    T: Eq + Hash + Clone + Send + Sync,
{
    fn when(&self, item: &T) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(item.clone()).or_insert(0);
        let delay = self.delay_for(*count);
        *count = count.saturating_add(1);
        delay
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(item)
            .copied()
            .unwrap_or(0)
    }

    fn forget(&self, item: &T) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(item);
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by every item.
///
/// Each `when` reserves one token; once the bucket is empty the returned
/// delay is the time until the reserved token is refilled.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            // A vanishing rate overflows the conversion; treat it as "never".
            Duration::try_from_secs_f64(-bucket.tokens / self.qps).unwrap_or(Duration::MAX)
        }
    }

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }

    fn forget(&self, _item: &T) {}
}

/// Combines limiters by taking the longest delay.
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        // Every child sees the failure, so none can short-circuit.
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .fold(Duration::ZERO, Duration::max)
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or(0)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }
}

/// Per-item exponential backoff (5ms to 1000s) combined with an overall
/// bucket of 10 qps and a burst of 100.
pub fn default_controller_rate_limiter<T>() -> MaxOfRateLimiter<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialRateLimiter::new(
            DEFAULT_BASE_DELAY,
            DEFAULT_MAX_DELAY,
        )),
        Box::new(BucketRateLimiter::new(DEFAULT_QPS, DEFAULT_BURST)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limiter() -> ItemExponentialRateLimiter<&'static str> {
        ItemExponentialRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1))
    }

    #[test]
    fn test_exponential_doubles_per_failure() {
        let limiter = limiter();
        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(10));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(20));
        assert_eq!(limiter.num_requeues(&"a"), 3);

        // Other items are tracked separately.
        assert_eq!(limiter.when(&"b"), Duration::from_millis(5));
        assert_eq!(limiter.num_requeues(&"b"), 1);
    }

    #[test]
    fn test_exponential_is_capped() {
        let limiter = limiter();
        assert_eq!(limiter.delay_for(8), Duration::from_secs(1));
        assert_eq!(limiter.delay_for(64), Duration::from_secs(1));
        assert_eq!(limiter.delay_for(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_forget_resets_to_base() {
        let limiter = limiter();
        for _ in 0..4 {
            limiter.when(&"a");
        }
        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_allows_burst_then_spaces_out() {
        let limiter = BucketRateLimiter::new(10.0, 2);
        assert_eq!(RateLimiter::<u32>::when(&limiter, &1), Duration::ZERO);
        assert_eq!(RateLimiter::<u32>::when(&limiter, &2), Duration::ZERO);
        assert_eq!(
            RateLimiter::<u32>::when(&limiter, &3),
            Duration::from_millis(100)
        );

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(RateLimiter::<u32>::when(&limiter, &4), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_with_zero_rate_never_refills() {
        let limiter = BucketRateLimiter::new(0.0, 1);
        assert_eq!(RateLimiter::<u32>::when(&limiter, &1), Duration::ZERO);
        assert_eq!(RateLimiter::<u32>::when(&limiter, &1), Duration::MAX);
        assert_eq!(RateLimiter::<u32>::when(&limiter, &1), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_of_takes_longest_delay() {
        let limiter: MaxOfRateLimiter<&str> = MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialRateLimiter::new(
                Duration::from_millis(1),
                Duration::from_secs(10),
            )),
            Box::new(BucketRateLimiter::new(1.0, 1)),
        ]);

        // First call: bucket has a token, backoff is 1ms.
        assert_eq!(limiter.when(&"a"), Duration::from_millis(1));
        // Second call: bucket is empty and needs a full second.
        assert_eq!(limiter.when(&"a"), Duration::from_secs(1));
        assert_eq!(limiter.num_requeues(&"a"), 2);

        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
    }

    proptest! {
        #[test]
        fn delay_is_bounded(failures in 0u32..200) {
            let limiter = limiter();
            let delay = limiter.delay_for(failures);
            prop_assert!(delay >= Duration::from_millis(5));
            prop_assert!(delay <= Duration::from_secs(1));
        }

        #[test]
        fn delay_is_non_decreasing(failures_a in 0u32..64, failures_b in 0u32..64) {
            let limiter = limiter();
            if failures_a <= failures_b {
                prop_assert!(limiter.delay_for(failures_a) <= limiter.delay_for(failures_b));
            }
        }

        #[test]
        fn consecutive_when_never_shrinks(rounds in 1usize..40) {
            let limiter = limiter();
            let mut previous = Duration::ZERO;
            for _ in 0..rounds {
                let delay = limiter.when(&"k");
                prop_assert!(delay >= previous);
                previous = delay;
            }
            prop_assert_eq!(limiter.num_requeues(&"k") as usize, rounds);
        }
    }
}
