//! Sliding window limiter

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use super::{RateLimitConfig, RateLimitKey};

/// Admits calls while fewer than `max_calls` were admitted for the same key
/// during the trailing `window`.
///
/// All keys share one mutex, so prune-compare-append runs atomically per key.
/// No method awaits while holding it.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    calls: Mutex<HashMap<RateLimitKey, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn table(&self) -> MutexGuard<'_, HashMap<RateLimitKey, VecDeque<Instant>>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop records whose age has reached the window. Records are sorted
    /// ascending, so only the front needs checking.
    fn prune(records: &mut VecDeque<Instant>, window: Duration, now: Instant) {
        while let Some(&oldest) = records.front() {
            if now.saturating_duration_since(oldest) >= window {
                records.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record a call for `key` if the window has room.
    ///
    /// A rejected call is not recorded.
    pub fn try_admit(&self, key: &RateLimitKey) -> bool {
        let now = Instant::now();
        let mut table = self.table();
        let records = table.entry(key.clone()).or_default();

        Self::prune(records, self.config.window, now);

        if records.len() >= self.config.max_calls {
            tracing::debug!(key = %key, in_window = records.len(), "Call rejected");
            return false;
        }

        records.push_back(now);
        true
    }

    /// Time until the oldest recorded call leaves the window.
    pub fn retry_after(&self, key: &RateLimitKey) -> Duration {
        let now = Instant::now();
        let mut table = self.table();
        let Some(records) = table.get_mut(key) else {
            return Duration::ZERO;
        };

        Self::prune(records, self.config.window, now);

        match records.front() {
            Some(&oldest) => self
                .config
                .window
                .saturating_sub(now.saturating_duration_since(oldest)),
            None => Duration::ZERO,
        }
    }

    /// Number of calls currently inside the window for `key`
    pub fn in_window(&self, key: &RateLimitKey) -> usize {
        let now = Instant::now();
        let mut table = self.table();
        match table.get_mut(key) {
            Some(records) => {
                Self::prune(records, self.config.window, now);
                records.len()
            }
            None => 0,
        }
    }

    /// Number of keys with a state entry, including idle ones
    pub fn tracked_keys(&self) -> usize {
        self.table().len()
    }

    /// Remove keys whose window has emptied. Returns how many were dropped.
    pub fn purge_idle(&self) -> usize {
        let now = Instant::now();
        let window = self.config.window;
        let mut table = self.table();
        let before = table.len();
        table.retain(|_, records| {
            Self::prune(records, window, now);
            !records.is_empty()
        });
        before - table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::advance;

    fn limiter(max_calls: usize, window_secs: u64) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(RateLimitConfig::new(
            max_calls,
            Duration::from_secs(window_secs),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_per_ten_seconds() {
        let limiter = limiter(3, 10);
        let key = RateLimitKey::user("alice");

        // t=0, 1, 2
        assert!(limiter.try_admit(&key));
        advance(Duration::from_secs(1)).await;
        assert!(limiter.try_admit(&key));
        advance(Duration::from_secs(1)).await;
        assert!(limiter.try_admit(&key));

        // t=3
        advance(Duration::from_secs(1)).await;
        assert!(!limiter.try_admit(&key));
        assert_eq!(limiter.retry_after(&key), Duration::from_secs(7));

        // t=11: the t=0 and t=1 calls have both aged out
        advance(Duration::from_secs(8)).await;
        assert!(limiter.try_admit(&key));
        assert_eq!(limiter.in_window(&key), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_call_not_recorded() {
        let limiter = limiter(1, 10);
        let key = RateLimitKey::Global;

        assert!(limiter.try_admit(&key));
        for _ in 0..5 {
            advance(Duration::from_secs(1)).await;
            assert!(!limiter.try_admit(&key));
        }
        assert_eq!(limiter.in_window(&key), 1);

        // Only the first call counts, so room opens at t=10
        advance(Duration::from_secs(5)).await;
        assert!(limiter.try_admit(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_boundary_call_is_expired() {
        let limiter = limiter(1, 10);
        let key = RateLimitKey::user("bob");

        assert!(limiter.try_admit(&key));
        advance(Duration::from_millis(9_999)).await;
        assert!(!limiter.try_admit(&key));
        advance(Duration::from_millis(1)).await;
        assert!(limiter.try_admit(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_decreases_to_zero() {
        let limiter = limiter(1, 10);
        let key = RateLimitKey::user("carol");

        assert_eq!(limiter.retry_after(&key), Duration::ZERO);
        assert!(limiter.try_admit(&key));

        let mut previous = limiter.retry_after(&key);
        assert_eq!(previous, Duration::from_secs(10));
        for _ in 0..9 {
            advance(Duration::from_secs(1)).await;
            let current = limiter.retry_after(&key);
            assert!(current < previous);
            previous = current;
        }

        advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.retry_after(&key), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_bound_holds_under_steady_pressure() {
        let limiter = limiter(3, 10);
        let key = RateLimitKey::user("dave");
        let mut admitted: Vec<Duration> = Vec::new();
        let start = Instant::now();

        // One attempt every 500ms for a minute
        for _ in 0..120 {
            if limiter.try_admit(&key) {
                admitted.push(Instant::now() - start);
            }
            advance(Duration::from_millis(500)).await;
        }

        for (i, &t) in admitted.iter().enumerate() {
            let in_window = admitted[..=i]
                .iter()
                .filter(|&&s| t - s < Duration::from_secs(10))
                .count();
            assert!(in_window <= 3, "{} calls in window ending at {:?}", in_window, t);
        }
        assert!(admitted.len() >= 18);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = limiter(1, 60);

        assert!(limiter.try_admit(&RateLimitKey::user("a")));
        assert!(limiter.try_admit(&RateLimitKey::user("b")));
        assert!(limiter.try_admit(&RateLimitKey::Global));
        assert!(!limiter.try_admit(&RateLimitKey::user("a")));
        assert_eq!(limiter.tracked_keys(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_idle() {
        let limiter = limiter(2, 10);
        limiter.try_admit(&RateLimitKey::user("old"));
        advance(Duration::from_secs(6)).await;
        limiter.try_admit(&RateLimitKey::user("new"));
        advance(Duration::from_secs(5)).await;

        assert_eq!(limiter.purge_idle(), 1);
        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(limiter.in_window(&RateLimitKey::user("new")), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admission_never_exceeds_cap() {
        let limiter = Arc::new(limiter(5, 60));
        let mut handles = Vec::new();

        for _ in 0..64 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.try_admit(&RateLimitKey::Global)
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 5);
    }
}
