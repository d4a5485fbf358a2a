//! Background eviction of expired sessions

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::ratelimit::SlidingWindowLimiter;

use super::store::ConversationStore;
use super::SessionConfig;

/// Periodically removes sessions older than the TTL.
///
/// Expiry is measured from `created_at`, so a session in active use is still
/// removed once it is older than the TTL.
pub struct Reaper {
    store: Arc<ConversationStore>,
    limiters: Vec<Arc<SlidingWindowLimiter>>,
    ttl: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(store: Arc<ConversationStore>, ttl: Duration, interval: Duration) -> Self {
        Self {
            store,
            limiters: Vec::new(),
            ttl,
            interval,
        }
    }

    pub fn from_config(store: Arc<ConversationStore>, config: &SessionConfig) -> Self {
        Self::new(store, config.ttl, config.reap_interval)
    }

    /// Also drop idle limiter keys on every sweep
    pub fn with_limiter(mut self, limiter: Arc<SlidingWindowLimiter>) -> Self {
        self.limiters.push(limiter);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one pass and return how many sessions were evicted.
    pub fn sweep(&self) -> usize {
        let now = self.store.now();
        let mut evicted = 0;

        for (user_id, created_at) in self.store.snapshot() {
            if !super::session::is_past_ttl(created_at, now, self.ttl) {
                continue;
            }
            if self.store.delete_expired(&user_id, now, self.ttl) {
                evicted += 1;
            } else {
                // Cleared or recreated since the snapshot
                tracing::debug!(user_id = %user_id, "Session changed during sweep, skipping");
            }
        }

        let purged: usize = self.limiters.iter().map(|l| l.purge_idle()).sum();

        if evicted > 0 {
            tracing::info!(
                evicted,
                "Auto-reset {} conversations that were over the TTL",
                evicted
            );
        } else {
            tracing::debug!(purged_limiter_keys = purged, "Sweep found nothing to evict");
        }
        evicted
    }

    /// Sweep on every interval tick until `shutdown` is cancelled.
    ///
    /// The first sweep runs immediately.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("Reaper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for Reaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaper")
            .field("ttl", &self.ttl)
            .field("interval", &self.interval)
            .field("limiters", &self.limiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::{RateLimitConfig, RateLimitKey};

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[test]
    fn test_sweep_evicts_only_sessions_past_ttl() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(ConversationStore::new().with_clock(clock.clone()));

        store.get_or_create("eight-days");
        clock.advance(DAY * 2);
        store.get_or_create("six-days");
        clock.advance(DAY * 6);

        let reaper = Reaper::new(store.clone(), DAY * 7, DAY);
        assert_eq!(reaper.sweep(), 1);

        assert!(!store.contains("eight-days"));
        assert!(store.contains("six-days"));
    }

    #[test]
    fn test_sweep_ignores_activity() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(ConversationStore::new().with_clock(clock.clone()));

        store.get_or_create("busy");
        clock.advance(DAY * 7 + Duration::from_secs(1));
        store.append_exchange("busy", "ping", "pong").unwrap();

        let reaper = Reaper::new(store.clone(), DAY * 7, DAY);
        assert_eq!(reaper.sweep(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_sweep_on_empty_store() {
        let store = Arc::new(ConversationStore::new());
        let reaper = Reaper::new(store, DAY * 7, DAY);
        assert_eq!(reaper.sweep(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_purges_idle_limiter_keys() {
        let store = Arc::new(ConversationStore::new());
        let limiter = Arc::new(SlidingWindowLimiter::new(RateLimitConfig::new(
            1,
            Duration::from_secs(60),
        )));
        limiter.try_admit(&RateLimitKey::user("a"));
        tokio::time::advance(Duration::from_secs(61)).await;

        let reaper = Reaper::new(store, DAY * 7, DAY).with_limiter(limiter.clone());
        reaper.sweep();
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_reaper_runs_and_stops() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(ConversationStore::new().with_clock(clock.clone()));
        let shutdown = CancellationToken::new();

        let handle = Reaper::new(store.clone(), DAY * 7, DAY).spawn(shutdown.clone());

        // Let the immediate first tick run
        tokio::time::sleep(Duration::from_millis(1)).await;

        store.get_or_create("alice");
        clock.advance(DAY * 8);
        assert!(store.contains("alice"));

        tokio::time::sleep(DAY).await;
        assert!(!store.contains("alice"));

        shutdown.cancel();
        handle.await.unwrap();
    }
}
