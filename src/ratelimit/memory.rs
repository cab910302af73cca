use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{ AtomicUsize, Ordering };
use std::time::Duration;
use tokio::time::Instant;

use super::RateLimiter;
use crate::error::RateLimitError;

/// Every this many calls, windows that have lapsed are dropped.
const SWEEP_EVERY: usize = 256;

#[derive(Debug, Clone, Copy)]
struct Window {
    opened: Instant,
    period: Duration,
    count: u32,
}

impl Window {
    fn lapsed(&self, now: Instant) -> bool {
        now.duration_since(self.opened) >= self.period
    }
}

/// Process-local limiter. The map entry lock serializes concurrent callers
/// for the same identity, so no increment is lost.
#[derive(Default)]
pub struct MemoryRateLimiter {
    windows: DashMap<String, Window>,
    calls: AtomicUsize,
}

impl MemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, identity: &str, limit: u32, period: Duration) -> bool {
        if (self.calls.fetch_add(1, Ordering::Relaxed) + 1) % SWEEP_EVERY == 0 {
            self.purge_expired();
        }

        let now = Instant::now();
        let mut window = self.windows
            .entry(identity.to_string())
            .or_insert(Window { opened: now, period, count: 0 });
        if window.lapsed(now) {
            *window = Window { opened: now, period, count: 0 };
        }
        if window.count >= limit {
            return false;
        }
        window.count += 1;
        true
    }

    /// Drops windows whose period has passed and returns how many went.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, w| !w.lapsed(now));
        before - self.windows.len()
    }

    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn try_acquire(
        &self,
        identity: &str,
        limit: u32,
        period: Duration
    ) -> Result<bool, RateLimitError> {
        Ok(self.acquire(identity, limit, period))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const PERIOD: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn seventh_call_is_refused_until_window_lapses() {
        let limiter = MemoryRateLimiter::new();
        for _ in 0..6 {
            assert!(limiter.allow("alice", 6, PERIOD).await);
        }
        assert!(!limiter.allow("alice", 6, PERIOD).await);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!limiter.allow("alice", 6, PERIOD).await);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.allow("alice", 6, PERIOD).await);
    }

    #[tokio::test(start_paused = true)]
    async fn identities_are_independent() {
        let limiter = MemoryRateLimiter::new();
        assert!(limiter.allow("alice", 1, PERIOD).await);
        assert!(!limiter.allow("alice", 1, PERIOD).await);
        assert!(limiter.allow("bob", 1, PERIOD).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_exceed_limit() {
        let limiter = Arc::new(MemoryRateLimiter::new());
        let mut handles = Vec::new();
        for _ in 0..64 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move { limiter.acquire("shared", 10, PERIOD) }));
        }
        let mut allowed = 0;
        for h in handles {
            if h.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_stale_windows() {
        let limiter = MemoryRateLimiter::new();
        limiter.acquire("alice", 6, PERIOD);
        tokio::time::advance(PERIOD).await;
        limiter.acquire("bob", 6, PERIOD);
        assert_eq!(limiter.purge_expired(), 1);
        assert_eq!(limiter.tracked(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn steady_use_evicts_lapsed_identities() {
        let limiter = MemoryRateLimiter::new();
        for i in 0..100 {
            limiter.acquire(&format!("visitor-{}", i), 6, PERIOD);
        }
        assert_eq!(limiter.tracked(), 100);

        tokio::time::advance(PERIOD).await;
        for _ in 0..SWEEP_EVERY {
            limiter.acquire("regular", u32::MAX, PERIOD);
        }
        assert_eq!(limiter.tracked(), 1);
    }

    #[tokio::test]
    async fn zero_limit_refuses() {
        let limiter = MemoryRateLimiter::new();
        assert!(!limiter.allow("alice", 0, PERIOD).await);
    }
}
