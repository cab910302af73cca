pub mod memory;
pub mod redis;

use async_trait::async_trait;
use log::{ info, warn };
use std::sync::Arc;
use std::time::Duration;

use crate::error::RateLimitError;

pub use self::memory::MemoryRateLimiter;
pub use self::redis::RedisRateLimiter;

/// Fixed-window counter keyed by identity.
///
/// The first call in a fresh window opens it with an expiry of `period`;
/// further calls count up to `limit` and are refused until the window lapses.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn try_acquire(
        &self,
        identity: &str,
        limit: u32,
        period: Duration
    ) -> Result<bool, RateLimitError>;

    /// Fails open: an unreachable backend allows the action.
    async fn allow(&self, identity: &str, limit: u32, period: Duration) -> bool {
        match self.try_acquire(identity, limit, period).await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!("Rate limiter unavailable for {}, allowing: {}", identity, e);
                true
            }
        }
    }
}

pub fn create_rate_limiter(backend: &str, redis_url: Option<&str>) -> Arc<dyn RateLimiter> {
    match (backend.to_lowercase().as_str(), redis_url) {
        ("redis", Some(url)) =>
            match RedisRateLimiter::new(url) {
                Ok(limiter) => {
                    info!("Rate limiter backed by Redis at {}", url);
                    Arc::new(limiter)
                }
                Err(e) => {
                    warn!("Invalid Redis URL for rate limiter ({}); using in-memory limiter", e);
                    Arc::new(MemoryRateLimiter::new())
                }
            }
        ("redis", None) => {
            warn!("RATE_LIMIT_BACKEND=redis without RATE_LIMIT_REDIS_URL; using in-memory limiter");
            Arc::new(MemoryRateLimiter::new())
        }
        _ => {
            info!("Rate limiter kept in process memory");
            Arc::new(MemoryRateLimiter::new())
        }
    }
}
