use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{ Client, Script };
use std::time::Duration;
use tokio::sync::Mutex;

use super::RateLimiter;
use crate::error::RateLimitError;
use crate::store::connect_redis;

// Runs atomically on the server, so concurrent callers across processes
// observe one counter.
const WINDOW_SCRIPT: &str =
    r"
if tonumber(ARGV[1]) <= 0 then
    return 0
end
local current = redis.call('GET', KEYS[1])
if not current then
    redis.call('SET', KEYS[1], 1, 'EX', ARGV[2])
    return 1
end
if tonumber(current) >= tonumber(ARGV[1]) then
    return 0
end
redis.call('INCR', KEYS[1])
return 1
";

pub struct RedisRateLimiter {
    client: Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    script: Script,
    key_prefix: String,
}

impl RedisRateLimiter {
    pub fn new(url: &str) -> Result<Self, RateLimitError> {
        Ok(Self {
            client: Client::open(url)?,
            conn: Mutex::new(None),
            script: Script::new(WINDOW_SCRIPT),
            key_prefix: "ratelimit:".to_string(),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, RateLimitError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = connect_redis(&self.client).await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_connection(&self) {
        *self.conn.lock().await = None;
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn try_acquire(
        &self,
        identity: &str,
        limit: u32,
        period: Duration
    ) -> Result<bool, RateLimitError> {
        if limit == 0 {
            return Ok(false);
        }
        let mut conn = self.connection().await?;
        let key = format!("{}{}", self.key_prefix, identity);
        let result: Result<i64, redis::RedisError> = self.script
            .key(&key)
            .arg(limit)
            .arg(period.as_secs().max(1))
            .invoke_async(&mut conn).await;
        match result {
            Ok(allowed) => Ok(allowed == 1),
            Err(e) => {
                self.reset_connection().await;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_limit_refuses_without_a_round_trip() {
        let limiter = RedisRateLimiter::new("redis://127.0.0.1:1/").unwrap();
        assert!(!limiter.try_acquire("u1", 0, Duration::from_secs(10)).await.unwrap());
        assert!(!limiter.allow("u1", 0, Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn zero_limit_refuses_on_the_server() {
        let Ok(url) = std::env::var("REDIS_TEST_URL") else {
            return;
        };
        let limiter = RedisRateLimiter::new(&url).unwrap();
        let mut conn = limiter.connection().await.unwrap();
        let key = format!("test:{}", uuid::Uuid::new_v4());
        let allowed: i64 = limiter.script.key(&key).arg(0).arg(10).invoke_async(&mut conn).await.unwrap();
        assert_eq!(allowed, 0);
    }
}
