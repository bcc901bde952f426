//! Redis-backed rate limit windows for multi-instance deployments.
//!
//! One counter key per (bucket, tenant, window); the first increment opens
//! the window by attaching the TTL. Atomicity comes from a Lua script so
//! concurrent workers cannot race the open.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

use super::backend::{RateLimitBackend, RateLimitError, RateLimitResult};

const KEY_PREFIX: &str = "trawler:rl:";

const INCR_SCRIPT: &str = r#"
local total = redis.call('INCRBY', KEYS[1], ARGV[1])
if total == tonumber(ARGV[1]) then
  redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return total
"#;

const REFUND_SCRIPT: &str = r#"
local total = redis.call('DECRBY', KEYS[1], ARGV[1])
if total < 0 then
  redis.call('SET', KEYS[1], 0, 'KEEPTTL')
end
return total
"#;

pub struct RedisRateLimitBackend {
    conn: ConnectionManager,
}

impl RedisRateLimitBackend {
    pub async fn connect(redis_url: &str) -> RateLimitResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| RateLimitError::Backend(format!("redis client: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| RateLimitError::Backend(format!("redis connection: {e}")))?;
        Ok(Self { conn })
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn counter_key(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }

    fn block_key(key: &str) -> String {
        format!("{KEY_PREFIX}block:{key}")
    }
}

#[async_trait]
impl RateLimitBackend for RedisRateLimitBackend {
    async fn incr_window(&self, key: &str, points: u32, window: Duration) -> RateLimitResult<u64> {
        let mut conn = self.conn.clone();
        let total: i64 = Script::new(INCR_SCRIPT)
            .key(Self::counter_key(key))
            .arg(points)
            .arg(window.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RateLimitError::Backend(e.to_string()))?;
        Ok(total.max(0) as u64)
    }

    async fn window_ttl(&self, key: &str) -> RateLimitResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        let ttl: i64 = redis::cmd("TTL")
            .arg(Self::counter_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| RateLimitError::Backend(e.to_string()))?;
        Ok((ttl > 0).then(|| Duration::from_secs(ttl as u64)))
    }

    async fn block(&self, key: &str, duration: Duration) -> RateLimitResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(Self::block_key(key))
            .arg("1")
            .arg("EX")
            .arg(duration.as_secs().max(1))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| RateLimitError::Backend(e.to_string()))
    }

    async fn is_blocked(&self, key: &str) -> RateLimitResult<bool> {
        let mut conn = self.conn.clone();
        let exists: i64 = redis::cmd("EXISTS")
            .arg(Self::block_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| RateLimitError::Backend(e.to_string()))?;
        Ok(exists == 1)
    }

    async fn refund(&self, key: &str, points: u32) -> RateLimitResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = Script::new(REFUND_SCRIPT)
            .key(Self::counter_key(key))
            .arg(points)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RateLimitError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend() -> Option<RedisRateLimitBackend> {
        let url = std::env::var("REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        match RedisRateLimitBackend::connect(&url).await {
            Ok(backend) => Some(backend),
            Err(_) => {
                println!("Redis not available, skipping test");
                None
            }
        }
    }

    #[tokio::test]
    async fn increments_share_a_window() {
        let Some(backend) = backend().await else { return };
        let key = format!("test:{}", uuid::Uuid::new_v4());
        let window = Duration::from_secs(60);
        assert_eq!(backend.incr_window(&key, 1, window).await.unwrap(), 1);
        assert_eq!(backend.incr_window(&key, 3, window).await.unwrap(), 4);
        assert!(backend.window_ttl(&key).await.unwrap().is_some());
    }
}
