//! In-memory rate limit backend for single-process operation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::backend::{RateLimitBackend, RateLimitResult};

#[derive(Debug)]
struct WindowEntry {
    total: u64,
    opened_at: Instant,
    window: Duration,
}

#[derive(Default)]
struct Inner {
    windows: HashMap<String, WindowEntry>,
    blocks: HashMap<String, Instant>,
}

#[derive(Default)]
pub struct MemoryRateLimitBackend {
    inner: Mutex<Inner>,
}

impl MemoryRateLimitBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitBackend for MemoryRateLimitBackend {
    async fn incr_window(&self, key: &str, points: u32, window: Duration) -> RateLimitResult<u64> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let entry = inner.windows.entry(key.to_string()).or_insert(WindowEntry {
            total: 0,
            opened_at: now,
            window,
        });
        if now.duration_since(entry.opened_at) >= entry.window {
            entry.total = 0;
            entry.opened_at = now;
        }
        entry.total += u64::from(points);
        Ok(entry.total)
    }

    async fn window_ttl(&self, key: &str) -> RateLimitResult<Option<Duration>> {
        let inner = self.inner.lock().await;
        Ok(inner.windows.get(key).and_then(|entry| {
            entry
                .window
                .checked_sub(entry.opened_at.elapsed())
                .filter(|left| !left.is_zero())
        }))
    }

    async fn block(&self, key: &str, duration: Duration) -> RateLimitResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .blocks
            .insert(key.to_string(), Instant::now() + duration);
        Ok(())
    }

    async fn is_blocked(&self, key: &str) -> RateLimitResult<bool> {
        let mut inner = self.inner.lock().await;
        match inner.blocks.get(key) {
            Some(until) if *until > Instant::now() => Ok(true),
            Some(_) => {
                inner.blocks.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn refund(&self, key: &str, points: u32) -> RateLimitResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.windows.get_mut(key) {
            entry.total = entry.total.saturating_sub(u64::from(points));
        }
        Ok(())
    }
}
