//! Pluggable storage backend for rate limit windows.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub type RateLimitResult<T> = Result<T, RateLimitError>;

#[derive(Debug, Error)]
pub enum RateLimitError {
    /// The bucket is exhausted for the current window.
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    Limited { retry_after: Option<Duration> },
    #[error("rate limit backend error: {0}")]
    Backend(String),
}

/// Storage operations for fixed-window counters.
///
/// Implementations must be safe under concurrent access; the counter
/// increment is the atomic primitive everything else builds on.
#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    /// Add `points` to the key's current window, creating the window with
    /// the given duration if absent. Returns the window total after the
    /// increment.
    async fn incr_window(&self, key: &str, points: u32, window: Duration) -> RateLimitResult<u64>;

    /// Time left in the key's current window, if one is open.
    async fn window_ttl(&self, key: &str) -> RateLimitResult<Option<Duration>>;

    /// Refuse the key outright for the given duration.
    async fn block(&self, key: &str, duration: Duration) -> RateLimitResult<()>;

    async fn is_blocked(&self, key: &str) -> RateLimitResult<bool>;

    /// Give points back (floored at zero), e.g. for cancelled work.
    async fn refund(&self, key: &str, points: u32) -> RateLimitResult<()>;
}
