//! Rate limiting for scrape/crawl API traffic.
//!
//! Buckets are fixed 60-second windows keyed by (mode, plan, tenant) with
//! pluggable storage backends:
//! - In-memory (single process, tests)
//! - Redis (distributed, production)
//!
//! The limiter is allow-by-default: a backend outage logs a warning and
//! admits the request rather than turning infrastructure trouble into
//! user-visible rate denials.

mod backend;
mod config;
mod limiter;
mod memory;
mod redis;

pub use backend::{RateLimitBackend, RateLimitError, RateLimitResult};
pub use config::{PlanRow, RateLimitConfig, RateLimitMode};
pub use limiter::{Bucket, RateDecision, RateLimiter};
pub use memory::MemoryRateLimitBackend;
pub use redis::RedisRateLimitBackend;
