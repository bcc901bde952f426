//! trawler - distributed scrape and crawl orchestration.
//!
//! The core of a web-scraping service: an API tier enqueues scrape jobs,
//! worker processes drain them by delegating page rendering to a headless
//! browser microservice, and a shared state store tracks per-job and
//! per-crawl progress so clients can poll long-running crawls.
//!
//! Modules map onto the service's moving parts:
//! - [`store`] - durable job/crawl records, URL locks, team-job counts
//! - [`queue`] - enqueue/next/complete over two interchangeable providers
//! - [`rate_limit`] - (mode, plan, tenant) fixed-window buckets
//! - [`priority`] - plan- and load-aware job priority
//! - [`crawl`] - crawl registration, fan-out, completion tracking
//! - [`scrape`] - the per-URL scrape pipeline and browser client
//! - [`worker`] - the poll loop that ties it all together

pub mod config;
pub mod crawl;
pub mod models;
pub mod priority;
pub mod queue;
pub mod rate_limit;
pub mod scrape;
pub mod store;
pub mod worker;

pub use config::Settings;
pub use models::{Crawl, CrawlStatus, Document, Job, JobStatus, ScrapeMode, ScrapeOutcome};
