//! Shared data model: jobs, crawls, and scraped documents.

mod crawl;
mod document;
mod job;

pub use crawl::{Crawl, CrawlStatus, CrawlerOptions};
pub use document::{Document, DocumentMetadata, PageOptions, ScrapeOutcome};
pub use job::{
    Job, JobOptions, JobPayload, JobProgress, JobState, JobStatus, ScrapeMode, WebhookConfig,
};

use uuid::Uuid;

/// Team id substituted when a request carries no tenant.
pub const SYSTEM_TEAM_ID: &str = "system";

/// Generate a fresh opaque id for jobs and crawls.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Normalize a plan string into its lookup key: lowercase, `-` stripped.
/// `"standard-new"` and `"standardnew"` address the same row.
pub fn plan_key(plan: &str) -> String {
    plan.to_lowercase().replace('-', "")
}
