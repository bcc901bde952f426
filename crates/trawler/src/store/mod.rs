//! Durable job and crawl state.
//!
//! The state store is the single writer-of-record for job status, crawl
//! counters, URL locks, and team-job records. Two backends implement the
//! same trait: Redis (distributed, the production path) and in-memory
//! (single process, tests and local runs).

mod memory;
mod redis;
mod truncate;

pub use memory::MemoryStateStore;
pub use redis::RedisStateStore;
pub use truncate::bounded_result;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::models::{Crawl, Job, JobPayload, JobProgress, JobState, JobStatus, ScrapeOutcome};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    Conflict(String),
    #[error("job {job_id} is already {}; transition refused", .status.as_str())]
    IllegalTransition { job_id: String, status: JobStatus },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Deterministic digest keying a URL lock. Locks are scoped by URL alone:
/// at most one crawl may hold a given URL until the lock expires.
pub fn url_lock_digest(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    // 64 bits of the digest is plenty; a collision costs one lock miss.
    let mut hex = String::with_capacity(16);
    for byte in &digest[..8] {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    format!("url_lock:{hex}")
}

/// Durable per-job and per-crawl state.
///
/// Write paths retry transient backend errors internally (exponential
/// backoff, 3 attempts) before surfacing [`StoreError::Unavailable`].
/// Terminal job transitions are idempotent: completing or failing a job
/// that is already terminal is a no-op, which is what makes at-least-once
/// queue delivery safe.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create a job record with status `waiting`. A missing tenant is
    /// replaced by the system tenant. Fails with `Conflict` if the id
    /// already exists.
    async fn create_job(&self, job: &Job) -> StoreResult<()>;

    /// Transition waiting -> active. `NotFound` when absent,
    /// `IllegalTransition` when already terminal; re-marking an active
    /// job is a no-op.
    async fn mark_job_started(&self, job_id: &str) -> StoreResult<()>;

    /// Terminal transition to `completed`, storing the (possibly
    /// truncated) result and propagating crawl progress. Tolerates a lost
    /// creation by writing a placeholder record first.
    async fn mark_job_completed(&self, job_id: &str, outcome: &ScrapeOutcome) -> StoreResult<()>;

    /// Terminal transition to `failed`, storing the error message and
    /// propagating crawl progress.
    async fn mark_job_failed(&self, job_id: &str, error: &str) -> StoreResult<()>;

    /// Update progress without touching status. Unknown ids are ignored.
    async fn update_job_progress(&self, job_id: &str, progress: &JobProgress) -> StoreResult<()>;

    async fn get_job(&self, job_id: &str) -> StoreResult<Option<Job>>;
    async fn get_job_state(&self, job_id: &str) -> StoreResult<JobState>;
    async fn get_job_result(&self, job_id: &str) -> StoreResult<Option<serde_json::Value>>;
    async fn get_job_error(&self, job_id: &str) -> StoreResult<Option<String>>;
    async fn get_job_data(&self, job_id: &str) -> StoreResult<Option<JobPayload>>;
    async fn remove_job(&self, job_id: &str) -> StoreResult<()>;

    /// Record the dispatcher-assigned task id on the job's payload
    /// (dispatcher queue provider only). Unknown ids are ignored.
    async fn set_job_dispatch_id(&self, job_id: &str, task_id: &str) -> StoreResult<()>;

    /// Sweep terminal jobs whose last update is older than the cutoff.
    /// Returns the number of records removed.
    async fn clean_terminal_jobs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    async fn save_crawl(&self, crawl: &Crawl) -> StoreResult<()>;
    async fn get_crawl(&self, crawl_id: &str) -> StoreResult<Option<Crawl>>;
    async fn get_crawl_expiry(&self, crawl_id: &str) -> StoreResult<Option<DateTime<Utc>>>;

    /// Flip a freshly created crawl to `scraping` on first enqueue.
    async fn mark_crawl_scraping(&self, crawl_id: &str) -> StoreResult<()>;

    /// Set the advisory cancelled flag; in-flight children still finish.
    async fn cancel_crawl(&self, crawl_id: &str) -> StoreResult<()>;

    /// Register a member job: append to the crawl's job list, bump
    /// `total_urls`, and write the (crawl, job) edge record — atomically.
    async fn add_crawl_job(&self, crawl_id: &str, job_id: &str) -> StoreResult<()>;
    async fn add_crawl_jobs(&self, crawl_id: &str, job_ids: &[String]) -> StoreResult<()>;

    /// Record a member job's terminal outcome: append to the completed or
    /// failed list, bump the matching counter, and flip the crawl to
    /// `completed` the moment the counters meet the total. Runs as one
    /// store transaction and is idempotent per job id.
    async fn add_crawl_job_done(
        &self,
        crawl_id: &str,
        job_id: &str,
        success: bool,
    ) -> StoreResult<()>;

    async fn done_jobs_len(&self, crawl_id: &str) -> StoreResult<u64>;

    /// Completed job ids in serialization order. `start`/`end` follow
    /// list-range semantics: inclusive, negative indices count from the
    /// end, so `(0, -1)` is the whole list.
    async fn done_jobs_ordered(
        &self,
        crawl_id: &str,
        start: i64,
        end: i64,
    ) -> StoreResult<Vec<String>>;

    async fn is_crawl_finished(&self, crawl_id: &str) -> StoreResult<bool>;

    /// Mark a finished crawl `completed` and stamp `end_time`. Idempotent;
    /// a no-op while children are still outstanding.
    async fn finish_crawl(&self, crawl_id: &str) -> StoreResult<()>;

    /// Create-if-absent lock on a URL. Returns true when this call created
    /// the lock. Atomic against concurrent callers; expires with the crawl.
    async fn lock_url(&self, crawl_id: &str, url: &str) -> StoreResult<bool>;

    /// Batch lock. All-or-nothing: true only when every URL was newly
    /// locked by this call.
    async fn lock_urls(&self, crawl_id: &str, urls: &[String]) -> StoreResult<bool>;

    /// Track an active job for the tenant's concurrency count.
    async fn add_team_job(&self, team_id: &str, job_id: &str) -> StoreResult<()>;
    async fn remove_team_job(&self, team_id: &str, job_id: &str) -> StoreResult<()>;

    /// Active jobs for a tenant, excluding expired records.
    async fn team_job_count(&self, team_id: &str) -> StoreResult<u64>;
}
