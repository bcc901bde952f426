//! Queue providers: enqueue/next/complete over interchangeable backends.
//!
//! Two production variants implement the same trait:
//! - [`BrokerQueue`] - an ordered priority queue in Redis with worker
//!   leases, stalled-job reclaim, and retry backoff.
//! - [`DispatcherQueue`] - a hosted task dispatcher that pushes each job to
//!   the worker's `/tasks/process` endpoint; the worker is passive.
//!
//! [`MemoryQueue`] backs tests and single-process runs.
//!
//! Delivery is at-least-once everywhere. The state store is the
//! authoritative side of a terminal transition: providers read job status
//! before completing, so a re-delivered terminal job is dropped instead of
//! double-counted.

mod broker;
mod dispatcher;
mod memory;

pub use broker::BrokerQueue;
pub use dispatcher::DispatcherQueue;
pub use memory::MemoryQueue;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{QueueProviderKind, Settings};
use crate::models::{JobOptions, JobPayload, JobProgress, JobState, ScrapeOutcome};
use crate::store::{StateStore, StoreError};

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("lease lost for job {0}")]
    LeaseLost(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A delivered job. `lease_token` is set when the provider handed this
/// worker a bounded-time claim that must be extended while work runs.
#[derive(Debug, Clone)]
pub struct QueueJob {
    pub id: String,
    pub name: String,
    pub data: JobPayload,
    pub options: JobOptions,
    pub lease_token: Option<String>,
}

pub type JobCompletedHook = Arc<dyn Fn(&str) + Send + Sync>;
pub type JobFailedHook = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Completion callback slots shared by all providers. Exactly one of the
/// two hooks fires per job, on its terminal transition.
#[derive(Default)]
pub(crate) struct Hooks {
    completed: Mutex<Option<JobCompletedHook>>,
    failed: Mutex<Option<JobFailedHook>>,
}

impl Hooks {
    pub(crate) fn set_completed(&self, hook: JobCompletedHook) {
        if let Ok(mut slot) = self.completed.lock() {
            *slot = Some(hook);
        }
    }

    pub(crate) fn set_failed(&self, hook: JobFailedHook) {
        if let Ok(mut slot) = self.failed.lock() {
            *slot = Some(hook);
        }
    }

    pub(crate) fn fire_completed(&self, job_id: &str) {
        if let Ok(slot) = self.completed.lock() {
            if let Some(hook) = slot.as_ref() {
                hook(job_id);
            }
        }
    }

    pub(crate) fn fire_failed(&self, job_id: &str, error: &str) {
        if let Ok(slot) = self.failed.lock() {
            if let Some(hook) = slot.as_ref() {
                hook(job_id, error);
            }
        }
    }
}

/// Uniform queue operations over both backends.
#[async_trait]
pub trait QueueProvider: Send + Sync {
    /// Create the job record and enqueue it. The id in `options` is
    /// canonical and returned unchanged; enqueueing an id that already
    /// exists is a no-op returning the same id, leaving at most one
    /// record and one in-queue entry.
    async fn add_job(&self, name: &str, data: JobPayload, options: JobOptions)
        -> QueueResult<String>;

    async fn get_job(&self, job_id: &str) -> QueueResult<Option<QueueJob>>;

    /// Deliver the next waiting job under a fresh lease for `token`.
    /// Push-based providers always return `None`.
    async fn next_job(&self, token: &str) -> QueueResult<Option<QueueJob>>;

    /// Push the lease for a running job out by `extension`. Fails with
    /// `LeaseLost` when another worker owns the job now.
    async fn extend_lock(&self, job_id: &str, token: &str, extension: Duration)
        -> QueueResult<()>;

    /// Terminal transition to completed. The store write is authoritative;
    /// in-queue cleanup is best-effort. Idempotent under re-delivery.
    async fn complete_job(&self, job: &QueueJob, outcome: &ScrapeOutcome) -> QueueResult<()>;

    /// Record a failed attempt. Requeues with backoff while attempts
    /// remain, then fails the job permanently.
    async fn fail_job(&self, job: &QueueJob, error: &str) -> QueueResult<()>;

    async fn update_progress(&self, job_id: &str, progress: &JobProgress) -> QueueResult<()>;

    /// Best-effort removal from the queue and the store.
    async fn remove_job(&self, job_id: &str) -> QueueResult<()>;

    /// Status from the state store, the authoritative source.
    async fn job_state(&self, job_id: &str) -> QueueResult<JobState>;
    async fn job_result(&self, job_id: &str) -> QueueResult<Option<serde_json::Value>>;
    async fn job_error(&self, job_id: &str) -> QueueResult<Option<String>>;

    /// In-flight / waiting totals. Push-based providers report 0.
    async fn active_count(&self) -> QueueResult<u64>;
    async fn waiting_count(&self) -> QueueResult<u64>;

    fn on_job_complete(&self, hook: JobCompletedHook);
    fn on_job_failed(&self, hook: JobFailedHook);
}

/// Build the provider selected by `QUEUE_PROVIDER`.
pub async fn from_settings(
    settings: &Settings,
    store: Arc<dyn StateStore>,
) -> QueueResult<Arc<dyn QueueProvider>> {
    match settings.queue_provider {
        QueueProviderKind::Broker => Ok(Arc::new(BrokerQueue::connect(settings, store).await?)),
        QueueProviderKind::Dispatcher => {
            let dispatcher = settings.dispatcher.clone().ok_or_else(|| {
                QueueError::Unavailable("dispatcher selected but not configured".to_string())
            })?;
            Ok(Arc::new(DispatcherQueue::new(dispatcher, store)))
        }
    }
}
