//! In-process queue for tests and single-node runs.
//!
//! Mirrors the broker's semantics - priority-then-FIFO ordering, leases
//! with expiry-driven reclaim, retry backoff - without the broker.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    Hooks, JobCompletedHook, JobFailedHook, QueueError, QueueJob, QueueProvider, QueueResult,
};
use crate::models::{Job, JobOptions, JobPayload, JobProgress, JobState, ScrapeOutcome};
use crate::store::{StateStore, StoreError};

#[derive(Debug)]
struct Lease {
    token: String,
    deadline: Instant,
}

#[derive(Default)]
struct Inner {
    /// (priority, seq) -> job id; BTreeMap iteration order is delivery order.
    waiting: BTreeMap<(i32, u64), String>,
    delayed: Vec<(Instant, String)>,
    active: HashMap<String, Lease>,
    priorities: HashMap<String, i32>,
    attempts: HashMap<String, u32>,
    stalls: HashMap<String, u32>,
    seq: u64,
}

impl Inner {
    fn enqueue(&mut self, job_id: String, priority: i32) {
        self.seq += 1;
        self.priorities.insert(job_id.clone(), priority);
        self.waiting.insert((priority, self.seq), job_id);
    }

    fn forget(&mut self, job_id: &str) {
        self.waiting.retain(|_, id| id != job_id);
        self.delayed.retain(|(_, id)| id != job_id);
        self.active.remove(job_id);
        self.priorities.remove(job_id);
        self.attempts.remove(job_id);
        self.stalls.remove(job_id);
    }
}

pub struct MemoryQueue {
    store: Arc<dyn StateStore>,
    inner: Mutex<Inner>,
    hooks: Hooks,
    lock_duration: Duration,
    max_stalled_count: u32,
}

impl MemoryQueue {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            inner: Mutex::new(Inner::default()),
            hooks: Hooks::default(),
            lock_duration: Duration::from_secs(120),
            max_stalled_count: 2,
        }
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    /// Requeue jobs whose lease lapsed; fail the ones that stalled too
    /// often. Returns ids that must be failed in the store (done outside
    /// the lock).
    fn reclaim(inner: &mut Inner, max_stalled: u32) -> Vec<String> {
        let now = Instant::now();
        let lapsed: Vec<String> = inner
            .active
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        let mut over_stalled = Vec::new();
        for job_id in lapsed {
            inner.active.remove(&job_id);
            let stalls = inner.stalls.entry(job_id.clone()).or_insert(0);
            *stalls += 1;
            if *stalls <= max_stalled {
                let priority = inner.priorities.get(&job_id).copied().unwrap_or(10);
                inner.enqueue(job_id, priority);
            } else {
                over_stalled.push(job_id);
            }
        }
        over_stalled
    }
}

#[async_trait]
impl QueueProvider for MemoryQueue {
    async fn add_job(
        &self,
        name: &str,
        data: JobPayload,
        options: JobOptions,
    ) -> QueueResult<String> {
        let job_id = options.job_id.clone();
        let job = Job::new(&job_id, name, data, options.clone());
        match self.store.create_job(&job).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                debug!(job_id, "job already exists, skipping enqueue");
                return Ok(job_id);
            }
            Err(e) => return Err(e.into()),
        }

        let mut inner = self.inner.lock().await;
        inner.enqueue(job_id.clone(), options.priority);
        Ok(job_id)
    }

    async fn get_job(&self, job_id: &str) -> QueueResult<Option<QueueJob>> {
        Ok(self.store.get_job(job_id).await?.map(|job| QueueJob {
            id: job.id,
            name: job.name,
            data: job.data,
            options: job.options,
            lease_token: None,
        }))
    }

    async fn next_job(&self, token: &str) -> QueueResult<Option<QueueJob>> {
        let (job_id, over_stalled) = {
            let mut inner = self.inner.lock().await;
            let over_stalled = Self::reclaim(&mut inner, self.max_stalled_count);

            let now = Instant::now();
            let due: Vec<String> = {
                let (ready, pending): (Vec<_>, Vec<_>) =
                    inner.delayed.drain(..).partition(|(at, _)| *at <= now);
                inner.delayed = pending;
                ready.into_iter().map(|(_, id)| id).collect()
            };
            for id in due {
                let priority = inner.priorities.get(&id).copied().unwrap_or(10);
                inner.enqueue(id, priority);
            }

            let popped = inner.waiting.keys().next().copied().map(|key| {
                let id = inner.waiting.remove(&key).unwrap_or_default();
                inner.active.insert(
                    id.clone(),
                    Lease {
                        token: token.to_string(),
                        deadline: Instant::now() + self.lock_duration,
                    },
                );
                id
            });
            (popped, over_stalled)
        };

        for id in over_stalled {
            self.store
                .mark_job_failed(&id, "job stalled more than allowable limit")
                .await?;
            self.hooks
                .fire_failed(&id, "job stalled more than allowable limit");
        }

        let Some(job_id) = job_id else { return Ok(None) };
        match self.store.get_job(&job_id).await? {
            Some(job) => Ok(Some(QueueJob {
                id: job.id,
                name: job.name,
                data: job.data,
                options: job.options,
                lease_token: Some(token.to_string()),
            })),
            None => {
                self.inner.lock().await.forget(&job_id);
                Ok(None)
            }
        }
    }

    async fn extend_lock(
        &self,
        job_id: &str,
        token: &str,
        extension: Duration,
    ) -> QueueResult<()> {
        let mut inner = self.inner.lock().await;
        match inner.active.get_mut(job_id) {
            Some(lease) if lease.token == token => {
                lease.deadline = Instant::now() + extension;
                Ok(())
            }
            _ => Err(QueueError::LeaseLost(job_id.to_string())),
        }
    }

    async fn complete_job(&self, job: &QueueJob, outcome: &ScrapeOutcome) -> QueueResult<()> {
        if self.store.get_job_state(&job.id).await?.is_terminal() {
            debug!(job_id = %job.id, "re-delivered terminal job, dropping");
            self.inner.lock().await.forget(&job.id);
            return Ok(());
        }
        self.store.mark_job_completed(&job.id, outcome).await?;
        self.inner.lock().await.forget(&job.id);
        self.hooks.fire_completed(&job.id);
        Ok(())
    }

    async fn fail_job(&self, job: &QueueJob, error: &str) -> QueueResult<()> {
        if self.store.get_job_state(&job.id).await?.is_terminal() {
            self.inner.lock().await.forget(&job.id);
            return Ok(());
        }

        let retry = {
            let mut inner = self.inner.lock().await;
            inner.active.remove(&job.id);
            let attempts = inner.attempts.entry(job.id.clone()).or_insert(0);
            *attempts += 1;
            if *attempts < job.options.attempts {
                let delay = job.options.backoff_ms.max(1) * 2u64.saturating_pow(*attempts - 1);
                inner
                    .delayed
                    .push((Instant::now() + Duration::from_millis(delay), job.id.clone()));
                true
            } else {
                false
            }
        };

        if retry {
            debug!(job_id = %job.id, error, "attempt failed, requeued with backoff");
            return Ok(());
        }

        self.store.mark_job_failed(&job.id, error).await?;
        self.inner.lock().await.forget(&job.id);
        self.hooks.fire_failed(&job.id, error);
        Ok(())
    }

    async fn update_progress(&self, job_id: &str, progress: &JobProgress) -> QueueResult<()> {
        Ok(self.store.update_job_progress(job_id, progress).await?)
    }

    async fn remove_job(&self, job_id: &str) -> QueueResult<()> {
        self.inner.lock().await.forget(job_id);
        Ok(self.store.remove_job(job_id).await?)
    }

    async fn job_state(&self, job_id: &str) -> QueueResult<JobState> {
        Ok(self.store.get_job_state(job_id).await?)
    }

    async fn job_result(&self, job_id: &str) -> QueueResult<Option<serde_json::Value>> {
        Ok(self.store.get_job_result(job_id).await?)
    }

    async fn job_error(&self, job_id: &str) -> QueueResult<Option<String>> {
        Ok(self.store.get_job_error(job_id).await?)
    }

    async fn active_count(&self) -> QueueResult<u64> {
        Ok(self.inner.lock().await.active.len() as u64)
    }

    async fn waiting_count(&self) -> QueueResult<u64> {
        let inner = self.inner.lock().await;
        Ok((inner.waiting.len() + inner.delayed.len()) as u64)
    }

    fn on_job_complete(&self, hook: JobCompletedHook) {
        self.hooks.set_completed(hook);
    }

    fn on_job_failed(&self, hook: JobFailedHook) {
        self.hooks.set_failed(hook);
    }
}
