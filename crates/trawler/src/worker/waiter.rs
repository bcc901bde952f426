//! Blocking wait for a job's terminal state.
//!
//! External callers poll the store until the job lands, with two guard
//! rails: an overall ceiling, and a per-read deadline so a struggling
//! store surfaces as `StoreUnstable` instead of hanging the caller.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::models::{JobState, JobStatus};
use crate::store::{StateStore, StoreError};

/// Cadence of the status polls.
const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Deadline for each individual store read.
const READ_DEADLINE: Duration = Duration::from_millis(3_500);
/// Consecutive per-read deadline misses before giving up on the store.
const MAX_CONSECUTIVE_TIMEOUTS: u32 = 10;

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("request timed out")]
    Timeout,
    #[error("store unstable while waiting")]
    StoreUnstable,
    #[error("job failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What one poll observed.
enum Poll {
    Done(serde_json::Value),
    Failed(String),
    Pending,
}

async fn poll_job(store: &dyn StateStore, job_id: &str) -> Result<Poll, StoreError> {
    match store.get_job_state(job_id).await? {
        JobState::Known(JobStatus::Completed) => {
            let result = store
                .get_job_result(job_id)
                .await?
                .unwrap_or(serde_json::Value::Null);
            Ok(Poll::Done(result))
        }
        JobState::Known(JobStatus::Failed) => {
            let error = store
                .get_job_error(job_id)
                .await?
                .unwrap_or_else(|| "job failed".to_string());
            Ok(Poll::Failed(error))
        }
        _ => Ok(Poll::Pending),
    }
}

/// Wait until the job reaches a terminal state and return its result.
pub async fn wait_for_job(
    store: &dyn StateStore,
    job_id: &str,
    wait_ceiling: Duration,
) -> Result<serde_json::Value, WaitError> {
    let deadline = Instant::now() + wait_ceiling;
    let mut consecutive_timeouts = 0u32;

    loop {
        if Instant::now() >= deadline {
            return Err(WaitError::Timeout);
        }

        match tokio::time::timeout(READ_DEADLINE, poll_job(store, job_id)).await {
            Err(_) => {
                consecutive_timeouts += 1;
                if consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
                    return Err(WaitError::StoreUnstable);
                }
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(Poll::Done(result))) => return Ok(result),
            Ok(Ok(Poll::Failed(error))) => return Err(WaitError::Failed(error)),
            Ok(Ok(Poll::Pending)) => {
                consecutive_timeouts = 0;
            }
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Job, JobOptions, JobPayload, ScrapeOutcome};
    use crate::store::MemoryStateStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn returns_the_result_once_completed() {
        let store = Arc::new(MemoryStateStore::new());
        let job = Job::new("j1", "scrape", JobPayload::default(), JobOptions::new("j1"));
        store.create_job(&job).await.unwrap();

        let waiter_store = store.clone();
        let waiter = tokio::spawn(async move {
            wait_for_job(waiter_store.as_ref(), "j1", Duration::from_secs(5)).await
        });

        store.mark_job_started("j1").await.unwrap();
        store
            .mark_job_completed("j1", &ScrapeOutcome::ok(vec![]))
            .await
            .unwrap();

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.get("success").and_then(|v| v.as_bool()), Some(true));
    }

    #[tokio::test]
    async fn failed_jobs_surface_their_error() {
        let store = Arc::new(MemoryStateStore::new());
        let job = Job::new("j1", "scrape", JobPayload::default(), JobOptions::new("j1"));
        store.create_job(&job).await.unwrap();
        store.mark_job_failed("j1", "boom").await.unwrap();

        let outcome = wait_for_job(store.as_ref(), "j1", Duration::from_secs(1)).await;
        assert!(matches!(outcome, Err(WaitError::Failed(msg)) if msg == "boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_produces_timeout() {
        let store = MemoryStateStore::new();
        let outcome = wait_for_job(&store, "never", Duration::from_secs(2)).await;
        assert!(matches!(outcome, Err(WaitError::Timeout)));
    }
}
