//! Hosted task-dispatcher queue: each enqueue becomes a one-shot HTTP
//! task targeting the worker's `/tasks/process` endpoint.
//!
//! The dispatcher owns scheduling and retry; this provider only creates
//! and deletes tasks. The caller's job id stays canonical everywhere -
//! the dispatcher-assigned task name is tucked into the job payload as
//! `cloud_tasks_id` purely so the task can be deleted later.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::json;
use tracing::{debug, warn};

use super::{
    Hooks, JobCompletedHook, JobFailedHook, QueueError, QueueJob, QueueProvider, QueueResult,
};
use crate::config::DispatcherSettings;
use crate::models::{Job, JobOptions, JobPayload, JobProgress, JobState, ScrapeOutcome};
use crate::store::{StateStore, StoreError};

pub struct DispatcherQueue {
    http: reqwest::Client,
    settings: DispatcherSettings,
    store: Arc<dyn StateStore>,
    hooks: Hooks,
    counts_warned: AtomicBool,
}

impl DispatcherQueue {
    pub fn new(settings: DispatcherSettings, store: Arc<dyn StateStore>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            settings,
            store,
            hooks: Hooks::default(),
            counts_warned: AtomicBool::new(false),
        }
    }

    fn tasks_url(&self) -> String {
        format!(
            "{}/v2/projects/{}/locations/{}/queues/{}/tasks",
            self.settings.api_url.trim_end_matches('/'),
            self.settings.project,
            self.settings.location,
            self.settings.queue
        )
    }

    fn target_url(&self) -> String {
        format!(
            "{}/tasks/process",
            self.settings.service_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl QueueProvider for DispatcherQueue {
    async fn add_job(
        &self,
        name: &str,
        data: JobPayload,
        options: JobOptions,
    ) -> QueueResult<String> {
        let job_id = options.job_id.clone();
        let job = Job::new(&job_id, name, data.clone(), options.clone());

        match self.store.create_job(&job).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                debug!(job_id, "job already exists, skipping dispatch");
                return Ok(job_id);
            }
            Err(e) => return Err(e.into()),
        }

        let payload = json!({
            "name": name,
            "data": data,
            "options": options,
        });
        let body = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(&payload)?);

        let task = json!({
            "task": {
                "httpRequest": {
                    "url": self.target_url(),
                    "httpMethod": "POST",
                    "headers": { "Content-Type": "application/json" },
                    "body": body,
                    "oidcToken": {
                        "serviceAccountEmail": self.settings.service_account,
                    },
                },
            },
        });

        let response = self
            .http
            .post(self.tasks_url())
            .json(&task)
            .send()
            .await
            .map_err(|e| QueueError::Unavailable(format!("dispatcher: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(QueueError::Unavailable(format!(
                "dispatcher returned {status}: {detail}"
            )));
        }

        let reply: serde_json::Value = response
            .json()
            .await
            .map_err(|e| QueueError::Unavailable(format!("dispatcher reply: {e}")))?;
        if let Some(task_name) = reply.get("name").and_then(|v| v.as_str()) {
            let task_id = task_name.rsplit('/').next().unwrap_or(task_name);
            self.store.set_job_dispatch_id(&job_id, task_id).await?;
        }

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

    async fn next_job(&self, _token: &str) -> QueueResult<Option<QueueJob>> {
        // Push-based: jobs arrive over HTTP at /tasks/process.
        Ok(None)
    }

    async fn extend_lock(
        &self,
        _job_id: &str,
        _token: &str,
        _extension: Duration,
    ) -> QueueResult<()> {
        // The dispatcher owns delivery timeouts; there is no lease to extend.
        Ok(())
    }

    async fn complete_job(&self, job: &QueueJob, outcome: &ScrapeOutcome) -> QueueResult<()> {
        if self.store.get_job_state(&job.id).await?.is_terminal() {
            debug!(job_id = %job.id, "re-delivered terminal job, dropping");
            return Ok(());
        }
        self.store.mark_job_completed(&job.id, outcome).await?;
        self.hooks.fire_completed(&job.id);
        Ok(())
    }

    async fn fail_job(&self, job: &QueueJob, error: &str) -> QueueResult<()> {
        if self.store.get_job_state(&job.id).await?.is_terminal() {
            debug!(job_id = %job.id, "re-delivered terminal job, dropping");
            return Ok(());
        }
        self.store.mark_job_failed(&job.id, error).await?;
        self.hooks.fire_failed(&job.id, error);
        Ok(())
    }

    async fn update_progress(&self, job_id: &str, progress: &JobProgress) -> QueueResult<()> {
        Ok(self.store.update_job_progress(job_id, progress).await?)
    }

    async fn remove_job(&self, job_id: &str) -> QueueResult<()> {
        if let Some(data) = self.store.get_job_data(job_id).await? {
            if let Some(task_id) = data.cloud_tasks_id {
                let url = format!("{}/{}", self.tasks_url(), task_id);
                if let Err(e) = self.http.delete(&url).send().await {
                    warn!(job_id, error = %e, "dispatcher task delete failed");
                }
            }
        }
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
        if !self.counts_warned.swap(true, Ordering::Relaxed) {
            warn!("queue counts are not supported by the dispatcher provider");
        }
        Ok(0)
    }

    async fn waiting_count(&self) -> QueueResult<u64> {
        if !self.counts_warned.swap(true, Ordering::Relaxed) {
            warn!("queue counts are not supported by the dispatcher provider");
        }
        Ok(0)
    }

    fn on_job_complete(&self, hook: JobCompletedHook) {
        self.hooks.set_completed(hook);
    }

    fn on_job_failed(&self, hook: JobFailedHook) {
        self.hooks.set_failed(hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;

    fn dispatcher(store: Arc<dyn StateStore>) -> DispatcherQueue {
        DispatcherQueue::new(
            DispatcherSettings {
                api_url: "http://127.0.0.1:1".to_string(),
                project: "p".to_string(),
                location: "l".to_string(),
                queue: "q".to_string(),
                service_url: "http://worker.internal".to_string(),
                service_account: "svc@p.iam".to_string(),
            },
            store,
        )
    }

    #[tokio::test]
    async fn counts_are_unsupported_zeroes() {
        let queue = dispatcher(Arc::new(MemoryStateStore::new()));
        assert_eq!(queue.active_count().await.unwrap(), 0);
        assert_eq!(queue.waiting_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn next_job_is_always_empty() {
        let queue = dispatcher(Arc::new(MemoryStateStore::new()));
        assert!(queue.next_job("worker-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completion_gates_on_store_status() {
        let store = Arc::new(MemoryStateStore::new());
        let queue = dispatcher(store.clone());
        let job = Job::new(
            "j1",
            "scrape",
            JobPayload::default(),
            JobOptions::new("j1"),
        );
        store.create_job(&job).await.unwrap();
        store.mark_job_started("j1").await.unwrap();
        store
            .mark_job_completed("j1", &ScrapeOutcome::ok(vec![]))
            .await
            .unwrap();

        let handle = QueueJob {
            id: "j1".to_string(),
            name: "scrape".to_string(),
            data: JobPayload::default(),
            options: JobOptions::new("j1"),
            lease_token: None,
        };
        // Second delivery of a terminal job must not flip it to failed.
        queue.fail_job(&handle, "late").await.unwrap();
        assert_eq!(
            store.get_job_state("j1").await.unwrap(),
            JobState::Known(crate::models::JobStatus::Completed)
        );
    }
}
