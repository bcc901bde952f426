//! The worker: drain the queue, execute scrapes, keep leases alive.
//!
//! One process runs one outer poll loop; every admitted job is handled on
//! its own task, so scrapes overlap while the loop keeps polling. The
//! loop applies backpressure from local CPU/RAM pressure and backs off
//! exponentially when the queue runs dry.

mod resource;
mod waiter;

pub use resource::{ProcSampler, ResourceMonitor, ResourceSample, ResourceSampler};
pub use waiter::{wait_for_job, WaitError};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::{Settings, WorkerTuning};
use crate::crawl::CrawlCoordinator;
use crate::models::{new_id, JobProgress, ScrapeOutcome};
use crate::queue::{QueueJob, QueueProvider};
use crate::scrape::{ProgressHook, ScrapeParams, ScrapePipeline, ScrapeProgress};
use crate::store::{StateStore, StoreError};

const BLOCKED_MESSAGE: &str =
    "URL is blocked. Suspicious activity detected. Please contact support if you believe this is an error.";

enum Execution {
    /// Terminal completed, successful or synthesized (blocked URLs).
    Completed(ScrapeOutcome),
    /// The pipeline reported failure; the queue decides retry vs final.
    Failed(String),
}

/// Executes one job end to end. Shared between the polling worker and the
/// dispatcher's `/tasks/process` endpoint so both delivery paths behave
/// identically.
pub struct JobHandler {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn QueueProvider>,
    pipeline: Arc<dyn ScrapePipeline>,
    coordinator: Arc<CrawlCoordinator>,
    settings: Arc<Settings>,
}

impl JobHandler {
    pub fn new(
        store: Arc<dyn StateStore>,
        queue: Arc<dyn QueueProvider>,
        pipeline: Arc<dyn ScrapePipeline>,
        coordinator: Arc<CrawlCoordinator>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            queue,
            pipeline,
            coordinator,
            settings,
        }
    }

    /// Run one job to a terminal state. Safe under re-delivery: a job the
    /// store already shows terminal is dropped immediately.
    pub async fn process(&self, job: &QueueJob) {
        match self.store.mark_job_started(&job.id).await {
            Ok(()) => {}
            Err(StoreError::IllegalTransition { .. }) => {
                debug!(job_id = %job.id, "job already terminal, dropping re-delivery");
                return;
            }
            Err(e) => {
                // Keep going; the completion path tolerates a lost record.
                warn!(job_id = %job.id, error = %e, "could not mark job started");
            }
        }

        let lease_ticker = self.start_lease_ticker(job);
        let team = job.data.team_or_system().to_string();
        if let Err(e) = self.store.add_team_job(&team, &job.id).await {
            warn!(job_id = %job.id, error = %e, "team job tracking failed");
        }

        match self.execute(job).await {
            Execution::Completed(outcome) => {
                if job.data.crawl_id.is_some() {
                    if let Err(e) = self
                        .coordinator
                        .handle_job_done(job, true, &outcome.docs)
                        .await
                    {
                        warn!(job_id = %job.id, error = %e, "crawl bookkeeping failed");
                    }
                }
                if let Err(e) = self.queue.complete_job(job, &outcome).await {
                    warn!(job_id = %job.id, error = %e, "completion failed, forcing durable write");
                    let _ = self
                        .store
                        .update_job_progress(&job.id, &JobProgress::Percent(100))
                        .await;
                    if let Err(e) = self.store.mark_job_completed(&job.id, &outcome).await {
                        error!(job_id = %job.id, error = %e, "durable completion failed, removing job");
                        let _ = self.queue.remove_job(&job.id).await;
                    }
                }
            }
            Execution::Failed(message) => {
                if let Err(e) = self.queue.fail_job(job, &message).await {
                    warn!(job_id = %job.id, error = %e, "queue failure path failed");
                    let _ = self.store.mark_job_failed(&job.id, &message).await;
                }
                if let Some(crawl_id) = &job.data.crawl_id {
                    // Counters propagate through the failed transition;
                    // this only checks for termination.
                    let _ = self.store.finish_crawl(crawl_id).await;
                }
            }
        }

        if let Some(ticker) = lease_ticker {
            ticker.abort();
        }
        if let Err(e) = self.store.remove_team_job(&team, &job.id).await {
            warn!(job_id = %job.id, error = %e, "team job cleanup failed");
        }
    }

    async fn execute(&self, job: &QueueJob) -> Execution {
        if self.settings.url_is_blocked(&job.data.url) {
            info!(job_id = %job.id, url = %job.data.url, "blocked URL refused");
            return Execution::Completed(ScrapeOutcome::error(BLOCKED_MESSAGE));
        }

        let _ = self
            .queue
            .update_progress(&job.id, &JobProgress::scraping())
            .await;

        let params = ScrapeParams {
            url: job.data.url.clone(),
            mode: job.data.mode,
            crawler_options: job.data.crawler_options.clone(),
            page_options: job.data.page_options.clone(),
            team_id: job.data.team_id.clone(),
            job_id: job.id.clone(),
            crawl_id: job.data.crawl_id.clone(),
            priority: job.options.priority,
            is_scrape: job.data.crawl_id.is_none(),
        };

        let outcome = self
            .pipeline
            .run(params, Some(self.progress_hook(&job.id)))
            .await;

        if outcome.success {
            Execution::Completed(outcome)
        } else {
            Execution::Failed(
                outcome
                    .message
                    .unwrap_or_else(|| "scrape pipeline failed".to_string()),
            )
        }
    }

    fn progress_hook(&self, job_id: &str) -> ProgressHook {
        let store = self.store.clone();
        let job_id = job_id.to_string();
        Arc::new(move |progress: ScrapeProgress| {
            let store = store.clone();
            let job_id = job_id.clone();
            tokio::spawn(async move {
                let step = JobProgress::Step {
                    current: progress.current,
                    total: progress.total,
                    step: "SCRAPING".to_string(),
                    current_url: progress.current_url,
                };
                let _ = store.update_job_progress(&job_id, &step).await;
            });
        })
    }

    /// Keep the lease alive while work is in flight. Extension errors are
    /// logged and swallowed; they must never stall the scrape.
    fn start_lease_ticker(&self, job: &QueueJob) -> Option<JoinHandle<()>> {
        let token = job.lease_token.clone()?;
        let queue = self.queue.clone();
        let job_id = job.id.clone();
        let interval = self.settings.worker.job_lock_extend_interval;
        let extension = self.settings.worker.job_lock_extension_time;

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = queue.extend_lock(&job_id, &token, extension).await {
                    warn!(job_id, error = %e, "lease extension failed");
                }
            }
        }))
    }
}

/// The outer poll loop.
pub struct Worker {
    handler: Arc<JobHandler>,
    queue: Arc<dyn QueueProvider>,
    monitor: Arc<ResourceMonitor>,
    tuning: WorkerTuning,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(
        handler: Arc<JobHandler>,
        queue: Arc<dyn QueueProvider>,
        monitor: Arc<ResourceMonitor>,
        tuning: WorkerTuning,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            handler,
            queue,
            monitor,
            tuning,
            shutdown,
        }
    }

    /// Poll until shutdown, then drain in-flight jobs within the grace
    /// period.
    pub async fn run(mut self) {
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut empty_polls = 0u32;
        info!("worker loop starting");

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            while in_flight.try_join_next().is_some() {}

            if self.monitor.overloaded() {
                let sample = self.monitor.current();
                debug!(
                    cpu = sample.cpu_fraction,
                    ram = sample.ram_fraction,
                    "resource pressure, not admitting jobs"
                );
                if !self.pause(self.tuning.cant_accept_connection_interval).await {
                    break;
                }
                continue;
            }

            let token = new_id();
            match self.queue.next_job(&token).await {
                Ok(Some(job)) => {
                    empty_polls = 0;
                    let handler = self.handler.clone();
                    in_flight.spawn(async move {
                        handler.process(&job).await;
                    });
                    if !self.pause(self.tuning.got_job_interval).await {
                        break;
                    }
                }
                Ok(None) => {
                    empty_polls += 1;
                    if !self.pause(self.empty_backoff(empty_polls)).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "queue poll failed");
                    if !self.pause(self.tuning.cant_accept_connection_interval).await {
                        break;
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            info!(count = in_flight.len(), "draining in-flight jobs");
            let drain = async {
                while in_flight.join_next().await.is_some() {}
            };
            if tokio::time::timeout(self.tuning.shutdown_grace, drain)
                .await
                .is_err()
            {
                warn!("shutdown grace elapsed, aborting remaining jobs");
            }
        }
        info!("worker loop stopped");
    }

    /// `min(base * 2^(polls / max_empty_polls), cap)`.
    fn empty_backoff(&self, empty_polls: u32) -> Duration {
        let doublings = empty_polls / self.tuning.max_empty_polls.max(1);
        let backoff = self
            .tuning
            .empty_poll_interval
            .saturating_mul(2u32.saturating_pow(doublings));
        backoff.min(self.tuning.empty_poll_interval_cap)
    }

    /// Sleep unless shutdown arrives first. Returns false on shutdown.
    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.changed() => !*self.shutdown.borrow(),
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::models::{Document, DocumentMetadata, JobOptions, JobPayload, JobState, JobStatus};
    use crate::queue::MemoryQueue;
    use crate::store::MemoryStateStore;

    struct StubPipeline<F>(F);

    #[async_trait]
    impl<F> ScrapePipeline for StubPipeline<F>
    where
        F: Fn(&ScrapeParams) -> ScrapeOutcome + Send + Sync,
    {
        async fn run(
            &self,
            params: ScrapeParams,
            _on_progress: Option<ProgressHook>,
        ) -> ScrapeOutcome {
            (self.0)(&params)
        }
    }

    fn success_pipeline() -> Arc<dyn ScrapePipeline> {
        Arc::new(StubPipeline(|params: &ScrapeParams| {
            ScrapeOutcome::ok(vec![Document {
                url: Some(params.url.clone()),
                content: Some("<html>ok</html>".to_string()),
                metadata: DocumentMetadata {
                    source_url: params.url.clone(),
                    ..Default::default()
                },
                ..Default::default()
            }])
        }))
    }

    struct Fixture {
        store: Arc<MemoryStateStore>,
        queue: Arc<MemoryQueue>,
        handler: Arc<JobHandler>,
        settings: Arc<Settings>,
    }

    fn fixture_with(pipeline: Arc<dyn ScrapePipeline>, settings: Settings) -> Fixture {
        let settings = Arc::new(settings);
        let store: Arc<MemoryStateStore> = Arc::new(MemoryStateStore::new());
        let queue: Arc<MemoryQueue> = Arc::new(MemoryQueue::new(store.clone()));
        let coordinator = Arc::new(CrawlCoordinator::new(store.clone(), queue.clone()));
        let handler = Arc::new(JobHandler::new(
            store.clone(),
            queue.clone(),
            pipeline,
            coordinator,
            settings.clone(),
        ));
        Fixture {
            store,
            queue,
            handler,
            settings,
        }
    }

    #[tokio::test]
    async fn happy_path_lands_completed_with_source_url() {
        let f = fixture_with(success_pipeline(), Settings::default());
        let payload = JobPayload {
            url: "https://example.com".to_string(),
            ..Default::default()
        };
        f.queue
            .add_job("scrape", payload, JobOptions::new("j1"))
            .await
            .unwrap();

        let job = f.queue.next_job("w").await.unwrap().unwrap();
        f.handler.process(&job).await;

        assert_eq!(
            f.store.get_job_state("j1").await.unwrap(),
            JobState::Known(JobStatus::Completed)
        );
        let result = f.store.get_job_result("j1").await.unwrap().unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(
            result["docs"][0]["metadata"]["sourceURL"],
            "https://example.com"
        );
        // Terminal jobs leave no team-job residue behind.
        assert_eq!(f.store.team_job_count("system").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn blocked_url_completes_with_unsuccessful_result() {
        let settings = Settings {
            blocked_url_substrings: vec!["blocked.example".to_string()],
            ..Default::default()
        };
        let f = fixture_with(success_pipeline(), settings);
        let payload = JobPayload {
            url: "https://blocked.example/page".to_string(),
            ..Default::default()
        };
        f.queue
            .add_job("scrape", payload, JobOptions::new("j1"))
            .await
            .unwrap();

        let job = f.queue.next_job("w").await.unwrap().unwrap();
        f.handler.process(&job).await;

        assert_eq!(
            f.store.get_job_state("j1").await.unwrap(),
            JobState::Known(JobStatus::Completed)
        );
        let result = f.store.get_job_result("j1").await.unwrap().unwrap();
        assert_eq!(result["success"], false);
        assert!(result["message"]
            .as_str()
            .unwrap()
            .contains("URL is blocked"));
    }

    #[tokio::test]
    async fn pipeline_failure_moves_the_job_to_failed() {
        let pipeline: Arc<dyn ScrapePipeline> = Arc::new(StubPipeline(|_: &ScrapeParams| {
            ScrapeOutcome::error("render crashed")
        }));
        let f = fixture_with(pipeline, Settings::default());
        f.queue
            .add_job(
                "scrape",
                JobPayload {
                    url: "https://example.com".to_string(),
                    ..Default::default()
                },
                JobOptions {
                    job_id: "j1".to_string(),
                    priority: 10,
                    attempts: 1,
                    backoff_ms: 1,
                },
            )
            .await
            .unwrap();

        let job = f.queue.next_job("w").await.unwrap().unwrap();
        f.handler.process(&job).await;

        assert_eq!(
            f.store.get_job_state("j1").await.unwrap(),
            JobState::Known(JobStatus::Failed)
        );
        assert_eq!(
            f.store.get_job_error("j1").await.unwrap().as_deref(),
            Some("render crashed")
        );
    }

    #[tokio::test]
    async fn redelivered_terminal_job_is_dropped() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let pipeline: Arc<dyn ScrapePipeline> = Arc::new(StubPipeline(move |_: &ScrapeParams| {
            counter.fetch_add(1, Ordering::SeqCst);
            ScrapeOutcome::ok(vec![])
        }));
        let f = fixture_with(pipeline, Settings::default());
        f.queue
            .add_job(
                "scrape",
                JobPayload {
                    url: "https://example.com".to_string(),
                    ..Default::default()
                },
                JobOptions::new("j1"),
            )
            .await
            .unwrap();

        let job = f.queue.next_job("w").await.unwrap().unwrap();
        f.handler.process(&job).await;
        f.handler.process(&job).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1, "second delivery dropped");
    }

    #[tokio::test]
    async fn overloaded_worker_admits_nothing() {
        struct HotSampler;
        impl ResourceSampler for HotSampler {
            fn sample(&self) -> ResourceSample {
                ResourceSample {
                    cpu_fraction: 1.0,
                    ram_fraction: 0.2,
                }
            }
        }

        let f = fixture_with(success_pipeline(), Settings::default());
        f.queue
            .add_job(
                "scrape",
                JobPayload {
                    url: "https://example.com".to_string(),
                    ..Default::default()
                },
                JobOptions::new("j1"),
            )
            .await
            .unwrap();

        let monitor = Arc::new(ResourceMonitor::new(Arc::new(HotSampler), 0.95, 0.95));
        let tuning = WorkerTuning {
            cant_accept_connection_interval: Duration::from_millis(5),
            ..Default::default()
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Worker::new(
            f.handler.clone(),
            f.queue.clone(),
            monitor,
            tuning,
            shutdown_rx,
        );
        let running = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = shutdown_tx.send(true);
        running.await.unwrap();

        assert_eq!(f.queue.waiting_count().await.unwrap(), 1);
        assert_eq!(
            f.store.get_job_state("j1").await.unwrap(),
            JobState::Known(JobStatus::Waiting)
        );
        let _ = f.settings; // fixture keeps settings alive for the handler
    }

    #[tokio::test]
    async fn worker_drains_the_queue() {
        let f = fixture_with(success_pipeline(), Settings::default());
        for i in 0..3 {
            f.queue
                .add_job(
                    "scrape",
                    JobPayload {
                        url: format!("https://example.com/{i}"),
                        ..Default::default()
                    },
                    JobOptions::new(format!("j{i}")),
                )
                .await
                .unwrap();
        }

        let monitor = Arc::new(ResourceMonitor::new(Arc::new(ProcSampler::new()), 2.0, 2.0));
        let tuning = WorkerTuning {
            got_job_interval: Duration::from_millis(5),
            empty_poll_interval: Duration::from_millis(5),
            ..Default::default()
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Worker::new(
            f.handler.clone(),
            f.queue.clone(),
            monitor,
            tuning,
            shutdown_rx,
        );
        let running = tokio::spawn(worker.run());

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let mut done = 0;
            for i in 0..3 {
                if f.store
                    .get_job_state(&format!("j{i}"))
                    .await
                    .unwrap()
                    .is_terminal()
                {
                    done += 1;
                }
            }
            if done == 3 {
                break;
            }
        }
        let _ = shutdown_tx.send(true);
        running.await.unwrap();

        for i in 0..3 {
            assert_eq!(
                f.store.get_job_state(&format!("j{i}")).await.unwrap(),
                JobState::Known(JobStatus::Completed)
            );
        }
    }
}
