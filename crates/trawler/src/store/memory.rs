//! In-memory state store for single-process runs and tests.
//!
//! Same contract as the Redis backend, held behind one lock. Expiry is
//! evaluated lazily at read time.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{bounded_result, url_lock_digest, StateStore, StoreError, StoreResult};
use crate::models::{
    Crawl, CrawlStatus, Job, JobOptions, JobPayload, JobProgress, JobState, JobStatus,
    ScrapeOutcome, SYSTEM_TEAM_ID,
};

#[derive(Debug)]
struct CrawlEntry {
    crawl: Crawl,
    done_set: HashSet<String>,
}

#[derive(Debug, Clone)]
struct UrlLock {
    crawl_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Job>,
    crawls: HashMap<String, CrawlEntry>,
    /// (crawl, job) edge records: job id -> crawl id.
    crawl_edges: HashMap<String, String>,
    url_locks: HashMap<String, UrlLock>,
    /// team id -> job id -> record expiry.
    team_jobs: HashMap<String, HashMap<String, DateTime<Utc>>>,
}

pub struct MemoryStateStore {
    inner: RwLock<Inner>,
    max_result_bytes: usize,
    team_job_ttl: Duration,
    url_lock_ttl: Duration,
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_result_bytes: 990_000,
            team_job_ttl: Duration::from_secs(10 * 60),
            url_lock_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }

    pub fn with_limits(
        max_result_bytes: usize,
        team_job_ttl: Duration,
        url_lock_ttl: Duration,
    ) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_result_bytes,
            team_job_ttl,
            url_lock_ttl,
        }
    }

    fn placeholder_job(job_id: &str) -> Job {
        let payload = JobPayload {
            team_id: Some(SYSTEM_TEAM_ID.to_string()),
            ..Default::default()
        };
        Job::new(job_id, "recovered", payload, JobOptions::new(job_id))
    }

    /// Counter update + list append + status flip, as one critical section.
    fn record_done(inner: &mut Inner, crawl_id: &str, job_id: &str, success: bool) -> StoreResult<()> {
        let entry = inner
            .crawls
            .get_mut(crawl_id)
            .ok_or_else(|| StoreError::NotFound(format!("crawl {crawl_id}")))?;
        if !entry.done_set.insert(job_id.to_string()) {
            return Ok(());
        }
        if success {
            entry.crawl.completed_jobs.push(job_id.to_string());
            entry.crawl.completed_urls += 1;
        } else {
            entry.crawl.failed_jobs.push(job_id.to_string());
            entry.crawl.failed_urls += 1;
        }
        if entry.crawl.is_finished() && entry.crawl.status != CrawlStatus::Completed {
            entry.crawl.status = CrawlStatus::Completed;
            entry.crawl.end_time = Some(Utc::now());
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn create_job(&self, job: &Job) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job {}", job.id)));
        }
        let mut job = job.clone();
        if job.data.team_id.is_none() {
            job.data.team_id = Some(SYSTEM_TEAM_ID.to_string());
        }
        job.status = JobStatus::Waiting;
        job.progress = JobProgress::Percent(0);
        inner.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn mark_job_started(&self, job_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        match job.status {
            JobStatus::Waiting => {
                job.status = JobStatus::Active;
                job.updated_at = Utc::now();
                Ok(())
            }
            JobStatus::Active => Ok(()),
            status => Err(StoreError::IllegalTransition {
                job_id: job_id.to_string(),
                status,
            }),
        }
    }

    async fn mark_job_completed(&self, job_id: &str, outcome: &ScrapeOutcome) -> StoreResult<()> {
        let result = bounded_result(outcome, self.max_result_bytes);
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .entry(job_id.to_string())
            .or_insert_with(|| Self::placeholder_job(job_id));
        if job.status.is_terminal() {
            return Ok(());
        }
        job.status = JobStatus::Completed;
        job.progress = JobProgress::Percent(100);
        job.result = Some(result);
        job.error = None;
        job.updated_at = Utc::now();
        let crawl_id = job.data.crawl_id.clone();

        if let Some(crawl_id) = crawl_id {
            Self::record_done(&mut inner, &crawl_id, job_id, true)?;
        }
        Ok(())
    }

    async fn mark_job_failed(&self, job_id: &str, error: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .entry(job_id.to_string())
            .or_insert_with(|| Self::placeholder_job(job_id));
        if job.status.is_terminal() {
            return Ok(());
        }
        job.status = JobStatus::Failed;
        job.error = Some(error.to_string());
        job.updated_at = Utc::now();
        let crawl_id = job.data.crawl_id.clone();

        if let Some(crawl_id) = crawl_id {
            Self::record_done(&mut inner, &crawl_id, job_id, false)?;
        }
        Ok(())
    }

    async fn update_job_progress(&self, job_id: &str, progress: &JobProgress) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(job) = inner.jobs.get_mut(job_id) {
            job.progress = progress.clone();
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> StoreResult<Option<Job>> {
        Ok(self.inner.read().await.jobs.get(job_id).cloned())
    }

    async fn get_job_state(&self, job_id: &str) -> StoreResult<JobState> {
        Ok(self
            .inner
            .read()
            .await
            .jobs
            .get(job_id)
            .map(|j| JobState::Known(j.status))
            .unwrap_or(JobState::Unknown))
    }

    async fn get_job_result(&self, job_id: &str) -> StoreResult<Option<serde_json::Value>> {
        Ok(self
            .inner
            .read()
            .await
            .jobs
            .get(job_id)
            .and_then(|j| j.result.clone()))
    }

    async fn get_job_error(&self, job_id: &str) -> StoreResult<Option<String>> {
        Ok(self
            .inner
            .read()
            .await
            .jobs
            .get(job_id)
            .and_then(|j| j.error.clone()))
    }

    async fn get_job_data(&self, job_id: &str) -> StoreResult<Option<JobPayload>> {
        Ok(self
            .inner
            .read()
            .await
            .jobs
            .get(job_id)
            .map(|j| j.data.clone()))
    }

    async fn remove_job(&self, job_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.jobs.remove(job_id);
        inner.crawl_edges.remove(job_id);
        Ok(())
    }

    async fn set_job_dispatch_id(&self, job_id: &str, task_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(job) = inner.jobs.get_mut(job_id) {
            job.data.cloud_tasks_id = Some(task_id.to_string());
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn clean_terminal_jobs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.write().await;
        let stale: Vec<String> = inner
            .jobs
            .values()
            .filter(|j| j.status.is_terminal() && j.updated_at < cutoff)
            .map(|j| j.id.clone())
            .collect();
        for id in &stale {
            inner.jobs.remove(id);
            inner.crawl_edges.remove(id);
        }
        Ok(stale.len() as u64)
    }

    async fn save_crawl(&self, crawl: &Crawl) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.crawls.insert(
            crawl.id.clone(),
            CrawlEntry {
                crawl: crawl.clone(),
                done_set: HashSet::new(),
            },
        );
        Ok(())
    }

    async fn get_crawl(&self, crawl_id: &str) -> StoreResult<Option<Crawl>> {
        Ok(self
            .inner
            .read()
            .await
            .crawls
            .get(crawl_id)
            .map(|e| e.crawl.clone()))
    }

    async fn get_crawl_expiry(&self, crawl_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self
            .inner
            .read()
            .await
            .crawls
            .get(crawl_id)
            .map(|e| e.crawl.expires_at))
    }

    async fn mark_crawl_scraping(&self, crawl_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.crawls.get_mut(crawl_id) {
            if matches!(entry.crawl.status, CrawlStatus::Created | CrawlStatus::Pending) {
                entry.crawl.status = CrawlStatus::Scraping;
            }
        }
        Ok(())
    }

    async fn cancel_crawl(&self, crawl_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .crawls
            .get_mut(crawl_id)
            .ok_or_else(|| StoreError::NotFound(format!("crawl {crawl_id}")))?;
        entry.crawl.cancelled = true;
        if !matches!(entry.crawl.status, CrawlStatus::Completed | CrawlStatus::Failed) {
            entry.crawl.status = CrawlStatus::Cancelled;
        }
        Ok(())
    }

    async fn add_crawl_job(&self, crawl_id: &str, job_id: &str) -> StoreResult<()> {
        self.add_crawl_jobs(crawl_id, std::slice::from_ref(&job_id.to_string()))
            .await
    }

    async fn add_crawl_jobs(&self, crawl_id: &str, job_ids: &[String]) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .crawls
            .get_mut(crawl_id)
            .ok_or_else(|| StoreError::NotFound(format!("crawl {crawl_id}")))?;
        for job_id in job_ids {
            entry.crawl.urls.push(job_id.clone());
            entry.crawl.total_urls += 1;
        }
        for job_id in job_ids {
            inner.crawl_edges.insert(job_id.clone(), crawl_id.to_string());
        }
        Ok(())
    }

    async fn add_crawl_job_done(
        &self,
        crawl_id: &str,
        job_id: &str,
        success: bool,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        Self::record_done(&mut inner, crawl_id, job_id, success)
    }

    async fn done_jobs_len(&self, crawl_id: &str) -> StoreResult<u64> {
        Ok(self
            .inner
            .read()
            .await
            .crawls
            .get(crawl_id)
            .map(|e| e.crawl.completed_jobs.len() as u64)
            .unwrap_or(0))
    }

    async fn done_jobs_ordered(
        &self,
        crawl_id: &str,
        start: i64,
        end: i64,
    ) -> StoreResult<Vec<String>> {
        let inner = self.inner.read().await;
        let Some(entry) = inner.crawls.get(crawl_id) else {
            return Ok(Vec::new());
        };
        Ok(slice_range(&entry.crawl.completed_jobs, start, end))
    }

    async fn is_crawl_finished(&self, crawl_id: &str) -> StoreResult<bool> {
        Ok(self
            .inner
            .read()
            .await
            .crawls
            .get(crawl_id)
            .map(|e| e.crawl.is_finished())
            .unwrap_or(false))
    }

    async fn finish_crawl(&self, crawl_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .crawls
            .get_mut(crawl_id)
            .ok_or_else(|| StoreError::NotFound(format!("crawl {crawl_id}")))?;
        if entry.crawl.is_finished() && entry.crawl.status != CrawlStatus::Completed {
            entry.crawl.status = CrawlStatus::Completed;
            entry.crawl.end_time = Some(Utc::now());
        }
        Ok(())
    }

    async fn lock_url(&self, crawl_id: &str, url: &str) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(try_lock(&mut inner, crawl_id, url, self.url_lock_ttl))
    }

    async fn lock_urls(&self, crawl_id: &str, urls: &[String]) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let all_free = urls.iter().all(|url| {
            inner
                .url_locks
                .get(&url_lock_digest(url))
                .map(|lock| lock.expires_at <= now)
                .unwrap_or(true)
        });
        if !all_free {
            return Ok(false);
        }
        for url in urls {
            try_lock(&mut inner, crawl_id, url, self.url_lock_ttl);
        }
        Ok(true)
    }

    async fn add_team_job(&self, team_id: &str, job_id: &str) -> StoreResult<()> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.team_job_ttl)
                .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let mut inner = self.inner.write().await;
        inner
            .team_jobs
            .entry(team_id.to_string())
            .or_default()
            .insert(job_id.to_string(), expires_at);
        Ok(())
    }

    async fn remove_team_job(&self, team_id: &str, job_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(jobs) = inner.team_jobs.get_mut(team_id) {
            jobs.remove(job_id);
        }
        Ok(())
    }

    async fn team_job_count(&self, team_id: &str) -> StoreResult<u64> {
        let now = Utc::now();
        Ok(self
            .inner
            .read()
            .await
            .team_jobs
            .get(team_id)
            .map(|jobs| jobs.values().filter(|expiry| **expiry > now).count() as u64)
            .unwrap_or(0))
    }
}

fn try_lock(inner: &mut Inner, crawl_id: &str, url: &str, ttl: Duration) -> bool {
    let digest = url_lock_digest(url);
    let now = Utc::now();
    if let Some(existing) = inner.url_locks.get(&digest) {
        if existing.expires_at > now {
            return false;
        }
    }
    inner.url_locks.insert(
        digest,
        UrlLock {
            crawl_id: crawl_id.to_string(),
            expires_at: now
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24)),
        },
    );
    true
}

/// List-range slicing: inclusive bounds, negatives count from the end.
fn slice_range(items: &[String], start: i64, end: i64) -> Vec<String> {
    let len = items.len() as i64;
    let resolve = |idx: i64| -> i64 {
        if idx < 0 {
            (len + idx).max(0)
        } else {
            idx
        }
    };
    let from = resolve(start).min(len);
    let to = resolve(end).min(len - 1);
    if len == 0 || from > to {
        return Vec::new();
    }
    items[from as usize..=(to as usize)].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Document, ScrapeMode};

    fn job(id: &str, crawl_id: Option<&str>) -> Job {
        let payload = JobPayload {
            url: "https://example.com".to_string(),
            mode: ScrapeMode::SingleUrls,
            team_id: Some("t1".to_string()),
            crawl_id: crawl_id.map(str::to_string),
            ..Default::default()
        };
        Job::new(id, "scrape", payload, JobOptions::new(id))
    }

    fn crawl(id: &str) -> Crawl {
        Crawl::new(
            id,
            "https://a.example/",
            Default::default(),
            Default::default(),
            "t1",
            "standard",
            None,
        )
    }

    #[tokio::test]
    async fn create_is_conflict_on_duplicate() {
        let store = MemoryStateStore::new();
        store.create_job(&job("j1", None)).await.unwrap();
        let err = store.create_job(&job("j1", None)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn missing_team_defaults_to_system() {
        let store = MemoryStateStore::new();
        let mut j = job("j1", None);
        j.data.team_id = None;
        store.create_job(&j).await.unwrap();
        let data = store.get_job_data("j1").await.unwrap().unwrap();
        assert_eq!(data.team_id.as_deref(), Some(SYSTEM_TEAM_ID));
    }

    #[tokio::test]
    async fn status_never_leaves_terminal() {
        let store = MemoryStateStore::new();
        store.create_job(&job("j1", None)).await.unwrap();
        store.mark_job_started("j1").await.unwrap();
        store
            .mark_job_completed("j1", &ScrapeOutcome::ok(vec![Document::default()]))
            .await
            .unwrap();

        // Re-delivery: terminal transitions are no-ops, start is refused.
        store
            .mark_job_failed("j1", "late failure")
            .await
            .unwrap();
        assert_eq!(
            store.get_job_state("j1").await.unwrap(),
            JobState::Known(JobStatus::Completed)
        );
        let err = store.mark_job_started("j1").await.unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn start_requires_existing_record() {
        let store = MemoryStateStore::new();
        let err = store.mark_job_started("ghost").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn completion_tolerates_lost_creation() {
        let store = MemoryStateStore::new();
        store
            .mark_job_completed("ghost", &ScrapeOutcome::ok(vec![]))
            .await
            .unwrap();
        assert_eq!(
            store.get_job_state("ghost").await.unwrap(),
            JobState::Known(JobStatus::Completed)
        );
    }

    #[tokio::test]
    async fn crawl_counters_flip_status_at_total() {
        let store = MemoryStateStore::new();
        store.save_crawl(&crawl("c1")).await.unwrap();
        let ids = vec!["j1".to_string(), "j2".to_string(), "j3".to_string()];
        store.add_crawl_jobs("c1", &ids).await.unwrap();

        store.add_crawl_job_done("c1", "j1", true).await.unwrap();
        store.add_crawl_job_done("c1", "j2", true).await.unwrap();
        assert!(!store.is_crawl_finished("c1").await.unwrap());

        store.add_crawl_job_done("c1", "j3", false).await.unwrap();
        assert!(store.is_crawl_finished("c1").await.unwrap());

        let c = store.get_crawl("c1").await.unwrap().unwrap();
        assert_eq!(c.status, CrawlStatus::Completed);
        assert_eq!(c.completed_urls, 2);
        assert_eq!(c.failed_urls, 1);
        assert!(c.end_time.is_some());
    }

    #[tokio::test]
    async fn done_recording_is_idempotent_per_job() {
        let store = MemoryStateStore::new();
        store.save_crawl(&crawl("c1")).await.unwrap();
        store.add_crawl_jobs("c1", &["j1".to_string(), "j2".to_string()]).await.unwrap();

        store.add_crawl_job_done("c1", "j1", true).await.unwrap();
        store.add_crawl_job_done("c1", "j1", true).await.unwrap();

        let c = store.get_crawl("c1").await.unwrap().unwrap();
        assert_eq!(c.completed_urls, 1);
        assert!(c.completed_urls + c.failed_urls <= c.total_urls);
    }

    #[tokio::test]
    async fn done_jobs_slicing_matches_list_ranges() {
        let store = MemoryStateStore::new();
        store.save_crawl(&crawl("c1")).await.unwrap();
        let ids: Vec<String> = (0..5).map(|i| format!("j{i}")).collect();
        store.add_crawl_jobs("c1", &ids).await.unwrap();
        for id in &ids {
            store.add_crawl_job_done("c1", id, true).await.unwrap();
        }

        let all = store.done_jobs_ordered("c1", 0, -1).await.unwrap();
        assert_eq!(all, ids);
        let middle = store.done_jobs_ordered("c1", 1, 3).await.unwrap();
        assert_eq!(middle, &ids[1..=3]);
        let tail = store.done_jobs_ordered("c1", -2, -1).await.unwrap();
        assert_eq!(tail, &ids[3..]);
    }

    #[tokio::test]
    async fn url_lock_is_create_if_absent() {
        let store = MemoryStateStore::new();
        assert!(store.lock_url("c1", "https://a.example/page").await.unwrap());
        assert!(!store.lock_url("c1", "https://a.example/page").await.unwrap());
        // Another crawl cannot steal a live lock either.
        assert!(!store.lock_url("c2", "https://a.example/page").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_lock_attempts_admit_exactly_one() {
        let store = std::sync::Arc::new(MemoryStateStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.lock_url("c1", "https://a.example/contended").await.unwrap()
            }));
        }
        let mut won = 0;
        for handle in handles {
            if handle.await.unwrap() {
                won += 1;
            }
        }
        assert_eq!(won, 1);
    }

    #[tokio::test]
    async fn batch_lock_is_all_or_nothing() {
        let store = MemoryStateStore::new();
        assert!(store.lock_url("c1", "https://a.example/1").await.unwrap());
        let urls = vec![
            "https://a.example/1".to_string(),
            "https://a.example/2".to_string(),
        ];
        assert!(!store.lock_urls("c2", &urls).await.unwrap());
        // /2 was not locked by the failed batch.
        assert!(store.lock_url("c3", "https://a.example/2").await.unwrap());
    }

    #[tokio::test]
    async fn expired_team_jobs_do_not_count() {
        let store =
            MemoryStateStore::with_limits(990_000, Duration::ZERO, Duration::from_secs(60));
        store.add_team_job("t1", "j1").await.unwrap();
        assert_eq!(store.team_job_count("t1").await.unwrap(), 0);

        let store = MemoryStateStore::new();
        store.add_team_job("t1", "j1").await.unwrap();
        store.add_team_job("t1", "j2").await.unwrap();
        assert_eq!(store.team_job_count("t1").await.unwrap(), 2);
        store.remove_team_job("t1", "j1").await.unwrap();
        assert_eq!(store.team_job_count("t1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sweeper_removes_old_terminal_jobs() {
        let store = MemoryStateStore::new();
        store.create_job(&job("j1", None)).await.unwrap();
        store.mark_job_started("j1").await.unwrap();
        store
            .mark_job_completed("j1", &ScrapeOutcome::ok(vec![]))
            .await
            .unwrap();
        store.create_job(&job("j2", None)).await.unwrap();

        let removed = store
            .clean_terminal_jobs_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.get_job_state("j2").await.unwrap(), JobState::Known(JobStatus::Waiting));
    }
}
