//! Crawl coordination: registration, fan-out, and completion tracking.
//!
//! The coordinator is the only path that turns URLs into member jobs:
//! lock the URL, enqueue a scrape job bound to the crawl, record the
//! (crawl, job) edge. URL locks make fan-out at-most-once per URL no
//! matter how many workers discover the same link concurrently.

mod links;

pub use links::{filter_links, HtmlLinkExtractor, LinkExtractor};

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::models::{
    new_id, Crawl, CrawlerOptions, Document, JobOptions, JobPayload, PageOptions, ScrapeMode,
};
use crate::priority::{job_priority, BASE_PRIORITY};
use crate::queue::{QueueError, QueueJob, QueueProvider};
use crate::store::{StateStore, StoreError};

/// Byte budget for one status read of completed results.
pub const STATUS_BYTE_BUDGET: usize = 10 * 1024 * 1024;
/// Completed job ids are fetched in slices of this size.
pub const STATUS_CHUNK: i64 = 100;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub struct CrawlCoordinator {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn QueueProvider>,
    extractor: Arc<dyn LinkExtractor>,
}

impl CrawlCoordinator {
    pub fn new(store: Arc<dyn StateStore>, queue: Arc<dyn QueueProvider>) -> Self {
        Self {
            store,
            queue,
            extractor: Arc::new(HtmlLinkExtractor),
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn LinkExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Create the crawl record and hand back its id. The caller expands
    /// the seed into URLs and passes them to [`register_urls`].
    ///
    /// [`register_urls`]: CrawlCoordinator::register_urls
    pub async fn start_crawl(
        &self,
        origin_url: &str,
        crawler_options: CrawlerOptions,
        page_options: PageOptions,
        team_id: &str,
        plan: &str,
        robots: Option<String>,
    ) -> Result<String, CrawlError> {
        let id = new_id();
        let crawl = Crawl::new(
            &id,
            origin_url,
            crawler_options,
            page_options,
            team_id,
            plan,
            robots,
        );
        self.store.save_crawl(&crawl).await?;
        Ok(id)
    }

    /// Lock, enqueue, and register each URL for the crawl. URLs whose
    /// lock already exists are skipped; the rest each become one member
    /// job. Returns the job ids actually enqueued.
    pub async fn register_urls(
        &self,
        crawl_id: &str,
        urls: &[String],
        from_sitemap: bool,
    ) -> Result<Vec<String>, CrawlError> {
        let Some(crawl) = self.store.get_crawl(crawl_id).await? else {
            return Err(CrawlError::Store(StoreError::NotFound(format!(
                "crawl {crawl_id}"
            ))));
        };
        if crawl.cancelled {
            debug!(crawl_id, "crawl cancelled, skipping registration");
            return Ok(Vec::new());
        }

        let limit = crawl.crawler_options.limit;
        let mut budget = if limit > 0 {
            limit.saturating_sub(crawl.total_urls as usize)
        } else {
            usize::MAX
        };

        let mut enqueued = Vec::new();
        for url in urls {
            if budget == 0 {
                debug!(crawl_id, limit, "crawl limit reached, dropping remainder");
                break;
            }
            if !self.store.lock_url(crawl_id, url).await? {
                continue;
            }

            let job_id = new_id();
            let priority = job_priority(
                self.store.as_ref(),
                &crawl.plan,
                Some(&crawl.team_id),
                BASE_PRIORITY,
            )
            .await;

            let payload = JobPayload {
                url: url.clone(),
                mode: ScrapeMode::SingleUrls,
                team_id: Some(crawl.team_id.clone()),
                page_options: crawl.page_options.clone(),
                crawler_options: Some(crawl.crawler_options.clone()),
                crawl_id: Some(crawl_id.to_string()),
                from_sitemap: from_sitemap.then_some(true),
                ..Default::default()
            };
            self.queue
                .add_job(
                    "scrape",
                    payload,
                    JobOptions::new(&job_id).with_priority(priority),
                )
                .await?;
            self.store.add_crawl_job(crawl_id, &job_id).await?;
            budget = budget.saturating_sub(1);
            enqueued.push(job_id);
        }

        if !enqueued.is_empty() {
            self.store.mark_crawl_scraping(crawl_id).await?;
        }
        Ok(enqueued)
    }

    /// Record a member job's terminal outcome and fan out the links it
    /// discovered. Runs for failed children too, so the crawl's counters
    /// always converge on its total.
    pub async fn handle_job_done(
        &self,
        job: &QueueJob,
        success: bool,
        docs: &[Document],
    ) -> Result<(), CrawlError> {
        let Some(crawl_id) = job.data.crawl_id.clone() else {
            return Ok(());
        };

        self.store
            .add_crawl_job_done(&crawl_id, &job.id, success)
            .await?;

        if success && !job.data.is_from_sitemap() {
            self.fan_out(&crawl_id, docs).await?;
        }

        self.store.finish_crawl(&crawl_id).await?;
        Ok(())
    }

    async fn fan_out(&self, crawl_id: &str, docs: &[Document]) -> Result<(), CrawlError> {
        let Some(crawl) = self.store.get_crawl(crawl_id).await? else {
            return Ok(());
        };
        if crawl.cancelled {
            debug!(crawl_id, "crawl cancelled, skipping fan-out");
            return Ok(());
        }
        let Some(first) = docs.first() else {
            return Ok(());
        };
        let Some(html) = first.raw_html.as_deref().or(first.content.as_deref()) else {
            return Ok(());
        };

        let base = if first.metadata.source_url.is_empty() {
            crawl.origin_url.clone()
        } else {
            first.metadata.source_url.clone()
        };
        let candidates = self.extractor.extract(&base, html);
        let accepted = filter_links(&crawl.origin_url, &crawl.crawler_options, candidates);
        if accepted.is_empty() {
            return Ok(());
        }

        let enqueued = self.register_urls(crawl_id, &accepted, false).await?;
        if !enqueued.is_empty() {
            debug!(crawl_id, count = enqueued.len(), "fanned out discovered links");
        }
        Ok(())
    }

    /// Completed results in completion order, stopping before the payload
    /// crosses `byte_budget`. The element that would cross is discarded.
    pub async fn collect_done_results(
        &self,
        crawl_id: &str,
        byte_budget: usize,
    ) -> Result<Vec<serde_json::Value>, CrawlError> {
        let len = self.store.done_jobs_len(crawl_id).await? as i64;
        let mut results = Vec::new();
        let mut used = 0usize;

        let mut start = 0i64;
        'chunks: while start < len {
            let end = (start + STATUS_CHUNK - 1).min(len - 1);
            let ids = self.store.done_jobs_ordered(crawl_id, start, end).await?;
            if ids.is_empty() {
                break;
            }
            for id in &ids {
                let Some(result) = self.store.get_job_result(id).await? else {
                    continue;
                };
                let size = serde_json::to_string(&result).map(|s| s.len()).unwrap_or(0);
                if used + size > byte_budget {
                    break 'chunks;
                }
                used += size;
                results.push(result);
            }
            start += STATUS_CHUNK;
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentMetadata, ScrapeOutcome};
    use crate::queue::MemoryQueue;
    use crate::store::MemoryStateStore;

    fn fixture() -> (Arc<MemoryStateStore>, Arc<MemoryQueue>, CrawlCoordinator) {
        let store: Arc<MemoryStateStore> = Arc::new(MemoryStateStore::new());
        let queue = Arc::new(MemoryQueue::new(store.clone()));
        let coordinator = CrawlCoordinator::new(store.clone(), queue.clone());
        (store, queue, coordinator)
    }

    async fn start(coordinator: &CrawlCoordinator) -> String {
        coordinator
            .start_crawl(
                "https://a.example/",
                CrawlerOptions::default(),
                PageOptions::default(),
                "t1",
                "standard",
                None,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_urls_enqueue_exactly_one_job() {
        let (_store, queue, coordinator) = fixture();
        let crawl_id = start(&coordinator).await;

        let urls = vec![
            "https://a.example/page".to_string(),
            "https://a.example/page".to_string(),
        ];
        let enqueued = coordinator.register_urls(&crawl_id, &urls, false).await.unwrap();
        assert_eq!(enqueued.len(), 1);
        assert_eq!(queue.waiting_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn registration_flips_crawl_to_scraping() {
        let (store, _queue, coordinator) = fixture();
        let crawl_id = start(&coordinator).await;
        coordinator
            .register_urls(&crawl_id, &["https://a.example/x".to_string()], false)
            .await
            .unwrap();
        let crawl = store.get_crawl(&crawl_id).await.unwrap().unwrap();
        assert_eq!(crawl.status, crate::models::CrawlStatus::Scraping);
    }

    #[tokio::test]
    async fn crawl_limit_caps_registration() {
        let (_store, _queue, coordinator) = fixture();
        let crawl_id = coordinator
            .start_crawl(
                "https://a.example/",
                CrawlerOptions {
                    limit: 2,
                    ..Default::default()
                },
                PageOptions::default(),
                "t1",
                "standard",
                None,
            )
            .await
            .unwrap();

        let urls: Vec<String> = (0..5).map(|i| format!("https://a.example/{i}")).collect();
        let enqueued = coordinator.register_urls(&crawl_id, &urls, false).await.unwrap();
        assert_eq!(enqueued.len(), 2);
    }

    #[tokio::test]
    async fn fan_out_locks_before_enqueueing() {
        let (store, queue, coordinator) = fixture();
        let crawl_id = start(&coordinator).await;
        let seeds = coordinator
            .register_urls(&crawl_id, &["https://a.example/".to_string()], false)
            .await
            .unwrap();
        let seed_job = queue.next_job("w").await.unwrap().unwrap();
        assert_eq!(seed_job.id, seeds[0]);

        // The page links to /next twice and to the seed itself.
        let html = r#"<a href="/next">n</a><a href="/next">n</a><a href="/">home</a>"#;
        let docs = vec![Document {
            raw_html: Some(html.to_string()),
            metadata: DocumentMetadata {
                source_url: "https://a.example/".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }];
        coordinator
            .handle_job_done(&seed_job, true, &docs)
            .await
            .unwrap();

        // Only /next survives: the seed URL is already locked.
        let crawl = store.get_crawl(&crawl_id).await.unwrap().unwrap();
        assert_eq!(crawl.total_urls, 2);
        assert_eq!(queue.waiting_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancelled_crawl_stops_fan_out_but_finishes_children() {
        let (store, queue, coordinator) = fixture();
        let crawl_id = start(&coordinator).await;
        coordinator
            .register_urls(&crawl_id, &["https://a.example/".to_string()], false)
            .await
            .unwrap();
        let job = queue.next_job("w").await.unwrap().unwrap();

        store.cancel_crawl(&crawl_id).await.unwrap();

        let html = r#"<a href="/next">n</a>"#;
        let docs = vec![Document {
            raw_html: Some(html.to_string()),
            metadata: DocumentMetadata {
                source_url: "https://a.example/".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }];
        coordinator.handle_job_done(&job, true, &docs).await.unwrap();

        let crawl = store.get_crawl(&crawl_id).await.unwrap().unwrap();
        assert_eq!(crawl.total_urls, 1, "no fan-out after cancellation");
        assert_eq!(crawl.completed_urls, 1, "the in-flight child still lands");
    }

    #[tokio::test]
    async fn sitemap_seeded_jobs_do_not_fan_out() {
        let (store, queue, coordinator) = fixture();
        let crawl_id = start(&coordinator).await;
        coordinator
            .register_urls(&crawl_id, &["https://a.example/".to_string()], true)
            .await
            .unwrap();
        let job = queue.next_job("w").await.unwrap().unwrap();

        let docs = vec![Document {
            raw_html: Some(r#"<a href="/next">n</a>"#.to_string()),
            metadata: DocumentMetadata {
                source_url: "https://a.example/".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }];
        coordinator.handle_job_done(&job, true, &docs).await.unwrap();
        assert_eq!(
            store.get_crawl(&crawl_id).await.unwrap().unwrap().total_urls,
            1
        );
    }

    #[tokio::test]
    async fn byte_budget_discards_the_crossing_element() {
        let (store, _queue, coordinator) = fixture();
        let crawl_id = start(&coordinator).await;
        store
            .add_crawl_jobs(
                &crawl_id,
                &["a".to_string(), "b".to_string(), "c".to_string()],
            )
            .await
            .unwrap();

        for id in ["a", "b", "c"] {
            store.create_job(&crate::models::Job::new(
                id,
                "scrape",
                JobPayload {
                    crawl_id: Some(crawl_id.clone()),
                    ..Default::default()
                },
                JobOptions::new(id),
            ))
            .await
            .unwrap();
            store.mark_job_started(id).await.unwrap();
            let outcome = ScrapeOutcome::ok(vec![Document {
                content: Some("x".repeat(400)),
                ..Default::default()
            }]);
            store.mark_job_completed(id, &outcome).await.unwrap();
        }

        let all = coordinator
            .collect_done_results(&crawl_id, usize::MAX)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        let one_size = serde_json::to_string(&all[0]).unwrap().len();

        // Budget fits two results; the third crosses and is discarded.
        let capped = coordinator
            .collect_done_results(&crawl_id, one_size * 2 + 10)
            .await
            .unwrap();
        assert_eq!(capped.len(), 2);
    }
}
