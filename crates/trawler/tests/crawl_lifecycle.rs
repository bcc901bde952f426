//! End-to-end crawl over the in-process backends: seed registration,
//! fan-out with URL locking, counter convergence, and completion.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use trawler::config::Settings;
use trawler::crawl::CrawlCoordinator;
use trawler::models::{
    CrawlStatus, CrawlerOptions, Document, DocumentMetadata, JobState, JobStatus, PageOptions,
    ScrapeOutcome,
};
use trawler::queue::{MemoryQueue, QueueProvider};
use trawler::scrape::{ProgressHook, ScrapeParams, ScrapePipeline};
use trawler::store::{MemoryStateStore, StateStore};
use trawler::worker::JobHandler;

/// Serves a tiny three-page site out of a map.
struct SitePipeline {
    pages: HashMap<String, String>,
}

#[async_trait]
impl ScrapePipeline for SitePipeline {
    async fn run(&self, params: ScrapeParams, _on_progress: Option<ProgressHook>) -> ScrapeOutcome {
        match self.pages.get(&params.url) {
            Some(html) => ScrapeOutcome::ok(vec![Document {
                url: Some(params.url.clone()),
                content: Some(html.clone()),
                raw_html: Some(html.clone()),
                metadata: DocumentMetadata {
                    source_url: params.url.clone(),
                    page_status_code: Some(200),
                    ..Default::default()
                },
                ..Default::default()
            }]),
            None => ScrapeOutcome::error(format!("no such page: {}", params.url)),
        }
    }
}

struct Harness {
    store: Arc<MemoryStateStore>,
    queue: Arc<MemoryQueue>,
    coordinator: Arc<CrawlCoordinator>,
    handler: JobHandler,
}

fn harness(pages: HashMap<String, String>) -> Harness {
    let store: Arc<MemoryStateStore> = Arc::new(MemoryStateStore::new());
    let queue: Arc<MemoryQueue> = Arc::new(MemoryQueue::new(store.clone()));
    let coordinator = Arc::new(CrawlCoordinator::new(store.clone(), queue.clone()));
    let handler = JobHandler::new(
        store.clone(),
        queue.clone(),
        Arc::new(SitePipeline { pages }),
        coordinator.clone(),
        Arc::new(Settings::default()),
    );
    Harness {
        store,
        queue,
        coordinator,
        handler,
    }
}

/// Drive the queue dry the way a worker would, without the poll loop.
/// Waits out retry backoff so failed jobs reach their final state.
async fn drain(harness: &Harness) -> usize {
    let mut processed = 0;
    for _ in 0..400 {
        if let Some(job) = harness.queue.next_job("it-worker").await.unwrap() {
            harness.handler.process(&job).await;
            processed += 1;
            continue;
        }
        if harness.queue.waiting_count().await.unwrap() == 0
            && harness.queue.active_count().await.unwrap() == 0
        {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    processed
}

fn site() -> HashMap<String, String> {
    // / links to /a and /b; /a links back to / and to /b; /b is a leaf.
    let mut pages = HashMap::new();
    pages.insert(
        "https://site.example/".to_string(),
        r#"<a href="/a">a</a><a href="/b">b</a>"#.to_string(),
    );
    pages.insert(
        "https://site.example/a".to_string(),
        r#"<a href="/">home</a><a href="/b">b</a>"#.to_string(),
    );
    pages.insert("https://site.example/b".to_string(), "<p>leaf</p>".to_string());
    pages
}

#[tokio::test]
async fn crawl_discovers_every_page_exactly_once() {
    let h = harness(site());
    let crawl_id = h
        .coordinator
        .start_crawl(
            "https://site.example/",
            CrawlerOptions::default(),
            PageOptions::default(),
            "t1",
            "standard",
            None,
        )
        .await
        .unwrap();

    let seeds = h
        .coordinator
        .register_urls(&crawl_id, &["https://site.example/".to_string()], false)
        .await
        .unwrap();
    assert_eq!(seeds.len(), 1);

    let processed = drain(&h).await;
    assert_eq!(processed, 3, "three pages, each scraped once");

    let crawl = h.store.get_crawl(&crawl_id).await.unwrap().unwrap();
    assert_eq!(crawl.status, CrawlStatus::Completed);
    assert_eq!(crawl.total_urls, 3);
    assert_eq!(crawl.completed_urls, 3);
    assert_eq!(crawl.failed_urls, 0);
    assert!(crawl.end_time.is_some());
    assert!(h.store.is_crawl_finished(&crawl_id).await.unwrap());

    // Every member job is terminal and carries its page.
    for job_id in &crawl.urls {
        assert_eq!(
            h.store.get_job_state(job_id).await.unwrap(),
            JobState::Known(JobStatus::Completed)
        );
        let result = h.store.get_job_result(job_id).await.unwrap().unwrap();
        assert_eq!(result["success"], true);
    }

    // Completion order is the store's serialization order.
    let done = h
        .store
        .done_jobs_ordered(&crawl_id, 0, -1)
        .await
        .unwrap();
    assert_eq!(done.len(), 3);
    assert_eq!(done[0], seeds[0], "the seed completed first");
}

#[tokio::test]
async fn failed_children_still_converge_the_crawl() {
    // /missing is linked but not served, so its job fails.
    let mut pages = site();
    pages.insert(
        "https://site.example/b".to_string(),
        r#"<a href="/missing">gone</a>"#.to_string(),
    );
    let h = harness(pages);

    let crawl_id = h
        .coordinator
        .start_crawl(
            "https://site.example/",
            CrawlerOptions::default(),
            PageOptions::default(),
            "t1",
            "standard",
            None,
        )
        .await
        .unwrap();
    h.coordinator
        .register_urls(&crawl_id, &["https://site.example/".to_string()], false)
        .await
        .unwrap();

    drain(&h).await;

    let crawl = h.store.get_crawl(&crawl_id).await.unwrap().unwrap();
    assert_eq!(crawl.status, CrawlStatus::Completed);
    assert_eq!(crawl.total_urls, 4);
    assert_eq!(crawl.completed_urls, 3);
    assert_eq!(crawl.failed_urls, 1);
    assert!(crawl.completed_urls + crawl.failed_urls <= crawl.total_urls);
}

#[tokio::test]
async fn status_read_returns_results_within_budget() {
    let h = harness(site());
    let crawl_id = h
        .coordinator
        .start_crawl(
            "https://site.example/",
            CrawlerOptions::default(),
            PageOptions::default(),
            "t1",
            "standard",
            None,
        )
        .await
        .unwrap();
    h.coordinator
        .register_urls(&crawl_id, &["https://site.example/".to_string()], false)
        .await
        .unwrap();
    drain(&h).await;

    let results = h
        .coordinator
        .collect_done_results(&crawl_id, trawler::crawl::STATUS_BYTE_BUDGET)
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    for result in &results {
        assert_eq!(result["success"], true);
    }
}
