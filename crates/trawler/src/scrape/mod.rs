//! The per-job scrape pipeline.
//!
//! Wraps the browser microservice and normalizes per-URL results into the
//! fixed [`ScrapeOutcome`] shape. Crawl mode scrapes its single seed URL;
//! single-URL mode accepts a comma-separated list.

mod browser;

pub use browser::{BrowserClient, FetchedPage};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{CrawlerOptions, Document, DocumentMetadata, PageOptions, ScrapeMode, ScrapeOutcome};

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("scrape failed: {0}")]
    Execution(String),
    #[error("browser transport error: {0}")]
    Transport(String),
}

/// Partial documents retained for progress reporting are capped here.
pub const MAX_PARTIAL_DOCS: usize = 50;

/// Inputs for one scrape job.
#[derive(Debug, Clone)]
pub struct ScrapeParams {
    pub url: String,
    pub mode: ScrapeMode,
    pub crawler_options: Option<CrawlerOptions>,
    pub page_options: PageOptions,
    pub team_id: Option<String>,
    pub job_id: String,
    pub crawl_id: Option<String>,
    pub priority: i32,
    pub is_scrape: bool,
}

/// Progress emitted at most once per fetched URL.
#[derive(Debug, Clone)]
pub struct ScrapeProgress {
    pub current: u32,
    pub total: u32,
    pub current_url: String,
    /// Documents so far, capped at [`MAX_PARTIAL_DOCS`].
    pub partial_docs: Vec<Document>,
}

pub type ProgressHook = Arc<dyn Fn(ScrapeProgress) + Send + Sync>;

/// The seam the worker drives. Tests substitute a stub; production wires
/// [`BrowserScraper`].
#[async_trait]
pub trait ScrapePipeline: Send + Sync {
    async fn run(&self, params: ScrapeParams, on_progress: Option<ProgressHook>) -> ScrapeOutcome;
}

/// Production pipeline backed by the browser microservice.
pub struct BrowserScraper {
    client: BrowserClient,
}

impl BrowserScraper {
    pub fn new(client: BrowserClient) -> Self {
        Self { client }
    }

    fn target_urls(params: &ScrapeParams) -> Vec<String> {
        match params.mode {
            ScrapeMode::Crawl => vec![params.url.clone()],
            ScrapeMode::SingleUrls => params
                .url
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Crawl children need the raw HTML for link extraction regardless of
    /// what the caller asked to keep; normalization applies afterwards.
    fn effective_options(params: &ScrapeParams) -> PageOptions {
        let mut options = params.page_options.clone();
        if params.crawl_id.is_some() {
            options.include_raw_html = true;
        }
        options
    }
}

#[async_trait]
impl ScrapePipeline for BrowserScraper {
    async fn run(&self, params: ScrapeParams, on_progress: Option<ProgressHook>) -> ScrapeOutcome {
        let urls = Self::target_urls(&params);
        if urls.is_empty() {
            return ScrapeOutcome::error("no URLs to scrape");
        }
        let options = Self::effective_options(&params);
        let total = urls.len() as u32;
        let mut docs = Vec::with_capacity(urls.len());

        for (index, url) in urls.iter().enumerate() {
            let page = match self
                .client
                .fetch_page(url, options.wait_after_load_ms, options.headers.as_ref())
                .await
            {
                Ok(page) => page,
                Err(e) => return ScrapeOutcome::error(e.to_string()),
            };

            let doc = Document {
                url: Some(url.clone()),
                content: Some(page.content.clone()),
                raw_html: Some(page.content),
                metadata: DocumentMetadata {
                    source_url: url.clone(),
                    page_status_code: page.status_code,
                    page_error: page.page_error,
                },
                index: Some(index as u32),
                provider: Some("browser".to_string()),
                ..Default::default()
            };
            docs.push(doc.normalized(&options));

            if let Some(hook) = &on_progress {
                let mut partial_docs = docs.clone();
                partial_docs.truncate(MAX_PARTIAL_DOCS);
                hook(ScrapeProgress {
                    current: (index + 1) as u32,
                    total,
                    current_url: url.clone(),
                    partial_docs,
                });
            }
        }

        ScrapeOutcome::ok(docs)
    }
}
