//! Crawl record: the root of a multi-job crawl produced by fan-out.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::PageOptions;

/// How long a crawl (and its URL locks) stays live.
pub const CRAWL_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    #[default]
    Created,
    Pending,
    Scraping,
    Completed,
    Failed,
    Cancelled,
}

impl CrawlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlStatus::Created => "created",
            CrawlStatus::Pending => "pending",
            CrawlStatus::Scraping => "scraping",
            CrawlStatus::Completed => "completed",
            CrawlStatus::Failed => "failed",
            CrawlStatus::Cancelled => "cancelled",
        }
    }
}

/// Options shaping a crawl's fan-out.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CrawlerOptions {
    /// Hard cap on URLs registered for the crawl (0 = unlimited).
    #[serde(default)]
    pub limit: usize,
    /// Follow links that leave the origin host.
    #[serde(default)]
    pub allow_external_links: bool,
    /// Only follow links whose path contains one of these fragments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_paths: Vec<String>,
    /// Skip links whose path contains one of these fragments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_paths: Vec<String>,
}

/// A crawl as held in the state store. Counters are mutated only inside
/// store transactions so `completed_urls + failed_urls <= total_urls`
/// holds under any interleaving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crawl {
    pub id: String,
    pub origin_url: String,
    pub crawler_options: CrawlerOptions,
    pub page_options: PageOptions,
    pub team_id: String,
    pub plan: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robots: Option<String>,
    pub cancelled: bool,
    pub status: CrawlStatus,
    pub total_urls: u64,
    pub completed_urls: u64,
    pub failed_urls: u64,
    /// Member job ids in registration order.
    pub urls: Vec<String>,
    /// Job ids recorded done, in the order the store serialized them.
    pub completed_jobs: Vec<String>,
    pub failed_jobs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Crawl {
    pub fn new(
        id: impl Into<String>,
        origin_url: impl Into<String>,
        crawler_options: CrawlerOptions,
        page_options: PageOptions,
        team_id: impl Into<String>,
        plan: impl Into<String>,
        robots: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            origin_url: origin_url.into(),
            crawler_options,
            page_options,
            team_id: team_id.into(),
            plan: plan.into(),
            robots,
            cancelled: false,
            status: CrawlStatus::Created,
            total_urls: 0,
            completed_urls: 0,
            failed_urls: 0,
            urls: Vec::new(),
            completed_jobs: Vec::new(),
            failed_jobs: Vec::new(),
            start_time: Some(now),
            end_time: None,
            created_at: now,
            expires_at: now + Duration::hours(CRAWL_TTL_HOURS),
        }
    }

    /// A crawl is finished once every registered job reached a terminal
    /// state. Empty crawls are never finished.
    pub fn is_finished(&self) -> bool {
        self.total_urls > 0 && self.completed_urls + self.failed_urls >= self.total_urls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crawl() -> Crawl {
        Crawl::new(
            "c1",
            "https://a.example/",
            CrawlerOptions::default(),
            PageOptions::default(),
            "t1",
            "standard",
            None,
        )
    }

    #[test]
    fn empty_crawl_is_not_finished() {
        assert!(!crawl().is_finished());
    }

    #[test]
    fn finished_when_counters_meet_total() {
        let mut c = crawl();
        c.total_urls = 3;
        c.completed_urls = 2;
        assert!(!c.is_finished());
        c.failed_urls = 1;
        assert!(c.is_finished());
    }

    #[test]
    fn expiry_is_24h_from_creation() {
        let c = crawl();
        assert_eq!(c.expires_at - c.created_at, Duration::hours(24));
    }
}
