//! Job record: one unit of scrape work tracked end-to-end.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of scrape a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeMode {
    /// One or more explicit URLs (comma-separated in the payload).
    #[default]
    SingleUrls,
    /// Seed URL of a recursive crawl.
    Crawl,
}

/// Job lifecycle status. Transitions strictly follow
/// waiting -> active -> {completed | failed}; terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Status as observed by readers: a missing job reads as `Unknown`
/// rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Known(JobStatus),
    Unknown,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Known(status) => status.as_str(),
            JobState::Unknown => "unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Known(s) if s.is_terminal())
    }
}

impl From<JobStatus> for JobState {
    fn from(status: JobStatus) -> Self {
        JobState::Known(status)
    }
}

/// Webhook coordinates carried in the payload for the edge tier.
/// Delivery itself is outside the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<serde_json::Value>,
}

/// The payload of a scrape job. Optional fields are elided on the wire;
/// the store never sees explicit nulls for absent values.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobPayload {
    pub url: String,
    pub mode: ScrapeMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default)]
    pub page_options: super::PageOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawler_options: Option<super::CrawlerOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawl_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConfig>,
    /// Set when the URL came from a sitemap scan; such jobs do not fan out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_sitemap: Option<bool>,
    /// Dispatcher-assigned task id (dispatcher provider only). The job id
    /// stays canonical; this is bookkeeping for task deletion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_tasks_id: Option<String>,
}

impl JobPayload {
    /// Tenant for accounting purposes; absent means the system tenant.
    pub fn team_or_system(&self) -> &str {
        self.team_id.as_deref().unwrap_or(super::SYSTEM_TEAM_ID)
    }

    pub fn is_from_sitemap(&self) -> bool {
        self.from_sitemap.unwrap_or(false)
    }
}

/// Enqueue options. `job_id` is the canonical id across queue and store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    pub job_id: String,
    /// Lower = served earlier. See [`crate::priority`].
    pub priority: i32,
    /// Total delivery attempts before the job fails permanently.
    pub attempts: u32,
    /// Base retry delay; doubles per attempt.
    pub backoff_ms: u64,
}

impl JobOptions {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            priority: 10,
            attempts: 3,
            backoff_ms: 1_000,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Job progress: a bare percentage or a structured step descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum JobProgress {
    Percent(u32),
    Step {
        current: u32,
        total: u32,
        step: String,
        #[serde(default)]
        current_url: String,
    },
}

impl Default for JobProgress {
    fn default() -> Self {
        JobProgress::Percent(0)
    }
}

impl JobProgress {
    /// The per-URL scraping step reported while the pipeline runs.
    pub fn scraping() -> Self {
        JobProgress::Step {
            current: 1,
            total: 100,
            step: "SCRAPING".to_string(),
            current_url: String::new(),
        }
    }
}

/// A job as held in the state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub data: JobPayload,
    pub options: JobOptions,
    pub status: JobStatus,
    pub progress: JobProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: impl Into<String>, name: impl Into<String>, data: JobPayload, options: JobOptions) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            data,
            options,
            status: JobStatus::Waiting,
            progress: JobProgress::Percent(0),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Waiting.is_terminal());
        assert!(!JobStatus::Active.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&ScrapeMode::SingleUrls).unwrap(),
            "\"single_urls\""
        );
        assert_eq!(serde_json::to_string(&ScrapeMode::Crawl).unwrap(), "\"crawl\"");
    }

    #[test]
    fn absent_payload_fields_are_elided() {
        let payload = JobPayload {
            url: "https://example.com".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&payload).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("team_id"));
        assert!(!obj.contains_key("crawl_id"));
        assert!(!obj.contains_key("cloud_tasks_id"));
    }

    #[test]
    fn unknown_state_reads_as_string() {
        assert_eq!(JobState::Unknown.as_str(), "unknown");
        assert_eq!(JobState::Known(JobStatus::Active).as_str(), "active");
    }
}
