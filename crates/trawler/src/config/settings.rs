//! Settings: environment-driven configuration for workers and providers.

use std::time::Duration;

use super::{env_duration_ms, env_fraction, env_or};

/// Which queue provider backs enqueue/next/complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueProviderKind {
    /// Redis-backed ordered priority queue with worker leases.
    #[default]
    Broker,
    /// Cloud task dispatcher pushing jobs to the worker over HTTP.
    Dispatcher,
}

impl QueueProviderKind {
    /// Parse the `QUEUE_PROVIDER` value. The wire names of the original
    /// deployment (`bull`, `cloud-tasks`) are accepted as aliases.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "broker" | "bull" | "redis" => Some(QueueProviderKind::Broker),
            "dispatcher" | "cloud-tasks" => Some(QueueProviderKind::Dispatcher),
            _ => None,
        }
    }
}

/// Coordinates of the hosted task dispatcher (dispatcher provider only).
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Base URL of the dispatcher REST API.
    pub api_url: String,
    pub project: String,
    pub location: String,
    pub queue: String,
    /// Public URL of this worker; tasks target `{service_url}/tasks/process`.
    pub service_url: String,
    pub service_account: String,
}

/// Worker loop tuning. Field names track the environment variables.
#[derive(Debug, Clone)]
pub struct WorkerTuning {
    /// Cadence of the lease-extension ticker.
    pub job_lock_extend_interval: Duration,
    /// How far each extension pushes the lease out.
    pub job_lock_extension_time: Duration,
    /// Sleep when CPU/RAM pressure blocks admission.
    pub cant_accept_connection_interval: Duration,
    /// Cadence of the stalled-job reclaim pass.
    pub connection_monitor_interval: Duration,
    /// Sleep after a job was admitted, before the next poll.
    pub got_job_interval: Duration,
    /// Base sleep for the empty-poll backoff.
    pub empty_poll_interval: Duration,
    /// Ceiling for the empty-poll backoff.
    pub empty_poll_interval_cap: Duration,
    /// Empty polls per backoff doubling.
    pub max_empty_polls: u32,
    /// CPU fraction above which no new jobs are admitted.
    pub max_cpu: f64,
    /// Memory fraction above which no new jobs are admitted.
    pub max_ram: f64,
    /// Broker lease duration for a freshly delivered job.
    pub lock_duration: Duration,
    /// Re-deliveries of a stalled job before it is failed outright.
    pub max_stalled_count: u32,
    /// Grace period for in-flight jobs during shutdown.
    pub shutdown_grace: Duration,
}

impl Default for WorkerTuning {
    fn default() -> Self {
        Self {
            job_lock_extend_interval: Duration::from_millis(30_000),
            job_lock_extension_time: Duration::from_millis(120_000),
            cant_accept_connection_interval: Duration::from_millis(5_000),
            connection_monitor_interval: Duration::from_millis(1_000),
            got_job_interval: Duration::from_millis(2_000),
            empty_poll_interval: Duration::from_millis(1_000),
            empty_poll_interval_cap: Duration::from_millis(30_000),
            max_empty_polls: 10,
            max_cpu: 0.95,
            max_ram: 0.95,
            lock_duration: Duration::from_millis(120_000),
            max_stalled_count: 2,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl WorkerTuning {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            job_lock_extend_interval: env_duration_ms("JOB_LOCK_EXTEND_INTERVAL", 30_000),
            job_lock_extension_time: env_duration_ms("JOB_LOCK_EXTENSION_TIME", 120_000),
            cant_accept_connection_interval: env_duration_ms(
                "CANT_ACCEPT_CONNECTION_INTERVAL",
                5_000,
            ),
            connection_monitor_interval: env_duration_ms("CONNECTION_MONITOR_INTERVAL", 1_000),
            got_job_interval: env_duration_ms("GOT_JOB_INTERVAL", 2_000),
            empty_poll_interval: env_duration_ms("EMPTY_POLL_INTERVAL", 1_000),
            empty_poll_interval_cap: env_duration_ms("EMPTY_POLL_INTERVAL_CAP", 30_000),
            max_empty_polls: env_or("MAX_EMPTY_POLLS", defaults.max_empty_polls),
            max_cpu: env_fraction("MAX_CPU", defaults.max_cpu),
            max_ram: env_fraction("MAX_RAM", defaults.max_ram),
            lock_duration: env_duration_ms("JOB_LOCK_DURATION", 120_000),
            max_stalled_count: env_or("MAX_STALLED_COUNT", defaults.max_stalled_count),
            shutdown_grace: Duration::from_secs(env_or("SHUTDOWN_GRACE_SECS", 30u64)),
        }
    }
}

/// Process-wide settings. `Default` gives a local single-node setup;
/// `from_env` layers the deployment environment on top.
#[derive(Debug, Clone)]
pub struct Settings {
    pub queue_provider: QueueProviderKind,
    /// Shared broker / document store connection string.
    pub redis_url: String,
    pub dispatcher: Option<DispatcherSettings>,
    /// Headless browser microservice endpoint.
    pub browser_url: String,
    /// Bearer token for the browser service, when one is provisioned.
    pub browser_token: Option<String>,
    pub worker: WorkerTuning,
    /// Hosts for which scrape requests are refused outright.
    pub blocked_url_substrings: Vec<String>,
    /// Tenants granted the manual high-capacity rate bucket.
    pub manual_team_ids: Vec<String>,
    /// The development tenant with its own generous bucket.
    pub dev_team_id: Option<String>,
    /// Token substrings identifying test-suite traffic.
    pub test_suite_token_markers: Vec<String>,
    /// Disable rate limiting entirely. Local testing only.
    pub rate_limit_unlimited: bool,
    /// Per-document budget for stored job results, in bytes.
    pub max_result_bytes: usize,
    /// Team-job records expire after this long.
    pub team_job_ttl: Duration,
    /// Crawls and URL locks expire after this long.
    pub crawl_ttl: Duration,
    /// Broker queue entries are swept after this long.
    pub job_queue_ttl: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            queue_provider: QueueProviderKind::Broker,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            dispatcher: None,
            browser_url: "http://127.0.0.1:3003/scrape".to_string(),
            browser_token: None,
            worker: WorkerTuning::default(),
            blocked_url_substrings: Vec::new(),
            manual_team_ids: Vec::new(),
            dev_team_id: None,
            test_suite_token_markers: vec!["a01ccae".to_string(), "6254cf9".to_string()],
            rate_limit_unlimited: false,
            max_result_bytes: 990_000,
            team_job_ttl: Duration::from_secs(10 * 60),
            crawl_ttl: Duration::from_secs(24 * 60 * 60),
            job_queue_ttl: Duration::from_secs(25 * 60 * 60),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let queue_provider = std::env::var("QUEUE_PROVIDER")
            .ok()
            .and_then(|v| QueueProviderKind::parse(&v))
            .unwrap_or_default();

        let dispatcher = std::env::var("DISPATCHER_PROJECT").ok().map(|project| {
            DispatcherSettings {
                api_url: env_or(
                    "DISPATCHER_API_URL",
                    "https://cloudtasks.googleapis.com".to_string(),
                ),
                project,
                location: env_or("DISPATCHER_LOCATION", "us-central1".to_string()),
                queue: env_or("DISPATCHER_QUEUE", "scrape".to_string()),
                service_url: env_or("DISPATCHER_SERVICE_URL", String::new()),
                service_account: env_or("DISPATCHER_SERVICE_ACCOUNT", String::new()),
            }
        });

        Self {
            queue_provider,
            redis_url: env_or("REDIS_URL", defaults.redis_url.clone()),
            dispatcher,
            browser_url: env_or("BROWSER_URL", defaults.browser_url.clone()),
            browser_token: std::env::var("BROWSER_TOKEN").ok(),
            worker: WorkerTuning::from_env(),
            blocked_url_substrings: env_list("BLOCKED_URL_SUBSTRINGS"),
            manual_team_ids: env_list("MANUAL_TEAM_IDS"),
            dev_team_id: std::env::var("DEV_TEAM_ID").ok(),
            test_suite_token_markers: {
                let markers = env_list("TEST_SUITE_TOKEN_MARKERS");
                if markers.is_empty() {
                    defaults.test_suite_token_markers.clone()
                } else {
                    markers
                }
            },
            rate_limit_unlimited: env_or("RATE_LIMIT_UNLIMITED", false),
            max_result_bytes: env_or("MAX_RESULT_BYTES", defaults.max_result_bytes),
            team_job_ttl: defaults.team_job_ttl,
            crawl_ttl: defaults.crawl_ttl,
            job_queue_ttl: defaults.job_queue_ttl,
        }
    }

    /// True when the given URL matches the configured block list.
    pub fn url_is_blocked(&self, url: &str) -> bool {
        self.blocked_url_substrings
            .iter()
            .any(|fragment| url.contains(fragment))
    }
}

fn env_list(var: &str) -> Vec<String> {
    std::env::var(var)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_aliases() {
        assert_eq!(
            QueueProviderKind::parse("bull"),
            Some(QueueProviderKind::Broker)
        );
        assert_eq!(
            QueueProviderKind::parse("cloud-tasks"),
            Some(QueueProviderKind::Dispatcher)
        );
        assert_eq!(QueueProviderKind::parse("kafka"), None);
    }

    #[test]
    fn blocked_url_matching() {
        let settings = Settings {
            blocked_url_substrings: vec!["blocked.example".to_string()],
            ..Default::default()
        };
        assert!(settings.url_is_blocked("https://blocked.example/page"));
        assert!(!settings.url_is_blocked("https://ok.example/page"));
    }
}
