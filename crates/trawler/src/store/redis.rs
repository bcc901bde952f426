//! Redis-backed state store for distributed deployments.
//!
//! Documents are JSON strings under prefixed keys; result payloads live in
//! a sibling key so the transition scripts never re-encode them. Multi-key
//! invariants (crawl counters + status flip) run inside Lua scripts, which
//! is what makes them transactional against concurrent workers.
//!
//! Key layout:
//! - `trawler:job:<id>` / `trawler:job:<id>:result`
//! - `trawler:crawl:<id>` (hash) + `:jobs` / `:done` / `:failed` / `:done_set`
//! - `trawler:crawl_job:<jobId>` - (crawl, job) edge record
//! - `trawler:url_lock:<digest>`
//! - `trawler:team:<teamId>:jobs` (zset scored by record expiry)
//! - `trawler:jobs:terminal` (zset scored by completion time, for the sweep)

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Script;

use super::{bounded_result, url_lock_digest, StateStore, StoreError, StoreResult};
use crate::config::Settings;
use crate::models::{
    Crawl, Job, JobOptions, JobPayload, JobProgress, JobState, JobStatus, ScrapeOutcome,
    SYSTEM_TEAM_ID,
};

const KEY_PREFIX: &str = "trawler:";

/// Transient-error retry budget for every store call.
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_MS: u64 = 100;

pub struct RedisStateStore {
    conn: ConnectionManager,
    max_result_bytes: usize,
    team_job_ttl_ms: i64,
    url_lock_ttl_secs: i64,
    crawl_ttl_secs: i64,
}

impl RedisStateStore {
    pub async fn connect(settings: &Settings) -> StoreResult<Self> {
        let client = redis::Client::open(settings.redis_url.as_str())
            .map_err(|e| StoreError::Unavailable(format!("redis client: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(format!("redis connection: {e}")))?;
        Ok(Self {
            conn,
            max_result_bytes: settings.max_result_bytes,
            team_job_ttl_ms: settings.team_job_ttl.as_millis() as i64,
            url_lock_ttl_secs: settings.crawl_ttl.as_secs() as i64,
            crawl_ttl_secs: settings.crawl_ttl.as_secs() as i64,
        })
    }

    fn job_key(&self, job_id: &str) -> String {
        format!("{KEY_PREFIX}job:{job_id}")
    }

    fn result_key(&self, job_id: &str) -> String {
        format!("{KEY_PREFIX}job:{job_id}:result")
    }

    fn crawl_key(&self, crawl_id: &str) -> String {
        format!("{KEY_PREFIX}crawl:{crawl_id}")
    }

    fn crawl_list_key(&self, crawl_id: &str, suffix: &str) -> String {
        format!("{KEY_PREFIX}crawl:{crawl_id}:{suffix}")
    }

    fn edge_key(&self, job_id: &str) -> String {
        format!("{KEY_PREFIX}crawl_job:{job_id}")
    }

    fn lock_key(&self, url: &str) -> String {
        format!("{KEY_PREFIX}{}", url_lock_digest(url))
    }

    fn team_key(&self, team_id: &str) -> String {
        format!("{KEY_PREFIX}team:{team_id}:jobs")
    }

    fn terminal_index_key(&self) -> String {
        format!("{KEY_PREFIX}jobs:terminal")
    }

    fn placeholder_json(job_id: &str) -> String {
        let payload = JobPayload {
            team_id: Some(SYSTEM_TEAM_ID.to_string()),
            ..Default::default()
        };
        let job = Job::new(job_id, "recovered", payload, JobOptions::new(job_id));
        serde_json::to_string(&job).unwrap_or_else(|_| "{}".to_string())
    }

    /// Run one terminal transition script, reporting whether it actually
    /// transitioned and the crawl the job belongs to.
    async fn run_terminal_script(
        &self,
        op: &'static str,
        script_src: &'static str,
        job_id: &str,
        payload_arg: String,
    ) -> StoreResult<(bool, Option<String>)> {
        let job_key = self.job_key(job_id);
        let result_key = self.result_key(job_id);
        let index_key = self.terminal_index_key();
        let placeholder = Self::placeholder_json(job_id);
        let base = self.conn.clone();

        let (flag, crawl_id): (i64, String) = retrying(op, || {
            let mut conn = base.clone();
            let job_key = job_key.clone();
            let result_key = result_key.clone();
            let index_key = index_key.clone();
            let payload_arg = payload_arg.clone();
            let placeholder = placeholder.clone();
            async move {
                Script::new(script_src)
                    .key(&job_key)
                    .key(&result_key)
                    .key(&index_key)
                    .arg(&payload_arg)
                    .arg(Utc::now().to_rfc3339())
                    .arg(Utc::now().timestamp_millis())
                    .arg(&placeholder)
                    .invoke_async(&mut conn)
                    .await
            }
        })
        .await?;

        let crawl_id = (!crawl_id.is_empty()).then_some(crawl_id);
        Ok((flag == 1, crawl_id))
    }
}

/// Retry transient backend errors with exponential backoff before giving
/// up with `Unavailable`.
async fn retrying<T, F, Fut>(op: &'static str, mut call: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, redis::RedisError>>,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= MAX_ATTEMPTS {
                    return Err(StoreError::Unavailable(format!("{op}: {e}")));
                }
                tracing::warn!(op, attempt, error = %e, "store call failed, retrying");
                tokio::time::sleep(Duration::from_millis(
                    RETRY_BASE_MS * 2u64.pow(attempt - 1),
                ))
                .await;
            }
        }
    }
}

// Transition scripts decode the job document with cjson; result payloads
// stay in their own key so arrays in them are never re-encoded by Lua.

const START_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 'missing' end
local job = cjson.decode(raw)
if job.status == 'completed' or job.status == 'failed' then
  return 'terminal:' .. job.status
end
if job.status == 'active' then return 'ok' end
job.status = 'active'
job.updated_at = ARGV[1]
redis.call('SET', KEYS[1], cjson.encode(job))
return 'ok'
"#;

const COMPLETE_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
local job
if raw then job = cjson.decode(raw) else job = cjson.decode(ARGV[4]) end
if job.status == 'completed' or job.status == 'failed' then return {0, ''} end
job.status = 'completed'
job.progress = 100
job.error = nil
job.updated_at = ARGV[2]
redis.call('SET', KEYS[1], cjson.encode(job))
if ARGV[1] ~= '' then redis.call('SET', KEYS[2], ARGV[1]) end
redis.call('ZADD', KEYS[3], ARGV[3], job.id)
local crawl = ''
if job.data and job.data.crawl_id then crawl = job.data.crawl_id end
return {1, crawl}
"#;

const FAIL_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
local job
if raw then job = cjson.decode(raw) else job = cjson.decode(ARGV[4]) end
if job.status == 'completed' or job.status == 'failed' then return {0, ''} end
job.status = 'failed'
job.error = ARGV[1]
job.updated_at = ARGV[2]
redis.call('SET', KEYS[1], cjson.encode(job))
redis.call('ZADD', KEYS[3], ARGV[3], job.id)
local crawl = ''
if job.data and job.data.crawl_id then crawl = job.data.crawl_id end
return {1, crawl}
"#;

const PROGRESS_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local job = cjson.decode(raw)
if job.status == 'completed' or job.status == 'failed' then return 0 end
job.progress = cjson.decode(ARGV[1])
job.updated_at = ARGV[2]
redis.call('SET', KEYS[1], cjson.encode(job))
return 1
"#;

const DISPATCH_ID_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local job = cjson.decode(raw)
job.data.cloud_tasks_id = ARGV[1]
job.updated_at = ARGV[2]
redis.call('SET', KEYS[1], cjson.encode(job))
return 1
"#;

const DONE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
if redis.call('SADD', KEYS[2], ARGV[1]) == 0 then return 0 end
if ARGV[2] == '1' then
  redis.call('RPUSH', KEYS[3], ARGV[1])
  redis.call('HINCRBY', KEYS[1], 'completed_urls', 1)
else
  redis.call('RPUSH', KEYS[4], ARGV[1])
  redis.call('HINCRBY', KEYS[1], 'failed_urls', 1)
end
local total = tonumber(redis.call('HGET', KEYS[1], 'total_urls')) or 0
local completed = tonumber(redis.call('HGET', KEYS[1], 'completed_urls')) or 0
local failed = tonumber(redis.call('HGET', KEYS[1], 'failed_urls')) or 0
if total > 0 and completed + failed >= total
   and redis.call('HGET', KEYS[1], 'status') ~= 'completed' then
  redis.call('HSET', KEYS[1], 'status', 'completed', 'end_time', ARGV[3])
end
return 1
"#;

const FINISH_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
local total = tonumber(redis.call('HGET', KEYS[1], 'total_urls')) or 0
local completed = tonumber(redis.call('HGET', KEYS[1], 'completed_urls')) or 0
local failed = tonumber(redis.call('HGET', KEYS[1], 'failed_urls')) or 0
if total > 0 and completed + failed >= total
   and redis.call('HGET', KEYS[1], 'status') ~= 'completed' then
  redis.call('HSET', KEYS[1], 'status', 'completed', 'end_time', ARGV[1])
end
return 1
"#;

const SCRAPING_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if status == 'created' or status == 'pending' then
  redis.call('HSET', KEYS[1], 'status', 'scraping')
end
return 1
"#;

const CANCEL_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
redis.call('HSET', KEYS[1], 'cancelled', '1')
local status = redis.call('HGET', KEYS[1], 'status')
if status ~= 'completed' and status ~= 'failed' then
  redis.call('HSET', KEYS[1], 'status', 'cancelled')
end
return 1
"#;

#[async_trait]
impl StateStore for RedisStateStore {
    async fn create_job(&self, job: &Job) -> StoreResult<()> {
        let mut job = job.clone();
        if job.data.team_id.is_none() {
            job.data.team_id = Some(SYSTEM_TEAM_ID.to_string());
        }
        job.status = JobStatus::Waiting;
        job.progress = JobProgress::Percent(0);
        job.result = None;
        let json = serde_json::to_string(&job)?;
        let key = self.job_key(&job.id);
        let base = self.conn.clone();

        let created: Option<String> = retrying("create_job", || {
            let mut conn = base.clone();
            let key = key.clone();
            let json = json.clone();
            async move {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(&json)
                    .arg("NX")
                    .query_async(&mut conn)
                    .await
            }
        })
        .await?;

        match created {
            Some(_) => Ok(()),
            None => Err(StoreError::Conflict(format!("job {}", job.id))),
        }
    }

    async fn mark_job_started(&self, job_id: &str) -> StoreResult<()> {
        let key = self.job_key(job_id);
        let base = self.conn.clone();
        let reply: String = retrying("mark_job_started", || {
            let mut conn = base.clone();
            let key = key.clone();
            async move {
                Script::new(START_SCRIPT)
                    .key(&key)
                    .arg(Utc::now().to_rfc3339())
                    .invoke_async(&mut conn)
                    .await
            }
        })
        .await?;

        match reply.as_str() {
            "ok" => Ok(()),
            "missing" => Err(StoreError::NotFound(format!("job {job_id}"))),
            "terminal:failed" => Err(StoreError::IllegalTransition {
                job_id: job_id.to_string(),
                status: JobStatus::Failed,
            }),
            _ => Err(StoreError::IllegalTransition {
                job_id: job_id.to_string(),
                status: JobStatus::Completed,
            }),
        }
    }

    async fn mark_job_completed(&self, job_id: &str, outcome: &ScrapeOutcome) -> StoreResult<()> {
        let result = bounded_result(outcome, self.max_result_bytes);
        let result_json = serde_json::to_string(&result)?;

        // The transition must never be lost: a full write, then a minimal
        // result, then status-only.
        let attempt = self
            .run_terminal_script("mark_job_completed", COMPLETE_SCRIPT, job_id, result_json)
            .await;
        let (transitioned, crawl_id) = match attempt {
            Ok(done) => done,
            Err(StoreError::Unavailable(_)) => {
                let minimal = serde_json::json!({
                    "success": outcome.success,
                    "message": "result omitted after store failure",
                    "truncated": true,
                    "docs": [],
                })
                .to_string();
                match self
                    .run_terminal_script("mark_job_completed_minimal", COMPLETE_SCRIPT, job_id, minimal)
                    .await
                {
                    Ok(done) => done,
                    Err(StoreError::Unavailable(_)) => {
                        self.run_terminal_script(
                            "mark_job_completed_status_only",
                            COMPLETE_SCRIPT,
                            job_id,
                            String::new(),
                        )
                        .await?
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        if transitioned {
            if let Some(crawl_id) = crawl_id {
                self.add_crawl_job_done(&crawl_id, job_id, true).await?;
            }
        }
        Ok(())
    }

    async fn mark_job_failed(&self, job_id: &str, error: &str) -> StoreResult<()> {
        let (transitioned, crawl_id) = self
            .run_terminal_script("mark_job_failed", FAIL_SCRIPT, job_id, error.to_string())
            .await?;
        if transitioned {
            if let Some(crawl_id) = crawl_id {
                self.add_crawl_job_done(&crawl_id, job_id, false).await?;
            }
        }
        Ok(())
    }

    async fn update_job_progress(&self, job_id: &str, progress: &JobProgress) -> StoreResult<()> {
        let progress_json = serde_json::to_string(progress)?;
        let key = self.job_key(job_id);
        let base = self.conn.clone();
        let _: i64 = retrying("update_job_progress", || {
            let mut conn = base.clone();
            let key = key.clone();
            let progress_json = progress_json.clone();
            async move {
                Script::new(PROGRESS_SCRIPT)
                    .key(&key)
                    .arg(&progress_json)
                    .arg(Utc::now().to_rfc3339())
                    .invoke_async(&mut conn)
                    .await
            }
        })
        .await?;
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> StoreResult<Option<Job>> {
        let job_key = self.job_key(job_id);
        let result_key = self.result_key(job_id);
        let base = self.conn.clone();
        let (raw, result): (Option<String>, Option<String>) = retrying("get_job", || {
            let mut conn = base.clone();
            let job_key = job_key.clone();
            let result_key = result_key.clone();
            async move {
                redis::cmd("MGET")
                    .arg(&job_key)
                    .arg(&result_key)
                    .query_async(&mut conn)
                    .await
            }
        })
        .await?;

        let Some(raw) = raw else { return Ok(None) };
        let mut job: Job = serde_json::from_str(&raw)?;
        if let Some(result) = result {
            job.result = Some(serde_json::from_str(&result)?);
        }
        Ok(Some(job))
    }

    async fn get_job_state(&self, job_id: &str) -> StoreResult<JobState> {
        Ok(self
            .get_job(job_id)
            .await?
            .map(|j| JobState::Known(j.status))
            .unwrap_or(JobState::Unknown))
    }

    async fn get_job_result(&self, job_id: &str) -> StoreResult<Option<serde_json::Value>> {
        let key = self.result_key(job_id);
        let base = self.conn.clone();
        let raw: Option<String> = retrying("get_job_result", || {
            let mut conn = base.clone();
            let key = key.clone();
            async move { redis::cmd("GET").arg(&key).query_async(&mut conn).await }
        })
        .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn get_job_error(&self, job_id: &str) -> StoreResult<Option<String>> {
        Ok(self.get_job(job_id).await?.and_then(|j| j.error))
    }

    async fn get_job_data(&self, job_id: &str) -> StoreResult<Option<JobPayload>> {
        Ok(self.get_job(job_id).await?.map(|j| j.data))
    }

    async fn remove_job(&self, job_id: &str) -> StoreResult<()> {
        let keys = vec![
            self.job_key(job_id),
            self.result_key(job_id),
            self.edge_key(job_id),
        ];
        let index_key = self.terminal_index_key();
        let job_id = job_id.to_string();
        let base = self.conn.clone();
        retrying("remove_job", || {
            let mut conn = base.clone();
            let keys = keys.clone();
            let index_key = index_key.clone();
            let job_id = job_id.clone();
            async move {
                redis::pipe()
                    .del(&keys)
                    .zrem(&index_key, &job_id)
                    .query_async::<()>(&mut conn)
                    .await
            }
        })
        .await
    }

    async fn set_job_dispatch_id(&self, job_id: &str, task_id: &str) -> StoreResult<()> {
        let key = self.job_key(job_id);
        let task_id = task_id.to_string();
        let base = self.conn.clone();
        let _: i64 = retrying("set_job_dispatch_id", || {
            let mut conn = base.clone();
            let key = key.clone();
            let task_id = task_id.clone();
            async move {
                Script::new(DISPATCH_ID_SCRIPT)
                    .key(&key)
                    .arg(&task_id)
                    .arg(Utc::now().to_rfc3339())
                    .invoke_async(&mut conn)
                    .await
            }
        })
        .await?;
        Ok(())
    }

    async fn clean_terminal_jobs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let index_key = self.terminal_index_key();
        let cutoff_ms = cutoff.timestamp_millis();
        let base = self.conn.clone();

        let stale: Vec<String> = retrying("clean_terminal_jobs", || {
            let mut conn = base.clone();
            let index_key = index_key.clone();
            async move {
                redis::cmd("ZRANGEBYSCORE")
                    .arg(&index_key)
                    .arg("-inf")
                    .arg(cutoff_ms)
                    .query_async(&mut conn)
                    .await
            }
        })
        .await?;

        for chunk in stale.chunks(100) {
            let mut pipe = redis::pipe();
            for job_id in chunk {
                pipe.del(vec![
                    self.job_key(job_id),
                    self.result_key(job_id),
                    self.edge_key(job_id),
                ]);
                pipe.zrem(&index_key, job_id);
            }
            let base = self.conn.clone();
            retrying("clean_terminal_jobs_chunk", || {
                let mut conn = base.clone();
                let pipe = pipe.clone();
                async move { pipe.query_async::<()>(&mut conn).await }
            })
            .await?;
        }
        Ok(stale.len() as u64)
    }

    async fn save_crawl(&self, crawl: &Crawl) -> StoreResult<()> {
        let doc = serde_json::to_string(crawl)?;
        let crawl_key = self.crawl_key(&crawl.id);
        let list_keys = vec![
            self.crawl_list_key(&crawl.id, "jobs"),
            self.crawl_list_key(&crawl.id, "done"),
            self.crawl_list_key(&crawl.id, "failed"),
            self.crawl_list_key(&crawl.id, "done_set"),
        ];
        let status = crawl.status.as_str().to_string();
        let ttl = self.crawl_ttl_secs;
        let base = self.conn.clone();

        retrying("save_crawl", || {
            let mut conn = base.clone();
            let crawl_key = crawl_key.clone();
            let doc = doc.clone();
            let status = status.clone();
            let list_keys = list_keys.clone();
            async move {
                redis::pipe()
                    .atomic()
                    .hset(&crawl_key, "doc", &doc)
                    .hset(&crawl_key, "status", &status)
                    .hset(&crawl_key, "cancelled", "0")
                    .hset(&crawl_key, "total_urls", 0)
                    .hset(&crawl_key, "completed_urls", 0)
                    .hset(&crawl_key, "failed_urls", 0)
                    .expire(&crawl_key, ttl)
                    .del(&list_keys)
                    .query_async::<()>(&mut conn)
                    .await
            }
        })
        .await
    }

    async fn get_crawl(&self, crawl_id: &str) -> StoreResult<Option<Crawl>> {
        use std::collections::HashMap;

        let crawl_key = self.crawl_key(crawl_id);
        let jobs_key = self.crawl_list_key(crawl_id, "jobs");
        let done_key = self.crawl_list_key(crawl_id, "done");
        let failed_key = self.crawl_list_key(crawl_id, "failed");
        let base = self.conn.clone();

        let (fields, urls, completed_jobs, failed_jobs): (
            HashMap<String, String>,
            Vec<String>,
            Vec<String>,
            Vec<String>,
        ) = retrying("get_crawl", || {
            let mut conn = base.clone();
            let crawl_key = crawl_key.clone();
            let jobs_key = jobs_key.clone();
            let done_key = done_key.clone();
            let failed_key = failed_key.clone();
            async move {
                redis::pipe()
                    .hgetall(&crawl_key)
                    .lrange(&jobs_key, 0, -1)
                    .lrange(&done_key, 0, -1)
                    .lrange(&failed_key, 0, -1)
                    .query_async(&mut conn)
                    .await
            }
        })
        .await?;

        let Some(doc) = fields.get("doc") else {
            return Ok(None);
        };
        let mut crawl: Crawl = serde_json::from_str(doc)?;
        crawl.status = match fields.get("status").map(String::as_str) {
            Some("pending") => crate::models::CrawlStatus::Pending,
            Some("scraping") => crate::models::CrawlStatus::Scraping,
            Some("completed") => crate::models::CrawlStatus::Completed,
            Some("failed") => crate::models::CrawlStatus::Failed,
            Some("cancelled") => crate::models::CrawlStatus::Cancelled,
            _ => crate::models::CrawlStatus::Created,
        };
        crawl.cancelled = fields.get("cancelled").map(|v| v == "1").unwrap_or(false);
        crawl.total_urls = parse_count(&fields, "total_urls");
        crawl.completed_urls = parse_count(&fields, "completed_urls");
        crawl.failed_urls = parse_count(&fields, "failed_urls");
        crawl.end_time = fields
            .get("end_time")
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc));
        crawl.urls = urls;
        crawl.completed_jobs = completed_jobs;
        crawl.failed_jobs = failed_jobs;
        Ok(Some(crawl))
    }

    async fn get_crawl_expiry(&self, crawl_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.get_crawl(crawl_id).await?.map(|c| c.expires_at))
    }

    async fn mark_crawl_scraping(&self, crawl_id: &str) -> StoreResult<()> {
        let key = self.crawl_key(crawl_id);
        let base = self.conn.clone();
        let _: i64 = retrying("mark_crawl_scraping", || {
            let mut conn = base.clone();
            let key = key.clone();
            async move {
                Script::new(SCRAPING_SCRIPT)
                    .key(&key)
                    .invoke_async(&mut conn)
                    .await
            }
        })
        .await?;
        Ok(())
    }

    async fn cancel_crawl(&self, crawl_id: &str) -> StoreResult<()> {
        let key = self.crawl_key(crawl_id);
        let base = self.conn.clone();
        let flag: i64 = retrying("cancel_crawl", || {
            let mut conn = base.clone();
            let key = key.clone();
            async move {
                Script::new(CANCEL_SCRIPT)
                    .key(&key)
                    .invoke_async(&mut conn)
                    .await
            }
        })
        .await?;
        if flag == -1 {
            return Err(StoreError::NotFound(format!("crawl {crawl_id}")));
        }
        Ok(())
    }

    async fn add_crawl_job(&self, crawl_id: &str, job_id: &str) -> StoreResult<()> {
        self.add_crawl_jobs(crawl_id, std::slice::from_ref(&job_id.to_string()))
            .await
    }

    async fn add_crawl_jobs(&self, crawl_id: &str, job_ids: &[String]) -> StoreResult<()> {
        if job_ids.is_empty() {
            return Ok(());
        }
        let crawl_key = self.crawl_key(crawl_id);
        let jobs_key = self.crawl_list_key(crawl_id, "jobs");
        let ttl = self.crawl_ttl_secs;
        let crawl_id = crawl_id.to_string();
        let job_ids = job_ids.to_vec();
        let edge_keys: Vec<String> = job_ids.iter().map(|id| self.edge_key(id)).collect();
        let base = self.conn.clone();

        retrying("add_crawl_jobs", || {
            let mut conn = base.clone();
            let crawl_key = crawl_key.clone();
            let jobs_key = jobs_key.clone();
            let crawl_id = crawl_id.clone();
            let job_ids = job_ids.clone();
            let edge_keys = edge_keys.clone();
            async move {
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .rpush(&jobs_key, &job_ids)
                    .hincr(&crawl_key, "total_urls", job_ids.len() as i64)
                    .expire(&jobs_key, ttl);
                for edge_key in &edge_keys {
                    pipe.set_ex(edge_key, &crawl_id, ttl as u64);
                }
                pipe.query_async::<()>(&mut conn).await
            }
        })
        .await
    }

    async fn add_crawl_job_done(
        &self,
        crawl_id: &str,
        job_id: &str,
        success: bool,
    ) -> StoreResult<()> {
        let crawl_key = self.crawl_key(crawl_id);
        let done_set_key = self.crawl_list_key(crawl_id, "done_set");
        let done_key = self.crawl_list_key(crawl_id, "done");
        let failed_key = self.crawl_list_key(crawl_id, "failed");
        let job_id_owned = job_id.to_string();
        let base = self.conn.clone();

        let flag: i64 = retrying("add_crawl_job_done", || {
            let mut conn = base.clone();
            let crawl_key = crawl_key.clone();
            let done_set_key = done_set_key.clone();
            let done_key = done_key.clone();
            let failed_key = failed_key.clone();
            let job_id = job_id_owned.clone();
            async move {
                Script::new(DONE_SCRIPT)
                    .key(&crawl_key)
                    .key(&done_set_key)
                    .key(&done_key)
                    .key(&failed_key)
                    .arg(&job_id)
                    .arg(if success { "1" } else { "0" })
                    .arg(Utc::now().to_rfc3339())
                    .invoke_async(&mut conn)
                    .await
            }
        })
        .await?;

        if flag == -1 {
            return Err(StoreError::NotFound(format!("crawl {crawl_id}")));
        }
        Ok(())
    }

    async fn done_jobs_len(&self, crawl_id: &str) -> StoreResult<u64> {
        let key = self.crawl_list_key(crawl_id, "done");
        let base = self.conn.clone();
        retrying("done_jobs_len", || {
            let mut conn = base.clone();
            let key = key.clone();
            async move { redis::cmd("LLEN").arg(&key).query_async(&mut conn).await }
        })
        .await
    }

    async fn done_jobs_ordered(
        &self,
        crawl_id: &str,
        start: i64,
        end: i64,
    ) -> StoreResult<Vec<String>> {
        let key = self.crawl_list_key(crawl_id, "done");
        let base = self.conn.clone();
        retrying("done_jobs_ordered", || {
            let mut conn = base.clone();
            let key = key.clone();
            async move {
                redis::cmd("LRANGE")
                    .arg(&key)
                    .arg(start)
                    .arg(end)
                    .query_async(&mut conn)
                    .await
            }
        })
        .await
    }

    async fn is_crawl_finished(&self, crawl_id: &str) -> StoreResult<bool> {
        let key = self.crawl_key(crawl_id);
        let base = self.conn.clone();
        let (total, completed, failed): (Option<u64>, Option<u64>, Option<u64>) =
            retrying("is_crawl_finished", || {
                let mut conn = base.clone();
                let key = key.clone();
                async move {
                    redis::cmd("HMGET")
                        .arg(&key)
                        .arg("total_urls")
                        .arg("completed_urls")
                        .arg("failed_urls")
                        .query_async(&mut conn)
                        .await
                }
            })
            .await?;
        let total = total.unwrap_or(0);
        Ok(total > 0 && completed.unwrap_or(0) + failed.unwrap_or(0) >= total)
    }

    async fn finish_crawl(&self, crawl_id: &str) -> StoreResult<()> {
        let key = self.crawl_key(crawl_id);
        let base = self.conn.clone();
        let flag: i64 = retrying("finish_crawl", || {
            let mut conn = base.clone();
            let key = key.clone();
            async move {
                Script::new(FINISH_SCRIPT)
                    .key(&key)
                    .arg(Utc::now().to_rfc3339())
                    .invoke_async(&mut conn)
                    .await
            }
        })
        .await?;
        if flag == -1 {
            return Err(StoreError::NotFound(format!("crawl {crawl_id}")));
        }
        Ok(())
    }

    async fn lock_url(&self, crawl_id: &str, url: &str) -> StoreResult<bool> {
        let key = self.lock_key(url);
        let ttl = self.url_lock_ttl_secs;
        let crawl_id = crawl_id.to_string();
        let base = self.conn.clone();
        let created: Option<String> = retrying("lock_url", || {
            let mut conn = base.clone();
            let key = key.clone();
            let crawl_id = crawl_id.clone();
            async move {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(&crawl_id)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl)
                    .query_async(&mut conn)
                    .await
            }
        })
        .await?;
        Ok(created.is_some())
    }

    async fn lock_urls(&self, crawl_id: &str, urls: &[String]) -> StoreResult<bool> {
        if urls.is_empty() {
            return Ok(true);
        }
        let keys: Vec<String> = urls.iter().map(|u| self.lock_key(u)).collect();
        let ttl = self.url_lock_ttl_secs;
        let crawl_id = crawl_id.to_string();
        let base = self.conn.clone();

        let acquired: i64 = retrying("lock_urls", || {
            let mut conn = base.clone();
            let keys = keys.clone();
            let crawl_id = crawl_id.clone();
            async move {
                let mut cmd = redis::cmd("MSETNX");
                for key in &keys {
                    cmd.arg(key).arg(&crawl_id);
                }
                cmd.query_async(&mut conn).await
            }
        })
        .await?;

        if acquired == 1 {
            let base = self.conn.clone();
            let keys = keys.clone();
            retrying("lock_urls_expire", || {
                let mut conn = base.clone();
                let keys = keys.clone();
                async move {
                    let mut pipe = redis::pipe();
                    for key in &keys {
                        pipe.expire(key, ttl);
                    }
                    pipe.query_async::<()>(&mut conn).await
                }
            })
            .await?;
        }
        Ok(acquired == 1)
    }

    async fn add_team_job(&self, team_id: &str, job_id: &str) -> StoreResult<()> {
        let key = self.team_key(team_id);
        let expires_ms = Utc::now().timestamp_millis() + self.team_job_ttl_ms;
        let retain_ms = self.team_job_ttl_ms * 2;
        let job_id = job_id.to_string();
        let base = self.conn.clone();
        retrying("add_team_job", || {
            let mut conn = base.clone();
            let key = key.clone();
            let job_id = job_id.clone();
            async move {
                redis::pipe()
                    .zadd(&key, &job_id, expires_ms)
                    .pexpire(&key, retain_ms)
                    .query_async::<()>(&mut conn)
                    .await
            }
        })
        .await
    }

    async fn remove_team_job(&self, team_id: &str, job_id: &str) -> StoreResult<()> {
        let key = self.team_key(team_id);
        let job_id = job_id.to_string();
        let base = self.conn.clone();
        retrying("remove_team_job", || {
            let mut conn = base.clone();
            let key = key.clone();
            let job_id = job_id.clone();
            async move {
                redis::cmd("ZREM")
                    .arg(&key)
                    .arg(&job_id)
                    .query_async::<()>(&mut conn)
                    .await
            }
        })
        .await
    }

    async fn team_job_count(&self, team_id: &str) -> StoreResult<u64> {
        let key = self.team_key(team_id);
        let now_ms = Utc::now().timestamp_millis();
        let base = self.conn.clone();
        retrying("team_job_count", || {
            let mut conn = base.clone();
            let key = key.clone();
            async move {
                redis::cmd("ZCOUNT")
                    .arg(&key)
                    .arg(format!("({now_ms}"))
                    .arg("+inf")
                    .query_async(&mut conn)
                    .await
            }
        })
        .await
    }
}

fn parse_count(fields: &std::collections::HashMap<String, String>, name: &str) -> u64 {
    fields
        .get(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}
