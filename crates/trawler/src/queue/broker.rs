//! Redis-backed broker queue: ordered priority delivery with leases.
//!
//! Waiting jobs sit in a zset scored `priority * 2^40 + seq`, so lower
//! priority numbers pop first and equal priorities pop FIFO. A delivered
//! job moves to the active set and gets a lease key the worker must keep
//! extending; a lease that lapses is reclaimed by the stalled pass and
//! handed to another worker, up to `max_stalled_count` times.
//!
//! Queue metadata carries a 25h TTL so abandoned entries age out on
//! their own. The queue name is the plain string `scrape` under the
//! `trawler:queue:` prefix (single-logical-node topology; the scripts
//! assume same-node keys).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, warn};

use super::{
    Hooks, JobCompletedHook, JobFailedHook, QueueError, QueueJob, QueueProvider, QueueResult,
};
use crate::config::Settings;
use crate::models::{Job, JobOptions, JobPayload, JobProgress, JobState, ScrapeOutcome};
use crate::store::{StateStore, StoreError};

const QUEUE_NAME: &str = "scrape";
const KEY_PREFIX: &str = "trawler:queue:";

/// priority * PRIORITY_STRIDE + sequence keeps ordering stable for any
/// realistic sequence volume while staying inside f64 precision.
const PRIORITY_STRIDE: f64 = 1_099_511_627_776.0; // 2^40

const ADD_SCRIPT: &str = r#"
local seq = redis.call('INCR', KEYS[1])
local score = tonumber(ARGV[1]) * tonumber(ARGV[4]) + seq
if redis.call('ZADD', KEYS[2], 'NX', score, ARGV[2]) == 1 then
  redis.call('HSET', KEYS[3], 'priority', ARGV[1], 'attempts_made', 0, 'stalled_count', 0)
  redis.call('PEXPIRE', KEYS[3], ARGV[3])
  return 1
end
return 0
"#;

const NEXT_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 16)
for _, id in ipairs(due) do
  local prio = tonumber(redis.call('HGET', ARGV[4] .. id, 'priority')) or 10
  local seq = redis.call('INCR', KEYS[3])
  redis.call('ZADD', KEYS[2], prio * tonumber(ARGV[6]) + seq, id)
  redis.call('ZREM', KEYS[1], id)
end
local popped = redis.call('ZPOPMIN', KEYS[2])
if popped[1] == nil then return '' end
local id = popped[1]
redis.call('SADD', KEYS[4], id)
redis.call('SET', ARGV[5] .. id, ARGV[2], 'PX', ARGV[3])
return id
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return 1
end
return 0
"#;

const STALLED_SCRIPT: &str = r#"
if redis.call('SET', KEYS[4], '1', 'NX', 'PX', ARGV[4]) == false then return 0 end
local reclaimed = 0
local active = redis.call('SMEMBERS', KEYS[1])
for _, id in ipairs(active) do
  if redis.call('EXISTS', ARGV[1] .. id) == 0 then
    redis.call('SREM', KEYS[1], id)
    local stalls = redis.call('HINCRBY', ARGV[2] .. id, 'stalled_count', 1)
    if stalls <= tonumber(ARGV[3]) then
      local prio = tonumber(redis.call('HGET', ARGV[2] .. id, 'priority')) or 10
      local seq = redis.call('INCR', KEYS[2])
      redis.call('ZADD', KEYS[3], prio * tonumber(ARGV[5]) + seq, id)
      reclaimed = reclaimed + 1
    else
      redis.call('RPUSH', KEYS[5], id)
    end
  end
end
return reclaimed
"#;

const RETRY_SCRIPT: &str = r#"
local attempts = redis.call('HINCRBY', KEYS[1], 'attempts_made', 1)
if attempts < tonumber(ARGV[1]) then
  local delay = tonumber(ARGV[2]) * 2 ^ (attempts - 1)
  redis.call('ZADD', KEYS[2], tonumber(ARGV[3]) + delay, ARGV[4])
  redis.call('SREM', KEYS[3], ARGV[4])
  redis.call('DEL', ARGV[5])
  return attempts
end
return -attempts
"#;

pub struct BrokerQueue {
    conn: ConnectionManager,
    store: Arc<dyn StateStore>,
    hooks: Hooks,
    queue_name: String,
    lock_duration: Duration,
    max_stalled_count: u32,
    stalled_check_interval: Duration,
    entry_ttl_ms: i64,
}

impl BrokerQueue {
    pub async fn connect(settings: &Settings, store: Arc<dyn StateStore>) -> QueueResult<Self> {
        Self::connect_named(settings, store, QUEUE_NAME).await
    }

    /// Connect against a non-default queue name (isolated test queues).
    pub async fn connect_named(
        settings: &Settings,
        store: Arc<dyn StateStore>,
        queue_name: &str,
    ) -> QueueResult<Self> {
        let client = redis::Client::open(settings.redis_url.as_str())
            .map_err(|e| QueueError::Unavailable(format!("redis client: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::Unavailable(format!("redis connection: {e}")))?;
        Ok(Self {
            conn,
            store,
            hooks: Hooks::default(),
            queue_name: queue_name.to_string(),
            lock_duration: settings.worker.lock_duration,
            max_stalled_count: settings.worker.max_stalled_count,
            stalled_check_interval: settings.worker.connection_monitor_interval,
            entry_ttl_ms: settings.job_queue_ttl.as_millis() as i64,
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{KEY_PREFIX}{}:{suffix}", self.queue_name)
    }

    fn meta_prefix(&self) -> String {
        self.key("meta:")
    }

    fn lease_prefix(&self) -> String {
        self.key("lease:")
    }

    /// Fail jobs the stalled pass gave up on, then hand back how many
    /// entries were requeued for another worker.
    async fn reclaim_stalled(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let reclaimed: i64 = Script::new(STALLED_SCRIPT)
            .key(self.key("active"))
            .key(self.key("seq"))
            .key(self.key("waiting"))
            .key(self.key("stalled_check"))
            .key(self.key("over_stalled"))
            .arg(self.lease_prefix())
            .arg(self.meta_prefix())
            .arg(self.max_stalled_count)
            .arg(self.stalled_check_interval.as_millis() as i64)
            .arg(PRIORITY_STRIDE)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(format!("stalled reclaim: {e}")))?;
        if reclaimed > 0 {
            debug!(reclaimed, "requeued stalled jobs");
        }

        loop {
            let mut conn = self.conn.clone();
            let over: Option<String> = redis::cmd("LPOP")
                .arg(self.key("over_stalled"))
                .query_async(&mut conn)
                .await
                .map_err(|e| QueueError::Unavailable(format!("over-stalled pop: {e}")))?;
            let Some(job_id) = over else { break };
            warn!(job_id, "job stalled too many times, failing");
            self.store
                .mark_job_failed(&job_id, "job stalled more than allowable limit")
                .await?;
            self.hooks
                .fire_failed(&job_id, "job stalled more than allowable limit");
        }
        Ok(())
    }

    /// Drop every queue-side key for a job. Best-effort.
    async fn cleanup_entry(&self, job_id: &str) {
        let mut conn = self.conn.clone();
        let keys = vec![
            format!("{}{}", self.lease_prefix(), job_id),
            format!("{}{}", self.meta_prefix(), job_id),
        ];
        let outcome: Result<(), redis::RedisError> = redis::pipe()
            .del(&keys)
            .srem(self.key("active"), job_id)
            .zrem(self.key("waiting"), job_id)
            .zrem(self.key("delayed"), job_id)
            .query_async(&mut conn)
            .await;
        if let Err(e) = outcome {
            warn!(job_id, error = %e, "queue cleanup failed");
        }
    }
}

#[async_trait]
impl QueueProvider for BrokerQueue {
    async fn add_job(
        &self,
        name: &str,
        data: JobPayload,
        options: JobOptions,
    ) -> QueueResult<String> {
        let job_id = options.job_id.clone();
        let job = Job::new(&job_id, name, data, options.clone());

        // The store record exists before the queue entry; a duplicate id
        // short-circuits without touching the queue a second time.
        match self.store.create_job(&job).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                debug!(job_id, "job already exists, skipping enqueue");
                return Ok(job_id);
            }
            Err(e) => return Err(e.into()),
        }

        let mut conn = self.conn.clone();
        let _: i64 = Script::new(ADD_SCRIPT)
            .key(self.key("seq"))
            .key(self.key("waiting"))
            .key(format!("{}{}", self.meta_prefix(), job_id))
            .arg(options.priority)
            .arg(&job_id)
            .arg(self.entry_ttl_ms)
            .arg(PRIORITY_STRIDE)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(format!("enqueue: {e}")))?;

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

    async fn next_job(&self, token: &str) -> QueueResult<Option<QueueJob>> {
        if let Err(e) = self.reclaim_stalled().await {
            warn!(error = %e, "stalled reclaim pass failed");
        }

        let mut conn = self.conn.clone();
        let job_id: String = Script::new(NEXT_SCRIPT)
            .key(self.key("delayed"))
            .key(self.key("waiting"))
            .key(self.key("seq"))
            .key(self.key("active"))
            .arg(Utc::now().timestamp_millis())
            .arg(token)
            .arg(self.lock_duration.as_millis() as i64)
            .arg(self.meta_prefix())
            .arg(self.lease_prefix())
            .arg(PRIORITY_STRIDE)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(format!("next job: {e}")))?;

        if job_id.is_empty() {
            return Ok(None);
        }

        match self.store.get_job(&job_id).await? {
            Some(job) => Ok(Some(QueueJob {
                id: job.id,
                name: job.name,
                data: job.data,
                options: job.options,
                lease_token: Some(token.to_string()),
            })),
            None => {
                // Queue entry outlived its record; drop it and move on.
                warn!(job_id, "queue entry without job record, discarding");
                self.cleanup_entry(&job_id).await;
                Ok(None)
            }
        }
    }

    async fn extend_lock(
        &self,
        job_id: &str,
        token: &str,
        extension: Duration,
    ) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let extended: i64 = Script::new(EXTEND_SCRIPT)
            .key(format!("{}{}", self.lease_prefix(), job_id))
            .arg(token)
            .arg(extension.as_millis() as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(format!("extend lock: {e}")))?;
        if extended == 1 {
            Ok(())
        } else {
            Err(QueueError::LeaseLost(job_id.to_string()))
        }
    }

    async fn complete_job(&self, job: &QueueJob, outcome: &ScrapeOutcome) -> QueueResult<()> {
        if self.store.get_job_state(&job.id).await?.is_terminal() {
            debug!(job_id = %job.id, "re-delivered terminal job, dropping");
            self.cleanup_entry(&job.id).await;
            return Ok(());
        }
        self.store.mark_job_completed(&job.id, outcome).await?;
        self.cleanup_entry(&job.id).await;
        self.hooks.fire_completed(&job.id);
        Ok(())
    }

    async fn fail_job(&self, job: &QueueJob, error: &str) -> QueueResult<()> {
        if self.store.get_job_state(&job.id).await?.is_terminal() {
            debug!(job_id = %job.id, "re-delivered terminal job, dropping");
            self.cleanup_entry(&job.id).await;
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let attempts: i64 = Script::new(RETRY_SCRIPT)
            .key(format!("{}{}", self.meta_prefix(), job.id))
            .key(self.key("delayed"))
            .key(self.key("active"))
            .arg(job.options.attempts)
            .arg(job.options.backoff_ms.max(1))
            .arg(Utc::now().timestamp_millis())
            .arg(&job.id)
            .arg(format!("{}{}", self.lease_prefix(), job.id))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(format!("retry: {e}")))?;

        if attempts > 0 {
            debug!(job_id = %job.id, attempts, error, "attempt failed, requeued with backoff");
            return Ok(());
        }

        self.store.mark_job_failed(&job.id, error).await?;
        self.cleanup_entry(&job.id).await;
        self.hooks.fire_failed(&job.id, error);
        Ok(())
    }

    async fn update_progress(&self, job_id: &str, progress: &JobProgress) -> QueueResult<()> {
        Ok(self.store.update_job_progress(job_id, progress).await?)
    }

    async fn remove_job(&self, job_id: &str) -> QueueResult<()> {
        self.cleanup_entry(job_id).await;
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
        let mut conn = self.conn.clone();
        redis::cmd("SCARD")
            .arg(self.key("active"))
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(format!("active count: {e}")))
    }

    async fn waiting_count(&self) -> QueueResult<u64> {
        let mut conn = self.conn.clone();
        let (waiting, delayed): (u64, u64) = redis::pipe()
            .zcard(self.key("waiting"))
            .zcard(self.key("delayed"))
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(format!("waiting count: {e}")))?;
        Ok(waiting + delayed)
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
    use crate::models::new_id;
    use crate::store::MemoryStateStore;

    async fn queue() -> Option<BrokerQueue> {
        let settings = Settings {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            ..Default::default()
        };
        let store = Arc::new(MemoryStateStore::new());
        // Every test gets its own queue keys.
        let name = format!("test-{}", new_id());
        match BrokerQueue::connect_named(&settings, store, &name).await {
            Ok(queue) => Some(queue),
            Err(_) => {
                println!("Redis not available, skipping test");
                None
            }
        }
    }

    fn payload() -> JobPayload {
        JobPayload {
            url: "https://example.com".to_string(),
            team_id: Some("t1".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn delivery_respects_priority_then_fifo() {
        let Some(queue) = queue().await else { return };

        let low = new_id();
        let high = new_id();
        let high2 = new_id();
        queue
            .add_job("scrape", payload(), JobOptions::new(&low).with_priority(10))
            .await
            .unwrap();
        queue
            .add_job("scrape", payload(), JobOptions::new(&high).with_priority(1))
            .await
            .unwrap();
        queue
            .add_job("scrape", payload(), JobOptions::new(&high2).with_priority(1))
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Some(job) = queue.next_job("worker-a").await.unwrap() {
            seen.push(job.id.clone());
            queue.complete_job(&job, &ScrapeOutcome::ok(vec![])).await.unwrap();
            if seen.len() == 3 {
                break;
            }
        }
        assert_eq!(seen, vec![high, high2, low]);
    }

    #[tokio::test]
    async fn duplicate_add_keeps_one_entry() {
        let Some(queue) = queue().await else { return };
        let id = new_id();
        let returned_a = queue
            .add_job("scrape", payload(), JobOptions::new(&id))
            .await
            .unwrap();
        let returned_b = queue
            .add_job("scrape", payload(), JobOptions::new(&id))
            .await
            .unwrap();
        assert_eq!(returned_a, id);
        assert_eq!(returned_b, id);

        let first = queue.next_job("worker-a").await.unwrap().unwrap();
        assert_eq!(first.id, id);
        queue
            .complete_job(&first, &ScrapeOutcome::ok(vec![]))
            .await
            .unwrap();
        // The duplicate enqueue did not leave a second entry behind.
        let second = queue.next_job("worker-a").await.unwrap();
        assert!(second.is_none() || second.unwrap().id != id);
    }

    #[tokio::test]
    async fn lease_extension_requires_ownership() {
        let Some(queue) = queue().await else { return };
        let id = new_id();
        queue
            .add_job("scrape", payload(), JobOptions::new(&id))
            .await
            .unwrap();
        let job = queue.next_job("worker-a").await.unwrap().unwrap();

        queue
            .extend_lock(&job.id, "worker-a", Duration::from_secs(60))
            .await
            .unwrap();
        let stolen = queue
            .extend_lock(&job.id, "worker-b", Duration::from_secs(60))
            .await;
        assert!(matches!(stolen, Err(QueueError::LeaseLost(_))));

        queue.complete_job(&job, &ScrapeOutcome::ok(vec![])).await.unwrap();
    }
}
