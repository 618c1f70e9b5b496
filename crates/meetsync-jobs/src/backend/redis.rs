//! Redis queue backend.
//!
//! Layout per queue (`{prefix}:{queue}:...`):
//!
//! - `job:{id}`: hash with the job record
//! - `wait`: sorted set scored by priority, then eligibility time
//! - `delayed`: sorted set scored by scheduled time
//! - `active`: sorted set scored by lease deadline
//! - `completed`, `failed`: sorted sets scored by finish time
//! - `paused`: flag
//! - `repeat`: hash of repeat key to recurrence
//!
//! Every state transition runs as a single Lua script.

use super::{priority_score, QueueBackend, StalledJob, STALLED_LIMIT_REASON};
use crate::config::RedisConfig;
use crate::error::{QueueError, QueueResult};
use crate::job::{EnqueueOutcome, JobId, JobRecord, JobState, NewJob, QueueMetrics};
use crate::repeat::RepeatableJob;
use crate::retry::RetryDecision;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::{AsyncCommands, Script};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Create a Redis connection pool.
pub async fn create_pool(config: &RedisConfig) -> QueueResult<Pool> {
    info!("Creating Redis connection pool for job queue...");

    let cfg = Config::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| QueueError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| QueueError::Configuration(format!("Failed to create pool: {}", e)))?;

    // Test connection
    let mut conn = tokio::time::timeout(config.connect_timeout(), pool.get())
        .await
        .map_err(|_| {
            QueueError::BackendUnavailable(format!(
                "Timed out connecting to Redis after {}s",
                config.connect_timeout_secs
            ))
        })??;
    redis::cmd("PING")
        .query_async::<String>(&mut *conn)
        .await?;

    info!("Redis connection pool created successfully");

    Ok(pool)
}

/// Redis key builder for job queues.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Prefix of every job hash in the queue.
    pub fn job_prefix(&self, queue: &str) -> String {
        format!("{}:{}:job:", self.prefix, queue)
    }

    /// Job record hash.
    pub fn job(&self, queue: &str, id: &str) -> String {
        format!("{}{}", self.job_prefix(queue), id)
    }

    /// Waiting jobs (sorted set by priority score).
    pub fn wait(&self, queue: &str) -> String {
        format!("{}:{}:wait", self.prefix, queue)
    }

    /// Delayed jobs (sorted set by scheduled time).
    pub fn delayed(&self, queue: &str) -> String {
        format!("{}:{}:delayed", self.prefix, queue)
    }

    /// Active jobs (sorted set by lease deadline).
    pub fn active(&self, queue: &str) -> String {
        format!("{}:{}:active", self.prefix, queue)
    }

    /// Completed jobs (sorted set by finish time).
    pub fn completed(&self, queue: &str) -> String {
        format!("{}:{}:completed", self.prefix, queue)
    }

    /// Failed jobs (sorted set by finish time).
    pub fn failed(&self, queue: &str) -> String {
        format!("{}:{}:failed", self.prefix, queue)
    }

    /// Paused flag.
    pub fn paused(&self, queue: &str) -> String {
        format!("{}:{}:paused", self.prefix, queue)
    }

    /// Recurrences (hash: repeat key -> recurrence).
    pub fn repeat(&self, queue: &str) -> String {
        format!("{}:{}:repeat", self.prefix, queue)
    }

    fn finished(&self, queue: &str, state: JobState) -> QueueResult<String> {
        match state {
            JobState::Completed => Ok(self.completed(queue)),
            JobState::Failed => Ok(self.failed(queue)),
            other => Err(QueueError::Validation(format!(
                "Only completed or failed jobs can be cleaned, got {}",
                other
            ))),
        }
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("meetsync")
    }
}

const ENQUEUE_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
    return 0
end
local state = "waiting"
if tonumber(ARGV[6]) > tonumber(ARGV[9]) then
    state = "delayed"
    redis.call("ZADD", KEYS[3], ARGV[6], ARGV[1])
else
    redis.call("ZADD", KEYS[2], ARGV[10], ARGV[1])
end
redis.call("HSET", KEYS[1],
    "name", ARGV[2], "data", ARGV[3], "opts", ARGV[4], "state", state,
    "attempts_made", 0, "attempts_started", 0, "stalled_count", 0, "progress", 0,
    "created_at", ARGV[5], "scheduled_at", ARGV[6], "repeat_key", ARGV[7],
    "priority", ARGV[8])
if state == "delayed" then
    return 2
end
return 1
"#;

const LEASE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local due = redis.call("ZRANGEBYSCORE", KEYS[2], "-inf", now, "WITHSCORES", "LIMIT", 0, 1000)
for i = 1, #due, 2 do
    local id = due[i]
    local jobKey = ARGV[5] .. id
    redis.call("ZREM", KEYS[2], id)
    if redis.call("EXISTS", jobKey) == 1 then
        local priority = tonumber(redis.call("HGET", jobKey, "priority") or "0") or 0
        redis.call("ZADD", KEYS[1], -(priority * 1000000000000) + tonumber(due[i + 1]), id)
        redis.call("HSET", jobKey, "state", "waiting")
    end
end
if redis.call("EXISTS", KEYS[4]) == 1 then
    return false
end
while true do
    local popped = redis.call("ZPOPMIN", KEYS[1])
    if #popped == 0 then
        return false
    end
    local id = popped[1]
    local jobKey = ARGV[5] .. id
    if redis.call("EXISTS", jobKey) == 1 then
        redis.call("ZADD", KEYS[3], now + tonumber(ARGV[2]), id)
        redis.call("HSET", jobKey, "state", "active", "lease_token", ARGV[3],
            "worker_id", ARGV[4], "processed_on", ARGV[1])
        redis.call("HINCRBY", jobKey, "attempts_started", 1)
        return id
    end
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("HGET", KEYS[1], "lease_token") ~= ARGV[2] then
    return 0
end
redis.call("ZADD", KEYS[2], ARGV[3], ARGV[1])
return 1
"#;

const COMPLETE_SCRIPT: &str = r#"
if redis.call("HGET", KEYS[1], "lease_token") ~= ARGV[2] then
    return 0
end
redis.call("ZREM", KEYS[2], ARGV[1])
redis.call("ZADD", KEYS[3], ARGV[3], ARGV[1])
redis.call("HDEL", KEYS[1], "lease_token", "worker_id")
redis.call("HINCRBY", KEYS[1], "attempts_made", 1)
redis.call("HSET", KEYS[1], "state", "completed", "return_value", ARGV[4], "finished_on", ARGV[3])
return 1
"#;

const FAIL_SCRIPT: &str = r#"
if redis.call("HGET", KEYS[1], "lease_token") ~= ARGV[2] then
    return ""
end
local now = tonumber(ARGV[3])
redis.call("ZREM", KEYS[2], ARGV[1])
redis.call("HDEL", KEYS[1], "lease_token", "worker_id")
redis.call("HINCRBY", KEYS[1], "attempts_made", 1)
redis.call("HSET", KEYS[1], "failed_reason", ARGV[4])
if ARGV[5] == "retry" then
    local delay = tonumber(ARGV[6])
    if delay > 0 then
        redis.call("ZADD", KEYS[4], now + delay, ARGV[1])
        redis.call("HSET", KEYS[1], "state", "delayed", "scheduled_at", now + delay)
        return "delayed"
    end
    local priority = tonumber(redis.call("HGET", KEYS[1], "priority") or "0") or 0
    redis.call("ZADD", KEYS[3], -(priority * 1000000000000) + now, ARGV[1])
    redis.call("HSET", KEYS[1], "state", "waiting")
    return "waiting"
end
redis.call("ZADD", KEYS[5], now, ARGV[1])
redis.call("HSET", KEYS[1], "state", "failed", "finished_on", ARGV[3])
return "failed"
"#;

const RECOVER_STALLED_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local expired = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", now, "LIMIT", 0, 1000)
local out = {}
for _, id in ipairs(expired) do
    redis.call("ZREM", KEYS[1], id)
    local jobKey = ARGV[3] .. id
    if redis.call("EXISTS", jobKey) == 1 then
        local stalled = redis.call("HINCRBY", jobKey, "stalled_count", 1)
        local name = redis.call("HGET", jobKey, "name") or ""
        redis.call("HDEL", jobKey, "lease_token", "worker_id")
        if stalled > tonumber(ARGV[2]) then
            redis.call("ZADD", KEYS[3], now, id)
            redis.call("HSET", jobKey, "state", "failed", "failed_reason", ARGV[4], "finished_on", ARGV[1])
            table.insert(out, id)
            table.insert(out, "failed")
        else
            local priority = tonumber(redis.call("HGET", jobKey, "priority") or "0") or 0
            redis.call("ZADD", KEYS[2], -(priority * 1000000000000) + now, id)
            redis.call("HSET", jobKey, "state", "waiting")
            table.insert(out, id)
            table.insert(out, "waiting")
        end
        table.insert(out, name)
    end
end
return out
"#;

const REMOVE_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 0 then
    return 0
end
if redis.call("HGET", KEYS[1], "state") == "active" then
    return -1
end
for i = 2, #KEYS do
    redis.call("ZREM", KEYS[i], ARGV[1])
end
redis.call("DEL", KEYS[1])
return 1
"#;

const PROGRESS_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 0 then
    return 0
end
redis.call("HSET", KEYS[1], "progress", ARGV[1])
return 1
"#;

const ADVANCE_REPEAT_SCRIPT: &str = r#"
if redis.call("HEXISTS", KEYS[1], ARGV[1]) == 0 then
    return 0
end
if ARGV[2] == "" then
    redis.call("HDEL", KEYS[1], ARGV[1])
else
    redis.call("HSET", KEYS[1], ARGV[1], ARGV[2])
end
return 1
"#;

struct Scripts {
    enqueue: Script,
    lease: Script,
    extend: Script,
    complete: Script,
    fail: Script,
    recover_stalled: Script,
    remove: Script,
    progress: Script,
    advance_repeat: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE_SCRIPT),
            lease: Script::new(LEASE_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
            complete: Script::new(COMPLETE_SCRIPT),
            fail: Script::new(FAIL_SCRIPT),
            recover_stalled: Script::new(RECOVER_STALLED_SCRIPT),
            remove: Script::new(REMOVE_SCRIPT),
            progress: Script::new(PROGRESS_SCRIPT),
            advance_repeat: Script::new(ADVANCE_REPEAT_SCRIPT),
        }
    }
}

/// Redis-backed [`QueueBackend`].
pub struct RedisBackend {
    pool: Pool,
    keys: RedisKeys,
    scripts: Scripts,
}

impl RedisBackend {
    /// Create a backend over an existing pool.
    pub fn new(pool: Pool, key_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(key_prefix),
            scripts: Scripts::load(),
        }
    }

    /// Get a connection from the pool.
    async fn conn(&self) -> QueueResult<Connection> {
        Ok(self.pool.get().await?)
    }

    async fn enqueue_one(
        &self,
        conn: &mut Connection,
        queue: &str,
        job: &NewJob,
    ) -> QueueResult<EnqueueOutcome> {
        let now = Utc::now().timestamp_millis();
        let priority = job.opts.priority_value();

        let code: i64 = self
            .scripts
            .enqueue
            .key(self.keys.job(queue, job.id.as_str()))
            .key(self.keys.wait(queue))
            .key(self.keys.delayed(queue))
            .arg(job.id.as_str())
            .arg(&job.name)
            .arg(serde_json::to_string(&job.data)?)
            .arg(serde_json::to_string(&job.opts)?)
            .arg(job.created_at.timestamp_millis())
            .arg(job.scheduled_at.timestamp_millis())
            .arg(job.repeat_key.as_deref().unwrap_or(""))
            .arg(priority)
            .arg(now)
            .arg(priority_score(priority, now))
            .invoke_async(conn)
            .await?;

        let outcome = match code {
            0 => EnqueueOutcome::Duplicate,
            2 => EnqueueOutcome::Created(JobState::Delayed),
            _ => EnqueueOutcome::Created(JobState::Waiting),
        };

        debug!(job_id = %job.id, queue = %queue, priority, ?outcome, "Enqueue");
        Ok(outcome)
    }

    async fn materialize_repeatables(
        &self,
        conn: &mut Connection,
        queue: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        let entries: Vec<String> = conn.hvals(self.keys.repeat(queue)).await?;

        for entry in entries {
            let mut repeatable: RepeatableJob = match serde_json::from_str(&entry) {
                Ok(repeatable) => repeatable,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Skipping malformed repeatable job");
                    continue;
                }
            };
            if repeatable.next > now {
                continue;
            }

            let instance = repeatable.instance(now);
            self.enqueue_one(conn, queue, &instance).await?;

            let next = if repeatable.advance(now) {
                serde_json::to_string(&repeatable)?
            } else {
                String::new()
            };
            let _: i64 = self
                .scripts
                .advance_repeat
                .key(self.keys.repeat(queue))
                .arg(&repeatable.key)
                .arg(next)
                .invoke_async(conn)
                .await?;
        }

        Ok(())
    }

    async fn load_record(
        &self,
        conn: &mut Connection,
        queue: &str,
        id: &str,
    ) -> QueueResult<Option<JobRecord>> {
        let (hash, paused): (HashMap<String, String>, bool) = redis::pipe()
            .hgetall(self.keys.job(queue, id))
            .exists(self.keys.paused(queue))
            .query_async(conn)
            .await?;

        if hash.is_empty() {
            return Ok(None);
        }

        let mut record = parse_record(queue, id, &hash)?;
        if paused && record.state == JobState::Waiting {
            record.state = JobState::Paused;
        }
        Ok(Some(record))
    }
}

fn field<'a>(hash: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    hash.get(name).map(String::as_str).filter(|v| !v.is_empty())
}

fn number<T: std::str::FromStr + Default>(hash: &HashMap<String, String>, name: &str) -> T {
    field(hash, name)
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}

fn timestamp(hash: &HashMap<String, String>, name: &str) -> Option<DateTime<Utc>> {
    field(hash, name)
        .and_then(|v| v.parse::<f64>().ok())
        .and_then(|ms| DateTime::from_timestamp_millis(ms as i64))
}

fn parse_record(queue: &str, id: &str, hash: &HashMap<String, String>) -> QueueResult<JobRecord> {
    let state_name = field(hash, "state").unwrap_or("waiting");
    let state = JobState::parse(state_name)
        .ok_or_else(|| QueueError::Internal(format!("Unknown job state '{}' for {}", state_name, id)))?;
    let created_at = timestamp(hash, "created_at").unwrap_or_else(Utc::now);

    Ok(JobRecord {
        id: JobId::from(id),
        name: field(hash, "name").unwrap_or_default().to_string(),
        queue: queue.to_string(),
        data: serde_json::from_str(field(hash, "data").unwrap_or("null"))?,
        opts: serde_json::from_str(field(hash, "opts").unwrap_or("{}"))?,
        state,
        attempts_made: number(hash, "attempts_made"),
        attempts_started: number(hash, "attempts_started"),
        stalled_count: number(hash, "stalled_count"),
        progress: number(hash, "progress"),
        failed_reason: field(hash, "failed_reason").map(str::to_string),
        return_value: field(hash, "return_value")
            .map(serde_json::from_str::<Value>)
            .transpose()?,
        created_at,
        scheduled_at: timestamp(hash, "scheduled_at").unwrap_or(created_at),
        processed_on: timestamp(hash, "processed_on"),
        finished_on: timestamp(hash, "finished_on"),
        repeat_key: field(hash, "repeat_key").map(str::to_string),
        lease_token: field(hash, "lease_token").map(str::to_string),
    })
}

fn lease_lost(id: &JobId) -> QueueError {
    QueueError::InvalidState {
        expected: "active with lease held".to_string(),
        actual: format!("lease lost for {}", id),
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn enqueue(&self, queue: &str, job: NewJob) -> QueueResult<EnqueueOutcome> {
        let mut conn = self.conn().await?;
        self.enqueue_one(&mut conn, queue, &job).await
    }

    async fn enqueue_bulk(
        &self,
        queue: &str,
        jobs: Vec<NewJob>,
    ) -> QueueResult<Vec<(JobId, EnqueueOutcome)>> {
        let mut conn = self.conn().await?;
        let mut outcomes = Vec::with_capacity(jobs.len());

        for job in jobs {
            let outcome = self.enqueue_one(&mut conn, queue, &job).await?;
            outcomes.push((job.id, outcome));
        }

        Ok(outcomes)
    }

    async fn lease(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
    ) -> QueueResult<Option<JobRecord>> {
        let mut conn = self.conn().await?;
        let now = Utc::now();

        self.materialize_repeatables(&mut conn, queue, now).await?;

        let token = Uuid::new_v4().to_string();
        let id: Option<String> = self
            .scripts
            .lease
            .key(self.keys.wait(queue))
            .key(self.keys.delayed(queue))
            .key(self.keys.active(queue))
            .key(self.keys.paused(queue))
            .arg(now.timestamp_millis())
            .arg(lease.as_millis() as u64)
            .arg(&token)
            .arg(worker_id)
            .arg(self.keys.job_prefix(queue))
            .invoke_async(&mut *conn)
            .await?;

        let Some(id) = id else {
            return Ok(None);
        };

        let record = self.load_record(&mut conn, queue, &id).await?;
        Ok(record.map(|mut record| {
            record.lease_token = Some(token);
            record
        }))
    }

    async fn extend_lease(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        lease: Duration,
    ) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let deadline = Utc::now().timestamp_millis() + lease.as_millis() as i64;

        let extended: i64 = self
            .scripts
            .extend
            .key(self.keys.job(queue, id.as_str()))
            .key(self.keys.active(queue))
            .arg(id.as_str())
            .arg(token)
            .arg(deadline)
            .invoke_async(&mut *conn)
            .await?;

        Ok(extended == 1)
    }

    async fn complete(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        return_value: Value,
    ) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        let done: i64 = self
            .scripts
            .complete
            .key(self.keys.job(queue, id.as_str()))
            .key(self.keys.active(queue))
            .key(self.keys.completed(queue))
            .arg(id.as_str())
            .arg(token)
            .arg(Utc::now().timestamp_millis())
            .arg(serde_json::to_string(&return_value)?)
            .invoke_async(&mut *conn)
            .await?;

        if done == 1 {
            Ok(())
        } else {
            Err(lease_lost(id))
        }
    }

    async fn fail(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        reason: &str,
        decision: RetryDecision,
    ) -> QueueResult<JobState> {
        let mut conn = self.conn().await?;
        let (mode, delay) = match decision {
            RetryDecision::Retry { delay } => ("retry", delay.as_millis() as u64),
            RetryDecision::Fail => ("fail", 0),
        };

        let moved_to: String = self
            .scripts
            .fail
            .key(self.keys.job(queue, id.as_str()))
            .key(self.keys.active(queue))
            .key(self.keys.wait(queue))
            .key(self.keys.delayed(queue))
            .key(self.keys.failed(queue))
            .arg(id.as_str())
            .arg(token)
            .arg(Utc::now().timestamp_millis())
            .arg(reason)
            .arg(mode)
            .arg(delay)
            .invoke_async(&mut *conn)
            .await?;

        JobState::parse(&moved_to).ok_or_else(|| lease_lost(id))
    }

    async fn get_counts(&self, queue: &str) -> QueueResult<QueueMetrics> {
        let mut conn = self.conn().await?;

        let (waiting, active, completed, failed, delayed, paused): (u64, u64, u64, u64, u64, bool) =
            redis::pipe()
                .zcard(self.keys.wait(queue))
                .zcard(self.keys.active(queue))
                .zcard(self.keys.completed(queue))
                .zcard(self.keys.failed(queue))
                .zcard(self.keys.delayed(queue))
                .exists(self.keys.paused(queue))
                .query_async(&mut *conn)
                .await?;

        let (waiting, paused_count) = if paused { (0, waiting) } else { (waiting, 0) };

        Ok(QueueMetrics {
            waiting,
            active,
            completed,
            failed,
            delayed,
            paused: paused_count,
        })
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> QueueResult<Option<JobRecord>> {
        let mut conn = self.conn().await?;
        let record = self.load_record(&mut conn, queue, id.as_str()).await?;
        Ok(record.map(|mut record| {
            record.lease_token = None;
            record
        }))
    }

    async fn remove_job(&self, queue: &str, id: &JobId) -> QueueResult<bool> {
        let mut conn = self.conn().await?;

        let removed: i64 = self
            .scripts
            .remove
            .key(self.keys.job(queue, id.as_str()))
            .key(self.keys.wait(queue))
            .key(self.keys.delayed(queue))
            .key(self.keys.active(queue))
            .key(self.keys.completed(queue))
            .key(self.keys.failed(queue))
            .arg(id.as_str())
            .invoke_async(&mut *conn)
            .await?;

        match removed {
            -1 => Err(QueueError::InvalidState {
                expected: "not active".to_string(),
                actual: JobState::Active.to_string(),
            }),
            0 => Ok(false),
            _ => Ok(true),
        }
    }

    async fn update_progress(&self, queue: &str, id: &JobId, progress: u8) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        let updated: i64 = self
            .scripts
            .progress
            .key(self.keys.job(queue, id.as_str()))
            .arg(u32::from(progress.min(100)))
            .invoke_async(&mut *conn)
            .await?;

        if updated == 1 {
            Ok(())
        } else {
            Err(QueueError::NotFound(format!("Job not found: {}", id)))
        }
    }

    async fn add_repeatable(&self, queue: &str, job: RepeatableJob) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .hset(self.keys.repeat(queue), &job.key, serde_json::to_string(&job)?)
            .await?;
        Ok(())
    }

    async fn remove_repeatable(&self, queue: &str, key: &str) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.hdel(self.keys.repeat(queue), key).await?;
        Ok(removed > 0)
    }

    async fn list_repeatable(&self, queue: &str) -> QueueResult<Vec<RepeatableJob>> {
        let mut conn = self.conn().await?;
        let entries: Vec<String> = conn.hvals(self.keys.repeat(queue)).await?;

        let mut jobs: Vec<RepeatableJob> = entries
            .iter()
            .filter_map(|entry| serde_json::from_str(entry).ok())
            .collect();
        jobs.sort_by(|a, b| a.next.cmp(&b.next).then_with(|| a.key.cmp(&b.key)));
        Ok(jobs)
    }

    async fn pause(&self, queue: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.set(self.keys.paused(queue), 1).await?;
        Ok(())
    }

    async fn resume(&self, queue: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(self.keys.paused(queue)).await?;
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let paused: bool = conn.exists(self.keys.paused(queue)).await?;
        Ok(paused)
    }

    async fn clean(
        &self,
        queue: &str,
        grace: Duration,
        limit: usize,
        state: JobState,
    ) -> QueueResult<Vec<JobId>> {
        let set = self.keys.finished(queue, state)?;
        let cutoff = Utc::now().timestamp_millis() - grace.as_millis() as i64;
        let mut conn = self.conn().await?;

        let ids: Vec<String> = if limit > 0 {
            conn.zrangebyscore_limit(&set, "-inf", cutoff, 0, limit as isize)
                .await?
        } else {
            conn.zrangebyscore(&set, "-inf", cutoff).await?
        };

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.zrem(&set, id).ignore();
            pipe.del(self.keys.job(queue, id)).ignore();
        }
        let _: () = pipe.query_async(&mut *conn).await?;

        Ok(ids.into_iter().map(JobId::from).collect())
    }

    async fn recover_stalled(&self, queue: &str, max_stalled: u32) -> QueueResult<Vec<StalledJob>> {
        let mut conn = self.conn().await?;

        let flat: Vec<String> = self
            .scripts
            .recover_stalled
            .key(self.keys.active(queue))
            .key(self.keys.wait(queue))
            .key(self.keys.failed(queue))
            .arg(Utc::now().timestamp_millis())
            .arg(max_stalled)
            .arg(self.keys.job_prefix(queue))
            .arg(STALLED_LIMIT_REASON)
            .invoke_async(&mut *conn)
            .await?;

        Ok(flat
            .chunks_exact(3)
            .map(|entry| StalledJob {
                id: JobId::from(entry[0].as_str()),
                moved_to: JobState::parse(&entry[1]).unwrap_or(JobState::Waiting),
                name: entry[2].clone(),
            })
            .collect())
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redis_keys() {
        let keys = RedisKeys::new("test");

        assert_eq!(keys.wait("email"), "test:email:wait");
        assert_eq!(keys.job("email", "k1"), "test:email:job:k1");
        assert_eq!(keys.job_prefix("email"), "test:email:job:");
        assert_eq!(keys.repeat("meeting"), "test:meeting:repeat");
        assert!(keys.finished("email", JobState::Active).is_err());
    }

    #[test]
    fn test_parse_record() {
        let hash: HashMap<String, String> = [
            ("name", "send_email"),
            ("data", r#"{"idempotencyKey":"k1"}"#),
            ("opts", r#"{"attempts":3,"priority":10}"#),
            ("state", "failed"),
            ("attempts_made", "3"),
            ("attempts_started", "3"),
            ("stalled_count", "0"),
            ("progress", "40"),
            ("failed_reason", "smtp timeout"),
            ("created_at", "1700000000000"),
            ("scheduled_at", "1700000000000"),
            ("finished_on", "1700000005000"),
            ("repeat_key", ""),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let record = parse_record("email", "k1", &hash).unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.attempts_made, 3);
        assert_eq!(record.max_attempts(), 3);
        assert_eq!(record.opts.priority_value(), 10);
        assert_eq!(record.progress, 40);
        assert_eq!(record.data, json!({"idempotencyKey": "k1"}));
        assert_eq!(record.repeat_key, None);
        assert_eq!(
            record.finished_on.map(|t| t.timestamp_millis()),
            Some(1_700_000_005_000)
        );
    }

    #[test]
    fn test_parse_record_rejects_unknown_state() {
        let hash: HashMap<String, String> =
            [("state".to_string(), "zombie".to_string())].into_iter().collect();
        assert!(matches!(
            parse_record("q", "k", &hash),
            Err(QueueError::Internal(_))
        ));
    }
}
