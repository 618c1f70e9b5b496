//! Job data, options, results and the backend's view of a job.

use crate::error::{QueueError, QueueResult};
use crate::retry::Backoff;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Durable job identifier. Defaults to the job's idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Creates a job ID from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Business priority levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work.
    Low,
    /// Default.
    Normal,
    /// User-facing, time-sensitive work.
    High,
}

impl Priority {
    /// Numeric value handed to the backend. Higher is leased first.
    pub const fn value(self) -> i32 {
        match self {
            Priority::High => 10,
            Priority::Normal => 5,
            Priority::Low => 1,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl From<Priority> for i32 {
    fn from(priority: Priority) -> Self {
        priority.value()
    }
}

/// Job payload envelope shared by every job type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobData {
    /// Caller-chosen key, unique within a queue; doubles as the job id.
    pub idempotency_key: String,

    /// Correlation ID for tracing.
    pub correlation_id: String,

    /// User on whose behalf the job runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,

    /// When the job was created by the producer.
    pub created_at: DateTime<Utc>,

    /// Type-specific payload.
    #[serde(default)]
    pub payload: Value,
}

impl JobData {
    /// Creates job data with a fresh correlation id.
    pub fn new(idempotency_key: impl Into<String>, payload: impl Serialize) -> QueueResult<Self> {
        Ok(Self {
            idempotency_key: idempotency_key.into(),
            correlation_id: Uuid::new_v4().to_string(),
            user_id: None,
            metadata: HashMap::new(),
            created_at: Utc::now(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Sets the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    /// Sets the user ID.
    pub fn with_user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Overrides the creation timestamp.
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Deserialize the payload.
    pub fn payload_as<T: DeserializeOwned>(&self) -> QueueResult<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| QueueError::Validation(format!("Malformed payload: {}", e)))
    }

    /// Parse and validate raw job data as stored by the backend.
    pub fn from_value(value: &Value) -> QueueResult<Self> {
        let data: JobData = serde_json::from_value(value.clone())
            .map_err(|e| QueueError::Validation(format!("Malformed job data: {}", e)))?;
        data.validate()?;
        Ok(data)
    }

    /// Check the fields every job must carry.
    pub fn validate(&self) -> QueueResult<()> {
        if self.idempotency_key.trim().is_empty() {
            return Err(QueueError::Validation("Missing idempotencyKey".to_string()));
        }
        Ok(())
    }

    /// Age of the job relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }

    /// Serialize to a JSON value.
    pub fn to_value(&self) -> QueueResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Recurrence for repeatable jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatOptions {
    /// Cron pattern (5 fields, or 6/7 with seconds).
    pub pattern: String,

    /// IANA timezone name; UTC when absent.
    #[serde(default, rename = "tz", skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl RepeatOptions {
    /// Creates repeat options in UTC.
    pub fn cron(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            timezone: None,
        }
    }

    /// Sets the timezone.
    pub fn in_timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = Some(tz.into());
        self
    }
}

/// Options controlling scheduling and retries of a job.
///
/// Every field is optional so that call-supplied options can be layered
/// over per-queue defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Priority; higher is leased first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    /// Delay before the job becomes eligible, in milliseconds.
    #[serde(default, rename = "delay", skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,

    /// Total attempt budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    /// Backoff between retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,

    /// Recurrence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatOptions>,

    /// Explicit job id; defaults to the idempotency key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl JobOptions {
    /// Creates empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a business priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority.value());
        self
    }

    /// Set a raw numeric priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set a delay before execution.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay_ms = Some(delay.as_millis() as u64);
        self
    }

    /// Set the attempt budget.
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Set the backoff.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Make the job recurring.
    pub fn repeat(mut self, repeat: RepeatOptions) -> Self {
        self.repeat = Some(repeat);
        self
    }

    /// Override the job id.
    pub fn job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    /// Layer these options over `defaults`.
    ///
    /// Fields set here win. Nested values (`backoff`, `repeat`) are replaced
    /// as a whole, never merged field by field.
    pub fn merged_over(&self, defaults: &JobOptions) -> JobOptions {
        JobOptions {
            priority: self.priority.or(defaults.priority),
            delay_ms: self.delay_ms.or(defaults.delay_ms),
            attempts: self.attempts.or(defaults.attempts),
            backoff: self.backoff.or(defaults.backoff),
            repeat: self.repeat.clone().or_else(|| defaults.repeat.clone()),
            job_id: self.job_id.clone().or_else(|| defaults.job_id.clone()),
        }
    }

    /// Attempt budget, at least one.
    pub fn max_attempts(&self) -> u32 {
        self.attempts.unwrap_or(1).max(1)
    }

    /// Priority, zero when unset.
    pub fn priority_value(&self) -> i32 {
        self.priority.unwrap_or(0)
    }

    /// Delay as a duration.
    pub fn delay_duration(&self) -> Duration {
        Duration::from_millis(self.delay_ms.unwrap_or(0))
    }
}

/// Outcome of a job execution, recorded in the idempotency store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// Whether the processor succeeded.
    pub success: bool,

    /// Success payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// When the result was produced.
    pub timestamp: DateTime<Utc>,

    /// Execution duration in milliseconds.
    #[serde(rename = "duration")]
    pub duration_ms: u64,
}

impl JobResult {
    /// Successful result.
    pub fn success(data: Value, duration: Duration) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Failed result.
    pub fn failure(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Scheduled for later (delay, retry backoff or repeat).
    Delayed,
    /// Eligible for leasing.
    Waiting,
    /// Waiting in a paused queue.
    Paused,
    /// Leased by a worker.
    Active,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully; no further attempts.
    Failed,
}

impl JobState {
    /// All states, in reporting order.
    pub const ALL: [JobState; 6] = [
        JobState::Waiting,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
        JobState::Delayed,
        JobState::Paused,
    ];

    /// Returns the state name.
    pub const fn as_str(self) -> &'static str {
        match self {
            JobState::Delayed => "delayed",
            JobState::Waiting => "waiting",
            JobState::Paused => "paused",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    /// Parses a state name.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == s)
    }

    /// Returns true for states with no further automatic transitions.
    pub const fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job as submitted to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    /// Durable id.
    pub id: JobId,

    /// Job type.
    pub name: String,

    /// Raw job data.
    pub data: Value,

    /// Resolved options.
    pub opts: JobOptions,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    /// Earliest execution time.
    pub scheduled_at: DateTime<Utc>,

    /// Repeat key of the recurrence that produced this job.
    pub repeat_key: Option<String>,
}

impl NewJob {
    /// Builds a job from typed data and resolved options.
    pub fn new(name: impl Into<String>, data: &JobData, opts: JobOptions) -> QueueResult<Self> {
        let id = JobId::from_string(
            opts.job_id
                .clone()
                .unwrap_or_else(|| data.idempotency_key.clone()),
        );
        let now = Utc::now();
        let scheduled_at = now
            + chrono::Duration::from_std(opts.delay_duration()).unwrap_or_else(|_| chrono::Duration::zero());

        Ok(Self {
            id,
            name: name.into(),
            data: data.to_value()?,
            opts,
            created_at: now,
            scheduled_at,
            repeat_key: None,
        })
    }

    /// Returns true if the job is not yet eligible at `now`.
    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at > now
    }
}

/// Result of submitting a job to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new job was stored in the given state.
    Created(JobState),
    /// A job with the same id already exists.
    Duplicate,
}

/// Handle returned to producers for an accepted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    /// Job id.
    pub id: JobId,

    /// Queue name.
    pub queue: String,

    /// Job type.
    pub name: String,

    /// Initial state (waiting or delayed).
    pub state: JobState,
}

/// The backend's record of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job id.
    pub id: JobId,

    /// Job type.
    pub name: String,

    /// Queue name.
    pub queue: String,

    /// Raw job data.
    pub data: Value,

    /// Resolved options.
    pub opts: JobOptions,

    /// Current state.
    pub state: JobState,

    /// Attempts that ran to a result (success or failure).
    pub attempts_made: u32,

    /// Attempts that were leased, including ones that stalled.
    pub attempts_started: u32,

    /// Times the job's lease expired while active.
    pub stalled_count: u32,

    /// Progress reported by the processor (0-100).
    pub progress: u8,

    /// Reason of the last failure.
    pub failed_reason: Option<String>,

    /// Processor output on success.
    pub return_value: Option<Value>,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    /// Earliest execution time.
    pub scheduled_at: DateTime<Utc>,

    /// When the current or last attempt started.
    pub processed_on: Option<DateTime<Utc>>,

    /// When the job reached a terminal state.
    pub finished_on: Option<DateTime<Utc>>,

    /// Repeat key of the recurrence that produced this job.
    pub repeat_key: Option<String>,

    /// Lease token of the worker holding the job.
    #[serde(skip)]
    pub lease_token: Option<String>,
}

impl JobRecord {
    /// Builds the initial record for a submitted job.
    pub fn from_new(queue: &str, job: NewJob, state: JobState) -> Self {
        Self {
            id: job.id,
            name: job.name,
            queue: queue.to_string(),
            data: job.data,
            opts: job.opts,
            state,
            attempts_made: 0,
            attempts_started: 0,
            stalled_count: 0,
            progress: 0,
            failed_reason: None,
            return_value: None,
            created_at: job.created_at,
            scheduled_at: job.scheduled_at,
            processed_on: None,
            finished_on: None,
            repeat_key: job.repeat_key,
            lease_token: None,
        }
    }

    /// Attempt budget.
    pub fn max_attempts(&self) -> u32 {
        self.opts.max_attempts()
    }

    /// When the job first became eligible to run: creation plus the
    /// requested delay. Retry backoff does not move it.
    pub fn eligible_at(&self) -> DateTime<Utc> {
        self.created_at
            + chrono::Duration::from_std(self.opts.delay_duration())
                .unwrap_or_else(|_| chrono::Duration::zero())
    }
}

/// Introspection view of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetails {
    pub id: JobId,
    pub name: String,
    pub queue: String,
    pub state: JobState,
    pub progress: u8,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub stalled_count: u32,
    pub priority: i32,
    pub failed_reason: Option<String>,
    pub data: Value,
    pub return_value: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub processed_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
    pub repeat_key: Option<String>,
}

impl From<JobRecord> for JobDetails {
    fn from(record: JobRecord) -> Self {
        Self {
            max_attempts: record.max_attempts(),
            priority: record.opts.priority_value(),
            id: record.id,
            name: record.name,
            queue: record.queue,
            state: record.state,
            progress: record.progress,
            attempts_made: record.attempts_made,
            stalled_count: record.stalled_count,
            failed_reason: record.failed_reason,
            data: record.data,
            return_value: record.return_value,
            created_at: record.created_at,
            scheduled_at: record.scheduled_at,
            processed_on: record.processed_on,
            finished_on: record.finished_on,
            repeat_key: record.repeat_key,
        }
    }
}

/// Point-in-time job counts of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: u64,
}

impl QueueMetrics {
    /// Total number of jobs tracked by the queue.
    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.completed + self.failed + self.delayed + self.paused
    }

    /// Count for one state.
    pub fn count(&self, state: JobState) -> u64 {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Active => self.active,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Delayed => self.delayed,
            JobState::Paused => self.paused,
        }
    }

    /// Adds another queue's counts.
    pub fn accumulate(&mut self, other: &QueueMetrics) {
        self.waiting += other.waiting;
        self.active += other.active;
        self.completed += other.completed;
        self.failed += other.failed;
        self.delayed += other.delayed;
        self.paused += other.paused;
    }
}
