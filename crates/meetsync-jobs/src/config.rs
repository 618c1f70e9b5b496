//! Queue runtime configuration.

use crate::job::JobOptions;
use crate::retry::Backoff;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Configuration for the job runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Which durable queue backend to use.
    #[serde(default)]
    pub backend: BackendKind,

    /// Redis connection configuration.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Worker configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Idempotency store configuration.
    #[serde(default)]
    pub idempotency: IdempotencyConfig,

    /// Health thresholds and cleanup defaults.
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    /// Per-queue overrides, keyed by queue name.
    #[serde(default)]
    pub queues: HashMap<String, QueueOverrides>,
}

impl JobsConfig {
    /// Apply the configured overrides for `definition.name`.
    pub fn resolve(&self, definition: QueueDefinition) -> QueueDefinition {
        let mut definition = definition;

        if definition.concurrency == 0 {
            definition.concurrency = self.worker.concurrency;
        }
        if definition.idempotency_ttl.is_zero() {
            definition.idempotency_ttl = self.idempotency.ttl();
        }

        match self.queues.get(&definition.name) {
            Some(overrides) => definition.with_overrides(overrides),
            None => definition,
        }
    }
}

/// Durable queue backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Redis via deadpool-redis.
    #[default]
    Redis,
    /// Process-local in-memory backend (development and tests).
    Memory,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Key prefix for all job-related keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl RedisConfig {
    /// Returns the connect timeout as Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_key_prefix() -> String {
    "meetsync".to_string()
}

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Default number of jobs processed in parallel per queue.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Polling interval when the queue is empty, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Lease (visibility timeout) in milliseconds.
    #[serde(default = "default_lease_duration")]
    pub lease_duration_ms: u64,

    /// Interval of the stalled-job check in milliseconds.
    #[serde(default = "default_stalled_interval")]
    pub stalled_interval_ms: u64,

    /// Stalls tolerated before a job fails terminally.
    #[serde(default = "default_max_stalled_count")]
    pub max_stalled_count: u32,

    /// Jobs older than this are failed without running, in seconds.
    #[serde(default = "default_max_job_age")]
    pub max_job_age_secs: u64,

    /// Shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval(),
            lease_duration_ms: default_lease_duration(),
            stalled_interval_ms: default_stalled_interval(),
            max_stalled_count: default_max_stalled_count(),
            max_job_age_secs: default_max_job_age(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_concurrency() -> usize {
    5
}

fn default_poll_interval() -> u64 {
    200
}

fn default_lease_duration() -> u64 {
    30_000
}

fn default_stalled_interval() -> u64 {
    30_000
}

fn default_max_stalled_count() -> u32 {
    1
}

fn default_max_job_age() -> u64 {
    86400 // 1 day
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl WorkerConfig {
    /// Returns poll interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns lease duration as Duration.
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    /// Returns stalled check interval as Duration.
    pub fn stalled_interval(&self) -> Duration {
        Duration::from_millis(self.stalled_interval_ms)
    }

    /// Returns max job age as Duration.
    pub fn max_job_age(&self) -> Duration {
        Duration::from_secs(self.max_job_age_secs)
    }

    /// Returns shutdown timeout as Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Idempotency store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Enable the idempotency cache.
    #[serde(default = "default_idempotency_enabled")]
    pub enabled: bool,

    /// How long results are kept, in seconds.
    #[serde(default = "default_idempotency_ttl")]
    pub ttl_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            enabled: default_idempotency_enabled(),
            ttl_secs: default_idempotency_ttl(),
        }
    }
}

impl IdempotencyConfig {
    /// Returns the TTL as Duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_idempotency_enabled() -> bool {
    true
}

fn default_idempotency_ttl() -> u64 {
    86400 // 24 hours
}

/// Health thresholds and cleanup defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Waiting jobs above this mark a queue unhealthy.
    #[serde(default = "default_max_waiting")]
    pub max_waiting: u64,

    /// Failed jobs above this mark a queue unhealthy.
    #[serde(default = "default_max_failed")]
    pub max_failed: u64,

    /// Completed jobs older than this are cleaned, in seconds.
    #[serde(default = "default_completed_max_age")]
    pub completed_max_age_secs: u64,

    /// Failed jobs older than this are cleaned, in seconds.
    #[serde(default = "default_failed_max_age")]
    pub failed_max_age_secs: u64,

    /// Maximum jobs removed per state per clean call.
    #[serde(default = "default_clean_limit")]
    pub clean_limit: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            max_waiting: default_max_waiting(),
            max_failed: default_max_failed(),
            completed_max_age_secs: default_completed_max_age(),
            failed_max_age_secs: default_failed_max_age(),
            clean_limit: default_clean_limit(),
        }
    }
}

fn default_max_waiting() -> u64 {
    1000
}

fn default_max_failed() -> u64 {
    100
}

fn default_completed_max_age() -> u64 {
    86400 // 1 day
}

fn default_failed_max_age() -> u64 {
    86400 * 7 // 7 days
}

fn default_clean_limit() -> usize {
    1000
}

/// Per-queue configuration overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueOverrides {
    /// Worker concurrency for this queue.
    #[serde(default)]
    pub concurrency: Option<usize>,

    /// Default attempt budget.
    #[serde(default)]
    pub attempts: Option<u32>,

    /// Default backoff.
    #[serde(default)]
    pub backoff: Option<Backoff>,

    /// Default priority.
    #[serde(default)]
    pub priority: Option<i32>,

    /// Idempotency TTL in seconds.
    #[serde(default)]
    pub idempotency_ttl_secs: Option<u64>,
}

/// A business queue: its name, default job options and worker sizing.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDefinition {
    /// Queue name.
    pub name: String,

    /// Options applied to every job unless the caller overrides them.
    pub default_options: JobOptions,

    /// Worker concurrency; zero means the runtime default.
    pub concurrency: usize,

    /// Idempotency TTL; zero means the runtime default.
    pub idempotency_ttl: Duration,
}

impl QueueDefinition {
    /// Create a definition with empty defaults.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_options: JobOptions::default(),
            concurrency: 0,
            idempotency_ttl: Duration::ZERO,
        }
    }

    /// Set default job options.
    pub fn default_options(mut self, options: JobOptions) -> Self {
        self.default_options = options;
        self
    }

    /// Set worker concurrency.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the idempotency TTL.
    pub fn idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_ttl = ttl;
        self
    }

    /// Apply configuration overrides.
    pub fn with_overrides(mut self, overrides: &QueueOverrides) -> Self {
        if let Some(concurrency) = overrides.concurrency {
            self.concurrency = concurrency;
        }
        if let Some(attempts) = overrides.attempts {
            self.default_options.attempts = Some(attempts);
        }
        if let Some(backoff) = overrides.backoff {
            self.default_options.backoff = Some(backoff);
        }
        if let Some(priority) = overrides.priority {
            self.default_options.priority = Some(priority);
        }
        if let Some(ttl) = overrides.idempotency_ttl_secs {
            self.idempotency_ttl = Duration::from_secs(ttl);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JobsConfig::default();
        assert_eq!(config.backend, BackendKind::Redis);
        assert_eq!(config.redis.key_prefix, "meetsync");
        assert_eq!(config.worker.lease_duration(), Duration::from_secs(30));
        assert_eq!(config.idempotency.ttl(), Duration::from_secs(86400));
        assert_eq!(config.monitoring.max_waiting, 1000);
    }

    #[test]
    fn test_resolve_fills_runtime_defaults() {
        let config = JobsConfig::default();
        let definition = config.resolve(QueueDefinition::new("email"));

        assert_eq!(definition.concurrency, config.worker.concurrency);
        assert_eq!(definition.idempotency_ttl, config.idempotency.ttl());
    }

    #[test]
    fn test_resolve_applies_queue_overrides() {
        let mut config = JobsConfig::default();
        config.queues.insert(
            "meeting".to_string(),
            QueueOverrides {
                concurrency: Some(2),
                attempts: Some(7),
                ..Default::default()
            },
        );

        let definition = config.resolve(
            QueueDefinition::new("meeting").default_options(JobOptions::new().attempts(3)),
        );

        assert_eq!(definition.concurrency, 2);
        assert_eq!(definition.default_options.attempts, Some(7));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: JobsConfig = serde_json::from_str(
            r#"{"backend":"memory","worker":{"concurrency":8},"queues":{"email":{"attempts":2}}}"#,
        )
        .unwrap();

        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.poll_interval_ms, 200);
        assert_eq!(config.queues["email"].attempts, Some(2));
    }
}
