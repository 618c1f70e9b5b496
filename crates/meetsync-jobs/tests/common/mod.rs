//! Common test infrastructure for job runtime integration tests.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use meetsync_jobs::{
    Clock, JobData, JobResult, JobsConfig, MockClock, ProcessorRegistry, QueueRuntime, RedisConfig,
    Worker,
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::redis::Redis;

/// In-memory runtime on a mock clock.
pub struct TestRuntime {
    pub runtime: QueueRuntime,
    pub clock: MockClock,
}

impl TestRuntime {
    pub fn new() -> Self {
        Self::with_config(JobsConfig::default())
    }

    pub fn with_config(config: JobsConfig) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let clock = MockClock::new();
        let runtime = QueueRuntime::in_memory_with_clock(config, Arc::new(clock.clone()));
        Self { runtime, clock }
    }

    /// Worker for `queue`, driven manually with `process_next`.
    pub fn worker(&self, queue: &str, registry: ProcessorRegistry) -> Worker {
        self.runtime
            .worker(queue, registry)
            .expect("Failed to build worker")
    }

    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Process jobs until the queue has nothing eligible.
pub async fn drain(worker: &Worker) -> Vec<JobResult> {
    let mut results = Vec::new();
    while let Some(result) = worker.process_next().await.expect("Failed to lease job") {
        results.push(result);
    }
    results
}

pub fn data(key: &str) -> JobData {
    JobData::new(key, json!({})).expect("Failed to build job data")
}

/// Counts processor invocations.
#[derive(Clone, Default)]
pub struct CallCounter(Arc<AtomicU32>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hit(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Redis testcontainer wrapper.
///
/// Manages a Redis container lifecycle and provides a matching config.
pub struct TestRedis {
    _container: ContainerAsync<Redis>,
    pub config: JobsConfig,
}

impl TestRedis {
    /// Starts a fresh Redis container.
    pub async fn new() -> Self {
        let container = Redis::default()
            .start()
            .await
            .expect("Failed to start Redis container");

        let port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let config = JobsConfig {
            redis: RedisConfig {
                url: format!("redis://127.0.0.1:{}", port),
                key_prefix: "meetsync-test".to_string(),
                ..RedisConfig::default()
            },
            ..JobsConfig::default()
        };

        Self {
            _container: container,
            config,
        }
    }
}
