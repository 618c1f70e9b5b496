//! MeetSync Jobs - Idempotent Background Job Runtime
//!
//! Decouples slow or unreliable external calls (email, Lark, Tencent
//! Meeting, OpenAI) from request handling:
//! - Idempotency-guarded enqueue, with the idempotency key as durable job id
//! - Per-queue workers with bounded concurrency and lease heartbeats
//! - Typed unrecoverable/recoverable failures with fixed or exponential backoff
//! - Delayed, prioritized and cron-recurring jobs
//! - Cross-queue health, pause/resume/clean and job introspection
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                         QueueRuntime                            │
//! ├────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  Producer ──► JobQueue::add_job ──► IdempotencyGuard (exists?)  │
//! │                     │                                           │
//! │                     ▼                                           │
//! │  ┌──────────────────────────────────────────────────────────┐  │
//! │  │            QueueBackend (Redis / in-memory)              │  │
//! │  │   delayed ──► waiting (by priority) ──► active (lease)   │  │
//! │  └──────────────────────────────────────────────────────────┘  │
//! │                     │                                           │
//! │                     ▼                                           │
//! │  Worker: validate ──► Processor ──► classify ──► record ──► ack │
//! │                     │                                           │
//! │                     ▼                                           │
//! │  EventBus ──► LifecycleRecorder / QueueMonitor                  │
//! │                                                                 │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use meetsync_jobs::{JobsConfig, ProcessorRegistry, QueueRuntime};
//! use serde_json::json;
//!
//! let runtime = QueueRuntime::connect(JobsConfig::default()).await;
//!
//! runtime.spawn_worker(
//!     "email",
//!     ProcessorRegistry::new().handle("send_verification_email", |_ctx, data| async move {
//!         // Send the email
//!         Ok(json!({ "messageId": "m-1" }))
//!     }),
//! )?;
//!
//! runtime.email()?.send_verification_email("a@x.com", "123456").await?;
//!
//! runtime.close().await;
//! ```

pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod job;
pub mod metrics;
pub mod monitor;
pub mod processor;
pub mod queue;
pub mod queues;
pub mod repeat;
pub mod retry;
pub mod runtime;
pub mod worker;

pub use backend::{DisabledBackend, InMemoryBackend, QueueBackend, RedisBackend, StalledJob};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{
    BackendKind, IdempotencyConfig, JobsConfig, MonitoringConfig, QueueDefinition,
    QueueOverrides, RedisConfig, WorkerConfig,
};
pub use error::{QueueError, QueueResult};
pub use events::{EventBus, LifecycleEvent, StateChange, StateChangeListener};
pub use idempotency::{IdempotencyGuard, KeyValueStore};
pub use job::{
    JobData, JobDetails, JobHandle, JobId, JobOptions, JobRecord, JobResult, JobState, Priority,
    QueueMetrics, RepeatOptions,
};
pub use metrics::{register_metrics, JobMetrics, WorkerMetrics};
pub use monitor::{CleanOptions, CleanReport, LifecycleCounts, LifecycleRecorder, QueueHealth, QueueMonitor, SystemHealth};
pub use processor::{processor_fn, JobContext, Processor, ProcessorError, ProcessorRegistry};
pub use queue::{BulkJob, JobQueue};
pub use repeat::RepeatableJob;
pub use retry::{Backoff, BackoffKind, RetryDecision};
pub use runtime::QueueRuntime;
pub use worker::{Worker, WorkerOptions};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::job::{JobData, JobOptions, Priority};
    pub use crate::processor::{JobContext, ProcessorError, ProcessorRegistry};
    pub use crate::queue::JobQueue;
    pub use crate::runtime::QueueRuntime;
    pub use crate::{QueueError, QueueResult};
}
