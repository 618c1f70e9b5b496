//! Caller-supplied job processors and their error contract.

use crate::backend::QueueBackend;
use crate::error::{QueueError, QueueResult};
use crate::events::{EventBus, LifecycleEvent, StateChange};
use crate::job::{JobData, JobId};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Message fragments that mark an untyped failure as permanent.
pub const UNRECOVERABLE_PATTERNS: &[&str] = &[
    "validation",
    "invalid",
    "malformed",
    "unauthorized",
    "forbidden",
    "not found",
    "duplicate",
    "bad request",
];

/// Failure reported by a processor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessorError {
    /// Retrying cannot help (bad input, missing permission, unknown entity).
    #[error("{reason}")]
    Unrecoverable { reason: String },

    /// Transient failure; the job is retried while attempts remain.
    #[error("{cause}")]
    Recoverable { cause: String },
}

impl ProcessorError {
    /// Permanent failure.
    pub fn unrecoverable(reason: impl Into<String>) -> Self {
        ProcessorError::Unrecoverable {
            reason: reason.into(),
        }
    }

    /// Transient failure.
    pub fn recoverable(cause: impl Into<String>) -> Self {
        ProcessorError::Recoverable {
            cause: cause.into(),
        }
    }

    /// Classify an untyped error message.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();

        if UNRECOVERABLE_PATTERNS.iter().any(|p| lowered.contains(p)) {
            ProcessorError::unrecoverable(message)
        } else {
            ProcessorError::recoverable(message)
        }
    }

    /// Returns true if the job must not be retried.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, ProcessorError::Unrecoverable { .. })
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        match self {
            ProcessorError::Unrecoverable { reason } => reason,
            ProcessorError::Recoverable { cause } => cause,
        }
    }
}

impl From<QueueError> for ProcessorError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Validation(_)
            | QueueError::Unrecoverable(_)
            | QueueError::Duplicate(_)
            | QueueError::NotFound(_)
            | QueueError::Serialization(_) => ProcessorError::unrecoverable(err.to_string()),
            other if other.is_retryable() => ProcessorError::recoverable(other.to_string()),
            other => ProcessorError::from_message(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ProcessorError {
    fn from(err: serde_json::Error) -> Self {
        ProcessorError::unrecoverable(format!("Malformed payload: {}", err))
    }
}

impl From<String> for ProcessorError {
    fn from(message: String) -> Self {
        ProcessorError::from_message(message)
    }
}

impl From<&str> for ProcessorError {
    fn from(message: &str) -> Self {
        ProcessorError::from_message(message)
    }
}

/// What a processor knows about the job it runs.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub queue: String,
    pub job_type: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
    pub correlation_id: String,
    pub worker_id: String,
    backend: Arc<dyn QueueBackend>,
    events: EventBus,
}

impl JobContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        job_id: JobId,
        queue: impl Into<String>,
        job_type: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
        correlation_id: impl Into<String>,
        worker_id: impl Into<String>,
        backend: Arc<dyn QueueBackend>,
        events: EventBus,
    ) -> Self {
        Self {
            job_id,
            queue: queue.into(),
            job_type: job_type.into(),
            attempt,
            max_attempts,
            correlation_id: correlation_id.into(),
            worker_id: worker_id.into(),
            backend,
            events,
        }
    }

    /// Returns true if this is the last attempt the job gets.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Report progress (clamped to 100).
    pub async fn update_progress(&self, progress: u8) -> QueueResult<()> {
        let progress = progress.min(100);
        self.backend
            .update_progress(&self.queue, &self.job_id, progress)
            .await?;

        self.events.emit(
            StateChange::new(
                self.queue.clone(),
                self.job_id.clone(),
                self.job_type.clone(),
                LifecycleEvent::Progress,
            )
            .attempt(self.attempt)
            .progress(progress),
        );
        Ok(())
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("queue", &self.queue)
            .field("job_type", &self.job_type)
            .field("attempt", &self.attempt)
            .field("max_attempts", &self.max_attempts)
            .field("correlation_id", &self.correlation_id)
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

/// Executes one job type.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Run the job. The returned value is stored as the job's result.
    async fn process(&self, ctx: &JobContext, data: &JobData) -> Result<Value, ProcessorError>;
}

/// Processor backed by an async closure.
pub struct FnProcessor<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F>
where
    F: Fn(JobContext, JobData) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ProcessorError>> + Send + 'static,
{
    async fn process(&self, ctx: &JobContext, data: &JobData) -> Result<Value, ProcessorError> {
        (self.f)(ctx.clone(), data.clone()).await
    }
}

/// Wrap an async closure as a processor.
pub fn processor_fn<F, Fut>(f: F) -> Arc<dyn Processor>
where
    F: Fn(JobContext, JobData) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ProcessorError>> + Send + 'static,
{
    Arc::new(FnProcessor { f })
}

/// Processors of one queue, keyed by job type.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor for a job type.
    pub fn register(mut self, job_type: impl Into<String>, processor: Arc<dyn Processor>) -> Self {
        self.processors.insert(job_type.into(), processor);
        self
    }

    /// Register an async closure for a job type.
    pub fn handle<F, Fut>(self, job_type: impl Into<String>, f: F) -> Self
    where
        F: Fn(JobContext, JobData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ProcessorError>> + Send + 'static,
    {
        self.register(job_type, processor_fn(f))
    }

    /// Look up the processor of a job type.
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn Processor>> {
        self.processors.get(job_type).cloned()
    }

    /// Registered job types.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.processors.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
