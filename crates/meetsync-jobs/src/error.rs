//! Queue runtime error types.

use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-related errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Job data is malformed or incomplete. Never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A job with the same id already exists in the queue.
    #[error("Duplicate job: {0}")]
    Duplicate(String),

    /// Job failed permanently and must not be retried.
    #[error("Unrecoverable job failure: {0}")]
    Unrecoverable(String),

    /// Job failed with a transient error and may be retried.
    #[error("Transient job failure: {0}")]
    Transient(String),

    /// The durable queue backend or the idempotency store is unreachable.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Job or queue not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid job state.
    #[error("Invalid job state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Worker error.
    #[error("Worker error: {0}")]
    Worker(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Returns true if a job failing with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueueError::Transient(_)
                | QueueError::BackendUnavailable(_)
                | QueueError::Redis(_)
                | QueueError::Pool(_)
                | QueueError::Worker(_)
        )
    }

    /// Returns true if the error means the backend could not be reached.
    ///
    /// Callers on the enqueue and monitoring paths degrade to defaults
    /// instead of propagating these.
    /// Script and type errors from Redis are not outages and propagate.
    pub fn is_backend_unavailable(&self) -> bool {
        match self {
            QueueError::BackendUnavailable(_) | QueueError::Pool(_) => true,
            QueueError::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_refusal()
                    || e.is_timeout()
                    || e.is_connection_dropped()
            }
            _ => false,
        }
    }
}
