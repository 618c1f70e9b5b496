//! Durable queue backend contract and its implementations.
//!
//! The backend owns job records and their states. It provides lease-based
//! delivery with a visibility timeout, delayed and recurring scheduling and
//! priority ordering. Callers never touch job states directly; they go
//! through the operations below.

mod disabled;
mod memory;
pub mod redis;

pub use disabled::DisabledBackend;
pub use memory::InMemoryBackend;
pub use self::redis::{create_pool, RedisBackend, RedisKeys};

use crate::error::QueueResult;
use crate::job::{EnqueueOutcome, JobId, JobRecord, JobState, NewJob, QueueMetrics};
use crate::repeat::RepeatableJob;
use crate::retry::RetryDecision;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Failure reason recorded for jobs that stalled too often.
pub const STALLED_LIMIT_REASON: &str = "job stalled more than allowable limit";

/// A job whose lease expired, and where it went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledJob {
    pub id: JobId,
    pub name: String,
    /// `Waiting` if re-queued, `Failed` if the stall limit was exceeded.
    pub moved_to: JobState,
}

/// Score used to order waiting jobs: higher priority first, then FIFO by
/// eligibility time.
pub fn priority_score(priority: i32, eligible_at_ms: i64) -> f64 {
    let priority_component = -(priority as f64) * 1_000_000_000_000.0;
    priority_component + eligible_at_ms as f64
}

/// Storage and delivery of jobs.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Insert a job unless a job with the same id exists.
    async fn enqueue(&self, queue: &str, job: NewJob) -> QueueResult<EnqueueOutcome>;

    /// Insert several jobs; duplicates are skipped individually.
    async fn enqueue_bulk(
        &self,
        queue: &str,
        jobs: Vec<NewJob>,
    ) -> QueueResult<Vec<(JobId, EnqueueOutcome)>>;

    /// Promote due delayed and recurring jobs, then lease the best waiting
    /// job. Returns `None` when the queue is empty or paused.
    async fn lease(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
    ) -> QueueResult<Option<JobRecord>>;

    /// Push the lease deadline out. Returns false if the lease was lost.
    async fn extend_lease(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        lease: Duration,
    ) -> QueueResult<bool>;

    /// Acknowledge successful completion.
    async fn complete(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        return_value: Value,
    ) -> QueueResult<()>;

    /// Record a failed attempt and apply the retry decision. Returns the
    /// state the job moved to.
    async fn fail(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        reason: &str,
        decision: RetryDecision,
    ) -> QueueResult<JobState>;

    /// Job counts per state.
    async fn get_counts(&self, queue: &str) -> QueueResult<QueueMetrics>;

    /// Look up a job.
    async fn get_job(&self, queue: &str, id: &JobId) -> QueueResult<Option<JobRecord>>;

    /// Remove a job that is not active. Returns false if it did not exist.
    async fn remove_job(&self, queue: &str, id: &JobId) -> QueueResult<bool>;

    /// Store processor progress (0-100).
    async fn update_progress(&self, queue: &str, id: &JobId, progress: u8) -> QueueResult<()>;

    /// Register or replace a recurrence.
    async fn add_repeatable(&self, queue: &str, job: RepeatableJob) -> QueueResult<()>;

    /// Remove a recurrence. Returns false if it did not exist.
    async fn remove_repeatable(&self, queue: &str, key: &str) -> QueueResult<bool>;

    /// Registered recurrences.
    async fn list_repeatable(&self, queue: &str) -> QueueResult<Vec<RepeatableJob>>;

    /// Stop leasing from the queue.
    async fn pause(&self, queue: &str) -> QueueResult<()>;

    /// Resume leasing.
    async fn resume(&self, queue: &str) -> QueueResult<()>;

    /// Returns true if the queue is paused.
    async fn is_paused(&self, queue: &str) -> QueueResult<bool>;

    /// Remove up to `limit` jobs in a terminal `state` that finished more
    /// than `grace` ago, oldest first. A zero limit removes all of them.
    async fn clean(
        &self,
        queue: &str,
        grace: Duration,
        limit: usize,
        state: JobState,
    ) -> QueueResult<Vec<JobId>>;

    /// Re-queue active jobs whose lease expired, failing those that
    /// stalled more than `max_stalled` times.
    async fn recover_stalled(&self, queue: &str, max_stalled: u32) -> QueueResult<Vec<StalledJob>>;

    /// Check connectivity.
    async fn ping(&self) -> QueueResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_score_orders_by_priority_then_time() {
        let now = 1_700_000_000_000;
        let high_late = priority_score(10, now + 5_000);
        let low_early = priority_score(1, now);
        let low_late = priority_score(1, now + 1);

        assert!(high_late < low_early);
        assert!(low_early < low_late);
    }
}
