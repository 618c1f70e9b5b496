//! Backend used when the broker could not be reached at startup.

use super::{QueueBackend, StalledJob};
use crate::error::{QueueError, QueueResult};
use crate::job::{EnqueueOutcome, JobId, JobRecord, JobState, NewJob, QueueMetrics};
use crate::repeat::RepeatableJob;
use crate::retry::RetryDecision;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Every operation fails with [`QueueError::BackendUnavailable`], which
/// callers degrade to warnings and defaults.
#[derive(Debug, Clone, Default)]
pub struct DisabledBackend {
    reason: String,
}

impl DisabledBackend {
    /// Create a disabled backend, remembering why.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn unavailable<T>(&self) -> QueueResult<T> {
        Err(QueueError::BackendUnavailable(format!(
            "queue backend disabled: {}",
            self.reason
        )))
    }
}

#[async_trait]
impl QueueBackend for DisabledBackend {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn enqueue(&self, _queue: &str, _job: NewJob) -> QueueResult<EnqueueOutcome> {
        self.unavailable()
    }

    async fn enqueue_bulk(
        &self,
        _queue: &str,
        _jobs: Vec<NewJob>,
    ) -> QueueResult<Vec<(JobId, EnqueueOutcome)>> {
        self.unavailable()
    }

    async fn lease(
        &self,
        _queue: &str,
        _worker_id: &str,
        _lease: Duration,
    ) -> QueueResult<Option<JobRecord>> {
        self.unavailable()
    }

    async fn extend_lease(
        &self,
        _queue: &str,
        _id: &JobId,
        _token: &str,
        _lease: Duration,
    ) -> QueueResult<bool> {
        self.unavailable()
    }

    async fn complete(
        &self,
        _queue: &str,
        _id: &JobId,
        _token: &str,
        _return_value: Value,
    ) -> QueueResult<()> {
        self.unavailable()
    }

    async fn fail(
        &self,
        _queue: &str,
        _id: &JobId,
        _token: &str,
        _reason: &str,
        _decision: RetryDecision,
    ) -> QueueResult<JobState> {
        self.unavailable()
    }

    async fn get_counts(&self, _queue: &str) -> QueueResult<QueueMetrics> {
        self.unavailable()
    }

    async fn get_job(&self, _queue: &str, _id: &JobId) -> QueueResult<Option<JobRecord>> {
        self.unavailable()
    }

    async fn remove_job(&self, _queue: &str, _id: &JobId) -> QueueResult<bool> {
        self.unavailable()
    }

    async fn update_progress(&self, _queue: &str, _id: &JobId, _progress: u8) -> QueueResult<()> {
        self.unavailable()
    }

    async fn add_repeatable(&self, _queue: &str, _job: RepeatableJob) -> QueueResult<()> {
        self.unavailable()
    }

    async fn remove_repeatable(&self, _queue: &str, _key: &str) -> QueueResult<bool> {
        self.unavailable()
    }

    async fn list_repeatable(&self, _queue: &str) -> QueueResult<Vec<RepeatableJob>> {
        self.unavailable()
    }

    async fn pause(&self, _queue: &str) -> QueueResult<()> {
        self.unavailable()
    }

    async fn resume(&self, _queue: &str) -> QueueResult<()> {
        self.unavailable()
    }

    async fn is_paused(&self, _queue: &str) -> QueueResult<bool> {
        self.unavailable()
    }

    async fn clean(
        &self,
        _queue: &str,
        _grace: Duration,
        _limit: usize,
        _state: JobState,
    ) -> QueueResult<Vec<JobId>> {
        self.unavailable()
    }

    async fn recover_stalled(&self, _queue: &str, _max_stalled: u32) -> QueueResult<Vec<StalledJob>> {
        self.unavailable()
    }

    async fn ping(&self) -> QueueResult<()> {
        self.unavailable()
    }
}
