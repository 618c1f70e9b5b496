//! Job queue client: idempotency-guarded enqueue and per-queue
//! administration.

use crate::backend::QueueBackend;
use crate::clock::Clock;
use crate::config::QueueDefinition;
use crate::error::{QueueError, QueueResult};
use crate::events::{EventBus, LifecycleEvent, StateChange};
use crate::idempotency::IdempotencyGuard;
use crate::job::{
    EnqueueOutcome, JobData, JobDetails, JobHandle, JobId, JobOptions, JobState, NewJob,
    QueueMetrics, RepeatOptions,
};
use crate::metrics::JobMetrics;
use crate::repeat::RepeatableJob;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One entry of a bulk enqueue.
#[derive(Debug, Clone)]
pub struct BulkJob {
    pub job_type: String,
    pub data: JobData,
    pub options: JobOptions,
}

impl BulkJob {
    /// Create a bulk entry.
    pub fn new(job_type: impl Into<String>, data: JobData, options: JobOptions) -> Self {
        Self {
            job_type: job_type.into(),
            data,
            options,
        }
    }
}

/// Client of one business queue.
///
/// Cheap to clone; clones share the backend, the idempotency guard and the
/// event bus.
#[derive(Clone)]
pub struct JobQueue {
    definition: Arc<QueueDefinition>,
    backend: Arc<dyn QueueBackend>,
    guard: IdempotencyGuard,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl JobQueue {
    /// Create a queue client.
    pub fn new(
        definition: QueueDefinition,
        backend: Arc<dyn QueueBackend>,
        guard: IdempotencyGuard,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            definition: Arc::new(definition),
            backend,
            guard,
            events,
            clock,
        }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Queue definition.
    pub fn definition(&self) -> &QueueDefinition {
        &self.definition
    }

    pub(crate) fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub(crate) fn guard(&self) -> &IdempotencyGuard {
        &self.guard
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Enqueue a job.
    ///
    /// Returns `Ok(None)` when the key was already processed, when a job
    /// with the same id exists, or when the backend is unavailable. Invalid
    /// job data is the only error surfaced to the caller.
    pub async fn add_job(
        &self,
        job_type: &str,
        data: JobData,
        options: JobOptions,
    ) -> QueueResult<Option<JobHandle>> {
        data.validate()?;

        if self.guard.exists(self.name(), &data.idempotency_key).await {
            debug!(
                queue = %self.name(),
                job_type = %job_type,
                idempotency_key = %data.idempotency_key,
                "Job already processed, skipping"
            );
            JobMetrics::job_deduplicated(self.name(), job_type);
            return Ok(None);
        }

        let options = options.merged_over(&self.definition.default_options);

        if let Some(repeat) = options.repeat.clone() {
            let key = self.add_repeatable_job(job_type, data, repeat, options).await?;
            return Ok(key.map(|key| JobHandle {
                id: JobId::from(key),
                queue: self.name().to_string(),
                name: job_type.to_string(),
                state: JobState::Delayed,
            }));
        }

        let job = NewJob::new(job_type, &data, options)?;
        let job_id = job.id.clone();

        match self.backend.enqueue(self.name(), job).await {
            Ok(EnqueueOutcome::Created(state)) => Ok(Some(self.accepted(job_id, job_type, state))),
            Ok(EnqueueOutcome::Duplicate) => {
                debug!(queue = %self.name(), job_id = %job_id, "Job with same id already queued");
                JobMetrics::job_deduplicated(self.name(), job_type);
                Ok(None)
            }
            Err(e) if e.is_backend_unavailable() => {
                warn!(queue = %self.name(), job_id = %job_id, error = %e, "Queue backend unavailable, job not enqueued");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Enqueue several jobs in one backend call.
    ///
    /// Entries whose key was already processed, and entries the backend
    /// rejects as duplicates, are skipped; only accepted handles are
    /// returned.
    pub async fn add_bulk_jobs(&self, jobs: Vec<BulkJob>) -> QueueResult<Vec<JobHandle>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        for job in &jobs {
            job.data.validate()?;
            if job.options.repeat.is_some() {
                return Err(QueueError::Validation(format!(
                    "Repeatable job '{}' cannot be bulk-enqueued",
                    job.data.idempotency_key
                )));
            }
        }

        let total = jobs.len();
        let mut submitted = Vec::with_capacity(total);
        for job in jobs {
            if self.guard.exists(self.name(), &job.data.idempotency_key).await {
                continue;
            }
            let options = job.options.merged_over(&self.definition.default_options);
            submitted.push(NewJob::new(job.job_type, &job.data, options)?);
        }

        if submitted.is_empty() {
            debug!(queue = %self.name(), skipped = total, "All bulk jobs already processed");
            return Ok(Vec::new());
        }

        let names: std::collections::HashMap<JobId, String> = submitted
            .iter()
            .map(|job| (job.id.clone(), job.name.clone()))
            .collect();

        let outcomes = match self.backend.enqueue_bulk(self.name(), submitted).await {
            Ok(outcomes) => outcomes,
            Err(e) if e.is_backend_unavailable() => {
                warn!(queue = %self.name(), count = total, error = %e, "Queue backend unavailable, bulk jobs not enqueued");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let handles: Vec<JobHandle> = outcomes
            .into_iter()
            .filter_map(|(id, outcome)| match outcome {
                EnqueueOutcome::Created(state) => {
                    let job_type = names.get(&id).cloned().unwrap_or_default();
                    Some(self.accepted(id, &job_type, state))
                }
                EnqueueOutcome::Duplicate => None,
            })
            .collect();

        debug!(
            queue = %self.name(),
            accepted = handles.len(),
            skipped = total - handles.len(),
            "Bulk enqueue finished"
        );
        Ok(handles)
    }

    fn accepted(&self, id: JobId, job_type: &str, state: JobState) -> JobHandle {
        let event = if state == JobState::Delayed {
            LifecycleEvent::Delayed
        } else {
            LifecycleEvent::Waiting
        };

        debug!(queue = %self.name(), job_id = %id, job_type = %job_type, state = %state, "Job enqueued");
        JobMetrics::job_enqueued(self.name(), job_type);
        self.events
            .emit(StateChange::new(self.name(), id.clone(), job_type, event));

        JobHandle {
            id,
            queue: self.name().to_string(),
            name: job_type.to_string(),
            state,
        }
    }

    /// Register a recurring job. Returns its repeat key, or `None` if the
    /// backend is unavailable.
    pub async fn add_repeatable_job(
        &self,
        job_type: &str,
        data: JobData,
        repeat: RepeatOptions,
        options: JobOptions,
    ) -> QueueResult<Option<String>> {
        data.validate()?;

        let options = options.merged_over(&self.definition.default_options);
        let repeatable = RepeatableJob::new(
            job_type,
            &data.idempotency_key,
            data.to_value()?,
            options,
            &repeat,
            self.clock.now(),
        )?;
        let key = repeatable.key.clone();
        let next = repeatable.next;

        match self.backend.add_repeatable(self.name(), repeatable).await {
            Ok(()) => {
                info!(queue = %self.name(), repeat_key = %key, pattern = %repeat.pattern, next = %next, "Registered repeatable job");
                self.events.emit(StateChange::new(
                    self.name(),
                    JobId::from(key.as_str()),
                    job_type,
                    LifecycleEvent::Delayed,
                ));
                Ok(Some(key))
            }
            Err(e) if e.is_backend_unavailable() => {
                warn!(queue = %self.name(), repeat_key = %key, error = %e, "Queue backend unavailable, repeatable job not registered");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Remove a recurrence by key. One-off jobs of the same type are not
    /// touched.
    pub async fn remove_repeatable(&self, key: &str) -> QueueResult<bool> {
        match self.backend.remove_repeatable(self.name(), key).await {
            Ok(removed) => {
                if removed {
                    info!(queue = %self.name(), repeat_key = %key, "Removed repeatable job");
                }
                Ok(removed)
            }
            Err(e) if e.is_backend_unavailable() => {
                warn!(queue = %self.name(), repeat_key = %key, error = %e, "Queue backend unavailable, repeatable job not removed");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Registered recurrences.
    pub async fn list_repeatable(&self) -> QueueResult<Vec<RepeatableJob>> {
        match self.backend.list_repeatable(self.name()).await {
            Ok(jobs) => Ok(jobs),
            Err(e) if e.is_backend_unavailable() => {
                warn!(queue = %self.name(), error = %e, "Queue backend unavailable, no repeatable jobs listed");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Job counts; zeros when the backend is unavailable.
    pub async fn get_queue_stats(&self) -> QueueResult<QueueMetrics> {
        match self.backend.get_counts(self.name()).await {
            Ok(metrics) => {
                JobMetrics::update_queue_sizes(self.name(), &metrics);
                Ok(metrics)
            }
            Err(e) if e.is_backend_unavailable() => {
                warn!(queue = %self.name(), error = %e, "Queue backend unavailable, reporting empty stats");
                Ok(QueueMetrics::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Stop workers from leasing new jobs. A no-op when the backend is
    /// unavailable.
    pub async fn pause_queue(&self) -> QueueResult<()> {
        match self.backend.pause(self.name()).await {
            Ok(()) => info!(queue = %self.name(), "Queue paused"),
            Err(e) if e.is_backend_unavailable() => {
                warn!(queue = %self.name(), error = %e, "Queue backend unavailable, queue not paused");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Resume leasing.
    pub async fn resume_queue(&self) -> QueueResult<()> {
        match self.backend.resume(self.name()).await {
            Ok(()) => info!(queue = %self.name(), "Queue resumed"),
            Err(e) if e.is_backend_unavailable() => {
                warn!(queue = %self.name(), error = %e, "Queue backend unavailable, queue not resumed");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Returns true if the queue is paused; false when unknown.
    pub async fn is_paused(&self) -> bool {
        match self.backend.is_paused(self.name()).await {
            Ok(paused) => paused,
            Err(e) => {
                warn!(queue = %self.name(), error = %e, "Failed to read pause state");
                false
            }
        }
    }

    /// Remove terminal jobs older than `grace`.
    pub async fn clean_queue(
        &self,
        grace: Duration,
        limit: usize,
        state: JobState,
    ) -> QueueResult<Vec<JobId>> {
        match self.backend.clean(self.name(), grace, limit, state).await {
            Ok(removed) => {
                if !removed.is_empty() {
                    info!(queue = %self.name(), state = %state, count = removed.len(), "Cleaned jobs");
                }
                Ok(removed)
            }
            Err(e) if e.is_backend_unavailable() => {
                warn!(queue = %self.name(), state = %state, error = %e, "Queue backend unavailable, nothing cleaned");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Look up a job; `None` when the backend is unavailable.
    pub async fn get_job(&self, id: &JobId) -> QueueResult<Option<JobDetails>> {
        match self.backend.get_job(self.name(), id).await {
            Ok(record) => Ok(record.map(JobDetails::from)),
            Err(e) if e.is_backend_unavailable() => {
                warn!(queue = %self.name(), job_id = %id, error = %e, "Queue backend unavailable, job not looked up");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Remove a job. Active jobs are never removed; false is returned
    /// for them and for unknown ids.
    pub async fn remove_job(&self, id: &JobId) -> QueueResult<bool> {
        match self.backend.remove_job(self.name(), id).await {
            Ok(removed) => Ok(removed),
            Err(QueueError::InvalidState { .. }) => {
                warn!(queue = %self.name(), job_id = %id, "Refusing to remove active job");
                Ok(false)
            }
            Err(e) if e.is_backend_unavailable() => {
                warn!(queue = %self.name(), job_id = %id, error = %e, "Queue backend unavailable, job not removed");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Returns true if the backend answers.
    pub async fn health_check(&self) -> bool {
        match self.backend.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(queue = %self.name(), error = %e, "Queue health check failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("name", &self.definition.name)
            .field("backend", &self.backend.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DisabledBackend, InMemoryBackend};
    use crate::clock::MockClock;
    use crate::idempotency::InMemoryKeyValueStore;
    use crate::job::{JobResult, Priority};
    use crate::retry::Backoff;
    use serde_json::json;

    fn queue_with(backend: Arc<dyn QueueBackend>) -> JobQueue {
        let clock = MockClock::new();
        let definition = QueueDefinition::new("email").default_options(
            JobOptions::new()
                .attempts(3)
                .backoff(Backoff::exponential(Duration::from_secs(2))),
        );
        JobQueue::new(
            definition,
            backend,
            IdempotencyGuard::new(Arc::new(InMemoryKeyValueStore::new()), "test"),
            EventBus::new(),
            Arc::new(clock),
        )
    }

    fn queue() -> JobQueue {
        queue_with(Arc::new(InMemoryBackend::new()))
    }

    fn data(key: &str) -> JobData {
        JobData::new(key, json!({"to": "a@x.com"})).unwrap()
    }

    #[tokio::test]
    async fn test_add_job_merges_defaults() {
        let queue = queue();
        let handle = queue
            .add_job("send_email", data("k1"), JobOptions::new().priority(Priority::High))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.state, JobState::Waiting);

        let details = queue.get_job(&handle.id).await.unwrap().unwrap();
        assert_eq!(details.priority, 10);
        assert_eq!(details.max_attempts, 3);
    }

    #[tokio::test]
    async fn test_duplicate_key_returns_none() {
        let queue = queue();
        assert!(queue.add_job("send_email", data("k1"), JobOptions::new()).await.unwrap().is_some());
        assert!(queue.add_job("send_email", data("k1"), JobOptions::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_processed_key_is_skipped() {
        let queue = queue();
        queue
            .guard()
            .mark_processed("email", "k1", &JobResult::success(json!(1), Duration::ZERO), Duration::from_secs(60))
            .await;

        assert!(queue.add_job("send_email", data("k1"), JobOptions::new()).await.unwrap().is_none());
        assert_eq!(queue.get_queue_stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_invalid_data_is_rejected() {
        let queue = queue();
        let err = queue
            .add_job("send_email", data(""), JobOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unavailable_backend_degrades() {
        let queue = queue_with(Arc::new(DisabledBackend::new("test")));

        assert!(queue.add_job("send_email", data("k1"), JobOptions::new()).await.unwrap().is_none());
        assert_eq!(queue.get_queue_stats().await.unwrap(), QueueMetrics::default());
        assert!(!queue.is_paused().await);
        assert!(!queue.health_check().await);

        queue.pause_queue().await.unwrap();
        queue.resume_queue().await.unwrap();
        assert!(queue.get_job(&JobId::from("k1")).await.unwrap().is_none());
        assert!(!queue.remove_job(&JobId::from("k1")).await.unwrap());
        assert!(!queue.remove_repeatable("send_email:k1::0 9 * * *").await.unwrap());
        assert!(queue.list_repeatable().await.unwrap().is_empty());
        assert!(queue
            .clean_queue(Duration::ZERO, 0, JobState::Completed)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_bulk_skips_processed_and_duplicates() {
        let queue = queue();
        queue
            .guard()
            .mark_processed("email", "done", &JobResult::success(json!(1), Duration::ZERO), Duration::from_secs(60))
            .await;
        queue.add_job("send_email", data("queued"), JobOptions::new()).await.unwrap();

        let handles = queue
            .add_bulk_jobs(vec![
                BulkJob::new("send_email", data("done"), JobOptions::new()),
                BulkJob::new("send_email", data("queued"), JobOptions::new()),
                BulkJob::new("send_email", data("new-1"), JobOptions::new()),
                BulkJob::new("send_email", data("new-2"), JobOptions::new()),
            ])
            .await
            .unwrap();

        let ids: Vec<&str> = handles.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["new-1", "new-2"]);
    }

    #[tokio::test]
    async fn test_repeatable_via_add_job_and_removal() {
        let queue = queue();
        queue.add_job("send_email", data("one-off"), JobOptions::new()).await.unwrap();

        let handle = queue
            .add_job(
                "send_email",
                data("digest"),
                JobOptions::new().repeat(RepeatOptions::cron("0 9 * * *").in_timezone("Asia/Shanghai")),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.state, JobState::Delayed);

        let listed = queue.list_repeatable().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, handle.id.as_str());

        assert!(queue.remove_repeatable(handle.id.as_str()).await.unwrap());
        assert!(queue.list_repeatable().await.unwrap().is_empty());
        // The one-off job of the same type survives.
        assert!(queue.get_job(&JobId::from("one-off")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remove_active_job_returns_false() {
        let queue = queue();
        let handle = queue.add_job("send_email", data("k1"), JobOptions::new()).await.unwrap().unwrap();
        queue
            .backend()
            .lease("email", "w", Duration::from_secs(30))
            .await
            .unwrap();

        assert!(!queue.remove_job(&handle.id).await.unwrap());
    }
}
