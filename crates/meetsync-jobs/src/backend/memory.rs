//! Process-local queue backend.
//!
//! Same semantics as the Redis backend, minus durability. Time comes from a
//! [`Clock`] so tests can move delayed jobs, leases and recurrences forward
//! without sleeping.

use super::{priority_score, QueueBackend, StalledJob, STALLED_LIMIT_REASON};
use crate::clock::{Clock, SystemClock};
use crate::error::{QueueError, QueueResult};
use crate::job::{EnqueueOutcome, JobId, JobRecord, JobState, NewJob, QueueMetrics};
use crate::repeat::RepeatableJob;
use crate::retry::RetryDecision;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Ordering key of a waiting job.
#[derive(Debug, Clone, Copy, PartialEq)]
struct WaitKey {
    score: f64,
    seq: u64,
}

impl Eq for WaitKey {}

impl PartialOrd for WaitKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WaitKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .total_cmp(&other.score)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug)]
struct Lease {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<JobId, JobRecord>,
    waiting: BTreeMap<WaitKey, JobId>,
    wait_keys: HashMap<JobId, WaitKey>,
    leases: HashMap<JobId, Lease>,
    repeatables: HashMap<String, RepeatableJob>,
    paused: bool,
    seq: u64,
}

impl QueueState {
    fn push_waiting(&mut self, id: JobId, priority: i32, eligible_at: DateTime<Utc>) {
        self.seq += 1;
        let key = WaitKey {
            score: priority_score(priority, eligible_at.timestamp_millis()),
            seq: self.seq,
        };
        self.waiting.insert(key, id.clone());
        self.wait_keys.insert(id, key);
    }

    fn drop_waiting(&mut self, id: &JobId) {
        if let Some(key) = self.wait_keys.remove(id) {
            self.waiting.remove(&key);
        }
    }

    fn insert(&mut self, job: NewJob, queue: &str, now: DateTime<Utc>) -> EnqueueOutcome {
        if self.jobs.contains_key(&job.id) {
            return EnqueueOutcome::Duplicate;
        }

        let delay = chrono::Duration::from_std(job.opts.delay_duration())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let mut job = job;
        job.created_at = now;
        job.scheduled_at = now + delay;

        let state = if job.scheduled_at > now {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        let id = job.id.clone();
        let priority = job.opts.priority_value();
        let scheduled_at = job.scheduled_at;
        self.jobs
            .insert(id.clone(), JobRecord::from_new(queue, job, state));
        if state == JobState::Waiting {
            self.push_waiting(id, priority, scheduled_at);
        }

        EnqueueOutcome::Created(state)
    }

    fn promote_delayed(&mut self, now: DateTime<Utc>) {
        let mut due: Vec<(DateTime<Utc>, JobId, i32)> = self
            .jobs
            .values()
            .filter(|job| job.state == JobState::Delayed && job.scheduled_at <= now)
            .map(|job| (job.scheduled_at, job.id.clone(), job.opts.priority_value()))
            .collect();
        due.sort_by(|a, b| a.0.cmp(&b.0));

        for (scheduled_at, id, priority) in due {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Waiting;
            }
            self.push_waiting(id, priority, scheduled_at);
        }
    }

    fn materialize_repeatables(&mut self, queue: &str, now: DateTime<Utc>) {
        let due: Vec<String> = self
            .repeatables
            .values()
            .filter(|r| r.next <= now)
            .map(|r| r.key.clone())
            .collect();

        for key in due {
            let Some(repeatable) = self.repeatables.get(&key).cloned() else {
                continue;
            };

            let instance = repeatable.instance(now);
            let outcome = self.insert(instance, queue, now);
            debug!(queue = %queue, repeat_key = %key, ?outcome, "Materialized repeatable job");

            let mut advanced = repeatable;
            if advanced.advance(now) {
                self.repeatables.insert(key, advanced);
            } else {
                self.repeatables.remove(&key);
            }
        }
    }

    fn visible_state(&self, state: JobState) -> JobState {
        if self.paused && state == JobState::Waiting {
            JobState::Paused
        } else {
            state
        }
    }

    fn check_lease(&self, id: &JobId, token: &str) -> QueueResult<()> {
        let actual = self
            .jobs
            .get(id)
            .map(|job| job.state.to_string())
            .ok_or_else(|| QueueError::NotFound(format!("Job not found: {}", id)))?;

        match self.leases.get(id) {
            Some(lease) if lease.token == token => Ok(()),
            _ => Err(QueueError::InvalidState {
                expected: "active with lease held".to_string(),
                actual,
            }),
        }
    }
}

/// In-memory [`QueueBackend`].
#[derive(Debug)]
pub struct InMemoryBackend {
    queues: Mutex<HashMap<String, QueueState>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryBackend {
    /// Create a backend on the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a backend on a custom clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn with_queue<R>(&self, queue: &str, f: impl FnOnce(&mut QueueState) -> R) -> R {
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        f(state)
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn enqueue(&self, queue: &str, job: NewJob) -> QueueResult<EnqueueOutcome> {
        let now = self.clock.now();
        Ok(self.with_queue(queue, |state| state.insert(job, queue, now)))
    }

    async fn enqueue_bulk(
        &self,
        queue: &str,
        jobs: Vec<NewJob>,
    ) -> QueueResult<Vec<(JobId, EnqueueOutcome)>> {
        let now = self.clock.now();
        Ok(self.with_queue(queue, |state| {
            jobs.into_iter()
                .map(|job| {
                    let id = job.id.clone();
                    (id, state.insert(job, queue, now))
                })
                .collect()
        }))
    }

    async fn lease(
        &self,
        queue: &str,
        _worker_id: &str,
        lease: Duration,
    ) -> QueueResult<Option<JobRecord>> {
        let now = self.clock.now();
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero());

        Ok(self.with_queue(queue, |state| {
            state.promote_delayed(now);
            state.materialize_repeatables(queue, now);

            if state.paused {
                return None;
            }

            let (key, id) = state.waiting.pop_first()?;
            debug_assert_eq!(state.wait_keys.get(&id), Some(&key));
            state.wait_keys.remove(&id);

            let token = Uuid::new_v4().to_string();
            let job = state.jobs.get_mut(&id)?;
            job.state = JobState::Active;
            job.attempts_started += 1;
            job.processed_on = Some(now);
            job.lease_token = Some(token.clone());
            let record = job.clone();

            state.leases.insert(
                id,
                Lease {
                    token,
                    expires_at: now + lease,
                },
            );
            Some(record)
        }))
    }

    async fn extend_lease(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        lease: Duration,
    ) -> QueueResult<bool> {
        let now = self.clock.now();
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero());

        Ok(self.with_queue(queue, |state| match state.leases.get_mut(id) {
            Some(held) if held.token == token => {
                held.expires_at = now + lease;
                true
            }
            _ => false,
        }))
    }

    async fn complete(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        return_value: Value,
    ) -> QueueResult<()> {
        let now = self.clock.now();

        self.with_queue(queue, |state| {
            state.check_lease(id, token)?;
            state.leases.remove(id);

            if let Some(job) = state.jobs.get_mut(id) {
                job.state = JobState::Completed;
                job.attempts_made += 1;
                job.return_value = Some(return_value);
                job.finished_on = Some(now);
                job.lease_token = None;
            }
            Ok(())
        })
    }

    async fn fail(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        reason: &str,
        decision: RetryDecision,
    ) -> QueueResult<JobState> {
        let now = self.clock.now();

        self.with_queue(queue, |state| {
            state.check_lease(id, token)?;
            state.leases.remove(id);

            let job = state
                .jobs
                .get_mut(id)
                .ok_or_else(|| QueueError::NotFound(format!("Job not found: {}", id)))?;
            job.attempts_made += 1;
            job.failed_reason = Some(reason.to_string());
            job.lease_token = None;

            let moved_to = match decision {
                RetryDecision::Retry { delay } if !delay.is_zero() => {
                    job.state = JobState::Delayed;
                    job.scheduled_at = now
                        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                    JobState::Delayed
                }
                RetryDecision::Retry { .. } => {
                    job.state = JobState::Waiting;
                    let priority = job.opts.priority_value();
                    state.push_waiting(id.clone(), priority, now);
                    JobState::Waiting
                }
                RetryDecision::Fail => {
                    job.state = JobState::Failed;
                    job.finished_on = Some(now);
                    JobState::Failed
                }
            };

            Ok(moved_to)
        })
    }

    async fn get_counts(&self, queue: &str) -> QueueResult<QueueMetrics> {
        Ok(self.with_queue(queue, |state| {
            let mut metrics = QueueMetrics::default();
            for job in state.jobs.values() {
                match state.visible_state(job.state) {
                    JobState::Waiting => metrics.waiting += 1,
                    JobState::Paused => metrics.paused += 1,
                    JobState::Active => metrics.active += 1,
                    JobState::Completed => metrics.completed += 1,
                    JobState::Failed => metrics.failed += 1,
                    JobState::Delayed => metrics.delayed += 1,
                }
            }
            metrics
        }))
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> QueueResult<Option<JobRecord>> {
        Ok(self.with_queue(queue, |state| {
            state.jobs.get(id).cloned().map(|mut job| {
                job.state = state.visible_state(job.state);
                job.lease_token = None;
                job
            })
        }))
    }

    async fn remove_job(&self, queue: &str, id: &JobId) -> QueueResult<bool> {
        self.with_queue(queue, |state| {
            match state.jobs.get(id).map(|job| job.state) {
                None => Ok(false),
                Some(JobState::Active) => Err(QueueError::InvalidState {
                    expected: "not active".to_string(),
                    actual: JobState::Active.to_string(),
                }),
                Some(_) => {
                    state.drop_waiting(id);
                    state.jobs.remove(id);
                    Ok(true)
                }
            }
        })
    }

    async fn update_progress(&self, queue: &str, id: &JobId, progress: u8) -> QueueResult<()> {
        self.with_queue(queue, |state| match state.jobs.get_mut(id) {
            Some(job) => {
                job.progress = progress.min(100);
                Ok(())
            }
            None => Err(QueueError::NotFound(format!("Job not found: {}", id))),
        })
    }

    async fn add_repeatable(&self, queue: &str, job: RepeatableJob) -> QueueResult<()> {
        self.with_queue(queue, |state| {
            state.repeatables.insert(job.key.clone(), job);
        });
        Ok(())
    }

    async fn remove_repeatable(&self, queue: &str, key: &str) -> QueueResult<bool> {
        Ok(self.with_queue(queue, |state| state.repeatables.remove(key).is_some()))
    }

    async fn list_repeatable(&self, queue: &str) -> QueueResult<Vec<RepeatableJob>> {
        Ok(self.with_queue(queue, |state| {
            let mut jobs: Vec<RepeatableJob> = state.repeatables.values().cloned().collect();
            jobs.sort_by(|a, b| a.next.cmp(&b.next).then_with(|| a.key.cmp(&b.key)));
            jobs
        }))
    }

    async fn pause(&self, queue: &str) -> QueueResult<()> {
        self.with_queue(queue, |state| state.paused = true);
        Ok(())
    }

    async fn resume(&self, queue: &str) -> QueueResult<()> {
        self.with_queue(queue, |state| state.paused = false);
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> QueueResult<bool> {
        Ok(self.with_queue(queue, |state| state.paused))
    }

    async fn clean(
        &self,
        queue: &str,
        grace: Duration,
        limit: usize,
        state_filter: JobState,
    ) -> QueueResult<Vec<JobId>> {
        if !state_filter.is_terminal() {
            return Err(QueueError::Validation(format!(
                "Only completed or failed jobs can be cleaned, got {}",
                state_filter
            )));
        }

        let cutoff = self.clock.now()
            - chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());

        Ok(self.with_queue(queue, |state| {
            let mut candidates: Vec<(DateTime<Utc>, JobId)> = state
                .jobs
                .values()
                .filter(|job| job.state == state_filter)
                .filter_map(|job| job.finished_on.map(|at| (at, job.id.clone())))
                .filter(|(at, _)| *at <= cutoff)
                .collect();
            candidates.sort();
            if limit > 0 {
                candidates.truncate(limit);
            }

            candidates
                .into_iter()
                .map(|(_, id)| {
                    state.jobs.remove(&id);
                    id
                })
                .collect()
        }))
    }

    async fn recover_stalled(&self, queue: &str, max_stalled: u32) -> QueueResult<Vec<StalledJob>> {
        let now = self.clock.now();

        Ok(self.with_queue(queue, |state| {
            let expired: Vec<JobId> = state
                .leases
                .iter()
                .filter(|(_, lease)| lease.expires_at <= now)
                .map(|(id, _)| id.clone())
                .collect();

            let mut recovered = Vec::with_capacity(expired.len());
            for id in expired {
                state.leases.remove(&id);
                let Some(job) = state.jobs.get_mut(&id) else {
                    continue;
                };

                job.stalled_count += 1;
                job.lease_token = None;
                let name = job.name.clone();

                let moved_to = if job.stalled_count > max_stalled {
                    job.state = JobState::Failed;
                    job.failed_reason = Some(STALLED_LIMIT_REASON.to_string());
                    job.finished_on = Some(now);
                    JobState::Failed
                } else {
                    job.state = JobState::Waiting;
                    let priority = job.opts.priority_value();
                    state.push_waiting(id.clone(), priority, now);
                    JobState::Waiting
                };

                recovered.push(StalledJob { id, name, moved_to });
            }
            recovered
        }))
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::job::{JobData, JobOptions, Priority, RepeatOptions};
    use serde_json::json;

    fn backend() -> (InMemoryBackend, MockClock) {
        let clock = MockClock::new();
        (InMemoryBackend::with_clock(Arc::new(clock.clone())), clock)
    }

    fn new_job(key: &str, opts: JobOptions) -> NewJob {
        let data = JobData::new(key, json!({})).unwrap();
        NewJob::new("test", &data, opts).unwrap()
    }

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_duplicate_id_rejected_until_cleaned() {
        let (backend, clock) = backend();

        let first = backend.enqueue("q", new_job("k1", JobOptions::new())).await.unwrap();
        assert_eq!(first, EnqueueOutcome::Created(JobState::Waiting));
        let second = backend.enqueue("q", new_job("k1", JobOptions::new())).await.unwrap();
        assert_eq!(second, EnqueueOutcome::Duplicate);

        let job = backend.lease("q", "w", LEASE).await.unwrap().unwrap();
        let token = job.lease_token.unwrap();
        backend.complete("q", &job.id, &token, json!(null)).await.unwrap();

        // Terminal records still block re-insertion.
        let third = backend.enqueue("q", new_job("k1", JobOptions::new())).await.unwrap();
        assert_eq!(third, EnqueueOutcome::Duplicate);

        clock.advance(Duration::from_secs(10));
        let removed = backend
            .clean("q", Duration::from_secs(5), 0, JobState::Completed)
            .await
            .unwrap();
        assert_eq!(removed, vec![JobId::from("k1")]);

        let fourth = backend.enqueue("q", new_job("k1", JobOptions::new())).await.unwrap();
        assert_eq!(fourth, EnqueueOutcome::Created(JobState::Waiting));
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let (backend, clock) = backend();

        backend
            .enqueue("q", new_job("low", JobOptions::new().priority(Priority::Low)))
            .await
            .unwrap();
        clock.advance(Duration::from_millis(1));
        backend
            .enqueue("q", new_job("normal-1", JobOptions::new().priority(Priority::Normal)))
            .await
            .unwrap();
        clock.advance(Duration::from_millis(1));
        backend
            .enqueue("q", new_job("normal-2", JobOptions::new().priority(Priority::Normal)))
            .await
            .unwrap();
        backend
            .enqueue("q", new_job("high", JobOptions::new().priority(Priority::High)))
            .await
            .unwrap();

        let mut order = Vec::new();
        while let Some(job) = backend.lease("q", "w", LEASE).await.unwrap() {
            order.push(job.id.to_string());
        }
        assert_eq!(order, vec!["high", "normal-1", "normal-2", "low"]);
    }

    #[tokio::test]
    async fn test_delayed_job_promoted_when_due() {
        let (backend, clock) = backend();

        let outcome = backend
            .enqueue("q", new_job("later", JobOptions::new().delay(Duration::from_secs(60))))
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Created(JobState::Delayed));
        assert!(backend.lease("q", "w", LEASE).await.unwrap().is_none());

        clock.advance(Duration::from_secs(60));
        let job = backend.lease("q", "w", LEASE).await.unwrap().unwrap();
        assert_eq!(job.id.as_str(), "later");
        assert_eq!(job.attempts_started, 1);
    }

    #[tokio::test]
    async fn test_paused_queue_reports_paused_and_leases_nothing() {
        let (backend, _clock) = backend();
        backend.enqueue("q", new_job("k1", JobOptions::new())).await.unwrap();
        backend.pause("q").await.unwrap();

        assert!(backend.lease("q", "w", LEASE).await.unwrap().is_none());
        let counts = backend.get_counts("q").await.unwrap();
        assert_eq!((counts.waiting, counts.paused), (0, 1));

        backend.resume("q").await.unwrap();
        assert!(backend.lease("q", "w", LEASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fail_applies_retry_decision() {
        let (backend, _clock) = backend();
        backend
            .enqueue("q", new_job("k1", JobOptions::new().attempts(2)))
            .await
            .unwrap();

        let job = backend.lease("q", "w", LEASE).await.unwrap().unwrap();
        let token = job.lease_token.clone().unwrap();
        let moved = backend
            .fail("q", &job.id, &token, "timeout", RetryDecision::Retry { delay: Duration::from_secs(5) })
            .await
            .unwrap();
        assert_eq!(moved, JobState::Delayed);

        let record = backend.get_job("q", &job.id).await.unwrap().unwrap();
        assert_eq!(record.attempts_made, 1);
        assert_eq!(record.failed_reason.as_deref(), Some("timeout"));

        // Stale token is refused.
        let err = backend.complete("q", &job.id, &token, json!(null)).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_active_job_cannot_be_removed() {
        let (backend, _clock) = backend();
        backend.enqueue("q", new_job("k1", JobOptions::new())).await.unwrap();
        let job = backend.lease("q", "w", LEASE).await.unwrap().unwrap();

        assert!(matches!(
            backend.remove_job("q", &job.id).await,
            Err(QueueError::InvalidState { .. })
        ));
        assert!(!backend.remove_job("q", &JobId::from("missing")).await.unwrap());
    }

    #[tokio::test]
    async fn test_stalled_jobs_requeued_then_failed() {
        let (backend, clock) = backend();
        backend.enqueue("q", new_job("k1", JobOptions::new())).await.unwrap();

        backend.lease("q", "w", LEASE).await.unwrap().unwrap();
        clock.advance(LEASE + Duration::from_secs(1));
        let first = backend.recover_stalled("q", 1).await.unwrap();
        assert_eq!(first[0].moved_to, JobState::Waiting);

        backend.lease("q", "w", LEASE).await.unwrap().unwrap();
        clock.advance(LEASE + Duration::from_secs(1));
        let second = backend.recover_stalled("q", 1).await.unwrap();
        assert_eq!(second[0].moved_to, JobState::Failed);

        let record = backend.get_job("q", &JobId::from("k1")).await.unwrap().unwrap();
        assert_eq!(record.failed_reason.as_deref(), Some(STALLED_LIMIT_REASON));
        assert_eq!(record.stalled_count, 2);
    }

    #[tokio::test]
    async fn test_extended_lease_does_not_stall() {
        let (backend, clock) = backend();
        backend.enqueue("q", new_job("k1", JobOptions::new())).await.unwrap();
        let job = backend.lease("q", "w", LEASE).await.unwrap().unwrap();
        let token = job.lease_token.unwrap();

        clock.advance(Duration::from_secs(20));
        assert!(backend.extend_lease("q", &job.id, &token, LEASE).await.unwrap());
        clock.advance(Duration::from_secs(20));

        assert!(backend.recover_stalled("q", 1).await.unwrap().is_empty());
        assert!(!backend.extend_lease("q", &job.id, "other", LEASE).await.unwrap());
    }

    #[tokio::test]
    async fn test_repeatable_materializes_one_instance_per_fire() {
        let (backend, clock) = backend();
        let now = clock.now();
        let repeatable = RepeatableJob::new(
            "digest",
            "daily-digest",
            json!({}),
            JobOptions::new(),
            &RepeatOptions::cron("* * * * *"),
            now,
        )
        .unwrap();
        let first_fire = repeatable.next;
        backend.add_repeatable("q", repeatable).await.unwrap();

        assert!(backend.lease("q", "w", LEASE).await.unwrap().is_none());

        clock.set(first_fire);
        let job = backend.lease("q", "w", LEASE).await.unwrap().unwrap();
        assert!(job.id.as_str().starts_with("repeat:digest:daily-digest"));
        assert!(job.repeat_key.is_some());

        let listed = backend.list_repeatable("q").await.unwrap();
        assert!(listed[0].next > first_fire);
    }

    #[tokio::test]
    async fn test_clean_rejects_non_terminal_state() {
        let (backend, _clock) = backend();
        assert!(matches!(
            backend.clean("q", Duration::ZERO, 10, JobState::Waiting).await,
            Err(QueueError::Validation(_))
        ));
    }
}
