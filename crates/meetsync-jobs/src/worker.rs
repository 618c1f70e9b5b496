//! Per-queue worker: leases jobs and runs them through their processors.

use crate::config::WorkerConfig;
use crate::error::{QueueError, QueueResult};
use crate::events::{LifecycleEvent, StateChange};
use crate::job::{JobData, JobRecord, JobResult, JobState};
use crate::metrics::{JobMetrics, WorkerMetrics};
use crate::processor::{JobContext, ProcessorError, ProcessorRegistry};
use crate::queue::JobQueue;
use crate::retry::RetryDecision;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Semaphore};
use tokio::time::{interval_at, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Worker settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOptions {
    /// Jobs executed in parallel.
    pub concurrency: usize,

    /// Sleep between lease attempts when the queue is empty.
    pub poll_interval: Duration,

    /// Visibility timeout of a lease; renewed every half period.
    pub lease_duration: Duration,

    /// Interval of the stalled-job check.
    pub stalled_interval: Duration,

    /// Stalls tolerated before a job fails.
    pub max_stalled_count: u32,

    /// Jobs older than this are failed without running.
    pub max_job_age: Duration,

    /// Grace period for in-flight jobs on stop.
    pub shutdown_timeout: Duration,

    /// How long job results are remembered.
    pub idempotency_ttl: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for WorkerOptions {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            poll_interval: config.poll_interval(),
            lease_duration: config.lease_duration(),
            stalled_interval: config.stalled_interval(),
            max_stalled_count: config.max_stalled_count,
            max_job_age: config.max_job_age(),
            shutdown_timeout: config.shutdown_timeout(),
            idempotency_ttl: Duration::from_secs(86_400),
        }
    }
}

impl WorkerOptions {
    /// Take concurrency and idempotency TTL from the queue definition when
    /// it sets them.
    pub fn for_queue(mut self, queue: &JobQueue) -> Self {
        let definition = queue.definition();
        if definition.concurrency > 0 {
            self.concurrency = definition.concurrency;
        }
        if !definition.idempotency_ttl.is_zero() {
            self.idempotency_ttl = definition.idempotency_ttl;
        }
        self
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.lease_duration / 2).max(Duration::from_millis(10))
    }
}

struct WorkerInner {
    id: String,
    queue: JobQueue,
    registry: ProcessorRegistry,
    options: WorkerOptions,
    shutdown_tx: broadcast::Sender<()>,
    stopping: AtomicBool,
    running: AtomicBool,
    busy: AtomicUsize,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
}

/// Consumer of one queue with bounded concurrency.
///
/// Cheap to clone; clones drive the same worker.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    /// Create a worker for `queue` dispatching to `registry`.
    pub fn new(queue: JobQueue, registry: ProcessorRegistry, options: WorkerOptions) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            inner: Arc::new(WorkerInner {
                id: format!("worker-{}-{}", queue.name(), Uuid::new_v4()),
                queue,
                registry,
                options,
                shutdown_tx,
                stopping: AtomicBool::new(false),
                running: AtomicBool::new(false),
                busy: AtomicUsize::new(0),
                jobs_completed: AtomicU64::new(0),
                jobs_failed: AtomicU64::new(0),
            }),
        }
    }

    /// Worker id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Queue name.
    pub fn queue_name(&self) -> &str {
        self.inner.queue.name()
    }

    /// Resolved worker options.
    pub fn options(&self) -> &WorkerOptions {
        &self.inner.options
    }

    /// Returns true while `run` is executing.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Jobs acknowledged as completed by this worker.
    pub fn jobs_completed(&self) -> u64 {
        self.inner.jobs_completed.load(Ordering::Relaxed)
    }

    /// Attempts that failed in this worker.
    pub fn jobs_failed(&self) -> u64 {
        self.inner.jobs_failed.load(Ordering::Relaxed)
    }

    /// Jobs currently executing.
    pub fn busy(&self) -> usize {
        self.inner.busy.load(Ordering::Relaxed)
    }

    /// Lease and process jobs until [`stop`](Self::stop) is called.
    pub async fn run(&self) -> QueueResult<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(QueueError::Worker(format!(
                "Worker {} already running",
                self.inner.id
            )));
        }

        let options = &self.inner.options;
        let queue_name = self.queue_name().to_string();

        info!(
            worker_id = %self.inner.id,
            queue = %queue_name,
            concurrency = options.concurrency,
            job_types = ?self.inner.registry.job_types(),
            "Starting worker"
        );
        WorkerMetrics::update_workers(&queue_name, 0, options.concurrency);

        let semaphore = Arc::new(Semaphore::new(options.concurrency));
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let mut stalled_check = interval_at(
            tokio::time::Instant::now() + options.stalled_interval,
            options.stalled_interval.max(Duration::from_millis(10)),
        );
        stalled_check.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !self.inner.stopping.load(Ordering::SeqCst) {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(worker_id = %self.inner.id, "Received shutdown signal");
                    break;
                }

                _ = stalled_check.tick() => {
                    self.check_stalled().await;
                }

                permit = semaphore.clone().acquire_owned() => {
                    let Ok(permit) = permit else {
                        break;
                    };

                    match self.lease().await {
                        Ok(Some(record)) => {
                            let worker = self.clone();
                            let span = tracing::info_span!(
                                "job",
                                queue = %queue_name,
                                job_id = %record.id,
                                job_name = %record.name
                            );
                            tokio::spawn(
                                async move {
                                    worker.process_job(record).await;
                                    drop(permit);
                                }
                                .instrument(span),
                            );
                        }
                        Ok(None) => {
                            drop(permit);
                            tokio::time::sleep(options.poll_interval).await;
                        }
                        Err(e) => {
                            drop(permit);
                            if e.is_backend_unavailable() {
                                debug!(queue = %queue_name, error = %e, "Queue backend unavailable");
                            } else {
                                error!(queue = %queue_name, error = %e, "Failed to lease job");
                            }
                            tokio::time::sleep(options.poll_interval).await;
                        }
                    }
                }
            }
        }

        info!(worker_id = %self.inner.id, "Waiting for in-flight jobs to finish...");
        let permits = u32::try_from(options.concurrency).unwrap_or(u32::MAX);
        if timeout(options.shutdown_timeout, semaphore.acquire_many(permits))
            .await
            .is_err()
        {
            warn!(
                worker_id = %self.inner.id,
                in_flight = self.busy(),
                "Shutdown timeout elapsed with jobs still running"
            );
        }

        self.inner.running.store(false, Ordering::SeqCst);
        WorkerMetrics::update_workers(&queue_name, 0, options.concurrency);

        info!(
            worker_id = %self.inner.id,
            completed = self.jobs_completed(),
            failed = self.jobs_failed(),
            "Worker stopped"
        );
        Ok(())
    }

    /// Signal `run` to stop leasing and drain.
    pub fn stop(&self) {
        info!(worker_id = %self.inner.id, "Stopping worker...");
        self.inner.stopping.store(true, Ordering::SeqCst);
        let _ = self.inner.shutdown_tx.send(());
    }

    /// Lease one job and process it. Returns `None` when nothing was
    /// eligible.
    pub async fn process_next(&self) -> QueueResult<Option<JobResult>> {
        match self.lease().await? {
            Some(record) => Ok(Some(self.process_job(record).await)),
            None => Ok(None),
        }
    }

    async fn lease(&self) -> QueueResult<Option<JobRecord>> {
        let queue = &self.inner.queue;
        let record = queue
            .backend()
            .lease(queue.name(), &self.inner.id, self.inner.options.lease_duration)
            .await?;

        if let Some(record) = &record {
            JobMetrics::job_leased(queue.name(), &record.name);
            let waited = (queue.clock().now() - record.scheduled_at)
                .to_std()
                .unwrap_or_default();
            JobMetrics::job_wait_time(queue.name(), &record.name, waited);
        }
        Ok(record)
    }

    /// Run a leased job: validate, execute, classify, record the result,
    /// then acknowledge.
    pub async fn process_job(&self, record: JobRecord) -> JobResult {
        let started = Instant::now();
        let queue = &self.inner.queue;
        let attempt = record.attempts_made + 1;
        let busy = self.inner.busy.fetch_add(1, Ordering::Relaxed) + 1;
        WorkerMetrics::update_workers(queue.name(), busy, self.inner.options.concurrency);

        if record.stalled_count > 0 {
            warn!(
                job_id = %record.id,
                stalled_count = record.stalled_count,
                "Re-running job after stall"
            );
        }

        debug!(
            job_id = %record.id,
            job_name = %record.name,
            attempt = attempt,
            max_attempts = record.max_attempts(),
            worker_id = %self.inner.id,
            "Processing job"
        );
        queue.events().emit(
            StateChange::new(queue.name(), record.id.clone(), record.name.clone(), LifecycleEvent::Active)
                .attempt(attempt),
        );

        let result = match JobData::from_value(&record.data) {
            Ok(data) => match self.check_age(&record, &data) {
                Ok(()) => self.execute(&record, data, started).await,
                Err(err) => {
                    self.finish_failure(&record, Some(&data.idempotency_key), err, started)
                        .await
                }
            },
            Err(e) => {
                let err = ProcessorError::unrecoverable(e.to_string());
                self.finish_failure(&record, None, err, started).await
            }
        };

        let busy = self.inner.busy.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        WorkerMetrics::update_workers(queue.name(), busy, self.inner.options.concurrency);
        result
    }

    /// Reject jobs that sat eligible for longer than `max_job_age`. Age
    /// counts from the later of the payload timestamp and the time the job
    /// became eligible, so a requested delay never counts as staleness.
    fn check_age(&self, record: &JobRecord, data: &JobData) -> Result<(), ProcessorError> {
        let max_age = self.inner.options.max_job_age;
        if max_age.is_zero() {
            return Ok(());
        }

        let now = self.inner.queue.clock().now();
        let age = data.age(now).min(
            (now - record.eligible_at())
                .to_std()
                .unwrap_or_default(),
        );
        if age > max_age {
            return Err(ProcessorError::unrecoverable(format!(
                "Job too old: {}s exceeds maximum age of {}s",
                age.as_secs(),
                max_age.as_secs()
            )));
        }

        Ok(())
    }

    async fn execute(&self, record: &JobRecord, data: JobData, started: Instant) -> JobResult {
        let queue = &self.inner.queue;
        let key = data.idempotency_key.as_str();

        if let Some(prior) = queue.guard().get_result(queue.name(), key).await {
            if prior.success {
                info!(job_id = %record.id, idempotency_key = %key, "Job already processed, acknowledging recorded result");
                let value = prior.data.clone().unwrap_or(Value::Null);
                self.acknowledge(record, value, started.elapsed()).await;
                return prior;
            }
        }

        let Some(processor) = self.inner.registry.get(&record.name) else {
            let err = ProcessorError::unrecoverable(format!(
                "No processor registered for job type: {}",
                record.name
            ));
            return self.finish_failure(record, Some(key), err, started).await;
        };

        let ctx = JobContext::new(
            record.id.clone(),
            queue.name(),
            record.name.clone(),
            record.attempts_made + 1,
            record.max_attempts(),
            data.correlation_id.clone(),
            self.inner.id.clone(),
            queue.backend().clone(),
            queue.events().clone(),
        );

        let outcome = {
            let work = processor.process(&ctx, &data);
            tokio::pin!(work);

            let period = self.inner.options.heartbeat_interval();
            let mut heartbeat = interval_at(tokio::time::Instant::now() + period, period);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    outcome = &mut work => break outcome,
                    _ = heartbeat.tick() => self.extend_lease(record).await,
                }
            }
        };

        match outcome {
            Ok(value) => {
                let duration = started.elapsed();
                let result = JobResult::success(value.clone(), duration);
                queue
                    .guard()
                    .mark_processed(queue.name(), key, &result, self.inner.options.idempotency_ttl)
                    .await;
                self.acknowledge(record, value, duration).await;
                result
            }
            Err(err) => self.finish_failure(record, Some(key), err, started).await,
        }
    }

    async fn extend_lease(&self, record: &JobRecord) {
        let queue = &self.inner.queue;
        let token = record.lease_token.as_deref().unwrap_or_default();

        match queue
            .backend()
            .extend_lease(queue.name(), &record.id, token, self.inner.options.lease_duration)
            .await
        {
            Ok(true) => debug!(job_id = %record.id, "Extended job lease"),
            Ok(false) => warn!(job_id = %record.id, "Job lease lost while running"),
            Err(e) => warn!(job_id = %record.id, error = %e, "Failed to extend job lease"),
        }
    }

    async fn acknowledge(&self, record: &JobRecord, value: Value, duration: Duration) {
        let queue = &self.inner.queue;
        let token = record.lease_token.as_deref().unwrap_or_default();

        match queue.backend().complete(queue.name(), &record.id, token, value).await {
            Ok(()) => {
                debug!(job_id = %record.id, duration_ms = duration.as_millis() as u64, "Job completed successfully");
                self.inner.jobs_completed.fetch_add(1, Ordering::Relaxed);
                JobMetrics::job_completed(queue.name(), &record.name, duration);
                queue.events().emit(
                    StateChange::new(queue.name(), record.id.clone(), record.name.clone(), LifecycleEvent::Completed)
                        .attempt(record.attempts_made + 1)
                        .duration(duration),
                );
            }
            Err(e @ QueueError::InvalidState { .. }) => {
                warn!(job_id = %record.id, error = %e, "Lease lost before completion, job will be retried by the backend");
            }
            Err(e) => {
                error!(job_id = %record.id, error = %e, "Failed to mark job as complete");
            }
        }
    }

    async fn finish_failure(
        &self,
        record: &JobRecord,
        key: Option<&str>,
        err: ProcessorError,
        started: Instant,
    ) -> JobResult {
        let queue = &self.inner.queue;
        let duration = started.elapsed();
        let attempt = record.attempts_made + 1;
        let result = JobResult::failure(err.message(), duration);

        if let Some(key) = key {
            queue
                .guard()
                .mark_processed(queue.name(), key, &result, self.inner.options.idempotency_ttl)
                .await;
        }

        let decision = RetryDecision::decide(
            attempt,
            record.max_attempts(),
            record.opts.backoff.as_ref(),
            err.is_unrecoverable(),
        );
        let error_type = if err.is_unrecoverable() {
            "unrecoverable"
        } else {
            "recoverable"
        };

        self.inner.jobs_failed.fetch_add(1, Ordering::Relaxed);
        JobMetrics::job_failed(queue.name(), &record.name, error_type, duration);

        let token = record.lease_token.as_deref().unwrap_or_default();
        let moved_to = match queue
            .backend()
            .fail(queue.name(), &record.id, token, err.message(), decision)
            .await
        {
            Ok(state) => state,
            Err(e @ QueueError::InvalidState { .. }) => {
                warn!(job_id = %record.id, error = %e, "Lease lost before failure was recorded");
                return result;
            }
            Err(e) => {
                error!(job_id = %record.id, error = %e, "Failed to mark job as failed");
                return result;
            }
        };

        let will_retry = moved_to != JobState::Failed;
        if will_retry {
            warn!(
                job_id = %record.id,
                attempt = attempt,
                max_attempts = record.max_attempts(),
                error = %err,
                "Job attempt failed, will retry"
            );
            JobMetrics::job_retried(queue.name(), &record.name, attempt);
        } else {
            error!(
                job_id = %record.id,
                attempt = attempt,
                unrecoverable = err.is_unrecoverable(),
                error = %err,
                "Job failed permanently"
            );
        }

        queue.events().emit(
            StateChange::new(queue.name(), record.id.clone(), record.name.clone(), LifecycleEvent::Failed)
                .attempt(attempt)
                .reason(err.message())
                .duration(duration)
                .will_retry(will_retry),
        );

        let requeued = match moved_to {
            JobState::Delayed => Some(LifecycleEvent::Delayed),
            JobState::Waiting => Some(LifecycleEvent::Waiting),
            _ => None,
        };
        if let Some(event) = requeued {
            queue.events().emit(
                StateChange::new(queue.name(), record.id.clone(), record.name.clone(), event)
                    .attempt(attempt),
            );
        }

        result
    }

    /// Return jobs with expired leases to the queue; jobs that stalled too
    /// often are failed.
    pub async fn check_stalled(&self) -> usize {
        let queue = &self.inner.queue;
        let stalled = match queue
            .backend()
            .recover_stalled(queue.name(), self.inner.options.max_stalled_count)
            .await
        {
            Ok(stalled) => stalled,
            Err(e) => {
                debug!(queue = %queue.name(), error = %e, "Stalled job check failed");
                return 0;
            }
        };

        for job in &stalled {
            warn!(
                queue = %queue.name(),
                job_id = %job.id,
                job_name = %job.name,
                moved_to = %job.moved_to,
                "Recovered stalled job"
            );
            JobMetrics::job_stalled(queue.name(), &job.name);

            let mut change = StateChange::new(queue.name(), job.id.clone(), job.name.clone(), LifecycleEvent::Stalled);
            if job.moved_to == JobState::Failed {
                change = change.reason(crate::backend::STALLED_LIMIT_REASON);
            }
            queue.events().emit(change);
        }

        stalled.len()
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.inner.id)
            .field("queue", &self.inner.queue.name())
            .field("registry", &self.inner.registry)
            .field("options", &self.inner.options)
            .finish()
    }
}
