//! The job runtime: one backend, one idempotency store and the business
//! queues, built once from configuration.

use crate::backend::{create_pool, DisabledBackend, InMemoryBackend, QueueBackend, RedisBackend};
use crate::clock::{Clock, SystemClock};
use crate::config::{BackendKind, JobsConfig, QueueDefinition};
use crate::error::{QueueError, QueueResult};
use crate::events::{EventBus, StateChangeListener};
use crate::idempotency::{
    DisabledKeyValueStore, IdempotencyGuard, InMemoryKeyValueStore, KeyValueStore,
    RedisKeyValueStore,
};
use crate::monitor::{LifecycleRecorder, QueueMonitor};
use crate::processor::ProcessorRegistry;
use crate::queue::JobQueue;
use crate::queues::{self, EmailQueue, ExternalApiQueue, MeetingQueue};
use crate::worker::{Worker, WorkerOptions};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Handle to the job runtime.
///
/// Producers take queue clients from it, hosts spawn workers through it,
/// and [`close`](Self::close) stops every spawned worker.
pub struct QueueRuntime {
    config: JobsConfig,
    backend: Arc<dyn QueueBackend>,
    guard: IdempotencyGuard,
    events: EventBus,
    clock: Arc<dyn Clock>,
    recorder: Arc<LifecycleRecorder>,
    queues: Vec<JobQueue>,
    monitor: QueueMonitor,
    workers: Mutex<Vec<(Worker, JoinHandle<QueueResult<()>>)>>,
    degraded: Option<String>,
}

impl QueueRuntime {
    /// Build the runtime for the configured backend.
    ///
    /// An unreachable broker does not fail startup: the runtime comes up
    /// with disabled queue features and logs the cause.
    pub async fn connect(config: JobsConfig) -> Self {
        match config.backend {
            BackendKind::Memory => Self::in_memory(config),
            BackendKind::Redis => match create_pool(&config.redis).await {
                Ok(pool) => {
                    let backend = Arc::new(RedisBackend::new(pool.clone(), config.redis.key_prefix.clone()));
                    let store = Arc::new(RedisKeyValueStore::new(pool));
                    Self::build(config, backend, store, Arc::new(SystemClock), None)
                }
                Err(e) => {
                    error!(error = %e, "Queue backend unavailable, job features disabled");
                    let reason = e.to_string();
                    Self::build(
                        config,
                        Arc::new(DisabledBackend::new(reason.clone())),
                        Arc::new(DisabledKeyValueStore),
                        Arc::new(SystemClock),
                        Some(reason),
                    )
                }
            },
        }
    }

    /// Build a runtime on the in-memory backend.
    pub fn in_memory(config: JobsConfig) -> Self {
        Self::in_memory_with_clock(config, Arc::new(SystemClock))
    }

    /// Build a runtime on the in-memory backend with a custom clock.
    pub fn in_memory_with_clock(config: JobsConfig, clock: Arc<dyn Clock>) -> Self {
        let backend = Arc::new(InMemoryBackend::with_clock(clock.clone()));
        let store = Arc::new(InMemoryKeyValueStore::with_clock(clock.clone()));
        Self::build(config, backend, store, clock, None)
    }

    fn build(
        config: JobsConfig,
        backend: Arc<dyn QueueBackend>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        degraded: Option<String>,
    ) -> Self {
        let guard = IdempotencyGuard::new(store, config.redis.key_prefix.clone())
            .enabled(config.idempotency.enabled);
        let events = EventBus::new();
        let recorder = Arc::new(LifecycleRecorder::new());
        events.subscribe(recorder.clone());

        let queues: Vec<JobQueue> = queues::definitions()
            .into_iter()
            .map(|definition| {
                JobQueue::new(
                    config.resolve(definition),
                    backend.clone(),
                    guard.clone(),
                    events.clone(),
                    clock.clone(),
                )
            })
            .collect();

        let monitor = QueueMonitor::new(queues.clone(), config.monitoring.clone(), recorder.clone());

        info!(
            backend = backend.name(),
            queues = ?queues.iter().map(|q| q.name()).collect::<Vec<_>>(),
            "Job runtime ready"
        );

        Self {
            config,
            backend,
            guard,
            events,
            clock,
            recorder,
            queues,
            monitor,
            workers: Mutex::new(Vec::new()),
            degraded,
        }
    }

    /// Add a queue beyond the business queues. Replaces a queue of the same
    /// name.
    pub fn register_queue(&mut self, definition: QueueDefinition) -> JobQueue {
        let queue = JobQueue::new(
            self.config.resolve(definition),
            self.backend.clone(),
            self.guard.clone(),
            self.events.clone(),
            self.clock.clone(),
        );

        self.queues.retain(|q| q.name() != queue.name());
        self.queues.push(queue.clone());
        self.monitor = QueueMonitor::new(
            self.queues.clone(),
            self.config.monitoring.clone(),
            self.recorder.clone(),
        );
        queue
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    /// Name of the active backend.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// The shared backend.
    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    /// Why queue features are disabled, if they are.
    pub fn degraded_reason(&self) -> Option<&str> {
        self.degraded.as_deref()
    }

    /// Returns true if the backend answers.
    pub async fn ping(&self) -> bool {
        self.backend.ping().await.is_ok()
    }

    /// Queue client by name.
    pub fn queue(&self, name: &str) -> Option<JobQueue> {
        self.queues.iter().find(|q| q.name() == name).cloned()
    }

    fn require(&self, name: &str) -> QueueResult<JobQueue> {
        self.queue(name)
            .ok_or_else(|| QueueError::NotFound(format!("Unknown queue: {}", name)))
    }

    pub fn meeting(&self) -> QueueResult<MeetingQueue> {
        self.require(MeetingQueue::NAME).map(MeetingQueue::new)
    }

    pub fn email(&self) -> QueueResult<EmailQueue> {
        self.require(EmailQueue::NAME).map(EmailQueue::new)
    }

    pub fn external_api(&self) -> QueueResult<ExternalApiQueue> {
        self.require(ExternalApiQueue::NAME).map(ExternalApiQueue::new)
    }

    pub fn monitor(&self) -> &QueueMonitor {
        &self.monitor
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Add a lifecycle listener.
    pub fn subscribe(&self, listener: Arc<dyn StateChangeListener>) {
        self.events.subscribe(listener);
    }

    /// Build a worker for `queue`; the caller drives it.
    pub fn worker(&self, queue: &str, registry: ProcessorRegistry) -> QueueResult<Worker> {
        let queue = self.require(queue)?;
        let options = WorkerOptions::from(&self.config.worker).for_queue(&queue);
        Ok(Worker::new(queue, registry, options))
    }

    /// Build a worker for `queue` and run it in the background until
    /// [`close`](Self::close).
    pub fn spawn_worker(&self, queue: &str, registry: ProcessorRegistry) -> QueueResult<Worker> {
        if registry.is_empty() {
            return Err(QueueError::Configuration(format!(
                "No processors registered for queue {}",
                queue
            )));
        }

        let worker = self.worker(queue, registry)?;
        let runner = worker.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        self.workers.lock().push((worker.clone(), handle));
        Ok(worker)
    }

    /// Stop every spawned worker and wait for them to drain.
    pub async fn close(&self) {
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        if workers.is_empty() {
            return;
        }

        info!(count = workers.len(), "Stopping job workers...");
        for (worker, _) in &workers {
            worker.stop();
        }

        let grace = self.config.worker.shutdown_timeout() + Duration::from_secs(1);
        for (worker, handle) in workers {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!(worker_id = %worker.id(), error = %e, "Worker exited with error"),
                Ok(Err(e)) => error!(worker_id = %worker.id(), error = %e, "Worker task panicked"),
                Err(_) => warn!(worker_id = %worker.id(), "Worker did not stop in time"),
            }
        }
        info!("Job runtime closed");
    }
}

impl std::fmt::Debug for QueueRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRuntime")
            .field("backend", &self.backend.name())
            .field("queues", &self.queues)
            .field("degraded", &self.degraded)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;
    use crate::job::{JobData, JobOptions};
    use serde_json::json;

    #[tokio::test]
    async fn test_unreachable_redis_degrades() {
        let config = JobsConfig {
            redis: RedisConfig {
                url: "redis://127.0.0.1:1".to_string(),
                connect_timeout_secs: 1,
                ..RedisConfig::default()
            },
            ..JobsConfig::default()
        };

        let runtime = QueueRuntime::connect(config).await;
        assert_eq!(runtime.backend_name(), "disabled");
        assert!(runtime.degraded_reason().is_some());

        let email = runtime.email().unwrap();
        let handle = email.send_verification_email("a@x.com", "123456").await.unwrap();
        assert!(handle.is_none());
        assert!(!runtime.ping().await);
    }

    #[tokio::test]
    async fn test_in_memory_runtime_has_business_queues() {
        let runtime = QueueRuntime::in_memory(JobsConfig::default());
        assert_eq!(runtime.monitor().queue_names(), vec!["meeting", "email", "external-api"]);
        assert!(runtime.queue("nope").is_none());
        assert!(matches!(
            runtime.worker("nope", ProcessorRegistry::new()),
            Err(QueueError::NotFound(_))
        ));

        let meeting = runtime.meeting().unwrap();
        assert_eq!(meeting.queue().definition().concurrency, 5);
    }

    #[tokio::test]
    async fn test_spawned_workers_stop_on_close() {
        let runtime = QueueRuntime::in_memory(JobsConfig::default());
        let registry = ProcessorRegistry::new().handle("t", |_ctx, _data| async move { Ok(json!(1)) });

        assert!(runtime.spawn_worker("email", ProcessorRegistry::new()).is_err());
        let worker = runtime.spawn_worker("email", registry).unwrap();

        runtime
            .queue("email")
            .unwrap()
            .add_job("t", JobData::new("k1", json!({})).unwrap(), JobOptions::new())
            .await
            .unwrap();

        runtime.close().await;
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn test_register_queue() {
        let mut runtime = QueueRuntime::in_memory(JobsConfig::default());
        let queue = runtime.register_queue(QueueDefinition::new("reports").concurrency(1));
        assert_eq!(queue.definition().concurrency, 1);
        assert!(runtime.monitor().queue_names().contains(&"reports"));
    }
}
