//! Cross-queue monitoring and administration.

use crate::config::MonitoringConfig;
use crate::error::{QueueError, QueueResult};
use crate::events::{LifecycleEvent, StateChange, StateChangeListener};
use crate::job::{JobDetails, JobId, JobState, QueueMetrics};
use crate::metrics::JobMetrics;
use crate::queue::JobQueue;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Health of one queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueHealth {
    pub queue: String,
    pub healthy: bool,
    pub issues: Vec<String>,
    pub metrics: QueueMetrics,
}

/// Lifecycle transitions observed per queue since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub stalled: u64,
}

impl LifecycleCounts {
    fn record(&mut self, event: LifecycleEvent) {
        let slot = match event {
            LifecycleEvent::Waiting => &mut self.waiting,
            LifecycleEvent::Delayed => &mut self.delayed,
            LifecycleEvent::Active => &mut self.active,
            LifecycleEvent::Progress => &mut self.progress,
            LifecycleEvent::Completed => &mut self.completed,
            LifecycleEvent::Failed => &mut self.failed,
            LifecycleEvent::Stalled => &mut self.stalled,
        };
        *slot += 1;
    }
}

/// Health of every queue plus aggregate counts.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub healthy: bool,
    pub timestamp: DateTime<Utc>,
    pub queues: Vec<QueueHealth>,
    pub totals: QueueMetrics,
    pub lifecycle: BTreeMap<String, LifecycleCounts>,
}

/// Age-based cleanup of terminal jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanOptions {
    pub completed_max_age: Duration,
    pub failed_max_age: Duration,
    /// Maximum jobs removed per queue and state; zero removes all.
    pub limit: usize,
}

impl From<&MonitoringConfig> for CleanOptions {
    fn from(config: &MonitoringConfig) -> Self {
        Self {
            completed_max_age: Duration::from_secs(config.completed_max_age_secs),
            failed_max_age: Duration::from_secs(config.failed_max_age_secs),
            limit: config.clean_limit,
        }
    }
}

/// Jobs removed from one queue by a cleanup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanReport {
    pub queue: String,
    pub completed: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Listener that logs transitions and tallies them per queue.
#[derive(Debug, Default)]
pub struct LifecycleRecorder {
    counts: Mutex<BTreeMap<String, LifecycleCounts>>,
}

impl LifecycleRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tallies of one queue.
    pub fn counts(&self, queue: &str) -> LifecycleCounts {
        self.counts.lock().get(queue).copied().unwrap_or_default()
    }

    /// Tallies of every queue that emitted events.
    pub fn snapshot(&self) -> BTreeMap<String, LifecycleCounts> {
        self.counts.lock().clone()
    }
}

impl StateChangeListener for LifecycleRecorder {
    fn on_state_change(&self, change: &StateChange) {
        self.counts
            .lock()
            .entry(change.queue.clone())
            .or_default()
            .record(change.event);

        match change.event {
            LifecycleEvent::Failed => warn!(
                queue = %change.queue,
                job_id = %change.job_id,
                job_name = %change.job_name,
                attempt = change.attempt,
                will_retry = change.will_retry,
                reason = change.reason.as_deref().unwrap_or_default(),
                "Job failed"
            ),
            LifecycleEvent::Stalled => warn!(
                queue = %change.queue,
                job_id = %change.job_id,
                job_name = %change.job_name,
                "Job stalled"
            ),
            event => debug!(
                queue = %change.queue,
                job_id = %change.job_id,
                job_name = %change.job_name,
                event = %event,
                attempt = change.attempt,
                "Job state changed"
            ),
        }
    }
}

/// Read-mostly view over every managed queue.
///
/// Administrative operations mutate queue-wide state only (pause, resume,
/// clean); job states are never touched.
#[derive(Debug, Clone)]
pub struct QueueMonitor {
    queues: Vec<JobQueue>,
    thresholds: MonitoringConfig,
    recorder: Arc<LifecycleRecorder>,
}

impl QueueMonitor {
    pub fn new(
        queues: Vec<JobQueue>,
        thresholds: MonitoringConfig,
        recorder: Arc<LifecycleRecorder>,
    ) -> Self {
        Self {
            queues,
            thresholds,
            recorder,
        }
    }

    /// Names of the managed queues.
    pub fn queue_names(&self) -> Vec<&str> {
        self.queues.iter().map(|q| q.name()).collect()
    }

    pub fn recorder(&self) -> &Arc<LifecycleRecorder> {
        &self.recorder
    }

    fn find(&self, queue: &str) -> QueueResult<&JobQueue> {
        self.queues
            .iter()
            .find(|q| q.name() == queue)
            .ok_or_else(|| QueueError::NotFound(format!("Unknown queue: {}", queue)))
    }

    /// Counts of one queue; zeros when the backend is unavailable.
    pub async fn get_queue_metrics(&self, queue: &str) -> QueueResult<QueueMetrics> {
        self.find(queue)?.get_queue_stats().await
    }

    /// Counts of every queue.
    pub async fn get_all_queue_metrics(&self) -> BTreeMap<String, QueueMetrics> {
        let mut all = BTreeMap::new();
        for queue in &self.queues {
            let metrics = match queue.get_queue_stats().await {
                Ok(metrics) => metrics,
                Err(e) => {
                    warn!(queue = %queue.name(), error = %e, "Failed to read queue metrics");
                    QueueMetrics::default()
                }
            };
            all.insert(queue.name().to_string(), metrics);
        }
        all
    }

    /// Evaluate thresholds for one queue.
    pub async fn get_queue_health(&self, queue: &str) -> QueueHealth {
        let Ok(job_queue) = self.find(queue) else {
            return QueueHealth {
                queue: queue.to_string(),
                healthy: false,
                issues: vec![format!("Unknown queue: {}", queue)],
                metrics: QueueMetrics::default(),
            };
        };

        let health = match job_queue.backend().get_counts(queue).await {
            Ok(metrics) => {
                JobMetrics::update_queue_sizes(queue, &metrics);
                self.evaluate(queue, metrics)
            }
            Err(e) => QueueHealth {
                queue: queue.to_string(),
                healthy: false,
                issues: vec![format!("Failed to read queue metrics: {}", e)],
                metrics: QueueMetrics::default(),
            },
        };

        JobMetrics::update_queue_health(queue, health.healthy);
        health
    }

    fn evaluate(&self, queue: &str, metrics: QueueMetrics) -> QueueHealth {
        let mut issues = Vec::new();

        if metrics.waiting > self.thresholds.max_waiting {
            issues.push(format!(
                "High number of waiting jobs: {} (threshold {})",
                metrics.waiting, self.thresholds.max_waiting
            ));
        }
        if metrics.failed > self.thresholds.max_failed {
            issues.push(format!(
                "High number of failed jobs: {} (threshold {})",
                metrics.failed, self.thresholds.max_failed
            ));
        }
        if metrics.active == 0 && metrics.waiting > 0 {
            issues.push("No active jobs while jobs are waiting; workers may be down".to_string());
        }

        QueueHealth {
            queue: queue.to_string(),
            healthy: issues.is_empty(),
            issues,
            metrics,
        }
    }

    /// Health of every queue and aggregate totals.
    pub async fn get_system_health(&self) -> SystemHealth {
        let mut queues = Vec::with_capacity(self.queues.len());
        let mut totals = QueueMetrics::default();

        for queue in &self.queues {
            let health = self.get_queue_health(queue.name()).await;
            totals.accumulate(&health.metrics);
            queues.push(health);
        }

        SystemHealth {
            healthy: queues.iter().all(|q| q.healthy),
            timestamp: Utc::now(),
            queues,
            totals,
            lifecycle: self.recorder.snapshot(),
        }
    }

    /// Pause every queue. Every queue is attempted; failures are reported
    /// together.
    pub async fn pause_all(&self) -> QueueResult<()> {
        let mut failed = Vec::new();
        for queue in &self.queues {
            if let Err(e) = queue.pause_queue().await {
                warn!(queue = %queue.name(), error = %e, "Failed to pause queue");
                failed.push(queue.name().to_string());
            }
        }
        Self::summarize("pause", failed)
    }

    /// Resume every queue.
    pub async fn resume_all(&self) -> QueueResult<()> {
        let mut failed = Vec::new();
        for queue in &self.queues {
            if let Err(e) = queue.resume_queue().await {
                warn!(queue = %queue.name(), error = %e, "Failed to resume queue");
                failed.push(queue.name().to_string());
            }
        }
        Self::summarize("resume", failed)
    }

    fn summarize(action: &str, failed: Vec<String>) -> QueueResult<()> {
        if failed.is_empty() {
            info!(action = action, "Applied to all queues");
            Ok(())
        } else {
            Err(QueueError::Internal(format!(
                "Failed to {} queues: {}",
                action,
                failed.join(", ")
            )))
        }
    }

    /// Remove old completed and failed jobs from every queue.
    pub async fn clean_all(&self, options: CleanOptions) -> Vec<CleanReport> {
        let mut reports = Vec::with_capacity(self.queues.len());

        for queue in &self.queues {
            let mut report = CleanReport {
                queue: queue.name().to_string(),
                ..CleanReport::default()
            };

            match queue
                .clean_queue(options.completed_max_age, options.limit, JobState::Completed)
                .await
            {
                Ok(removed) => report.completed = removed.len(),
                Err(e) => report.error = Some(e.to_string()),
            }

            if report.error.is_none() {
                match queue
                    .clean_queue(options.failed_max_age, options.limit, JobState::Failed)
                    .await
                {
                    Ok(removed) => report.failed = removed.len(),
                    Err(e) => report.error = Some(e.to_string()),
                }
            }

            if let Some(error) = &report.error {
                warn!(queue = %queue.name(), error = %error, "Failed to clean queue");
            }
            reports.push(report);
        }

        let removed: usize = reports.iter().map(|r| r.completed + r.failed).sum();
        info!(removed = removed, "Cleaned all queues");
        reports
    }

    /// Introspect one job.
    pub async fn get_job_details(&self, queue: &str, job_id: &JobId) -> QueueResult<Option<JobDetails>> {
        self.find(queue)?.get_job(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DisabledBackend, InMemoryBackend, QueueBackend};
    use crate::clock::SystemClock;
    use crate::config::QueueDefinition;
    use crate::events::EventBus;
    use crate::idempotency::{IdempotencyGuard, InMemoryKeyValueStore};
    use crate::job::{JobData, JobOptions};
    use serde_json::json;

    fn monitor_with(backend: Arc<dyn QueueBackend>, thresholds: MonitoringConfig) -> QueueMonitor {
        let events = EventBus::new();
        let recorder = Arc::new(LifecycleRecorder::new());
        events.subscribe(recorder.clone());
        let guard = IdempotencyGuard::new(Arc::new(InMemoryKeyValueStore::new()), "test");

        let queues = ["a", "b"]
            .into_iter()
            .map(|name| {
                JobQueue::new(
                    QueueDefinition::new(name),
                    backend.clone(),
                    guard.clone(),
                    events.clone(),
                    Arc::new(SystemClock),
                )
            })
            .collect();

        QueueMonitor::new(queues, thresholds, recorder)
    }

    async fn enqueue(monitor: &QueueMonitor, queue: &str, key: &str) {
        monitor
            .find(queue)
            .unwrap()
            .add_job("t", JobData::new(key, json!({})).unwrap(), JobOptions::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_waiting_without_active_is_flagged() {
        let monitor = monitor_with(Arc::new(InMemoryBackend::new()), MonitoringConfig::default());
        assert!(monitor.get_queue_health("a").await.healthy);

        enqueue(&monitor, "a", "k1").await;
        let health = monitor.get_queue_health("a").await;
        assert!(!health.healthy);
        assert_eq!(health.issues.len(), 1);
        assert!(health.issues[0].contains("workers may be down"));
    }

    #[tokio::test]
    async fn test_thresholds() {
        let thresholds = MonitoringConfig {
            max_waiting: 1,
            ..MonitoringConfig::default()
        };
        let monitor = monitor_with(Arc::new(InMemoryBackend::new()), thresholds);
        enqueue(&monitor, "a", "k1").await;
        enqueue(&monitor, "a", "k2").await;

        let health = monitor.get_queue_health("a").await;
        assert_eq!(health.issues.len(), 2);
        assert!(health.issues[0].contains("waiting"));
    }

    #[tokio::test]
    async fn test_unknown_queue_and_unavailable_backend() {
        let monitor = monitor_with(Arc::new(InMemoryBackend::new()), MonitoringConfig::default());
        assert!(!monitor.get_queue_health("nope").await.healthy);
        assert!(matches!(
            monitor.get_job_details("nope", &JobId::from("x")).await,
            Err(QueueError::NotFound(_))
        ));

        let monitor = monitor_with(Arc::new(DisabledBackend::new("down")), MonitoringConfig::default());
        let system = monitor.get_system_health().await;
        assert!(!system.healthy);
        assert_eq!(system.totals, QueueMetrics::default());
        monitor.pause_all().await.unwrap();
        monitor.resume_all().await.unwrap();
        let reports = monitor.clean_all(CleanOptions::from(&MonitoringConfig::default())).await;
        assert!(reports.iter().all(|r| r.error.is_none() && r.completed == 0));
        assert!(monitor
            .get_job_details("a", &JobId::from("x"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_system_totals_and_lifecycle_tallies() {
        let monitor = monitor_with(Arc::new(InMemoryBackend::new()), MonitoringConfig::default());
        enqueue(&monitor, "a", "k1").await;
        enqueue(&monitor, "b", "k2").await;
        enqueue(&monitor, "b", "k3").await;

        let system = monitor.get_system_health().await;
        assert_eq!(system.totals.waiting, 3);
        assert_eq!(system.queues.len(), 2);
        assert_eq!(system.lifecycle["b"].waiting, 2);
        assert_eq!(monitor.recorder().counts("a").waiting, 1);
    }

    #[tokio::test]
    async fn test_pause_and_resume_all() {
        let monitor = monitor_with(Arc::new(InMemoryBackend::new()), MonitoringConfig::default());
        monitor.pause_all().await.unwrap();
        for queue in &monitor.queues {
            assert!(queue.is_paused().await);
        }

        monitor.resume_all().await.unwrap();
        for queue in &monitor.queues {
            assert!(!queue.is_paused().await);
        }
    }

    #[tokio::test]
    async fn test_clean_all_reports_per_queue() {
        let monitor = monitor_with(Arc::new(InMemoryBackend::new()), MonitoringConfig::default());
        let reports = monitor
            .clean_all(CleanOptions {
                completed_max_age: Duration::ZERO,
                failed_max_age: Duration::ZERO,
                limit: 0,
            })
            .await;

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.error.is_none() && r.completed == 0));
    }
}
