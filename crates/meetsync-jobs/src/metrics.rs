//! Prometheus metrics for job queue monitoring.

use crate::job::QueueMetrics;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names for the job runtime.
pub mod names {
    /// Total jobs accepted by a queue.
    pub const JOBS_ENQUEUED_TOTAL: &str = "meetsync_jobs_enqueued_total";
    /// Total enqueue attempts skipped as duplicates.
    pub const JOBS_DEDUPLICATED_TOTAL: &str = "meetsync_jobs_deduplicated_total";
    /// Total jobs leased for processing.
    pub const JOBS_LEASED_TOTAL: &str = "meetsync_jobs_leased_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "meetsync_jobs_completed_total";
    /// Total failed attempts.
    pub const JOBS_FAILED_TOTAL: &str = "meetsync_jobs_failed_total";
    /// Total retries scheduled.
    pub const JOBS_RETRIED_TOTAL: &str = "meetsync_jobs_retried_total";
    /// Total stalled jobs recovered.
    pub const JOBS_STALLED_TOTAL: &str = "meetsync_jobs_stalled_total";

    /// Current jobs per state.
    pub const JOBS_CURRENT: &str = "meetsync_jobs_current";

    /// Job execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "meetsync_jobs_duration_seconds";
    /// Time from scheduled to leased, in seconds.
    pub const JOB_WAIT_TIME_SECONDS: &str = "meetsync_jobs_wait_time_seconds";

    /// Jobs currently running in a worker.
    pub const WORKERS_BUSY: &str = "meetsync_jobs_workers_busy";
    /// Worker concurrency.
    pub const WORKERS_CONCURRENCY: &str = "meetsync_jobs_workers_concurrency";

    /// Queue health (1 healthy, 0 unhealthy).
    pub const QUEUE_HEALTHY: &str = "meetsync_jobs_queue_healthy";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs enqueued");
    describe_counter!(
        names::JOBS_DEDUPLICATED_TOTAL,
        "Total number of enqueue attempts skipped as duplicates"
    );
    describe_counter!(names::JOBS_LEASED_TOTAL, "Total number of jobs leased for processing");
    describe_counter!(
        names::JOBS_COMPLETED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of failed job attempts");
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Total number of job retries");
    describe_counter!(names::JOBS_STALLED_TOTAL, "Total number of stalled jobs recovered");

    describe_gauge!(names::JOBS_CURRENT, "Current number of jobs per queue and state");

    describe_histogram!(names::JOB_DURATION_SECONDS, "Job execution duration in seconds");
    describe_histogram!(
        names::JOB_WAIT_TIME_SECONDS,
        "Time between a job becoming eligible and being leased"
    );

    describe_gauge!(names::WORKERS_BUSY, "Jobs currently running in a worker");
    describe_gauge!(names::WORKERS_CONCURRENCY, "Worker concurrency setting");
    describe_gauge!(names::QUEUE_HEALTHY, "Queue health (1 healthy, 0 unhealthy)");
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job accepted by a queue.
    pub fn job_enqueued(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_ENQUEUED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record an enqueue skipped as duplicate.
    pub fn job_deduplicated(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_DEDUPLICATED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record a job leased.
    pub fn job_leased(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_LEASED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record a job completed.
    pub fn job_completed(queue: &str, job_name: &str, duration: Duration) {
        counter!(
            names::JOBS_COMPLETED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "status" => "completed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed attempt.
    pub fn job_failed(queue: &str, job_name: &str, error_type: &str, duration: Duration) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "error_type" => error_type.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a retry.
    pub fn job_retried(queue: &str, job_name: &str, attempt: u32) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    /// Record a stalled job.
    pub fn job_stalled(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_STALLED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record job wait time.
    pub fn job_wait_time(queue: &str, job_name: &str, wait_time: Duration) {
        histogram!(
            names::JOB_WAIT_TIME_SECONDS,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .record(wait_time.as_secs_f64());
    }

    /// Update per-state gauges.
    pub fn update_queue_sizes(queue: &str, metrics: &QueueMetrics) {
        let states = [
            ("waiting", metrics.waiting),
            ("active", metrics.active),
            ("completed", metrics.completed),
            ("failed", metrics.failed),
            ("delayed", metrics.delayed),
            ("paused", metrics.paused),
        ];

        for (state, count) in states {
            gauge!(
                names::JOBS_CURRENT,
                "queue" => queue.to_string(),
                "state" => state
            )
            .set(count as f64);
        }
    }

    /// Update queue health.
    pub fn update_queue_health(queue: &str, healthy: bool) {
        gauge!(names::QUEUE_HEALTHY, "queue" => queue.to_string()).set(if healthy { 1.0 } else { 0.0 });
    }
}

/// Worker metrics recorder.
#[derive(Clone)]
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Update busy slots and concurrency.
    pub fn update_workers(queue: &str, busy: usize, concurrency: usize) {
        gauge!(names::WORKERS_BUSY, "queue" => queue.to_string()).set(busy as f64);
        gauge!(names::WORKERS_CONCURRENCY, "queue" => queue.to_string()).set(concurrency as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics() {
        // Just verify registration doesn't panic
        register_metrics();
    }

    #[test]
    fn test_job_metrics() {
        JobMetrics::job_enqueued("email", "send_email");
        JobMetrics::job_leased("email", "send_email");
        JobMetrics::job_completed("email", "send_email", Duration::from_millis(250));
        JobMetrics::job_failed("email", "send_email", "recoverable", Duration::from_secs(1));
        JobMetrics::update_queue_sizes("email", &QueueMetrics::default());
        WorkerMetrics::update_workers("email", 1, 5);
    }
}
