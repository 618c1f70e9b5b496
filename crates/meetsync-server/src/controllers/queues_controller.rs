//! Queue administration REST API controller.

use crate::responses::{ok, ApiResult, AppError};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use meetsync_jobs::{
    CleanOptions, CleanReport, JobDetails, JobId, QueueError, QueueHealth, QueueMetrics,
    SystemHealth,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Create the queues router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(system_health))
        .route("/metrics", get(all_metrics))
        .route("/pause", post(pause_all))
        .route("/resume", post(resume_all))
        .route("/clean", post(clean_all))
        .route("/:queue/health", get(queue_health))
        .route("/:queue/jobs/:job_id", get(job_details))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Body of a clean request. Missing fields fall back to the configured
/// monitoring defaults.
#[derive(Debug, Default, Deserialize)]
pub struct CleanRequest {
    pub completed_max_age_secs: Option<u64>,
    pub failed_max_age_secs: Option<u64>,
    pub limit: Option<usize>,
}

impl CleanRequest {
    fn over(self, defaults: CleanOptions) -> CleanOptions {
        CleanOptions {
            completed_max_age: self
                .completed_max_age_secs
                .map_or(defaults.completed_max_age, Duration::from_secs),
            failed_max_age: self
                .failed_max_age_secs
                .map_or(defaults.failed_max_age, Duration::from_secs),
            limit: self.limit.unwrap_or(defaults.limit),
        }
    }
}

/// Simple message response.
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

// ============================================================================
// Handler Functions
// ============================================================================

async fn system_health(State(state): State<AppState>) -> ApiResult<SystemHealth> {
    ok(state.runtime.monitor().get_system_health().await)
}

async fn all_metrics(State(state): State<AppState>) -> ApiResult<BTreeMap<String, QueueMetrics>> {
    ok(state.runtime.monitor().get_all_queue_metrics().await)
}

async fn queue_health(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> ApiResult<QueueHealth> {
    if state.runtime.queue(&queue).is_none() {
        return Err(QueueError::NotFound(format!("Unknown queue: {}", queue)).into());
    }
    ok(state.runtime.monitor().get_queue_health(&queue).await)
}

async fn job_details(
    State(state): State<AppState>,
    Path((queue, job_id)): Path<(String, String)>,
) -> ApiResult<JobDetails> {
    let details = state
        .runtime
        .monitor()
        .get_job_details(&queue, &JobId::from(job_id.as_str()))
        .await?
        .ok_or_else(|| AppError(QueueError::NotFound(format!("Job {} in queue {}", job_id, queue))))?;
    ok(details)
}

async fn pause_all(State(state): State<AppState>) -> ApiResult<MessageResponse> {
    state.runtime.monitor().pause_all().await?;
    ok(MessageResponse {
        message: "All queues paused".to_string(),
    })
}

async fn resume_all(State(state): State<AppState>) -> ApiResult<MessageResponse> {
    state.runtime.monitor().resume_all().await?;
    ok(MessageResponse {
        message: "All queues resumed".to_string(),
    })
}

async fn clean_all(
    State(state): State<AppState>,
    body: Option<Json<CleanRequest>>,
) -> ApiResult<Vec<CleanReport>> {
    let defaults = CleanOptions::from(&state.runtime.config().monitoring);
    let options = body.map(|Json(request)| request).unwrap_or_default().over(defaults);
    ok(state.runtime.monitor().clean_all(options).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_request_falls_back_to_defaults() {
        let defaults = CleanOptions {
            completed_max_age: Duration::from_secs(100),
            failed_max_age: Duration::from_secs(200),
            limit: 10,
        };

        let options = CleanRequest {
            failed_max_age_secs: Some(5),
            ..CleanRequest::default()
        }
        .over(defaults);

        assert_eq!(options.completed_max_age, Duration::from_secs(100));
        assert_eq!(options.failed_max_age, Duration::from_secs(5));
        assert_eq!(options.limit, 10);
    }
}
