//! Application state for Axum handlers.

use meetsync_jobs::QueueRuntime;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<QueueRuntime>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Creates a new application state.
    pub fn new(runtime: Arc<QueueRuntime>) -> Self {
        Self {
            runtime,
            metrics: None,
        }
    }

    /// Attaches the Prometheus handle rendered at `/metrics`.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}
