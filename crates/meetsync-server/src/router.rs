//! Main application router.

use crate::{
    controllers::{health_controller, queues_controller},
    middleware::logging_middleware,
    state::AppState,
};
use axum::{middleware, routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Creates the main application router.
pub fn create_router(state: AppState) -> Router {
    let api_router = Router::new().nest("/queues", queues_controller::router());

    let router = Router::new()
        // Probes and Prometheus exposition
        .merge(health_controller::router())
        // API v1
        .nest("/api/v1", api_router)
        .route("/", get(root))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(logging_middleware))
        .with_state(state);

    info!("Router created with health, metrics and queue administration endpoints");
    router
}

/// Root endpoint handler.
async fn root() -> &'static str {
    "MeetSync job runtime API v1"
}
