//! # MeetSync Server
//!
//! Hosts the job runtime: loads configuration, connects the queue backend,
//! serves health, metrics and queue administration over HTTP, and closes
//! the runtime on shutdown.

use anyhow::Context;
use meetsync_config::ConfigLoader;
use meetsync_jobs::QueueRuntime;
use meetsync_server::{create_router, startup, telemetry, AppState};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Application error: {:#}", e);
        eprintln!("Application error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config_loader =
        ConfigLoader::from_default_location().context("Failed to load configuration")?;
    let config = config_loader.get().await;

    telemetry::init_logging(&config.logging);
    startup::print_banner();
    info!("Starting MeetSync server v{}", env!("CARGO_PKG_VERSION"));

    let metrics = telemetry::init_metrics().context("Failed to install metrics recorder")?;

    let runtime = Arc::new(QueueRuntime::connect(config.jobs.clone()).await);
    if let Some(reason) = runtime.degraded_reason() {
        warn!(reason = %reason, "Running with job features disabled");
    }

    let state = AppState::new(runtime.clone()).with_metrics(metrics);
    let router = create_router(state);

    let addr = config.server.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    startup::print_startup_info(&config, runtime.backend_name());

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    runtime.close().await;
    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
