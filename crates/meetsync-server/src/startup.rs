//! Server startup utilities.

use meetsync_config::AppConfig;
use tracing::info;

/// Prints the startup banner.
pub fn print_banner() {
    info!(r#"
    __  ___          __  _____
   /  |/  /__  ___  / /_/ ___/__  ______  _____
  / /|_/ / _ \/ _ \/ __/\__ \/ / / / __ \/ ___/
 / /  / /  __/  __/ /_ ___/ / /_/ / / / / /__
/_/  /_/\___/\___/\__//____/\__, /_/ /_/\___/
                           /____/   job runtime
    "#);
}

/// Prints server startup information.
pub fn print_startup_info(config: &AppConfig, backend: &str) {
    let separator = "=".repeat(60);
    let addr = config.server.addr();
    info!("{}", separator);
    info!("Environment: {}", config.app.environment);
    info!("Backend:     {}", backend);
    info!("Health:      http://{}/health", addr);
    info!("Metrics:     http://{}/metrics", addr);
    info!("Queues API:  http://{}/api/v1/queues", addr);
    info!("{}", separator);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_banner_does_not_panic() {
        let _ = tracing_subscriber::fmt::try_init();
        print_banner();
    }

    #[test]
    fn test_print_startup_info_does_not_panic() {
        let _ = tracing_subscriber::fmt::try_init();
        print_startup_info(&AppConfig::default(), "memory");
    }
}
