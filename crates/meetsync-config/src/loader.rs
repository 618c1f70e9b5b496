//! Configuration loader with layered sources.

use crate::{format_validation_errors, AppConfig, ConfigValidationError, ConfigValidator};
use config::{Config, Environment, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "MEETSYNC";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or deserialized.
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// The merged configuration is invalid.
    #[error("{}", format_validation_errors(.0))]
    Invalid(Vec<ConfigValidationError>),
}

/// Configuration loader with runtime refresh support.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config: Arc<RwLock<AppConfig>>,
    config_dir: PathBuf,
    environment: String,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `config/default.toml` - Default values
    /// 2. `config/{environment}.toml` - Environment-specific overrides
    /// 3. `config/local.toml` - Local overrides
    /// 4. Environment variables with `MEETSYNC_` prefix and `__` separators
    ///
    /// The environment comes from `MEETSYNC_ENVIRONMENT`, defaulting to
    /// `development`.
    pub fn new(config_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        // Load .env file if present
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment = std::env::var(format!("{}_ENVIRONMENT", ENV_PREFIX))
            .unwrap_or_else(|_| "development".to_string());
        Self::with_environment(config_dir, environment)
    }

    /// Creates a loader for an explicit environment.
    pub fn with_environment(
        config_dir: impl Into<PathBuf>,
        environment: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let config_dir = config_dir.into();
        let environment = environment.into();
        let config = Self::load_config(&config_dir, &environment)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_dir,
            environment,
        })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> Result<Self, ConfigError> {
        Self::new("./config")
    }

    /// Returns the current configuration.
    pub async fn get(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// The environment this loader reads.
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Reloads the configuration from disk.
    ///
    /// On failure the previous configuration stays in effect.
    pub async fn reload(&self) -> Result<(), ConfigError> {
        let new_config = Self::load_config(&self.config_dir, &self.environment)?;
        let mut config = self.config.write().await;
        *config = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Loads configuration from the specified directory.
    fn load_config(config_dir: &Path, environment: &str) -> Result<AppConfig, ConfigError> {
        info!("Loading configuration for environment: {}", environment);

        let mut builder = Config::builder();

        for name in ["default", environment, "local"] {
            let path = config_dir.join(format!("{}.toml", name));
            if path.exists() {
                debug!("Loading config from: {}", path.display());
                builder = builder.add_source(File::from(path).required(false));
            }
        }

        builder = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override("app.environment", environment)?;

        let app_config: AppConfig = builder.build()?.try_deserialize()?;

        Self::validate_config(&app_config)?;

        Ok(app_config)
    }

    fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
        ConfigValidator::validate(config).map_err(ConfigError::Invalid)?;

        if config.app.is_production() && config.jobs.backend == meetsync_jobs::BackendKind::Memory {
            warn!("In-memory job backend in production! Jobs are lost on restart");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meetsync_jobs::{Backoff, BackendKind};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) {
        fs::write(dir.path().join(name), contents).unwrap();
    }

    #[tokio::test]
    async fn test_missing_files_yield_defaults() {
        let dir = TempDir::new().unwrap();
        let loader = ConfigLoader::with_environment(dir.path(), "test").unwrap();

        let config = loader.get().await;
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.app.environment, "test");
        assert_eq!(config.jobs.worker.concurrency, 5);
    }

    #[tokio::test]
    async fn test_layers_override_in_order() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "default.toml",
            r#"
            [server]
            host = "127.0.0.1"
            port = 3000

            [jobs]
            backend = "memory"

            [jobs.worker]
            concurrency = 2
            "#,
        );
        write(
            &dir,
            "staging.toml",
            r#"
            [server]
            port = 4000
            request_timeout_secs = 10
            "#,
        );
        write(
            &dir,
            "local.toml",
            r#"
            [jobs.queues.email]
            concurrency = 8
            attempts = 4
            backoff = { type = "fixed", delay = 250 }
            "#,
        );

        let loader = ConfigLoader::with_environment(dir.path(), "staging").unwrap();
        let config = loader.get().await;

        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.request_timeout_secs, 10);
        assert_eq!(config.jobs.backend, BackendKind::Memory);
        assert_eq!(config.jobs.worker.concurrency, 2);

        let email = &config.jobs.queues["email"];
        assert_eq!(email.concurrency, Some(8));
        assert_eq!(email.attempts, Some(4));
        assert_eq!(email.backoff, Some(Backoff::fixed(Duration::from_millis(250))));
    }

    #[tokio::test]
    async fn test_invalid_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        write(&dir, "default.toml", "[jobs.worker]\nconcurrency = 0\n");

        let err = ConfigLoader::with_environment(dir.path(), "test").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("Concurrency for worker"));
    }

    #[tokio::test]
    async fn test_reload_keeps_previous_config_on_error() {
        let dir = TempDir::new().unwrap();
        write(&dir, "default.toml", "[logging]\nlevel = \"debug\"\nformat = \"json\"\n");

        let loader = ConfigLoader::with_environment(dir.path(), "test").unwrap();
        assert_eq!(loader.get().await.logging.level, "debug");

        write(&dir, "default.toml", "[logging]\nlevel = \"loud\"\nformat = \"json\"\n");
        assert!(loader.reload().await.is_err());
        assert_eq!(loader.get().await.logging.level, "debug");

        write(&dir, "default.toml", "[logging]\nlevel = \"warn\"\nformat = \"json\"\n");
        loader.reload().await.unwrap();
        assert_eq!(loader.get().await.logging.level, "warn");
    }
}
