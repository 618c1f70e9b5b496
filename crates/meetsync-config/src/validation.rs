//! Configuration validation module.
//!
//! Collects every problem in one pass so a bad deployment fails at startup
//! with the full list instead of one error at a time.

use crate::AppConfig;
use meetsync_jobs::{BackendKind, JobsConfig};
use thiserror::Error;
use url::Url;

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigValidationError {
    /// Port number is invalid (must be 1-65535).
    #[error("Invalid port for {name}: {value} (must be 1-65535)")]
    InvalidPort { name: String, value: u16 },

    /// URL format is invalid.
    #[error("Invalid {url_type} URL: {message}")]
    InvalidUrl { url_type: String, message: String },

    /// Pool size out of range.
    #[error("Invalid pool size {value} (must be between 1 and {maximum})")]
    InvalidPoolSize { value: usize, maximum: usize },

    /// A duration that must be positive is zero.
    #[error("Timeout '{name}' must be positive")]
    NonPositiveTimeout { name: String },

    /// Concurrency must be at least 1.
    #[error("Concurrency for {name} must be at least 1")]
    InvalidConcurrency { name: String },

    /// Attempt budget must be at least 1.
    #[error("Attempts for queue {queue} must be at least 1")]
    InvalidAttempts { queue: String },

    /// Log level is not one tracing understands.
    #[error("Invalid log level: '{value}' (valid: trace, debug, info, warn, error)")]
    InvalidLogLevel { value: String },

    /// Key prefix must be non-empty.
    #[error("Redis key prefix cannot be empty")]
    EmptyKeyPrefix,
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Maximum Redis pool size.
    const MAX_POOL_SIZE: usize = 512;
    /// Valid log levels.
    const VALID_LOG_LEVELS: &'static [&'static str] = &["trace", "debug", "info", "warn", "error"];

    /// Validates the entire application configuration.
    ///
    /// Returns Ok(()) if valid, or Err with all validation errors found.
    pub fn validate(config: &AppConfig) -> Result<(), Vec<ConfigValidationError>> {
        let mut errors = Vec::new();

        Self::validate_server(config, &mut errors);
        Self::validate_logging(config, &mut errors);
        Self::validate_jobs(&config.jobs, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_server(config: &AppConfig, errors: &mut Vec<ConfigValidationError>) {
        if config.server.port == 0 {
            errors.push(ConfigValidationError::InvalidPort {
                name: "server.port".to_string(),
                value: config.server.port,
            });
        }
        if config.server.request_timeout_secs == 0 {
            errors.push(ConfigValidationError::NonPositiveTimeout {
                name: "server.request_timeout_secs".to_string(),
            });
        }
    }

    fn validate_logging(config: &AppConfig, errors: &mut Vec<ConfigValidationError>) {
        let level = config.logging.level.to_lowercase();
        if !Self::VALID_LOG_LEVELS.contains(&level.as_str()) {
            errors.push(ConfigValidationError::InvalidLogLevel {
                value: config.logging.level.clone(),
            });
        }
    }

    /// Validates the job runtime configuration.
    fn validate_jobs(config: &JobsConfig, errors: &mut Vec<ConfigValidationError>) {
        if config.backend == BackendKind::Redis {
            match Url::parse(&config.redis.url) {
                Ok(url) if url.scheme() == "redis" || url.scheme() == "rediss" => {}
                Ok(_) => errors.push(ConfigValidationError::InvalidUrl {
                    url_type: "redis".to_string(),
                    message: "URL must start with redis:// or rediss://".to_string(),
                }),
                Err(e) => errors.push(ConfigValidationError::InvalidUrl {
                    url_type: "redis".to_string(),
                    message: e.to_string(),
                }),
            }

            if config.redis.pool_size == 0 || config.redis.pool_size > Self::MAX_POOL_SIZE {
                errors.push(ConfigValidationError::InvalidPoolSize {
                    value: config.redis.pool_size,
                    maximum: Self::MAX_POOL_SIZE,
                });
            }
        }

        if config.redis.key_prefix.trim().is_empty() {
            errors.push(ConfigValidationError::EmptyKeyPrefix);
        }

        if config.worker.concurrency == 0 {
            errors.push(ConfigValidationError::InvalidConcurrency {
                name: "worker".to_string(),
            });
        }

        for (name, value) in [
            ("jobs.worker.poll_interval_ms", config.worker.poll_interval_ms),
            ("jobs.worker.lease_duration_ms", config.worker.lease_duration_ms),
            ("jobs.worker.stalled_interval_ms", config.worker.stalled_interval_ms),
            ("jobs.worker.max_job_age_secs", config.worker.max_job_age_secs),
            ("jobs.idempotency.ttl_secs", config.idempotency.ttl_secs),
        ] {
            if value == 0 {
                errors.push(ConfigValidationError::NonPositiveTimeout {
                    name: name.to_string(),
                });
            }
        }

        let mut queues: Vec<_> = config.queues.iter().collect();
        queues.sort_by(|a, b| a.0.cmp(b.0));
        for (queue, overrides) in queues {
            if overrides.concurrency == Some(0) {
                errors.push(ConfigValidationError::InvalidConcurrency {
                    name: format!("queue {}", queue),
                });
            }
            if overrides.attempts == Some(0) {
                errors.push(ConfigValidationError::InvalidAttempts {
                    queue: queue.clone(),
                });
            }
        }
    }
}

/// Formats validation errors for display.
pub fn format_validation_errors(errors: &[ConfigValidationError]) -> String {
    let mut output = String::from("Configuration validation failed:\n");
    for (i, error) in errors.iter().enumerate() {
        output.push_str(&format!("  {}. {}\n", i + 1, error));
    }
    output
}
