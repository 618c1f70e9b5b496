//! Backoff policies and the retry decision for failed jobs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Same delay before every retry.
    Fixed,
    /// Delay doubles with every attempt made.
    Exponential,
}

/// Delay policy applied between retries of a recoverable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    /// Backoff kind.
    #[serde(rename = "type")]
    pub kind: BackoffKind,

    /// Base delay in milliseconds.
    #[serde(rename = "delay")]
    pub delay_ms: u64,
}

impl Backoff {
    /// Ceiling applied to computed delays (1 day).
    pub const MAX_DELAY_MS: u64 = 86_400_000;

    /// Creates a fixed backoff.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Creates an exponential backoff.
    pub fn exponential(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Delay before the next attempt, given how many attempts were made.
    ///
    /// Exponential: `delay * 2^(attempts_made - 1)`, capped at one day.
    pub fn delay_for_attempt(&self, attempts_made: u32) -> Duration {
        if attempts_made == 0 {
            return Duration::ZERO;
        }

        let delay_ms = match self.kind {
            BackoffKind::Fixed => self.delay_ms,
            BackoffKind::Exponential => {
                let exp = (attempts_made - 1).min(32);
                self.delay_ms.saturating_mul(1u64 << exp)
            }
        };

        Duration::from_millis(delay_ms.min(Self::MAX_DELAY_MS))
    }
}

/// What the backend should do with a job whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue the job after the given delay.
    Retry { delay: Duration },
    /// Move the job to the terminal failed state.
    Fail,
}

impl RetryDecision {
    /// Decide between retry and terminal failure.
    ///
    /// `attempts_made` already includes the attempt that just failed, so a
    /// job never runs more than `attempts` times.
    pub fn decide(
        attempts_made: u32,
        attempts: u32,
        backoff: Option<&Backoff>,
        unrecoverable: bool,
    ) -> Self {
        if unrecoverable || attempts_made >= attempts.max(1) {
            return RetryDecision::Fail;
        }

        let delay = backoff
            .map(|b| b.delay_for_attempt(attempts_made))
            .unwrap_or(Duration::ZERO);

        RetryDecision::Retry { delay }
    }

    /// Returns true if the job will be retried.
    pub fn is_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }
}
