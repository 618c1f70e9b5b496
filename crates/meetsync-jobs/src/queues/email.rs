//! Email queue: verification codes, reminders and templated mail.

use crate::config::QueueDefinition;
use crate::error::QueueResult;
use crate::job::{JobData, JobHandle, JobOptions, Priority};
use crate::queue::JobQueue;
use crate::retry::Backoff;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Job type of a templated email.
pub const SEND_EMAIL: &str = "send_email";
/// Job type of a verification-code email.
pub const SEND_VERIFICATION_EMAIL: &str = "send_verification_email";
/// Job type of a meeting reminder.
pub const SEND_MEETING_REMINDER: &str = "send_meeting_reminder";

/// Payload of an email job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailJob {
    pub to: String,
    pub template: String,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

impl EmailJob {
    pub fn new(to: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            template: template.into(),
            variables: Map::new(),
        }
    }

    pub fn variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

/// Delay of a reminder: `max(0, target - lead - now)`.
pub fn reminder_delay(target: DateTime<Utc>, lead: Duration, now: DateTime<Utc>) -> Duration {
    let lead = chrono::Duration::from_std(lead).unwrap_or_else(|_| chrono::Duration::zero());
    (target - lead - now).to_std().unwrap_or(Duration::ZERO)
}

/// Typed client of the `email` queue.
#[derive(Debug, Clone)]
pub struct EmailQueue {
    queue: JobQueue,
}

impl EmailQueue {
    pub const NAME: &'static str = "email";

    /// Three attempts, exponential backoff from 2s.
    pub fn definition() -> QueueDefinition {
        QueueDefinition::new(Self::NAME).default_options(
            JobOptions::new()
                .priority(Priority::Normal)
                .attempts(3)
                .backoff(Backoff::exponential(Duration::from_millis(2000))),
        )
    }

    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Enqueue a templated email.
    pub async fn send_email(
        &self,
        email: EmailJob,
        idempotency_key: impl Into<String>,
        options: JobOptions,
    ) -> QueueResult<Option<JobHandle>> {
        let data = JobData::new(idempotency_key, &email)?;
        self.queue.add_job(SEND_EMAIL, data, options).await
    }

    /// Enqueue a verification code at high priority, keyed
    /// `verify-{to}-{code}`.
    pub async fn send_verification_email(
        &self,
        to: &str,
        code: &str,
    ) -> QueueResult<Option<JobHandle>> {
        let email = EmailJob::new(to, "verification").variable("code", code);
        let data = JobData::new(format!("verify-{}-{}", to, code), &email)?;
        self.queue
            .add_job(
                SEND_VERIFICATION_EMAIL,
                data,
                JobOptions::new().priority(Priority::High),
            )
            .await
    }

    /// Enqueue a reminder that fires `lead` before `starts_at`, or now if
    /// that moment has passed.
    pub async fn send_meeting_reminder(
        &self,
        to: &str,
        meeting_id: &str,
        starts_at: DateTime<Utc>,
        lead: Duration,
    ) -> QueueResult<Option<JobHandle>> {
        let delay = reminder_delay(starts_at, lead, self.queue.clock().now());
        let email = EmailJob::new(to, "meeting_reminder")
            .variable("meetingId", meeting_id)
            .variable("startsAt", starts_at.to_rfc3339());
        let data = JobData::new(format!("reminder-{}-{}", meeting_id, to), &email)?;

        self.queue
            .add_job(SEND_MEETING_REMINDER, data, JobOptions::new().delay(delay))
            .await
    }
}
