//! Meeting processing queue.

use crate::config::QueueDefinition;
use crate::error::QueueResult;
use crate::job::{JobData, JobHandle, JobOptions, Priority};
use crate::queue::JobQueue;
use crate::retry::Backoff;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// What to do with a meeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingAction {
    /// Upsert the meeting record in the tabular store.
    SyncRecord,
    /// Fetch and attach the recording.
    ProcessRecording,
    /// Produce the AI summary.
    GenerateSummary,
    /// Refresh the participant list.
    SyncParticipants,
}

impl MeetingAction {
    /// Job type name; processors are registered under it.
    pub const fn as_str(self) -> &'static str {
        match self {
            MeetingAction::SyncRecord => "sync_record",
            MeetingAction::ProcessRecording => "process_recording",
            MeetingAction::GenerateSummary => "generate_summary",
            MeetingAction::SyncParticipants => "sync_participants",
        }
    }
}

impl fmt::Display for MeetingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a meeting job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingJob {
    pub meeting_id: String,
    pub action: MeetingAction,
    /// Webhook event that triggered the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_event: Option<String>,
}

impl MeetingJob {
    pub fn new(meeting_id: impl Into<String>, action: MeetingAction) -> Self {
        Self {
            meeting_id: meeting_id.into(),
            action,
            source_event: None,
        }
    }

    pub fn with_source_event(mut self, event: impl Into<String>) -> Self {
        self.source_event = Some(event.into());
        self
    }

    /// `meeting-{id}-{action}`, suffixed with the source event when known
    /// so that distinct webhook deliveries are not collapsed.
    pub fn idempotency_key(&self) -> String {
        match &self.source_event {
            Some(event) => format!("meeting-{}-{}-{}", self.meeting_id, self.action, event),
            None => format!("meeting-{}-{}", self.meeting_id, self.action),
        }
    }
}

/// Typed client of the `meeting` queue.
#[derive(Debug, Clone)]
pub struct MeetingQueue {
    queue: JobQueue,
}

impl MeetingQueue {
    pub const NAME: &'static str = "meeting";

    /// Three attempts, exponential backoff from 5s.
    pub fn definition() -> QueueDefinition {
        QueueDefinition::new(Self::NAME).default_options(
            JobOptions::new()
                .priority(Priority::Normal)
                .attempts(3)
                .backoff(Backoff::exponential(Duration::from_millis(5000))),
        )
    }

    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }

    /// The underlying queue client.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Enqueue a meeting job under its derived idempotency key.
    pub async fn add_meeting_job(
        &self,
        job: MeetingJob,
        options: JobOptions,
    ) -> QueueResult<Option<JobHandle>> {
        let key = job.idempotency_key();
        self.add_meeting_job_with_key(job, key, options).await
    }

    /// Enqueue a meeting job under a caller-chosen key.
    pub async fn add_meeting_job_with_key(
        &self,
        job: MeetingJob,
        idempotency_key: impl Into<String>,
        options: JobOptions,
    ) -> QueueResult<Option<JobHandle>> {
        let job_type = job.action.as_str();
        let data = JobData::new(idempotency_key, &job)?;
        self.queue.add_job(job_type, data, options).await
    }

    /// Enqueue a summary job for a finished meeting.
    pub async fn generate_summary(&self, meeting_id: &str) -> QueueResult<Option<JobHandle>> {
        self.add_meeting_job(
            MeetingJob::new(meeting_id, MeetingAction::GenerateSummary),
            JobOptions::new(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key() {
        let job = MeetingJob::new("m-1", MeetingAction::SyncRecord);
        assert_eq!(job.idempotency_key(), "meeting-m-1-sync_record");

        let job = job.with_source_event("meeting.ended");
        assert_eq!(job.idempotency_key(), "meeting-m-1-sync_record-meeting.ended");
    }

    #[test]
    fn test_payload_shape() {
        let job = MeetingJob::new("m-1", MeetingAction::ProcessRecording);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["meetingId"], "m-1");
        assert_eq!(value["action"], "process_recording");
        assert!(value.get("sourceEvent").is_none());
    }

    #[test]
    fn test_definition() {
        let definition = MeetingQueue::definition();
        assert_eq!(definition.default_options.attempts, Some(3));
        assert_eq!(
            definition.default_options.backoff,
            Some(Backoff::exponential(Duration::from_secs(5)))
        );
    }
}
