//! External API sync queue (Lark, Tencent Meeting, OpenAI).

use crate::config::QueueDefinition;
use crate::error::QueueResult;
use crate::job::{JobData, JobHandle, JobOptions, Priority};
use crate::queue::{BulkJob, JobQueue};
use crate::retry::Backoff;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// External service called by the job; doubles as the job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalService {
    Lark,
    Tencent,
    Openai,
}

impl ExternalService {
    pub const fn as_str(self) -> &'static str {
        match self {
            ExternalService::Lark => "lark",
            ExternalService::Tencent => "tencent",
            ExternalService::Openai => "openai",
        }
    }
}

impl fmt::Display for ExternalService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an external API call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalApiJob {
    pub service: ExternalService,
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

impl ExternalApiJob {
    pub fn new(service: ExternalService, action: impl Into<String>, params: Value) -> Self {
        Self {
            service,
            action: action.into(),
            params,
        }
    }
}

/// Typed client of the `external-api` queue.
#[derive(Debug, Clone)]
pub struct ExternalApiQueue {
    queue: JobQueue,
}

impl ExternalApiQueue {
    pub const NAME: &'static str = "external-api";

    /// Five attempts, exponential backoff from 3s, low priority.
    pub fn definition() -> QueueDefinition {
        QueueDefinition::new(Self::NAME).default_options(
            JobOptions::new()
                .priority(Priority::Low)
                .attempts(5)
                .backoff(Backoff::exponential(Duration::from_millis(3000))),
        )
    }

    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Enqueue one call.
    pub async fn call(
        &self,
        job: ExternalApiJob,
        idempotency_key: impl Into<String>,
        options: JobOptions,
    ) -> QueueResult<Option<JobHandle>> {
        let service = job.service;
        let data = JobData::new(idempotency_key, &job)?;
        self.queue.add_job(service.as_str(), data, options).await
    }

    /// Enqueue a batch of calls; already-processed keys are skipped.
    pub async fn sync_batch(
        &self,
        jobs: Vec<(String, ExternalApiJob)>,
    ) -> QueueResult<Vec<JobHandle>> {
        let mut bulk = Vec::with_capacity(jobs.len());
        for (key, job) in jobs {
            let service = job.service;
            bulk.push(BulkJob::new(
                service.as_str(),
                JobData::new(key, &job)?,
                JobOptions::new(),
            ));
        }
        self.queue.add_bulk_jobs(bulk).await
    }
}
