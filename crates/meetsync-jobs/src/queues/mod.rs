//! Business queues.
//!
//! Each queue is a [`QueueDefinition`] plus a typed wrapper over
//! [`JobQueue`](crate::queue::JobQueue). Execution semantics live in the
//! processors registered on the queue's worker, not here.

pub mod email;
pub mod external_api;
pub mod meeting;

pub use email::{reminder_delay, EmailJob, EmailQueue};
pub use external_api::{ExternalApiJob, ExternalApiQueue, ExternalService};
pub use meeting::{MeetingAction, MeetingJob, MeetingQueue};

use crate::config::QueueDefinition;

/// Definitions of every business queue.
pub fn definitions() -> Vec<QueueDefinition> {
    vec![
        MeetingQueue::definition(),
        EmailQueue::definition(),
        ExternalApiQueue::definition(),
    ]
}
