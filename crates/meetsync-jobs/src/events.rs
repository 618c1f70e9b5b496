//! Job lifecycle events.

use crate::job::JobId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle transition kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Job became eligible for leasing.
    Waiting,
    /// Job was scheduled for later.
    Delayed,
    /// Job was leased by a worker.
    Active,
    /// Processor reported progress.
    Progress,
    /// Job finished successfully.
    Completed,
    /// An attempt failed (terminal or not, see `StateChange::will_retry`).
    Failed,
    /// Job lease expired while active.
    Stalled,
}

impl LifecycleEvent {
    /// Returns the event name.
    pub const fn as_str(self) -> &'static str {
        match self {
            LifecycleEvent::Waiting => "waiting",
            LifecycleEvent::Delayed => "delayed",
            LifecycleEvent::Active => "active",
            LifecycleEvent::Progress => "progress",
            LifecycleEvent::Completed => "completed",
            LifecycleEvent::Failed => "failed",
            LifecycleEvent::Stalled => "stalled",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job changed state.
#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    pub queue: String,
    pub job_id: JobId,
    pub job_name: String,
    pub event: LifecycleEvent,
    /// 1-based attempt number, zero before the first lease.
    pub attempt: u32,
    pub at: DateTime<Utc>,
    /// Failure reason or stall reason.
    pub reason: Option<String>,
    pub progress: Option<u8>,
    pub duration: Option<Duration>,
    /// Set on `Failed` when another attempt is scheduled.
    pub will_retry: bool,
}

impl StateChange {
    /// Create an event with no details.
    pub fn new(
        queue: impl Into<String>,
        job_id: JobId,
        job_name: impl Into<String>,
        event: LifecycleEvent,
    ) -> Self {
        Self {
            queue: queue.into(),
            job_id,
            job_name: job_name.into(),
            event,
            attempt: 0,
            at: Utc::now(),
            reason: None,
            progress: None,
            duration: None,
            will_retry: false,
        }
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn will_retry(mut self, will_retry: bool) -> Self {
        self.will_retry = will_retry;
        self
    }
}

/// Observer of job lifecycle transitions.
///
/// Listeners run inline on the emitting task and must not block.
pub trait StateChangeListener: Send + Sync {
    /// Called for every transition.
    fn on_state_change(&self, change: &StateChange);
}

/// Fan-out of lifecycle events to registered listeners.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<Vec<Arc<dyn StateChangeListener>>>>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    pub fn subscribe(&self, listener: Arc<dyn StateChangeListener>) {
        self.listeners.write().push(listener);
    }

    /// Deliver an event to every listener.
    pub fn emit(&self, change: StateChange) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_state_change(&change);
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<LifecycleEvent>>,
    }

    impl StateChangeListener for Recorder {
        fn on_state_change(&self, change: &StateChange) {
            self.seen.lock().push(change.event);
        }
    }

    #[test]
    fn test_emit_reaches_every_listener() {
        let bus = EventBus::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        bus.subscribe(first.clone());
        bus.subscribe(second.clone());

        bus.emit(StateChange::new("email", JobId::from("k1"), "send", LifecycleEvent::Waiting));
        bus.emit(
            StateChange::new("email", JobId::from("k1"), "send", LifecycleEvent::Failed)
                .attempt(1)
                .reason("smtp timeout")
                .will_retry(true),
        );

        assert_eq!(*first.seen.lock(), vec![LifecycleEvent::Waiting, LifecycleEvent::Failed]);
        assert_eq!(second.seen.lock().len(), 2);
    }

    #[test]
    fn test_clones_share_listeners() {
        let bus = EventBus::new();
        let clone = bus.clone();
        clone.subscribe(Arc::new(Recorder::default()));
        assert_eq!(bus.listener_count(), 1);
    }
}
