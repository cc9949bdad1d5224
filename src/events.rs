// src/events.rs
use crate::JobId;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Lifecycle transitions that external collectors may subscribe to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Enqueued,
    Claimed { worker_id: String },
    Completed,
    Retrying { delay: Duration, error: String },
    Dead { error: String },
    LeaseReaped { previous_owner: Option<String> },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Enqueued => "enqueued",
            EventKind::Claimed { .. } => "claimed",
            EventKind::Completed => "completed",
            EventKind::Retrying { .. } => "retrying",
            EventKind::Dead { .. } => "dead",
            EventKind::LeaseReaped { .. } => "lease-reaped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub job_id: JobId,
    pub queue: String,
    pub attempts: u32,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
}

/// Fan-out of lifecycle events. Emitting never blocks and never fails;
/// slow subscribers observe `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: LifecycleEvent) {
        debug!(
            job_id = %event.job_id,
            queue = %event.queue,
            attempts = event.attempts,
            event = event.kind.name(),
            "lifecycle event"
        );
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
