// src/producer.rs
use crate::clock::{Clock, SystemClock};
use crate::events::{EventBus, EventKind, LifecycleEvent};
use crate::store::{Backend, QueueStats};
use crate::{Job, JobId, JobOptions, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Submission and status boundary for one queue
#[derive(Clone)]
pub struct Producer {
    backend: Arc<dyn Backend>,
    queue: String,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl Producer {
    pub fn new(backend: Arc<dyn Backend>, queue: impl Into<String>) -> Self {
        Self {
            backend,
            queue: queue.into(),
            events: EventBus::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Enroll a raw payload with the given attempt ceiling.
    pub async fn create(&self, payload: impl Into<Vec<u8>>, max_attempts: u32) -> Result<JobId> {
        self.submit(payload, JobOptions::default().with_max_attempts(max_attempts))
            .await
    }

    /// Enroll a raw payload with custom options
    pub async fn submit(&self, payload: impl Into<Vec<u8>>, options: JobOptions) -> Result<JobId> {
        let now = self.clock.now();
        let job = Job::new(self.queue.clone(), payload.into(), &options, now)?;
        let delayed = job.not_before > now;

        let id = self.backend.create(job).await?;
        info!(job_id = %id, queue = %self.queue, delayed, "job enqueued");

        self.events.emit(LifecycleEvent {
            job_id: id,
            queue: self.queue.clone(),
            attempts: 0,
            at: now,
            kind: EventKind::Enqueued,
        });
        Ok(id)
    }

    /// Serialize `payload` as JSON and enroll it
    pub async fn submit_json<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        options: JobOptions,
    ) -> Result<JobId> {
        let bytes = serde_json::to_vec(payload)?;
        self.submit(bytes, options).await
    }

    /// Read-only view of a job, for polling until completion.
    pub async fn status(&self, id: &JobId) -> Result<Job> {
        self.backend.get(id).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.backend.stats(&self.queue, self.clock.now()).await
    }

    /// Health check: succeeds when the backing store answers.
    pub async fn ping(&self) -> Result<()> {
        self.backend.ping().await
    }
}
