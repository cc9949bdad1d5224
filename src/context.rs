// src/context.rs
use crate::{Job, JobId, LeaseManager, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::Span;

/// Context provided to job execution
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub queue: String,
    /// 1-based number of the attempt being executed.
    pub attempt: u32,
    pub max_attempts: u32,
    pub worker_id: String,
    pub span: Span,
    lease: Arc<LeaseManager>,
    lease_duration: Duration,
}

impl JobContext {
    pub fn new(
        job: &Job,
        worker_id: impl Into<String>,
        lease: Arc<LeaseManager>,
        lease_duration: Duration,
    ) -> Self {
        let worker_id = worker_id.into();
        let span = tracing::info_span!(
            "job_execution",
            job_id = %job.id,
            queue = %job.queue,
            attempt = job.attempts,
            worker_id = %worker_id,
        );

        Self {
            job_id: job.id,
            queue: job.queue.clone(),
            attempt: job.attempts,
            max_attempts: job.max_attempts,
            worker_id,
            span,
            lease,
            lease_duration,
        }
    }

    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Push the lease expiry out by another lease duration.
    ///
    /// An `Expired` or `NotOwner` error means another worker may now own the
    /// job; the executor should stop as soon as it can.
    pub async fn renew_lease(&self) -> Result<()> {
        self.lease
            .renew(&self.job_id, &self.worker_id, self.lease_duration)
            .await
            .map(|_| ())
    }
}
