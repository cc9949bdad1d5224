// src/lease.rs
use crate::clock::{Clock, SystemClock};
use crate::events::{EventBus, EventKind, LifecycleEvent};
use crate::job::to_chrono;
use crate::store::{Backend, JobPatch, LeaseGuard, Transition};
use crate::{
    ExecutionError, Job, JobId, JobState, LeaseMqError, Outcome, Result, RetryDecision,
    RetryPolicy,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Result of trying to claim a dequeued id
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    Acquired(Job),
    /// Another worker got there first. Expected under contention.
    LostRace,
}

/// Grants and reclaims time-bounded execution leases on one queue.
///
/// All state changes go through [`crate::JobStore::transition`], so any number
/// of managers (in any number of processes) can share a backend.
pub struct LeaseManager {
    backend: Arc<dyn Backend>,
    queue: String,
    retry: RetryPolicy,
    events: EventBus,
    clock: Arc<dyn Clock>,
    stranded_grace: Duration,
}

impl LeaseManager {
    pub fn new(backend: Arc<dyn Backend>, queue: impl Into<String>) -> Self {
        Self {
            backend,
            queue: queue.into(),
            retry: RetryPolicy::default(),
            events: EventBus::default(),
            clock: Arc::new(SystemClock),
            stranded_grace: Duration::from_secs(30),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// How long a job may sit between two steps of a multi-step transition
    /// (dequeued but unclaimed, failed but not yet requeued) before `reap`
    /// finishes the step on its behalf.
    pub fn with_stranded_grace(mut self, grace: Duration) -> Self {
        self.stranded_grace = grace;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Next visible id, if any. Does not touch job state.
    pub async fn dequeue_next(&self) -> Result<Option<JobId>> {
        self.backend.dequeue_next(&self.queue, self.now()).await
    }

    /// Take the lease on a dequeued `Pending` job and count the attempt.
    #[instrument(skip(self), fields(queue = %self.queue))]
    pub async fn claim(
        &self,
        id: &JobId,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Claim> {
        if lease_duration.is_zero() {
            return Err(LeaseMqError::InvalidInput(
                "lease duration must be positive".to_string(),
            ));
        }
        let now = self.now();
        let expiry = now + to_chrono(lease_duration)?;

        let transition = Transition::new(JobState::Pending, JobState::Leased).patch(JobPatch {
            lease_owner: Some(Some(worker_id.to_string())),
            lease_expiry: Some(Some(expiry)),
            increment_attempts: true,
            ..Default::default()
        });

        match self.backend.transition(&self.queue, id, transition, now).await {
            Ok(job) => {
                debug!(job_id = %id, attempts = job.attempts, "lease acquired");
                self.emit(
                    &job,
                    EventKind::Claimed {
                        worker_id: worker_id.to_string(),
                    },
                );
                Ok(Claim::Acquired(job))
            }
            Err(LeaseMqError::Conflict(_)) => {
                debug!(job_id = %id, "lost claim race");
                Ok(Claim::LostRace)
            }
            Err(e) => Err(e),
        }
    }

    /// Extend a live lease held by `worker_id` to `now + lease_duration`.
    pub async fn renew(&self, id: &JobId, worker_id: &str, lease_duration: Duration) -> Result<Job> {
        let now = self.now();
        let expiry = now + to_chrono(lease_duration)?;

        let transition = Transition::new(JobState::Leased, JobState::Leased)
            .guard(LeaseGuard::Owner {
                worker: worker_id.to_string(),
                live: true,
            })
            .patch(JobPatch {
                lease_expiry: Some(Some(expiry)),
                ..Default::default()
            });

        match self.backend.transition(&self.queue, id, transition, now).await {
            Ok(job) => Ok(job),
            // No longer leased at all: someone reaped or finished it
            Err(LeaseMqError::Conflict(_)) => Err(self.lost_lease(id, worker_id).await?),
            Err(e) => Err(e),
        }
    }

    /// Report the outcome of an execution.
    ///
    /// Releasing a job that is already `Completed` or `Dead` returns the stored
    /// record unchanged. A report from a worker whose lease already expired is
    /// still accepted as long as nobody else has taken the job since.
    #[instrument(skip(self, outcome), fields(queue = %self.queue))]
    pub async fn release(&self, id: &JobId, worker_id: &str, outcome: Outcome) -> Result<Job> {
        let current = self.backend.get(id).await?;
        if current.state.is_terminal() {
            debug!(job_id = %id, state = %current.state, "release on terminal job ignored");
            return Ok(current);
        }

        let now = self.now();
        let owner = LeaseGuard::Owner {
            worker: worker_id.to_string(),
            live: false,
        };

        match outcome {
            Outcome::Success(output) => {
                let mut patch = JobPatch::clear_lease();
                patch.result = Some(output);
                let transition = Transition::new(JobState::Leased, JobState::Completed)
                    .guard(owner)
                    .patch(patch);

                let job = self.transition_owned(id, worker_id, transition, now).await?;
                info!(job_id = %id, attempts = job.attempts, "job completed");
                self.emit(&job, EventKind::Completed);
                Ok(job)
            }
            Outcome::Failure(error) => {
                let mut patch = JobPatch::clear_lease();
                patch.last_error = Some(error.message.clone());
                let transition = Transition::new(JobState::Leased, JobState::Failed)
                    .guard(owner)
                    .patch(patch);

                let job = self.transition_owned(id, worker_id, transition, now).await?;
                warn!(job_id = %id, attempts = job.attempts, error = %error, "job attempt failed");
                self.settle_failure(job, &error).await
            }
        }
    }

    /// Recover jobs whose worker went away.
    ///
    /// Expired leases go back to `Pending` (or `Dead` when no attempts remain).
    /// Jobs stranded between steps longer than the grace period have the step
    /// finished for them. Returns how many jobs were touched. Safe to run
    /// concurrently with other reapers.
    #[instrument(skip(self), fields(queue = %self.queue))]
    pub async fn reap(&self) -> Result<usize> {
        let now = self.now();
        let stranded_before = now - to_chrono(self.stranded_grace)?;
        let candidates = self.backend.in_flight(&self.queue, now).await?;

        let mut reaped = 0;
        for (id, score) in candidates {
            let job = match self.backend.get(&id).await {
                Ok(job) => job,
                Err(LeaseMqError::NotFound(_)) => {
                    self.backend.discard_in_flight(&self.queue, &id).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let outcome = match job.state {
                // Finished jobs never come back, so their index entry is stale
                state if state.is_terminal() => {
                    debug!(job_id = %id, state = %state, "dropping stale in-flight entry");
                    self.backend.discard_in_flight(&self.queue, &id).await?;
                    continue;
                }
                JobState::Leased if job.lease_expired(now) => self.reclaim(job, now).await,
                JobState::Pending if score < stranded_before => {
                    self.requeue_stranded(&job, JobState::Pending, now).await
                }
                JobState::Retrying if score < stranded_before => {
                    self.requeue_stranded(&job, JobState::Retrying, now).await
                }
                JobState::Failed if score < stranded_before => {
                    let error = ExecutionError::retryable(
                        job.last_error.clone().unwrap_or_else(|| "unknown failure".to_string()),
                    );
                    self.settle_failure(job, &error).await.map(|_| ())
                }
                _ => continue,
            };

            match outcome {
                Ok(()) => reaped += 1,
                // Someone else (a renewal, another reaper, a late report) won
                Err(LeaseMqError::Conflict(_)) | Err(LeaseMqError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if reaped > 0 {
            info!(reaped, "recovered stranded jobs");
        }
        Ok(reaped)
    }

    async fn reclaim(&self, job: Job, now: DateTime<Utc>) -> Result<()> {
        let previous_owner = job.lease_owner.clone();
        let guard = LeaseGuard::ExpiredBefore(now);

        // Re-running would exceed max_attempts
        if job.attempts_exhausted() {
            let mut patch = JobPatch::clear_lease();
            let error = "lease expired on final attempt".to_string();
            patch.last_error = Some(error.clone());
            let transition = Transition::new(JobState::Leased, JobState::Dead)
                .guard(guard)
                .patch(patch);
            let dead = self.backend.transition(&self.queue, &job.id, transition, now).await?;
            warn!(job_id = %dead.id, owner = ?previous_owner, "lease expired on final attempt, job is dead");
            self.emit(&dead, EventKind::LeaseReaped { previous_owner });
            self.emit(&dead, EventKind::Dead { error });
            return Ok(());
        }

        let transition = Transition::new(JobState::Leased, JobState::Pending)
            .guard(guard)
            .patch(JobPatch::clear_lease())
            .requeue_at(now);
        let pending = self.backend.transition(&self.queue, &job.id, transition, now).await?;
        warn!(job_id = %pending.id, owner = ?previous_owner, "expired lease reclaimed");
        self.emit(&pending, EventKind::LeaseReaped { previous_owner });
        Ok(())
    }

    /// Finish an abandoned step back to `Pending`. A `Retrying` job carries its
    /// backoff in `not_before`, so it stays hidden until then.
    async fn requeue_stranded(&self, job: &Job, from: JobState, now: DateTime<Utc>) -> Result<()> {
        let requeue_at = job.not_before.max(now);
        let transition = Transition::new(from, JobState::Pending).requeue_at(requeue_at);
        self.backend.transition(&self.queue, &job.id, transition, now).await?;
        debug!(job_id = %job.id, from = %from, "stranded job requeued");
        Ok(())
    }

    /// Apply the retry policy to a job sitting in `Failed`.
    async fn settle_failure(&self, job: Job, error: &ExecutionError) -> Result<Job> {
        let now = self.now();

        match self.retry.decide(&job, error) {
            RetryDecision::Retry { delay } => {
                // Recorded up front so a reaper finishing this step keeps the backoff
                let not_before = now + to_chrono(delay)?;
                let retrying = self
                    .backend
                    .transition(
                        &self.queue,
                        &job.id,
                        Transition::new(JobState::Failed, JobState::Retrying).patch(JobPatch {
                            not_before: Some(not_before),
                            ..Default::default()
                        }),
                        now,
                    )
                    .await?;
                self.emit(
                    &retrying,
                    EventKind::Retrying {
                        delay,
                        error: error.message.clone(),
                    },
                );

                let pending = self
                    .backend
                    .transition(
                        &self.queue,
                        &job.id,
                        Transition::new(JobState::Retrying, JobState::Pending).requeue_at(not_before),
                        now,
                    )
                    .await?;
                info!(
                    job_id = %job.id,
                    attempts = pending.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "job scheduled for retry"
                );
                Ok(pending)
            }
            RetryDecision::Dead => {
                let dead = self
                    .backend
                    .transition(
                        &self.queue,
                        &job.id,
                        Transition::new(JobState::Failed, JobState::Dead),
                        now,
                    )
                    .await?;
                warn!(
                    job_id = %job.id,
                    attempts = dead.attempts,
                    permanent = error.permanent,
                    "job is dead"
                );
                self.emit(
                    &dead,
                    EventKind::Dead {
                        error: error.message.clone(),
                    },
                );
                Ok(dead)
            }
        }
    }

    /// Run an owner-guarded transition, translating a state conflict into the
    /// lease error the caller should see.
    async fn transition_owned(
        &self,
        id: &JobId,
        worker_id: &str,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        match self.backend.transition(&self.queue, id, transition, now).await {
            Err(LeaseMqError::Conflict(_)) => Err(self.lost_lease(id, worker_id).await?),
            other => other,
        }
    }

    /// Work out why `worker_id` no longer holds the lease on `id`.
    async fn lost_lease(&self, id: &JobId, worker_id: &str) -> Result<LeaseMqError> {
        let job = self.backend.get(id).await?;
        if job.state == JobState::Leased && job.lease_owner.as_deref() == Some(worker_id) {
            return Ok(LeaseMqError::Expired(*id));
        }
        if job.state == JobState::Leased {
            return Ok(LeaseMqError::NotOwner {
                job_id: *id,
                worker: worker_id.to_string(),
            });
        }
        // Reaped back to the queue (or beyond): the lease ran out
        Ok(LeaseMqError::Expired(*id))
    }

    fn emit(&self, job: &Job, kind: EventKind) {
        self.events.emit(LifecycleEvent {
            job_id: job.id,
            queue: job.queue.clone(),
            attempts: job.attempts,
            at: job.updated_at,
            kind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ManualClock, MemoryBackend, Producer};

    #[tokio::test]
    async fn reap_drops_in_flight_entries_of_finished_jobs() {
        let backend = MemoryBackend::arc();
        let clock = Arc::new(ManualClock::default());
        let lease = LeaseManager::new(backend.clone(), "q").with_clock(clock.clone());
        let producer = Producer::new(backend.clone(), "q").with_clock(clock.clone());

        let id = producer.create(b"{}".to_vec(), 3).await.unwrap();
        let Claim::Acquired(_) = lease.claim(&id, "w1", Duration::from_secs(5)).await.unwrap() else {
            panic!("claim should succeed");
        };
        lease
            .release(&id, "w1", Outcome::Success(Vec::new()))
            .await
            .unwrap();

        let ghost = JobId::new();
        backend.park_in_flight("q", id, lease.now()).await;
        backend.park_in_flight("q", ghost, lease.now()).await;
        assert_eq!(producer.stats().await.unwrap().in_flight, 2);

        clock.advance(Duration::from_secs(3_600));
        assert_eq!(lease.reap().await.unwrap(), 0);
        assert_eq!(producer.stats().await.unwrap().in_flight, 0);
        assert_eq!(producer.status(&id).await.unwrap().state, JobState::Completed);
        assert_eq!(lease.dequeue_next().await.unwrap(), None);
    }
}
