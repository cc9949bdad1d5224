// src/store/mod.rs
//! Durable job records and the ready/in-flight indexes over them.
//!
//! Every mutation of a job goes through [`JobStore::transition`], an atomic
//! compare-and-update keyed on the stored state. Backends keep two indexes per
//! queue in step with each transition:
//!
//! - **ready**: `Pending` ids ordered by `not_before`, ties by id.
//! - **in-flight**: ids that left the ready set but have not reached a terminal
//!   state, scored by lease expiry (leased jobs) or by the instant they entered
//!   the index. The reaper sweeps it to recover crashed workers.

pub mod memory;
pub mod redis;

use crate::{Job, JobId, JobState, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use self::memory::MemoryBackend;
pub use self::redis::{RedisBackend, RedisOptions};

/// Extra condition checked atomically alongside the expected state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseGuard {
    None,
    /// Lease must belong to `worker`. When `live` is set the lease must also
    /// not have expired yet.
    Owner { worker: String, live: bool },
    /// Lease must have expired strictly before the given instant.
    ExpiredBefore(DateTime<Utc>),
}

/// Field updates applied by a successful transition.
///
/// `None` leaves a field untouched; `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub lease_owner: Option<Option<String>>,
    pub lease_expiry: Option<Option<DateTime<Utc>>>,
    pub increment_attempts: bool,
    pub result: Option<Vec<u8>>,
    pub last_error: Option<String>,
    /// Next visibility instant, recorded ahead of a requeue.
    pub not_before: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn clear_lease() -> Self {
        Self {
            lease_owner: Some(None),
            lease_expiry: Some(None),
            ..Default::default()
        }
    }

    pub(crate) fn apply(&self, job: &mut Job) {
        if let Some(owner) = &self.lease_owner {
            job.lease_owner = owner.clone();
        }
        if let Some(expiry) = self.lease_expiry {
            job.lease_expiry = expiry;
        }
        if self.increment_attempts {
            job.attempts += 1;
        }
        if let Some(result) = &self.result {
            job.result = Some(result.clone());
        }
        if let Some(error) = &self.last_error {
            job.last_error = Some(error.clone());
        }
        if let Some(at) = self.not_before {
            job.not_before = at;
        }
    }
}

/// A conditional state change on one job
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: JobState,
    pub to: JobState,
    pub guard: LeaseGuard,
    pub patch: JobPatch,
    /// Visibility instant when `to` is `Pending`; defaults to the transition time.
    /// The id re-enters the ready set in the same atomic step.
    pub requeue_at: Option<DateTime<Utc>>,
}

impl Transition {
    pub fn new(from: JobState, to: JobState) -> Self {
        Self {
            from,
            to,
            guard: LeaseGuard::None,
            patch: JobPatch::default(),
            requeue_at: None,
        }
    }

    pub fn guard(mut self, guard: LeaseGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn patch(mut self, patch: JobPatch) -> Self {
        self.patch = patch;
        self
    }

    pub fn requeue_at(mut self, at: DateTime<Utc>) -> Self {
        self.requeue_at = Some(at);
        self
    }
}

/// Snapshot of one queue's indexes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Pending and visible now.
    pub ready: usize,
    /// Pending but held back by `not_before`.
    pub delayed: usize,
    /// Leased, or between states awaiting a follow-up transition.
    pub in_flight: usize,
}

/// Durable job records with atomic compare-and-update.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a `Pending` record and make it visible at `job.not_before`.
    async fn create(&self, job: Job) -> Result<JobId>;

    async fn get(&self, id: &JobId) -> Result<Job>;

    /// Apply `transition` if the stored state equals `transition.from` and the
    /// guard holds. Fails with `Conflict`, `NotOwner`, `Expired` or `NotFound`.
    /// Stamps `updated_at = now` on success and returns the new record.
    async fn transition(
        &self,
        queue: &str,
        id: &JobId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Job>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<()>;
}

/// Ordered set of ids eligible for claiming.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Make a `Pending` job visible at `not_before`. Any other state is a
    /// `Conflict`: terminal jobs never re-enter the ready set.
    async fn enqueue(&self, queue: &str, id: &JobId, not_before: DateTime<Utc>) -> Result<()>;

    /// Remove and return the oldest id with `not_before <= now`. The id moves to
    /// the in-flight index; job state is left alone.
    async fn dequeue_next(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<JobId>>;

    /// In-flight ids whose index score is strictly before `before`.
    async fn in_flight(
        &self,
        queue: &str,
        before: DateTime<Utc>,
    ) -> Result<Vec<(JobId, DateTime<Utc>)>>;

    /// Drop `id` from the in-flight index without touching the record.
    async fn discard_in_flight(&self, queue: &str, id: &JobId) -> Result<()>;

    async fn stats(&self, queue: &str, now: DateTime<Utc>) -> Result<QueueStats>;
}

/// A store that also provides the queue indexes.
pub trait Backend: JobStore + JobQueue {}

impl<T: JobStore + JobQueue + ?Sized> Backend for T {}

/// Shared guard evaluation for backends that check guards in Rust.
pub(crate) fn check_guard(job: &Job, guard: &LeaseGuard, now: DateTime<Utc>) -> Result<()> {
    use crate::LeaseMqError;

    match guard {
        LeaseGuard::None => Ok(()),
        LeaseGuard::Owner { worker, live } => {
            if job.lease_owner.as_deref() != Some(worker.as_str()) {
                return Err(LeaseMqError::NotOwner {
                    job_id: job.id,
                    worker: worker.clone(),
                });
            }
            if *live && job.lease_expiry.map_or(true, |expiry| expiry <= now) {
                return Err(LeaseMqError::Expired(job.id));
            }
            Ok(())
        }
        LeaseGuard::ExpiredBefore(at) => match job.lease_expiry {
            Some(expiry) if expiry >= *at => Err(LeaseMqError::Conflict(job.id)),
            _ => Ok(()),
        },
    }
}
