// src/store/memory.rs
use super::{check_guard, JobQueue, JobStore, QueueStats, Transition};
use crate::{Job, JobId, JobState, LeaseMqError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct QueueIndex {
    ready: BTreeSet<(DateTime<Utc>, JobId)>,
    ready_at: HashMap<JobId, DateTime<Utc>>,
    in_flight: HashMap<JobId, DateTime<Utc>>,
}

impl QueueIndex {
    fn push_ready(&mut self, id: JobId, at: DateTime<Utc>) {
        self.remove_ready(&id);
        self.ready.insert((at, id));
        self.ready_at.insert(id, at);
    }

    fn remove_ready(&mut self, id: &JobId) {
        if let Some(at) = self.ready_at.remove(id) {
            self.ready.remove(&(at, *id));
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    queues: HashMap<String, QueueIndex>,
}

/// In-process backend for tests and single-process deployments.
///
/// One mutex guards records and indexes together, so every operation is
/// trivially atomic. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    offline: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an outage: every call fails with `StoreUnavailable` until reset.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(LeaseMqError::StoreUnavailable(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "memory backend offline",
            ))));
        }
        Ok(())
    }

    /// Put `id` in the in-flight index regardless of its state.
    #[cfg(test)]
    pub(crate) async fn park_in_flight(&self, queue: &str, id: JobId, at: DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        let index = inner.queues.entry(queue.to_string()).or_default();
        index.remove_ready(&id);
        index.in_flight.insert(id, at);
    }

    /// Every job currently recorded, in creation order.
    pub async fn jobs(&self) -> Vec<Job> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner.jobs.values().cloned().collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }
}

#[async_trait]
impl JobStore for MemoryBackend {
    async fn create(&self, job: Job) -> Result<JobId> {
        self.ensure_online()?;
        let mut inner = self.inner.lock().await;
        if inner.jobs.contains_key(&job.id) {
            return Err(LeaseMqError::InvalidInput(format!(
                "job {} already exists",
                job.id
            )));
        }

        let id = job.id;
        inner
            .queues
            .entry(job.queue.clone())
            .or_default()
            .push_ready(id, job.not_before);
        inner.jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, id: &JobId) -> Result<Job> {
        self.ensure_online()?;
        let inner = self.inner.lock().await;
        inner
            .jobs
            .get(id)
            .cloned()
            .ok_or(LeaseMqError::NotFound(*id))
    }

    async fn transition(
        &self,
        queue: &str,
        id: &JobId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        self.ensure_online()?;
        if transition.from.is_terminal() {
            return Err(LeaseMqError::InvalidInput(format!(
                "cannot transition out of terminal state {}",
                transition.from
            )));
        }

        let mut inner = self.inner.lock().await;
        let Inner { jobs, queues } = &mut *inner;

        let job = match jobs.get_mut(id) {
            Some(job) if job.queue == queue => job,
            _ => return Err(LeaseMqError::NotFound(*id)),
        };
        if job.state != transition.from {
            return Err(LeaseMqError::Conflict(*id));
        }
        check_guard(job, &transition.guard, now)?;

        transition.patch.apply(job);
        job.state = transition.to;
        job.updated_at = now;

        let index = queues.entry(queue.to_string()).or_default();
        match transition.to {
            JobState::Pending => {
                let at = transition.requeue_at.unwrap_or(now);
                job.not_before = at;
                index.in_flight.remove(id);
                index.push_ready(*id, at);
            }
            JobState::Completed | JobState::Dead => {
                index.remove_ready(id);
                index.in_flight.remove(id);
            }
            JobState::Leased | JobState::Failed | JobState::Retrying => {
                index.remove_ready(id);
                index.in_flight.insert(*id, job.lease_expiry.unwrap_or(now));
            }
        }

        Ok(job.clone())
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_online()
    }
}

#[async_trait]
impl JobQueue for MemoryBackend {
    async fn enqueue(&self, queue: &str, id: &JobId, not_before: DateTime<Utc>) -> Result<()> {
        self.ensure_online()?;
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(id) {
            Some(job) if job.queue == queue && job.state == JobState::Pending => {
                job.not_before = not_before
            }
            Some(job) if job.queue == queue => return Err(LeaseMqError::Conflict(*id)),
            _ => return Err(LeaseMqError::NotFound(*id)),
        }
        let index = inner.queues.entry(queue.to_string()).or_default();
        index.in_flight.remove(id);
        index.push_ready(*id, not_before);
        Ok(())
    }

    async fn dequeue_next(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<JobId>> {
        self.ensure_online()?;
        let mut inner = self.inner.lock().await;
        let Some(index) = inner.queues.get_mut(queue) else {
            return Ok(None);
        };

        let next = match index.ready.first() {
            Some(&(at, id)) if at <= now => id,
            _ => return Ok(None),
        };
        index.remove_ready(&next);
        index.in_flight.insert(next, now);
        Ok(Some(next))
    }

    async fn in_flight(
        &self,
        queue: &str,
        before: DateTime<Utc>,
    ) -> Result<Vec<(JobId, DateTime<Utc>)>> {
        self.ensure_online()?;
        let inner = self.inner.lock().await;
        let Some(index) = inner.queues.get(queue) else {
            return Ok(Vec::new());
        };

        let mut entries: Vec<(JobId, DateTime<Utc>)> = index
            .in_flight
            .iter()
            .filter(|(_, score)| **score < before)
            .map(|(id, score)| (*id, *score))
            .collect();
        entries.sort_by_key(|(id, score)| (*score, *id));
        Ok(entries)
    }

    async fn discard_in_flight(&self, queue: &str, id: &JobId) -> Result<()> {
        self.ensure_online()?;
        let mut inner = self.inner.lock().await;
        if let Some(index) = inner.queues.get_mut(queue) {
            index.in_flight.remove(id);
        }
        Ok(())
    }

    async fn stats(&self, queue: &str, now: DateTime<Utc>) -> Result<QueueStats> {
        self.ensure_online()?;
        let inner = self.inner.lock().await;
        let Some(index) = inner.queues.get(queue) else {
            return Ok(QueueStats::default());
        };

        let ready = index.ready.iter().filter(|(at, _)| *at <= now).count();
        Ok(QueueStats {
            ready,
            delayed: index.ready.len() - ready,
            in_flight: index.in_flight.len(),
        })
    }
}
