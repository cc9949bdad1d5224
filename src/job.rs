// src/job.rs
use crate::{BackoffStrategy, LeaseMqError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a job
///
/// Backed by a UUIDv7, so ids sort in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = LeaseMqError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|_| LeaseMqError::InvalidInput(format!("invalid job id '{}'", s)))
    }
}

/// Current state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Leased,
    Completed,
    /// An attempt failed and the retry decision has not been applied yet.
    Failed,
    Retrying,
    Dead,
}

impl JobState {
    /// Completed and Dead jobs are immutable.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Leased => "leased",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Retrying => "retrying",
            JobState::Dead => "dead",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = LeaseMqError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobState::Pending),
            "leased" => Ok(JobState::Leased),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "retrying" => Ok(JobState::Retrying),
            "dead" => Ok(JobState::Dead),
            other => Err(LeaseMqError::InvalidInput(format!(
                "unknown job state '{}'",
                other
            ))),
        }
    }
}

/// Per-job submission options
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub max_attempts: u32,
    /// Overrides the retry policy's default backoff for this job.
    pub backoff: Option<BackoffStrategy>,
    /// Keep the job invisible to workers for this long after submission.
    pub delay: Option<Duration>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: None,
            delay: None,
        }
    }
}

impl JobOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// The durable job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub payload: Vec<u8>,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: Option<BackoffStrategy>,
    pub lease_owner: Option<String>,
    pub lease_expiry: Option<DateTime<Utc>>,
    /// Earliest instant the job is visible to `dequeue_next`.
    pub not_before: DateTime<Utc>,
    pub result: Option<Vec<u8>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh `Pending` record. Rejects `max_attempts == 0`.
    pub fn new(
        queue: impl Into<String>,
        payload: Vec<u8>,
        options: &JobOptions,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if options.max_attempts == 0 {
            return Err(LeaseMqError::InvalidInput(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        let queue = queue.into();
        if queue.is_empty() {
            return Err(LeaseMqError::InvalidInput(
                "queue name must not be empty".to_string(),
            ));
        }

        let not_before = match options.delay {
            Some(delay) => now + to_chrono(delay)?,
            None => now,
        };

        Ok(Self {
            id: JobId::new(),
            queue,
            payload,
            state: JobState::Pending,
            attempts: 0,
            max_attempts: options.max_attempts,
            backoff: options.backoff.clone(),
            lease_owner: None,
            lease_expiry: None,
            not_before,
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// True when the job is leased and its lease ran out before `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Leased && self.lease_expiry.map_or(true, |expiry| expiry < now)
    }
}

/// What an execution reported back to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Vec<u8>),
    Failure(ExecutionError),
}

impl From<std::result::Result<Vec<u8>, ExecutionError>> for Outcome {
    fn from(result: std::result::Result<Vec<u8>, ExecutionError>) -> Self {
        match result {
            Ok(output) => Outcome::Success(output),
            Err(err) => Outcome::Failure(err),
        }
    }
}

/// Failure signalled by an executor.
///
/// Failures are retryable unless marked permanent, in which case the job
/// goes straight to `Dead`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionError {
    pub message: String,
    pub permanent: bool,
}

impl ExecutionError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: false,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: true,
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ExecutionError {}

impl From<anyhow::Error> for ExecutionError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(format!("{:#}", err))
    }
}

impl From<LeaseMqError> for ExecutionError {
    fn from(err: LeaseMqError) -> Self {
        Self::retryable(err.to_string())
    }
}

pub(crate) fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|_| LeaseMqError::InvalidInput(format!("duration {:?} out of range", duration)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_starts_pending_with_zero_attempts() {
        let now = Utc::now();
        let job = Job::new("default", b"hello".to_vec(), &JobOptions::default(), now).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.not_before, now);
        assert!(job.lease_owner.is_none());
    }

    #[test]
    fn zero_max_attempts_is_rejected() {
        let opts = JobOptions::default().with_max_attempts(0);
        let err = Job::new("default", vec![], &opts, Utc::now()).unwrap_err();
        assert!(matches!(err, LeaseMqError::InvalidInput(_)));
    }

    #[test]
    fn delay_pushes_not_before() {
        let now = Utc::now();
        let opts = JobOptions::default().with_delay(Duration::from_secs(5));
        let job = Job::new("default", vec![], &opts, now).unwrap();
        assert_eq!(job.not_before, now + chrono::Duration::seconds(5));
    }

    #[test]
    fn state_names_parse_back() {
        for state in [
            JobState::Pending,
            JobState::Leased,
            JobState::Completed,
            JobState::Failed,
            JobState::Retrying,
            JobState::Dead,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("active".parse::<JobState>().is_err());
    }

    #[test]
    fn only_completed_and_dead_are_terminal() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Dead.is_terminal());
        assert!(!JobState::Failed.is_terminal());
        assert!(!JobState::Retrying.is_terminal());
    }

    #[test]
    fn job_ids_sort_in_creation_order() {
        let a = JobId::new();
        let b = JobId::new();
        assert!(a < b);
        assert_eq!(a.to_string().parse::<JobId>().unwrap(), a);
    }
}
