// src/error.rs
use crate::JobId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LeaseMqError {
    /// The store could not be reached. Safe to retry.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(redis::RedisError),

    /// The store answered with an error (script failure, wrong key type).
    #[error("Store command failed: {0}")]
    StoreCommand(redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// Stored state did not match the expected state at update time.
    #[error("Conflicting update on job {0}")]
    Conflict(JobId),

    #[error("Lease on job {0} has expired")]
    Expired(JobId),

    #[error("Worker {worker} does not own the lease on job {job_id}")]
    NotOwner { job_id: JobId, worker: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Corrupt job record {0}: {1}")]
    Corrupt(String, String),

    #[error("Worker error: {0}")]
    Worker(String),
}

impl LeaseMqError {
    /// Lease-level rejections: the caller must stop working on the job.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, Self::Expired(_) | Self::NotOwner { .. })
    }

    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

impl From<redis::RedisError> for LeaseMqError {
    fn from(err: redis::RedisError) -> Self {
        let unreachable = err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
            || err.kind() == redis::ErrorKind::IoError;
        if unreachable {
            Self::StoreUnavailable(err)
        } else {
            Self::StoreCommand(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, LeaseMqError>;
