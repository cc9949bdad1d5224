// src/lib.rs
//! leasemq: a durable, at-least-once job queue with execution leases
//!
//! Producers submit opaque payloads; workers claim them under time-bounded
//! leases, execute them, and report outcomes. Failed attempts are retried with
//! backoff until `max_attempts`, and jobs held by crashed workers are reclaimed
//! once their lease runs out. Every state change is an atomic
//! compare-and-update on the job record, so workers and reapers in any number
//! of processes can share one store.

pub mod backoff;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod job;
pub mod lease;
mod lua;
pub mod producer;
pub mod retry;
pub mod store;
pub mod worker;

pub use backoff::{Backoff, BackoffStrategy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use context::JobContext;
pub use error::{LeaseMqError, Result};
pub use events::{EventBus, EventKind, LifecycleEvent};
pub use executor::{from_fn, ExecutionResult, Executor, FnExecutor, JsonExecutor, JsonJob};
pub use job::{ExecutionError, Job, JobId, JobOptions, JobState, Outcome};
pub use lease::{Claim, LeaseManager};
pub use producer::Producer;
pub use retry::{RetryDecision, RetryPolicy};
pub use store::{
    Backend, JobPatch, JobQueue, JobStore, LeaseGuard, MemoryBackend, QueueStats, RedisBackend,
    RedisOptions, Transition,
};
pub use worker::{Worker, WorkerBuilder, WorkerConfig, WorkerStats};

// Re-export commonly used types
pub use async_trait::async_trait;
