// src/retry.rs
use crate::{BackoffStrategy, ExecutionError, Job};
use std::time::Duration;

/// What to do with a job whose attempt just failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Dead,
}

/// Decides whether a failed job re-enters the queue, and when.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Used when the job carries no backoff of its own.
    pub default_backoff: BackoffStrategy,
    /// Hard ceiling applied on top of any strategy.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            default_backoff: BackoffStrategy::default(),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(default_backoff: BackoffStrategy) -> Self {
        Self {
            default_backoff,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn decide(&self, job: &Job, error: &ExecutionError) -> RetryDecision {
        if error.permanent || job.attempts_exhausted() {
            return RetryDecision::Dead;
        }

        let backoff = job.backoff.as_ref().unwrap_or(&self.default_backoff);
        let delay = backoff.calculate_delay(job.attempts).min(self.max_delay);
        RetryDecision::Retry { delay }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobOptions;
    use chrono::Utc;

    fn job_with_attempts(attempts: u32, max_attempts: u32) -> Job {
        let opts = JobOptions::default().with_max_attempts(max_attempts);
        let mut job = Job::new("default", vec![], &opts, Utc::now()).unwrap();
        job.attempts = attempts;
        job
    }

    #[test]
    fn retries_while_attempts_remain() {
        let policy = RetryPolicy::new(BackoffStrategy::Fixed { millis: 50 });
        let decision = policy.decide(&job_with_attempts(1, 3), &ExecutionError::retryable("boom"));
        assert_eq!(
            decision,
            RetryDecision::Retry {
                delay: Duration::from_millis(50)
            }
        );
    }

    #[test]
    fn dead_once_attempts_are_exhausted() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(&job_with_attempts(3, 3), &ExecutionError::retryable("boom"));
        assert_eq!(decision, RetryDecision::Dead);
    }

    #[test]
    fn permanent_failures_skip_retries() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(&job_with_attempts(1, 5), &ExecutionError::permanent("bad"));
        assert_eq!(decision, RetryDecision::Dead);
    }

    #[test]
    fn job_backoff_overrides_default_and_is_capped() {
        let policy = RetryPolicy::new(BackoffStrategy::Fixed { millis: 1 })
            .with_max_delay(Duration::from_millis(500));
        let mut job = job_with_attempts(1, 3);
        job.backoff = Some(BackoffStrategy::Fixed { millis: 10_000 });
        assert_eq!(
            policy.decide(&job, &ExecutionError::retryable("slow")),
            RetryDecision::Retry {
                delay: Duration::from_millis(500)
            }
        );
    }
}
