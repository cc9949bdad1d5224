// src/backoff.rs
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategies for job retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed {
        millis: u64,
    },
    Linear {
        increment_ms: u64,
        cap_ms: u64,
    },
    /// `base_ms * 2^attempt`, scaled by a random factor in `[1 - jitter, 1 + jitter]`.
    Exponential {
        base_ms: u64,
        cap_ms: u64,
        jitter: f64,
    },
}

impl BackoffStrategy {
    /// Delay before the next attempt, given how many attempts have run so far.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed { millis } => Duration::from_millis(*millis),
            BackoffStrategy::Linear {
                increment_ms,
                cap_ms,
            } => {
                let delay = increment_ms.saturating_mul(attempt as u64).min(*cap_ms);
                Duration::from_millis(delay)
            }
            BackoffStrategy::Exponential {
                base_ms,
                cap_ms,
                jitter,
            } => {
                let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
                let raw = base_ms.saturating_mul(factor).min(*cap_ms);
                let jittered = apply_jitter(raw, *jitter);
                Duration::from_millis(jittered.min(*cap_ms))
            }
        }
    }
}

fn apply_jitter(millis: u64, jitter: f64) -> u64 {
    if millis == 0 || !jitter.is_finite() || jitter <= 0.0 {
        return millis;
    }
    let spread = jitter.min(1.0);
    let scale = rand::thread_rng().gen_range(1.0 - spread..=1.0 + spread);
    (millis as f64 * scale).round() as u64
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base_ms: 1_000,
            cap_ms: 300_000,
            jitter: 0.1,
        }
    }
}

/// Convenience type alias
pub type Backoff = BackoffStrategy;
