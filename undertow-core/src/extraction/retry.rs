//! Attempt budget and linear backoff for range reads.
//!
//! The wait after failed attempt `n` (1-indexed) is `n * step`, so with the
//! default one second step three failures cost 1s + 2s + 3s.

use std::time::Duration;

use crate::config::ExtractionConfig;

/// What to do after a failed read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then make attempt number `next_attempt`.
    Retry { delay: Duration, next_attempt: u32 },
    /// Wait `delay`, then surface the failure.
    GiveUp { delay: Duration },
}

impl RetryDecision {
    pub fn delay(&self) -> Duration {
        match self {
            Self::Retry { delay, .. } | Self::GiveUp { delay } => *delay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    step: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, step: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            step,
        }
    }

    pub fn from_config(config: &ExtractionConfig) -> Self {
        Self::new(config.max_attempts, config.backoff_step)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff after failed attempt `attempt` (1-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt.max(1))
    }

    /// Decides how to continue after attempt `attempt` failed.
    pub fn after_failure(&self, attempt: u32) -> RetryDecision {
        let delay = self.backoff(attempt);
        if attempt < self.max_attempts {
            RetryDecision::Retry {
                delay,
                next_attempt: attempt + 1,
            }
        } else {
            RetryDecision::GiveUp { delay }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ExtractionConfig::default())
    }
}
