//! Bounded exponential backoff and retry decisions.
//!
//! Delays are deterministic: `min(max_backoff, min_backoff * 2^min(attempts,
//! max_exponent))`. Without jitter the delay is monotone in the attempt
//! count, which keeps retry scheduling predictable for operators.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backoff configuration shared by both queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay unit doubled per attempt.
    pub min_backoff: Duration,

    /// Upper bound on computed delays.
    pub max_backoff: Duration,

    /// Attempts are clamped to this exponent before doubling.
    pub max_exponent: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            max_exponent: 10,
        }
    }
}

impl RetryPolicy {
    /// Computes the backoff delay after `attempts` attempts.
    ///
    /// Never exceeds `max_backoff` and never overflows, whatever the inputs.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.min(self.max_exponent).min(31);
        let multiplier = 1_u32 << exponent;

        self.min_backoff
            .checked_mul(multiplier)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }

    /// Computes the delay, raised to at least `retry_after` when the remote
    /// side asked for a minimum wait.
    pub fn delay(&self, attempts: u32, retry_after: Option<Duration>) -> Duration {
        let computed = self.backoff(attempts);
        retry_after.map_or(computed, |floor| computed.max(floor))
    }
}

/// Context of a failed attempt.
#[derive(Debug, Clone)]
pub struct RetryContext<'a> {
    /// Attempts made so far, including the failed one.
    pub attempts: u32,
    /// Attempt ceiling of the queue.
    pub max_attempts: u32,
    /// Whether the failure may succeed on a later attempt.
    pub retryable: bool,
    /// Minimum wait requested by the remote side.
    pub retry_after: Option<Duration>,
    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,
    /// Backoff policy.
    pub policy: &'a RetryPolicy,
}

/// Result of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry no earlier than `next_attempt_at`.
    Retry {
        /// Earliest time of the next attempt
        next_attempt_at: DateTime<Utc>,
    },
    /// Do not retry.
    GiveUp {
        /// Why no further attempt is made
        reason: String,
    },
}

impl RetryContext<'_> {
    /// Decides whether and when to retry.
    ///
    /// Permanent failures and failures at the attempt ceiling give up; all
    /// others are scheduled after the backoff delay.
    pub fn decide_retry(&self) -> RetryDecision {
        if !self.retryable {
            return RetryDecision::GiveUp { reason: "permanent failure".to_string() };
        }

        if self.attempts >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) reached", self.max_attempts),
            };
        }

        let delay = self.policy.delay(self.attempts, self.retry_after);
        let next_attempt_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| self.failed_at.checked_add_signed(delay));
        let Some(next_attempt_at) = next_attempt_at else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
            };
        };

        RetryDecision::Retry { next_attempt_at }
    }
}
