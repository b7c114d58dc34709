//! # Reconnect Backoff
//!
//! Exponential backoff for the persistent ingestion mode: each consecutive
//! connection failure waits `multiplier` times longer than the previous one,
//! up to `max_delay`. A session that reaches the subscribed state resets the
//! sequence.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::time::Duration;

/// Parameters of the exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays. Must be greater than 1.
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

/// Tracks consecutive failures and hands out the next delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    /// Starts a fresh sequence.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Number of failures recorded since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Records a failure and returns how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        self.attempt = self.attempt.saturating_add(1);

        let max = self.policy.max_delay.as_secs_f64();
        let delay = self.policy.base_delay.as_secs_f64() * self.policy.multiplier.powi(exponent);
        if delay.is_finite() && delay < max {
            Duration::from_secs_f64(delay)
        } else {
            self.policy.max_delay
        }
    }

    /// Forgets past failures.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
