//! Bounded exponential backoff.
//!
//! Attempt numbers start at 1. The delay before attempt `n >= 2` is
//! `min(base * 2^(n-2), max)`, shortened by up to `jitter` of itself but
//! never below the un-jittered delay of the previous attempt, so successive
//! delays never decrease.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const MAX_JITTER: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, the first one included. Zero is treated as one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction in `[0, 0.5]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Whether another attempt may follow attempt number `attempt`.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.attempts()
    }

    /// Un-jittered delay before `attempt` (zero for the first attempt).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = (attempt - 2).min(31);
        let factor = 1u32 << exp;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Jittered delay before `attempt`; `unit` is a sample from `[0, 1)`.
    pub fn jittered_delay_before(&self, attempt: u32, unit: f64) -> Duration {
        let delay = self.delay_before(attempt);
        let jitter = self.jitter.clamp(0.0, MAX_JITTER);
        let unit = unit.clamp(0.0, 1.0);
        delay
            .mul_f64(1.0 - jitter * unit)
            .max(self.delay_before(attempt.saturating_sub(1)))
    }

    /// Lower bound of [`jittered_delay_before`](Self::jittered_delay_before).
    pub fn min_delay_before(&self, attempt: u32) -> Duration {
        self.jittered_delay_before(attempt, 1.0)
    }
}
