//! Retry backoff.
//!
//! `delay = min(base_ms * multiplier^(attempt-1), max_ms)`, then scaled by a
//! random factor in `[min_jitter, 1.0]` so nodes that failed together do not
//! retry together.

use nodeinit_shared::{NodeinitError, NodeinitResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_ms: u64,
    /// Upper bound before jitter.
    pub max_ms: u64,
    pub multiplier: f64,
    /// Lower bound of the jitter factor. 1.0 disables jitter.
    pub min_jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 60_000,
            multiplier: 2.0,
            min_jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate() -> Self {
        Self {
            base_ms: 0,
            max_ms: 0,
            multiplier: 1.0,
            min_jitter: 1.0,
        }
    }

    pub(crate) fn validate(&self) -> NodeinitResult<()> {
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err(NodeinitError::Config(format!(
                "retry.multiplier must be a finite value >= 1, got {}",
                self.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.min_jitter) {
            return Err(NodeinitError::Config(format!(
                "retry.min_jitter must be in [0, 1], got {}",
                self.min_jitter
            )));
        }
        if self.base_ms > self.max_ms {
            return Err(NodeinitError::Config(format!(
                "retry.base_ms ({}) exceeds retry.max_ms ({})",
                self.base_ms, self.max_ms
            )));
        }
        Ok(())
    }

    /// Capped delay for the `attempt`-th retry (1-based), before jitter.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_ms as f64 * self.multiplier.powi(exponent);
        let max = self.max_ms as f64;
        let capped = if raw.is_nan() || raw < 0.0 {
            0.0
        } else {
            raw.min(max)
        };
        Duration::from_millis(capped as u64)
    }

    /// Jittered delay for the `attempt`-th retry.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if ceiling.is_zero() || self.min_jitter >= 1.0 {
            return ceiling;
        }
        let factor = rand::rng().random_range(self.min_jitter..=1.0);
        ceiling.mul_f64(factor)
    }
}
