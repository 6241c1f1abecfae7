//! Exponential backoff policy.
//!
//! One policy object serves every retry loop in the pipeline: the push
//! transport's reconnect loop and the per-account connection registry.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on the exponent so `factor^n` cannot overflow.
const MAX_EXPONENT: u32 = 20;

/// `delay(n) = min(base * factor^n, cap) + jitter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    /// Multiplier per failed attempt.
    #[serde(default = "default_factor")]
    pub factor: u32,
    /// Maximum delay before jitter.
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,
    /// Maximum random jitter added on top (0 = deterministic).
    #[serde(default)]
    pub jitter_ms: u64,
}

fn default_base_ms() -> u64 {
    1_000
}

fn default_factor() -> u32 {
    2
}

fn default_cap_ms() -> u64 {
    60_000
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            factor: default_factor(),
            cap_ms: default_cap_ms(),
            jitter_ms: 0,
        }
    }
}

impl BackoffPolicy {
    /// Doubling backoff without jitter.
    pub fn exponential(base_ms: u64, cap_ms: u64) -> Self {
        Self {
            base_ms,
            factor: 2,
            cap_ms,
            jitter_ms: 0,
        }
    }

    /// Constant interval.
    pub fn fixed(interval_ms: u64) -> Self {
        Self {
            base_ms: interval_ms,
            factor: 1,
            cap_ms: interval_ms,
            jitter_ms: 0,
        }
    }

    pub fn with_jitter(mut self, jitter_ms: u64) -> Self {
        self.jitter_ms = jitter_ms;
        self
    }

    /// Delay before the retry that follows `retry_count` consecutive failures.
    ///
    /// retry_count=0 -> base, 1 -> base*factor, 2 -> base*factor^2, ...
    pub fn delay(&self, retry_count: u32) -> Duration {
        Duration::from_millis(self.delay_ms(retry_count) + self.jitter())
    }

    /// Deterministic part of the delay, in milliseconds.
    pub fn delay_ms(&self, retry_count: u32) -> u64 {
        let exponent = retry_count.min(MAX_EXPONENT);
        let multiplier = u64::from(self.factor.max(1)).saturating_pow(exponent);
        self.base_ms.saturating_mul(multiplier).min(self.cap_ms)
    }

    fn jitter(&self) -> u64 {
        if self.jitter_ms == 0 {
            return 0;
        }
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        u64::from(nanos) % (self.jitter_ms + 1)
    }
}
