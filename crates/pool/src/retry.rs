//! Backoff between dispatch attempts

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::duration_millis;

/// How long `submit` waits before re-dispatching a request
///
/// Attempt 1 always goes out immediately. Attempt `n` waits
/// `base_delay * multiplier^(n-2)`, capped at `max_delay` and spread by
/// `jitter` so workers replaced after a common fault are not hit in lockstep.
/// How many attempts there are is `PoolConfig::max_retries_per_request`.
///
/// ```
/// use warmpool_pool::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_base_delay(Duration::from_millis(50))
///     .with_max_delay(Duration::from_secs(1))
///     .with_jitter(0.0);
///
/// assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(50));
/// assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(100));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Wait before the second attempt
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Growth per further attempt; 1.0 keeps the delay fixed
    pub multiplier: f64,

    /// Fraction of the delay added or removed at random, 0.0 to 1.0
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// 50 ms doubling up to 2 s, 10% jitter. Long enough for a replacement
    /// worker to come up after a couple of retries.
    pub fn exponential() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before 1-based attempt `attempt`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(exponent) = attempt.checked_sub(2) else {
            return Duration::ZERO;
        };

        // Deserialized policies skip the builder clamps
        let multiplier = self.multiplier.max(1.0);
        let jitter = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };

        let ceiling = self.max_delay.as_secs_f64();
        let grown = self.base_delay.as_secs_f64() * multiplier.powi(exponent.min(64) as i32);
        let delay = grown.min(ceiling).max(0.0);

        if jitter == 0.0 || delay == 0.0 {
            return Duration::from_secs_f64(delay);
        }
        let spread = delay * jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((delay + offset).max(0.0))
    }
}
