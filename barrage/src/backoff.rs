//! Retry backoff policy.
//!
//! Pure delay computation for unit-level retries: exponential growth from a
//! base delay, capped, with a small uniform jitter to avoid synchronized
//! retry storms. Rate-limit denials use the distributed limiter's own
//! schedule instead (see [`crate::limiter::distributed`]).

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with jitter.
///
/// `delay(attempt)` for a 1-indexed retry attempt is
/// `min(base * 2^(attempt - 1), cap)` plus a uniform random addition in
/// `[0, jitter_span]`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffPolicy {
    /// Delay before the first retry (default: 1s)
    #[serde(with = "humantime_serde")]
    pub base: Duration,
    /// Upper bound on the pre-jitter delay (default: 30s)
    #[serde(with = "humantime_serde")]
    pub cap: Duration,
    /// Width of the uniform jitter added on top (default: 250ms)
    #[serde(with = "humantime_serde")]
    pub jitter_span: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter_span: Duration::from_millis(250),
        }
    }
}

impl BackoffPolicy {
    /// The deterministic part of the delay for retry `attempt` (1-indexed),
    /// before jitter. Non-decreasing in `attempt` and never above `cap`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let millis = (self.base.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.cap)
    }

    /// Jittered delay for retry `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_millis = self.jitter_span.as_millis() as u64;
        let jitter = if jitter_millis == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_millis))
        };
        self.base_delay(attempt) + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(base_ms: u64, cap_ms: u64) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(base_ms),
            cap: Duration::from_millis(cap_ms),
            jitter_span: Duration::ZERO,
        }
    }

    #[test]
    fn delays_double_per_attempt() {
        let policy = no_jitter(1000, 60_000);

        assert_eq!(policy.base_delay(1), Duration::from_millis(1000));
        assert_eq!(policy.base_delay(2), Duration::from_millis(2000));
        assert_eq!(policy.base_delay(3), Duration::from_millis(4000));
        assert_eq!(policy.base_delay(4), Duration::from_millis(8000));
    }

    #[test]
    fn delays_are_capped() {
        let policy = no_jitter(1000, 5000);

        assert_eq!(policy.base_delay(4), Duration::from_millis(5000));
        assert_eq!(policy.base_delay(30), Duration::from_millis(5000));
        // Exponents past the shift width must not wrap
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_millis(5000));
    }

    #[test]
    fn delay_sequence_is_non_decreasing() {
        let policy = no_jitter(250, 10_000);

        let mut previous = Duration::ZERO;
        for attempt in 1..=40 {
            let delay = policy.base_delay(attempt);
            assert!(delay >= previous, "delay shrank at attempt {attempt}");
            previous = delay;
        }
    }

    #[test]
    fn jitter_stays_within_span() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(60),
            jitter_span: Duration::from_millis(50),
        };

        for _ in 0..200 {
            let delay = policy.delay(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }
}
