//! Exponential retry backoff with jitter.

use std::time::Duration;

use rand::Rng;

use agential_core::defaults::{RETRY_BASE_DELAY_MS, RETRY_JITTER_MS, RETRY_MAX_DELAY_MS};

use crate::lane::env_or;

/// Delay before a failed job becomes eligible again.
///
/// `min(base * 2^(attempt - 1), max) + uniform(0..=jitter)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(RETRY_BASE_DELAY_MS),
            max: Duration::from_millis(RETRY_MAX_DELAY_MS),
            jitter: Duration::from_millis(RETRY_JITTER_MS),
        }
    }
}

impl RetryPolicy {
    /// Read `RETRY_BASE_DELAY_MS`, `RETRY_MAX_DELAY_MS` and `RETRY_JITTER_MS`.
    pub fn from_env() -> Self {
        Self {
            base: Duration::from_millis(env_or("RETRY_BASE_DELAY_MS", RETRY_BASE_DELAY_MS)),
            max: Duration::from_millis(env_or("RETRY_MAX_DELAY_MS", RETRY_MAX_DELAY_MS)),
            jitter: Duration::from_millis(env_or("RETRY_JITTER_MS", RETRY_JITTER_MS)),
        }
    }

    /// No delay at all; handy in tests.
    pub fn immediate() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Capped exponential part of the delay for the given (1-based) attempt.
    pub fn base_delay(&self, attempt: i32) -> Duration {
        let exp = attempt.saturating_sub(1).clamp(0, 30) as u32;
        self.base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Full delay including random jitter.
    pub fn delay_for(&self, attempt: i32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.base_delay(attempt) + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_then_caps() {
        let policy = RetryPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(10),
            jitter: Duration::ZERO,
        };
        let delays: Vec<u64> = (1..=6).map(|a| policy.base_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(i32::MAX), policy.max);
        assert_eq!(policy.base_delay(0), policy.base);
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let d = policy.delay_for(2);
            assert!(d >= Duration::from_millis(2_000));
            assert!(d <= Duration::from_millis(2_250));
        }
    }

    #[test]
    fn test_immediate_is_zero() {
        assert_eq!(RetryPolicy::immediate().delay_for(5), Duration::ZERO);
    }
}
