//! Retry policy: exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

use ac_common::ErrorType;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay for the first retry
    pub base_delay: Duration,
    /// Cap applied before jitter
    pub max_delay: Duration,
    /// Jitter fraction (0.2 = up to plus/minus 20%)
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based): `base * 2^attempt`
    /// capped at `max_delay`, with up to plus/minus `jitter` applied.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        let capped = exp.min(self.max_delay);

        if self.jitter <= 0.0 {
            return capped;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        capped.mul_f64(factor)
    }

    /// Uncapped, unjittered delay. Exposed so callers can assert the
    /// monotone schedule independent of randomness.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.max_delay)
    }

    /// Whether another attempt should be made after `attempts` tries
    /// failed with `error_type`. Permanent errors never retry.
    pub fn should_retry(&self, attempts: u32, error_type: ErrorType) -> bool {
        if error_type == ErrorType::Permanent {
            return false;
        }
        attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_monotone_until_cap() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..Default::default()
        };
        let mut prev = Duration::ZERO;
        for attempt in 0..10 {
            let delay = policy.next_delay(attempt);
            assert!(delay >= prev, "attempt {} regressed", attempt);
            assert!(delay <= policy.max_delay);
            prev = delay;
        }
        assert_eq!(policy.next_delay(9), policy.max_delay);
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 0..6 {
            let base = policy.base_delay_for(attempt);
            for _ in 0..50 {
                let delay = policy.next_delay(attempt);
                assert!(delay >= base.mul_f64(0.8), "below jitter floor");
                assert!(delay <= base.mul_f64(1.2), "above jitter ceiling");
            }
        }
    }

    #[test]
    fn test_permanent_never_retries() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(0, ErrorType::Permanent));
        assert!(!policy.should_retry(1, ErrorType::Permanent));
    }

    #[test]
    fn test_retry_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1, ErrorType::Transient));
        assert!(policy.should_retry(2, ErrorType::Unknown));
        assert!(!policy.should_retry(3, ErrorType::Transient));
        assert!(!policy.should_retry(4, ErrorType::Unknown));
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.next_delay(u32::MAX), policy.max_delay);
    }
}
