//! Retry policy: exponential backoff between attempts, bounded by each job's `max_attempts`.

use std::time::Duration;

use crate::config::QueueConfig;

/// What happens to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `pending`, leasable again after `delay`.
    Retry { attempts: u32, delay: Duration },
    /// Terminal `failed`.
    Exhausted { attempts: u32 },
}

/// Exponential backoff: `base * 2^(attempts - 1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(2_000),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.base_backoff(), config.max_backoff())
    }

    /// Delay before the next attempt once `attempts` attempts have failed.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Decide the fate of a job whose failed-attempt count just became `attempts`.
    pub fn decide(&self, attempts: u32, max_attempts: u32, retryable: bool) -> RetryDecision {
        if !retryable || attempts >= max_attempts {
            RetryDecision::Exhausted { attempts }
        } else {
            RetryDecision::Retry {
                attempts,
                delay: self.backoff_for(attempts),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_from_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(8));
        assert_eq!(policy.backoff_for(4), Duration::from_secs(16));
    }

    #[test]
    fn test_backoff_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(30));
        assert_eq!(policy.backoff_for(5), Duration::from_secs(30));
        assert_eq!(policy.backoff_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_is_monotonic() {
        let policy = RetryPolicy::new(Duration::from_millis(750), Duration::from_secs(3600));
        let mut previous = Duration::ZERO;
        for attempts in 1..=64 {
            let delay = policy.backoff_for(attempts);
            assert!(delay >= previous, "attempt {} went backwards", attempts);
            previous = delay;
        }
    }

    #[test]
    fn test_decide_retries_until_max() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(1, 3, true),
            RetryDecision::Retry { attempts: 1, delay: Duration::from_secs(2) }
        );
        assert_eq!(
            policy.decide(2, 3, true),
            RetryDecision::Retry { attempts: 2, delay: Duration::from_secs(4) }
        );
        assert_eq!(policy.decide(3, 3, true), RetryDecision::Exhausted { attempts: 3 });
    }

    #[test]
    fn test_fatal_error_exhausts_immediately() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(1, 3, false), RetryDecision::Exhausted { attempts: 1 });
    }
}
