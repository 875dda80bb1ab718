//! Retry policy and backoff schedules.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ErrorClass;

/// Backoff schedule between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Delay grows linearly: `initial_delay * attempt`.
    Linear,

    /// Delay grows geometrically: `initial_delay * multiplier^(attempt - 1)`.
    Exponential {
        /// Growth factor applied per attempt.
        multiplier: f64,
    },

    /// Delay follows the Fibonacci sequence scaled by `initial_delay`.
    Fibonacci,
}

/// Configuration for retrying a failed call.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first call.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Backoff schedule for subsequent retries.
    pub backoff: Backoff,
    /// Upper bound on any single backoff delay.
    pub max_wait: Duration,
    /// Failure classes that pass through without being retried.
    pub ignore_classes: Vec<ErrorClass>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff: Backoff::Exponential { multiplier: 2.0 },
            max_wait: Duration::from_secs(30),
            ignore_classes: Vec::new(),
        }
    }
}

impl RetryConfig {
    /// Delay to wait after `attempt` failed attempts (1-based), capped at
    /// `max_wait`. Pure; the executor owns the actual sleep.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            Backoff::Linear => self.initial_delay.saturating_mul(attempt),
            Backoff::Exponential { multiplier } => {
                let factor = multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
                let millis = self.initial_delay.as_secs_f64() * 1000.0 * factor;
                if millis.is_finite() {
                    Duration::from_millis(millis.min(u64::MAX as f64) as u64)
                } else {
                    self.max_wait
                }
            }
            Backoff::Fibonacci => self.initial_delay.saturating_mul(fibonacci(attempt)),
        };
        delay.min(self.max_wait)
    }

    /// Whether a failure with this classification is eligible for retry.
    pub fn retryable(&self, class: ErrorClass) -> bool {
        !self.ignore_classes.contains(&class)
    }
}

/// Nth Fibonacci number (1-based: 1, 1, 2, 3, 5, ...), saturating.
fn fibonacci(n: u32) -> u32 {
    let (mut a, mut b) = (1u32, 1u32);
    for _ in 2..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    if n <= 1 {
        1
    } else {
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn linear_backoff_scales_with_attempt() {
        let config = RetryConfig {
            backoff: Backoff::Linear,
            initial_delay: Duration::from_millis(100),
            max_wait: Duration::from_secs(60),
            ..RetryConfig::default()
        };
        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(3), Duration::from_millis(300));
    }

    #[test]
    fn exponential_backoff_doubles() {
        let config = RetryConfig {
            backoff: Backoff::Exponential { multiplier: 2.0 },
            initial_delay: Duration::from_millis(100),
            max_wait: Duration::from_secs(60),
            ..RetryConfig::default()
        };
        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(4), Duration::from_millis(800));
    }

    #[test]
    fn fibonacci_backoff_follows_sequence() {
        let config = RetryConfig {
            backoff: Backoff::Fibonacci,
            initial_delay: Duration::from_millis(10),
            max_wait: Duration::from_secs(60),
            ..RetryConfig::default()
        };
        let expected = [10u64, 10, 20, 30, 50, 80];
        for (i, millis) in expected.iter().enumerate() {
            assert_eq!(
                config.delay_for(i as u32 + 1),
                Duration::from_millis(*millis)
            );
        }
    }

    #[test]
    fn delay_is_capped_at_max_wait() {
        let config = RetryConfig {
            backoff: Backoff::Exponential { multiplier: 10.0 },
            initial_delay: Duration::from_secs(1),
            max_wait: Duration::from_secs(5),
            ..RetryConfig::default()
        };
        assert_eq!(config.delay_for(10), Duration::from_secs(5));
    }

    #[test]
    fn ignored_classes_are_not_retryable() {
        let config = RetryConfig {
            ignore_classes: vec![ErrorClass::Timeout],
            ..RetryConfig::default()
        };
        assert!(!config.retryable(ErrorClass::Timeout));
        assert!(config.retryable(ErrorClass::Operation));
    }

    proptest! {
        #[test]
        fn exponential_delays_are_non_decreasing(
            multiplier in 1.0f64..8.0,
            attempt in 1u32..20,
        ) {
            let config = RetryConfig {
                backoff: Backoff::Exponential { multiplier },
                initial_delay: Duration::from_millis(10),
                max_wait: Duration::from_secs(300),
                ..RetryConfig::default()
            };
            prop_assert!(config.delay_for(attempt + 1) >= config.delay_for(attempt));
        }

        #[test]
        fn fibonacci_delays_are_non_decreasing(attempt in 1u32..30) {
            let config = RetryConfig {
                backoff: Backoff::Fibonacci,
                initial_delay: Duration::from_millis(10),
                max_wait: Duration::from_secs(3600),
                ..RetryConfig::default()
            };
            prop_assert!(config.delay_for(attempt + 1) >= config.delay_for(attempt));
        }
    }
}
