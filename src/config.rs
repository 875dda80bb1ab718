//! Breaker configuration and builder.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::breaker::CircuitBreaker;
use crate::bulkhead::BulkheadConfig;
use crate::error::ConfigError;
use crate::events::EventDispatcher;
use crate::fallback::Fallback;
use crate::retry::RetryConfig;

/// Shape and size of a breaker's sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    /// Ring buffer of the last `size` outcomes.
    CountBased {
        /// Number of retained outcomes.
        size: usize,
    },
    /// Bucketed window over the last `span` of wall time.
    TimeBased {
        /// Span covered by the window.
        span: Duration,
        /// Number of eviction buckets.
        buckets: usize,
    },
}

/// Timeout applied to each attempt of a protected call.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    /// Budget for a single attempt.
    pub duration: Duration,
}

/// Read-only configuration of one circuit breaker.
///
/// Effectively immutable after breaker creation; the breaker reads it
/// without synchronization.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failure-rate percentage at or above which the circuit opens.
    pub failure_rate_threshold: f64,
    /// Slow-call-rate percentage at or above which the circuit opens.
    pub slow_call_rate_threshold: f64,
    /// Duration beyond which a call counts as slow, success or not.
    pub slow_call_duration_threshold: Duration,
    /// Trial calls permitted per half-open episode.
    pub permitted_calls_in_half_open: u32,
    /// Success-rate percentage among trial calls required to close.
    pub success_rate_threshold: f64,
    /// Sliding-window kind and size.
    pub window: WindowKind,
    /// Outcomes required in the window before thresholds are evaluated.
    pub minimum_calls: u64,
    /// How long the circuit stays open before probing recovery.
    pub wait_duration_in_open: Duration,
    /// Let the health monitor drive open-to-half-open instead of the lazy
    /// gate-time check.
    pub automatic_transition: bool,
    /// Optional concurrency limiter, applied before the gate.
    pub bulkhead: Option<BulkheadConfig>,
    /// Optional retry policy for failed attempts.
    pub retry: Option<RetryConfig>,
    /// Optional per-attempt timeout.
    pub timeout: Option<TimeoutConfig>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(1),
            permitted_calls_in_half_open: 10,
            success_rate_threshold: 50.0,
            window: WindowKind::CountBased { size: 100 },
            minimum_calls: 10,
            wait_duration_in_open: Duration::from_secs(30),
            automatic_transition: false,
            bulkhead: None,
            retry: None,
            timeout: None,
        }
    }
}

impl BreakerConfig {
    /// Validates threshold ranges and non-zero sizes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_rate("failure_rate_threshold", self.failure_rate_threshold)?;
        check_rate("slow_call_rate_threshold", self.slow_call_rate_threshold)?;
        check_rate("success_rate_threshold", self.success_rate_threshold)?;
        if self.permitted_calls_in_half_open == 0 {
            return Err(ConfigError::ZeroSize("permitted_calls_in_half_open"));
        }
        if self.minimum_calls == 0 {
            return Err(ConfigError::ZeroSize("minimum_calls"));
        }
        match &self.bulkhead {
            Some(BulkheadConfig::Semaphore {
                max_concurrent: 0, ..
            }) => return Err(ConfigError::ZeroSize("bulkhead max_concurrent")),
            Some(BulkheadConfig::Queue {
                worker_count: 0, ..
            }) => return Err(ConfigError::ZeroSize("bulkhead worker_count")),
            _ => {}
        }
        if let Some(retry) = &self.retry {
            if retry.max_attempts == 0 {
                return Err(ConfigError::ZeroSize("retry max_attempts"));
            }
        }
        match self.window {
            WindowKind::CountBased { size } if size == 0 => {
                Err(ConfigError::ZeroSize("window size"))
            }
            WindowKind::TimeBased { buckets, span } if buckets == 0 || span.is_zero() => {
                Err(ConfigError::ZeroSize("window span"))
            }
            _ => Ok(()),
        }
    }
}

fn check_rate(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value <= 100.0 {
        Ok(())
    } else {
        Err(ConfigError::ThresholdOutOfRange { field, value })
    }
}

/// Builder for creating circuit breakers with custom configurations.
pub struct BreakerBuilder<T, E> {
    name: String,
    service: String,
    config: BreakerConfig,
    fallback: Option<Fallback<T>>,
    dispatcher: Option<Arc<EventDispatcher>>,
    _error_type: PhantomData<fn() -> E>,
}

impl<T, E> BreakerBuilder<T, E>
where
    E: std::error::Error + 'static,
{
    /// Creates a builder for a breaker named `name` with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            service: name.clone(),
            name,
            config: BreakerConfig::default(),
            fallback: None,
            dispatcher: None,
            _error_type: PhantomData,
        }
    }

    /// Sets the owning-service label (defaults to the breaker name).
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    /// Sets the failure-rate percentage that trips the circuit.
    pub fn failure_rate_threshold(mut self, percent: f64) -> Self {
        self.config.failure_rate_threshold = percent;
        self
    }

    /// Sets the slow-call-rate percentage that trips the circuit.
    pub fn slow_call_rate_threshold(mut self, percent: f64) -> Self {
        self.config.slow_call_rate_threshold = percent;
        self
    }

    /// Sets the duration beyond which a call counts as slow.
    pub fn slow_call_duration_threshold(mut self, duration: Duration) -> Self {
        self.config.slow_call_duration_threshold = duration;
        self
    }

    /// Sets the number of trial calls permitted while half-open.
    pub fn permitted_calls_in_half_open(mut self, calls: u32) -> Self {
        self.config.permitted_calls_in_half_open = calls;
        self
    }

    /// Sets the trial success-rate percentage required to close.
    pub fn success_rate_threshold(mut self, percent: f64) -> Self {
        self.config.success_rate_threshold = percent;
        self
    }

    /// Sets the sliding-window kind and size.
    pub fn window(mut self, window: WindowKind) -> Self {
        self.config.window = window;
        self
    }

    /// Sets the minimum recorded calls before thresholds are evaluated.
    pub fn minimum_calls(mut self, calls: u64) -> Self {
        self.config.minimum_calls = calls;
        self
    }

    /// Sets how long the circuit waits while open before probing recovery.
    pub fn wait_duration_in_open(mut self, duration: Duration) -> Self {
        self.config.wait_duration_in_open = duration;
        self
    }

    /// Delegates the open-to-half-open transition to the health monitor.
    pub fn automatic_transition(mut self, enabled: bool) -> Self {
        self.config.automatic_transition = enabled;
        self
    }

    /// Attaches a bulkhead.
    pub fn bulkhead(mut self, bulkhead: BulkheadConfig) -> Self {
        self.config.bulkhead = Some(bulkhead);
        self
    }

    /// Attaches a retry policy.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = Some(retry);
        self
    }

    /// Attaches a per-attempt timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.config.timeout = Some(TimeoutConfig { duration });
        self
    }

    /// Attaches a fallback.
    pub fn fallback(mut self, fallback: Fallback<T>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Publishes events through the given dispatcher instead of a private one.
    pub fn dispatcher(mut self, dispatcher: Arc<EventDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub(crate) fn dispatcher_is_set(&self) -> bool {
        self.dispatcher.is_some()
    }

    /// Validates the configuration and builds the breaker.
    pub fn build(self) -> Result<CircuitBreaker<T, E>, ConfigError> {
        self.config.validate()?;
        let dispatcher = self
            .dispatcher
            .unwrap_or_else(|| Arc::new(EventDispatcher::new()));
        Ok(CircuitBreaker::from_parts(
            self.name,
            self.service,
            self.config,
            self.fallback,
            dispatcher,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(BreakerConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        let config = BreakerConfig {
            failure_rate_threshold: 0.0,
            ..BreakerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ThresholdOutOfRange { .. })
        ));

        let config = BreakerConfig {
            slow_call_rate_threshold: 120.0,
            ..BreakerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_sizes() {
        let config = BreakerConfig {
            window: WindowKind::CountBased { size: 0 },
            ..BreakerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroSize("window size")));

        let config = BreakerConfig {
            minimum_calls: 0,
            ..BreakerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_sized_policies() {
        let config = BreakerConfig {
            bulkhead: Some(BulkheadConfig::Semaphore {
                max_concurrent: 0,
                max_wait: Duration::from_millis(10),
                fair: true,
            }),
            ..BreakerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroSize("bulkhead max_concurrent"))
        );

        let config = BreakerConfig {
            bulkhead: Some(BulkheadConfig::Queue {
                worker_count: 0,
                queue_size: 4,
                max_wait: Duration::from_millis(10),
            }),
            ..BreakerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroSize("bulkhead worker_count"))
        );

        let config = BreakerConfig {
            retry: Some(RetryConfig {
                max_attempts: 0,
                ..RetryConfig::default()
            }),
            ..BreakerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroSize("retry max_attempts"))
        );
    }
}
