//! Health status and the periodic health monitor.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::breaker::CircuitBreaker;

/// Coarse health of a dependency as seen through its breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// The dependency is responding normally.
    Healthy,

    /// The dependency shows elevated failures or a failing probe.
    Degraded,

    /// The circuit is open or failures are sustained.
    Unhealthy,
}

/// Point-in-time health view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Derived status.
    pub status: HealthStatus,
    /// Failures since the last success.
    pub consecutive_failures: u64,
    /// Successes since the last failure.
    pub consecutive_successes: u64,
    /// Successful calls as a percentage of all recorded calls.
    pub uptime_percent: f64,
    /// When the breaker last left healthy, if it has not returned.
    pub degraded_since: Option<DateTime<Utc>>,
}

/// Async probe run by the [`HealthMonitor`]; returns whether the dependency
/// looked healthy.
pub type HealthProbe = Box<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Independent periodic probe feeding a breaker's health status.
///
/// When the breaker's `automatic_transition` flag is set, the monitor also
/// drives the open-to-half-open transition once the wait duration elapses,
/// replacing the lazy gate-time check.
pub struct HealthMonitor {
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    /// Starts probing `breaker` every `interval`.
    pub fn start<T, E>(
        breaker: Arc<CircuitBreaker<T, E>>,
        interval: Duration,
        probe: HealthProbe,
    ) -> Self
    where
        T: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let healthy = probe().await;
                breaker.record_probe(healthy);
                if !healthy {
                    tracing::debug!(breaker = %breaker.name(), "health probe failed");
                }
                if breaker.config().automatic_transition && breaker.try_automatic_half_open() {
                    tracing::info!(
                        breaker = %breaker.name(),
                        "health monitor moved circuit to half-open"
                    );
                }
            }
        });
        Self { handle }
    }

    /// Stops the probe task.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
