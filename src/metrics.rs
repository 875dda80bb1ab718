//! Cumulative per-breaker metrics and the diagnostic call-record log.
//!
//! Everything here lives inside the breaker's guarded core, so the types
//! are plain mutable data; the breaker serializes access.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::ErrorClass;
use crate::state::State;

/// Latency samples retained for percentile estimates.
const LATENCY_RESERVOIR: usize = 256;

/// Call records retained per breaker for diagnostics.
pub(crate) const CALL_RECORD_CAPACITY: usize = 256;

/// One historical entry per executed call, newest queried first.
///
/// Diagnostics only; the state machine itself reads the sliding window.
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    /// Breaker the call ran under.
    pub breaker: String,
    /// Wall-clock completion time.
    pub at: DateTime<Utc>,
    /// How long the final attempt took, in milliseconds.
    pub duration_ms: u64,
    /// Whether the call succeeded.
    pub success: bool,
    /// Whether the call exceeded the slow-call threshold.
    pub slow: bool,
    /// Circuit state observed at call time.
    pub state: State,
    /// Failure classification, when the call failed.
    pub error_class: Option<ErrorClass>,
    /// Whether at least one retry was attempted.
    pub retried: bool,
    /// Whether a fallback substitute was returned to the caller.
    pub fallback_used: bool,
    /// Whether the bulkhead rejected the call.
    pub bulkhead_rejected: bool,
    /// Whether the call timed out.
    pub timed_out: bool,
}

/// Serializable counter snapshot for the query surface.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Total terminal outcomes recorded.
    pub total_calls: u64,
    /// Successful outcomes.
    pub successful_calls: u64,
    /// Failed outcomes.
    pub failed_calls: u64,
    /// Outcomes over the slow-call threshold.
    pub slow_calls: u64,
    /// Gate rejections while open or trial-exhausted.
    pub rejected_calls: u64,
    /// Bulkhead rejections.
    pub bulkhead_rejections: u64,
    /// Calls that hit the timeout budget.
    pub timeouts: u64,
    /// Retry attempts made beyond first calls.
    pub retry_attempts: u64,
    /// Fallback invocations.
    pub fallback_invocations: u64,
    /// Mean latency over the reservoir, in milliseconds.
    pub avg_latency_ms: f64,
    /// Median latency, in milliseconds.
    pub p50_latency_ms: u64,
    /// 95th percentile latency, in milliseconds.
    pub p95_latency_ms: u64,
    /// 99th percentile latency, in milliseconds.
    pub p99_latency_ms: u64,
    /// Cumulative milliseconds spent closed.
    pub time_closed_ms: u64,
    /// Cumulative milliseconds spent open.
    pub time_open_ms: u64,
    /// Cumulative milliseconds spent half-open.
    pub time_half_open_ms: u64,
}

/// Cumulative metrics owned by one breaker.
#[derive(Debug)]
pub struct BreakerMetrics {
    /// Total terminal outcomes recorded.
    pub total_calls: u64,
    /// Successful outcomes.
    pub successful_calls: u64,
    /// Failed outcomes.
    pub failed_calls: u64,
    /// Outcomes over the slow-call threshold.
    pub slow_calls: u64,
    /// Gate rejections.
    pub rejected_calls: u64,
    /// Bulkhead rejections observed by the executor.
    pub bulkhead_rejections: u64,
    /// Timed-out calls.
    pub timeouts: u64,
    /// Retry attempts beyond first calls.
    pub retry_attempts: u64,
    /// Fallback invocations observed by the executor.
    pub fallback_invocations: u64,
    latencies: VecDeque<Duration>,
    time_in_state: [Duration; 3],
    state_entered_at: Instant,
    current_state: State,
}

impl BreakerMetrics {
    /// Creates zeroed metrics for a breaker starting in `state`.
    pub fn new(state: State) -> Self {
        Self {
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            slow_calls: 0,
            rejected_calls: 0,
            bulkhead_rejections: 0,
            timeouts: 0,
            retry_attempts: 0,
            fallback_invocations: 0,
            latencies: VecDeque::with_capacity(LATENCY_RESERVOIR),
            time_in_state: [Duration::ZERO; 3],
            state_entered_at: Instant::now(),
            current_state: state,
        }
    }

    /// Records one terminal outcome.
    pub fn record_outcome(&mut self, success: bool, slow: bool, duration: Duration) {
        self.total_calls += 1;
        if success {
            self.successful_calls += 1;
        } else {
            self.failed_calls += 1;
        }
        if slow {
            self.slow_calls += 1;
        }
        if self.latencies.len() == LATENCY_RESERVOIR {
            self.latencies.pop_front();
        }
        self.latencies.push_back(duration);
    }

    /// Accounts elapsed time to the outgoing state on a transition.
    pub fn note_state_change(&mut self, to: State) {
        let now = Instant::now();
        self.time_in_state[state_index(self.current_state)] +=
            now.duration_since(self.state_entered_at);
        self.state_entered_at = now;
        self.current_state = to;
    }

    /// Zeroes every counter, keeping only the state clock anchored at now.
    pub fn reset(&mut self, state: State) {
        *self = Self::new(state);
    }

    /// Builds the serializable snapshot, folding in the live state clock.
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut time_in_state = self.time_in_state;
        time_in_state[state_index(self.current_state)] += self.state_entered_at.elapsed();

        let mut sorted: Vec<Duration> = self.latencies.iter().copied().collect();
        sorted.sort_unstable();
        let avg = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().map(|d| d.as_secs_f64()).sum::<f64>() / sorted.len() as f64 * 1000.0
        };

        StatsSnapshot {
            total_calls: self.total_calls,
            successful_calls: self.successful_calls,
            failed_calls: self.failed_calls,
            slow_calls: self.slow_calls,
            rejected_calls: self.rejected_calls,
            bulkhead_rejections: self.bulkhead_rejections,
            timeouts: self.timeouts,
            retry_attempts: self.retry_attempts,
            fallback_invocations: self.fallback_invocations,
            avg_latency_ms: avg,
            p50_latency_ms: percentile(&sorted, 50.0),
            p95_latency_ms: percentile(&sorted, 95.0),
            p99_latency_ms: percentile(&sorted, 99.0),
            time_closed_ms: time_in_state[0].as_millis() as u64,
            time_open_ms: time_in_state[1].as_millis() as u64,
            time_half_open_ms: time_in_state[2].as_millis() as u64,
        }
    }
}

fn state_index(state: State) -> usize {
    match state {
        State::Closed => 0,
        State::Open => 1,
        State::HalfOpen => 2,
    }
}

fn percentile(sorted: &[Duration], pct: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (pct / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)].as_millis() as u64
}
