//! Per-dependency circuit breaker: gate check, execute pipeline, history.
//!
//! The mutable core (state, window, metrics, history, health counters) is a
//! single unit behind one mutex, so outcome recording and the rate
//! re-evaluation that follows it are atomic and transitions linearize.
//! Configuration is read-only after construction. Events are collected
//! under the lock and published after it is released.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::VecDeque;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bulkhead::{Bulkhead, BulkheadStats};
use crate::config::{BreakerBuilder, BreakerConfig, WindowKind};
use crate::error::{BreakerError, BreakerResult, ErrorClass};
use crate::events::{Event, EventDispatcher, EventKind};
use crate::fallback::{Fallback, FallbackStats};
use crate::health::{HealthSnapshot, HealthStatus};
use crate::metrics::{BreakerMetrics, CallRecord, StatsSnapshot, CALL_RECORD_CAPACITY};
use crate::state::State;
use crate::window::{CallOutcome, SlidingWindow, WindowStats};

/// Consecutive failures after which health degrades.
const DEGRADED_AFTER: u64 = 2;

/// Consecutive failures after which health is unhealthy.
const UNHEALTHY_AFTER: u64 = 5;

/// One entry in a breaker's append-only transition history.
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    /// Wall-clock time of the transition.
    pub at: DateTime<Utc>,
    /// State before the transition.
    pub from: State,
    /// State after the transition.
    pub to: State,
    /// Why the transition happened, recorded verbatim.
    pub reason: String,
    /// Failure rate at transition time, in percent.
    pub failure_rate: f64,
    /// Slow-call rate at transition time, in percent.
    pub slow_rate: f64,
    /// Whether this was a manual override.
    pub manual: bool,
    /// Who forced the transition, for manual overrides.
    pub actor: Option<String>,
}

#[derive(Default)]
struct Trial {
    admitted: u32,
    successes: u32,
    failures: u32,
}

struct Core {
    state: State,
    window: SlidingWindow,
    metrics: BreakerMetrics,
    history: Vec<StateTransition>,
    records: VecDeque<CallRecord>,
    consecutive_failures: u64,
    consecutive_successes: u64,
    degraded_since: Option<DateTime<Utc>>,
    last_probe_healthy: Option<bool>,
    half_open: Option<Trial>,
    last_transition_at: Instant,
    manual_hold: bool,
    // Bumped on every transition; outcomes carry the epoch they were
    // admitted under, so late calls from an earlier state never count
    // toward the current half-open trial.
    epoch: u64,
}

/// A circuit breaker protecting calls to one dependency.
///
/// `T` is the protected call's result type, `E` the operation error type.
/// Created once per dependency, usually through a [`Registry`]; mutated on
/// every call outcome and by manual override; never deleted, only
/// [`disable`]d.
///
/// [`Registry`]: crate::registry::Registry
/// [`disable`]: CircuitBreaker::disable
pub struct CircuitBreaker<T, E> {
    name: String,
    service: String,
    config: BreakerConfig,
    fallback: Option<Fallback<T>>,
    bulkhead: Option<Bulkhead>,
    core: Mutex<Core>,
    dispatcher: Arc<EventDispatcher>,
    disabled: AtomicBool,
    _error_type: PhantomData<fn() -> E>,
}

enum AttemptError<E> {
    Timeout(Duration),
    Operation(E),
}

impl<E> AttemptError<E> {
    fn class(&self) -> ErrorClass {
        match self {
            AttemptError::Timeout(_) => ErrorClass::Timeout,
            AttemptError::Operation(_) => ErrorClass::Operation,
        }
    }
}

struct CancelGuard<'a, T, E> {
    breaker: &'a CircuitBreaker<T, E>,
    armed: bool,
    started: Instant,
    epoch: u64,
}

impl<T, E> Drop for CancelGuard<'_, T, E> {
    fn drop(&mut self) {
        if self.armed {
            // The execute future was dropped mid-flight; count it as a
            // failure so in-flight accounting stays consistent.
            let events = self.breaker.record_terminal(TerminalOutcome {
                success: false,
                slow: false,
                duration: self.started.elapsed(),
                class: Some(ErrorClass::Cancelled),
                retried: false,
                timed_out: false,
                fallback_used: false,
                epoch: self.epoch,
            });
            self.breaker.publish_all(events);
        }
    }
}

struct TerminalOutcome {
    success: bool,
    slow: bool,
    duration: Duration,
    class: Option<ErrorClass>,
    retried: bool,
    timed_out: bool,
    fallback_used: bool,
    epoch: u64,
}

impl<T, E> CircuitBreaker<T, E> {
    pub(crate) fn from_parts(
        name: String,
        service: String,
        config: BreakerConfig,
        fallback: Option<Fallback<T>>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        let window = match config.window {
            WindowKind::CountBased { size } => SlidingWindow::count_based(size),
            WindowKind::TimeBased { span, buckets } => SlidingWindow::time_based(span, buckets),
        };
        let bulkhead = config.bulkhead.as_ref().map(Bulkhead::new);
        Self {
            name,
            service,
            config,
            fallback,
            bulkhead,
            core: Mutex::new(Core {
                state: State::Closed,
                window,
                metrics: BreakerMetrics::new(State::Closed),
                history: Vec::new(),
                records: VecDeque::with_capacity(CALL_RECORD_CAPACITY),
                consecutive_failures: 0,
                consecutive_successes: 0,
                degraded_since: None,
                last_probe_healthy: None,
                half_open: None,
                last_transition_at: Instant::now(),
                manual_hold: false,
                epoch: 0,
            }),
            dispatcher,
            disabled: AtomicBool::new(false),
            _error_type: PhantomData,
        }
    }

    /// Name identifying this breaker.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning-service label.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The breaker's read-only configuration.
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state of the circuit.
    pub fn state(&self) -> State {
        self.core.lock().state
    }

    /// Dispatcher this breaker publishes events through.
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Stops gating: calls pass through unprotected and unrecorded.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Relaxed);
    }

    /// Resumes gating after [`disable`](CircuitBreaker::disable).
    pub fn enable(&self) {
        self.disabled.store(false, Ordering::Relaxed);
    }

    /// Whether gating is currently disabled.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// Serializable counter snapshot.
    pub fn metrics(&self) -> StatsSnapshot {
        self.core.lock().metrics.snapshot()
    }

    /// Totals and rates over the live sliding window.
    pub fn window_stats(&self) -> WindowStats {
        self.core.lock().window.stats()
    }

    /// Copy of the append-only transition history.
    pub fn history(&self) -> Vec<StateTransition> {
        self.core.lock().history.clone()
    }

    /// Most recent call records, newest first, up to `limit`.
    pub fn call_records(&self, limit: usize) -> Vec<CallRecord> {
        self.core
            .lock()
            .records
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Current health snapshot.
    pub fn health(&self) -> HealthSnapshot {
        let core = self.core.lock();
        let status = Self::status_of(&core);
        let uptime_percent = if core.metrics.total_calls == 0 {
            100.0
        } else {
            core.metrics.successful_calls as f64 / core.metrics.total_calls as f64 * 100.0
        };
        HealthSnapshot {
            status,
            consecutive_failures: core.consecutive_failures,
            consecutive_successes: core.consecutive_successes,
            uptime_percent,
            degraded_since: core.degraded_since,
        }
    }

    /// Fallback counters, when a fallback is attached.
    pub fn fallback_stats(&self) -> Option<FallbackStats> {
        self.fallback.as_ref().map(Fallback::stats)
    }

    /// Bulkhead counters, when a bulkhead is attached.
    pub fn bulkhead_stats(&self) -> Option<BulkheadStats> {
        self.bulkhead.as_ref().map(Bulkhead::stats)
    }

    /// Forces a transition to `to`, bypassing threshold evaluation.
    ///
    /// The override is recorded in history with `manual = true` and the
    /// given actor, and suppresses automatic evaluation until the next
    /// transition.
    pub fn force_transition(&self, to: State, reason: impl Into<String>, actor: impl Into<String>) {
        let reason = reason.into();
        let actor = actor.into();
        let mut events = Vec::new();
        {
            let mut core = self.core.lock();
            self.transition_locked(&mut core, to, &reason, true, Some(actor), &mut events);
        }
        self.publish_all(events);
    }

    /// Resets the breaker to closed with zeroed metrics. Idempotent.
    pub fn reset(&self) {
        let mut events = Vec::new();
        {
            let mut core = self.core.lock();
            if core.state != State::Closed {
                self.transition_locked(
                    &mut core,
                    State::Closed,
                    "Manual reset",
                    true,
                    None,
                    &mut events,
                );
            }
            core.window.clear();
            core.metrics.reset(State::Closed);
            core.consecutive_failures = 0;
            core.consecutive_successes = 0;
            core.degraded_since = None;
            core.half_open = None;
            core.manual_hold = false;
            events.push(Event::now(
                &self.name,
                EventKind::Reset,
                State::Closed,
                json!({ "service": self.service }),
            ));
        }
        tracing::info!(breaker = %self.name, "circuit breaker reset");
        self.publish_all(events);
    }

    /// Health-monitor feedback; does not touch the call window.
    pub(crate) fn record_probe(&self, healthy: bool) {
        let mut core = self.core.lock();
        core.last_probe_healthy = Some(healthy);
        Self::refresh_degraded(&mut core);
    }

    /// Moves open to half-open once the wait duration elapsed. Used by the
    /// health monitor when automatic transition is enabled.
    pub(crate) fn try_automatic_half_open(&self) -> bool {
        let mut events = Vec::new();
        let transitioned = {
            let mut core = self.core.lock();
            if core.state == State::Open
                && !core.manual_hold
                && core.last_transition_at.elapsed() >= self.config.wait_duration_in_open
            {
                self.transition_locked(
                    &mut core,
                    State::HalfOpen,
                    "Wait duration elapsed",
                    false,
                    None,
                    &mut events,
                );
                true
            } else {
                false
            }
        };
        self.publish_all(events);
        transitioned
    }

    fn publish_all(&self, events: Vec<Event>) {
        for event in events {
            self.dispatcher.publish(event);
        }
    }

    fn status_of(core: &Core) -> HealthStatus {
        if core.state == State::Open || core.consecutive_failures >= UNHEALTHY_AFTER {
            HealthStatus::Unhealthy
        } else if core.state == State::HalfOpen
            || core.consecutive_failures >= DEGRADED_AFTER
            || core.last_probe_healthy == Some(false)
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    fn refresh_degraded(core: &mut Core) {
        match Self::status_of(core) {
            HealthStatus::Healthy => core.degraded_since = None,
            _ => {
                if core.degraded_since.is_none() {
                    core.degraded_since = Some(Utc::now());
                }
            }
        }
    }

    fn transition_locked(
        &self,
        core: &mut Core,
        to: State,
        reason: &str,
        manual: bool,
        actor: Option<String>,
        events: &mut Vec<Event>,
    ) {
        let from = core.state;
        if from == to && !manual {
            return;
        }
        let stats = core.window.stats();

        core.metrics.note_state_change(to);
        core.state = to;
        core.last_transition_at = Instant::now();
        core.manual_hold = manual;
        core.epoch += 1;
        core.half_open = if to == State::HalfOpen {
            Some(Trial::default())
        } else {
            None
        };
        if to == State::Closed {
            // A fresh window keeps stale failures from retripping instantly.
            core.window.clear();
        }
        Self::refresh_degraded(core);

        core.history.push(StateTransition {
            at: Utc::now(),
            from,
            to,
            reason: reason.to_string(),
            failure_rate: stats.failure_rate(),
            slow_rate: stats.slow_rate(),
            manual,
            actor: actor.clone(),
        });

        tracing::info!(
            breaker = %self.name,
            from = %from,
            to = %to,
            reason,
            manual,
            "circuit breaker state change"
        );
        events.push(Event::now(
            &self.name,
            EventKind::StateChange,
            to,
            json!({
                "from": from,
                "to": to,
                "reason": reason,
                "manual": manual,
                "actor": actor,
                "failure_rate": stats.failure_rate(),
                "slow_rate": stats.slow_rate(),
            }),
        ));
    }

    fn note_rejection(&self, bulkhead: bool, fallback_used: bool) {
        let mut core = self.core.lock();
        if bulkhead {
            core.metrics.bulkhead_rejections += 1;
        } else {
            core.metrics.rejected_calls += 1;
        }
        let state = core.state;
        Self::push_record(
            &mut core,
            CallRecord {
                breaker: self.name.clone(),
                at: Utc::now(),
                duration_ms: 0,
                success: false,
                slow: false,
                state,
                error_class: None,
                retried: false,
                fallback_used,
                bulkhead_rejected: bulkhead,
                timed_out: false,
            },
        );
    }

    fn push_record(core: &mut Core, record: CallRecord) {
        if core.records.len() == CALL_RECORD_CAPACITY {
            core.records.pop_front();
        }
        core.records.push_back(record);
    }

    fn record_terminal(&self, outcome: TerminalOutcome) -> Vec<Event> {
        let mut events = Vec::new();
        let mut core = self.core.lock();

        core.window.record(CallOutcome {
            at: Instant::now(),
            success: outcome.success,
            duration: outcome.duration,
            slow: outcome.slow,
            error_class: outcome.class,
        });
        core.metrics
            .record_outcome(outcome.success, outcome.slow, outcome.duration);
        if outcome.timed_out {
            core.metrics.timeouts += 1;
        }

        if outcome.success {
            core.consecutive_successes += 1;
            core.consecutive_failures = 0;
        } else {
            core.consecutive_failures += 1;
            core.consecutive_successes = 0;
        }
        Self::refresh_degraded(&mut core);

        let state = core.state;
        Self::push_record(
            &mut core,
            CallRecord {
                breaker: self.name.clone(),
                at: Utc::now(),
                duration_ms: outcome.duration.as_millis() as u64,
                success: outcome.success,
                slow: outcome.slow,
                state,
                error_class: outcome.class,
                retried: outcome.retried,
                fallback_used: outcome.fallback_used,
                bulkhead_rejected: false,
                timed_out: outcome.timed_out,
            },
        );

        let kind = if outcome.success {
            EventKind::Success
        } else {
            EventKind::Failure
        };
        events.push(Event::now(
            &self.name,
            kind,
            state,
            json!({
                "duration_ms": outcome.duration.as_millis() as u64,
                "slow": outcome.slow,
                "error_class": outcome.class,
            }),
        ));
        if outcome.slow {
            events.push(Event::now(
                &self.name,
                EventKind::SlowCall,
                state,
                json!({
                    "duration_ms": outcome.duration.as_millis() as u64,
                    "threshold_ms": self.config.slow_call_duration_threshold.as_millis() as u64,
                }),
            ));
        }

        self.evaluate_locked(&mut core, outcome.success, outcome.epoch, &mut events);
        events
    }

    /// Threshold evaluation after a recorded outcome. Runs under the core
    /// lock so concurrent outcomes cannot double-transition. `epoch` is the
    /// value captured at admission; trial counting skips outcomes admitted
    /// before the current half-open episode.
    fn evaluate_locked(&self, core: &mut Core, success: bool, epoch: u64, events: &mut Vec<Event>) {
        if core.manual_hold {
            return;
        }
        match core.state {
            State::Closed => {
                let stats = core.window.stats();
                if stats.total < self.config.minimum_calls {
                    return;
                }
                if stats.failure_rate() >= self.config.failure_rate_threshold {
                    self.transition_locked(
                        core,
                        State::Open,
                        "Failure rate exceeded threshold",
                        false,
                        None,
                        events,
                    );
                } else if stats.slow_rate() >= self.config.slow_call_rate_threshold {
                    self.transition_locked(
                        core,
                        State::Open,
                        "Slow call rate exceeded threshold",
                        false,
                        None,
                        events,
                    );
                }
            }
            State::HalfOpen => {
                if epoch != core.epoch {
                    return;
                }
                let permitted = self.config.permitted_calls_in_half_open;
                let (successes, failures) = match core.half_open.as_mut() {
                    Some(trial) => {
                        if success {
                            trial.successes += 1;
                        } else {
                            trial.failures += 1;
                        }
                        (trial.successes, trial.failures)
                    }
                    None => return,
                };

                let reopen_at = permitted.div_ceil(2);
                let close_at =
                    (permitted as f64 * self.config.success_rate_threshold / 100.0).ceil() as u32;
                if failures >= reopen_at {
                    self.transition_locked(
                        core,
                        State::Open,
                        "Trial calls failed during half-open",
                        false,
                        None,
                        events,
                    );
                } else if successes >= close_at.max(1) {
                    self.transition_locked(
                        core,
                        State::Closed,
                        "Trial calls succeeded during half-open",
                        false,
                        None,
                        events,
                    );
                }
            }
            State::Open => {}
        }
    }
}

impl<T, E> CircuitBreaker<T, E>
where
    E: std::error::Error + 'static,
{
    /// Creates a builder for a breaker named `name`.
    pub fn builder(name: impl Into<String>) -> BreakerBuilder<T, E> {
        BreakerBuilder::new(name)
    }

    /// Admission decision made before a protected call executes. On success
    /// carries the epoch the call was admitted under.
    ///
    /// Lazily moves open to half-open once the wait duration has elapsed
    /// (unless automatic transition delegates that to the health monitor).
    fn gate(&self) -> (Result<u64, BreakerError<E>>, Vec<Event>) {
        let mut events = Vec::new();
        let mut core = self.core.lock();
        let decision = match core.state {
            State::Closed => Ok(core.epoch),
            State::Open => {
                if !core.manual_hold
                    && !self.config.automatic_transition
                    && core.last_transition_at.elapsed() >= self.config.wait_duration_in_open
                {
                    self.transition_locked(
                        &mut core,
                        State::HalfOpen,
                        "Wait duration elapsed",
                        false,
                        None,
                        &mut events,
                    );
                    if let Some(trial) = core.half_open.as_mut() {
                        trial.admitted = 1;
                    }
                    Ok(core.epoch)
                } else {
                    Err(BreakerError::CircuitOpen(self.name.clone()))
                }
            }
            State::HalfOpen => match core.half_open.as_mut() {
                Some(trial) if trial.admitted < self.config.permitted_calls_in_half_open => {
                    trial.admitted += 1;
                    Ok(core.epoch)
                }
                _ => Err(BreakerError::CircuitOpen(self.name.clone())),
            },
        };
        drop(core);
        (decision, events)
    }

    fn consult_fallback(&self) -> Option<T>
    where
        T: Clone,
    {
        let fallback = self.fallback.as_ref()?;
        self.core.lock().metrics.fallback_invocations += 1;
        fallback.produce()
    }

    /// Executes a unit of work under this breaker's protection.
    ///
    /// Pipeline: bulkhead admission, gate check, timeout-wrapped invocation
    /// with retry, outcome recording, fallback on rejection or final
    /// failure. Every execution lands exactly one terminal outcome in the
    /// sliding window; dropping the returned future after admission counts
    /// as a cancelled failure.
    pub async fn execute<F, Fut>(&self, op: F) -> BreakerResult<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Clone,
    {
        if self.is_disabled() {
            return op().await.map_err(BreakerError::Operation);
        }

        let _permit = match &self.bulkhead {
            Some(bulkhead) => match bulkhead.acquire().await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    let substitute = self.consult_fallback();
                    self.note_rejection(true, substitute.is_some());
                    return match substitute {
                        Some(value) => Ok(value),
                        None => Err(BreakerError::BulkheadRejected(self.name.clone())),
                    };
                }
            },
            None => None,
        };

        let (decision, events) = self.gate();
        self.publish_all(events);
        let epoch = match decision {
            Ok(epoch) => epoch,
            Err(err) => {
                let substitute = self.consult_fallback();
                self.note_rejection(false, substitute.is_some());
                return match substitute {
                    Some(value) => Ok(value),
                    None => Err(err),
                };
            }
        };

        let mut guard = CancelGuard {
            breaker: self,
            armed: true,
            started: Instant::now(),
            epoch,
        };
        let retry = self.config.retry.as_ref();
        let max_attempts = retry.map_or(1, |r| r.max_attempts);
        let mut attempt: u32 = 1;

        loop {
            let attempt_start = Instant::now();
            let result = match self.config.timeout {
                Some(timeout) => match tokio::time::timeout(timeout.duration, op()).await {
                    Ok(inner) => inner.map_err(AttemptError::Operation),
                    Err(_) => Err(AttemptError::Timeout(timeout.duration)),
                },
                None => op().await.map_err(AttemptError::Operation),
            };
            let duration = attempt_start.elapsed();
            let slow = duration > self.config.slow_call_duration_threshold;

            match result {
                Ok(value) => {
                    guard.armed = false;
                    if let Some(fallback) = &self.fallback {
                        fallback.cache_put(&value);
                    }
                    let events = self.record_terminal(TerminalOutcome {
                        success: true,
                        slow,
                        duration,
                        class: None,
                        retried: attempt > 1,
                        timed_out: false,
                        fallback_used: false,
                        epoch,
                    });
                    self.publish_all(events);
                    return Ok(value);
                }
                Err(failure) => {
                    let class = failure.class();
                    if let Some(retry) = retry {
                        if attempt < max_attempts && retry.retryable(class) {
                            self.core.lock().metrics.retry_attempts += 1;
                            let delay = retry.delay_for(attempt);
                            tracing::debug!(
                                breaker = %self.name,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                "retrying failed call"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                    }

                    guard.armed = false;
                    let substitute = self.consult_fallback();
                    let events = self.record_terminal(TerminalOutcome {
                        success: false,
                        slow,
                        duration,
                        class: Some(class),
                        retried: attempt > 1,
                        timed_out: matches!(failure, AttemptError::Timeout(_)),
                        fallback_used: substitute.is_some(),
                        epoch,
                    });
                    self.publish_all(events);

                    // A fallback failure propagates the original error.
                    return match (substitute, failure) {
                        (Some(value), _) => Ok(value),
                        (None, AttemptError::Timeout(budget)) => Err(BreakerError::Timeout(budget)),
                        (None, AttemptError::Operation(source)) if attempt > 1 => {
                            Err(BreakerError::RetriesExhausted {
                                attempts: attempt,
                                source,
                            })
                        }
                        (None, AttemptError::Operation(source)) => {
                            Err(BreakerError::Operation(source))
                        }
                    };
                }
            }
        }
    }
}
