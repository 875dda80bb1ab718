//! Breaker registry and service-level circuit groups.
//!
//! The registry is an explicit object constructed once and passed by
//! handle; there is no process-wide singleton. It owns the breakers, the
//! shared event dispatcher, and the group definitions used for read-side
//! aggregation.

use ahash::RandomState;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::breaker::{CircuitBreaker, StateTransition};
use crate::config::BreakerBuilder;
use crate::error::{BreakerError, BreakerResult, ConfigError};
use crate::events::EventDispatcher;
use crate::health::HealthStatus;
use crate::metrics::CallRecord;
use crate::state::State;

/// How a group folds member states into one aggregate state.
#[derive(Debug, Clone)]
pub enum AggregationStrategy {
    /// Open as soon as any member is open.
    AnyOpen,

    /// Open only when every member is open.
    AllOpen,

    /// Open when more than half the members are open.
    MajorityOpen,

    /// Open when the open-weight fraction crosses `open_threshold`.
    Weighted {
        /// Per-member weight; unlisted members weigh 1.0.
        weights: HashMap<String, f64, RandomState>,
        /// Fraction of total weight that must be open, in [0, 1].
        open_threshold: f64,
    },
}

/// A named aggregation of breakers for one logical service.
///
/// Holds only the member list, strategy and weights; aggregate state and
/// health are recomputed from current member states on every query.
#[derive(Debug, Clone)]
pub struct ServiceCircuitGroup {
    /// Group name.
    pub name: String,
    /// Names of member breakers.
    pub members: Vec<String>,
    /// Fold strategy.
    pub strategy: AggregationStrategy,
}

/// Counts and rollups over every registered breaker.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    /// Registered breakers.
    pub total_breakers: usize,
    /// Breakers currently closed.
    pub closed: usize,
    /// Breakers currently open.
    pub open: usize,
    /// Breakers currently half-open.
    pub half_open: usize,
    /// Terminal outcomes across all breakers.
    pub total_calls: u64,
    /// Successes across all breakers.
    pub successful_calls: u64,
    /// Failures across all breakers.
    pub failed_calls: u64,
    /// Gate rejections across all breakers.
    pub rejected_calls: u64,
    /// Bulkhead rejections across all breakers.
    pub bulkhead_rejections: u64,
    /// Timed-out calls across all breakers.
    pub timeouts: u64,
    /// Retry attempts across all breakers.
    pub retry_attempts: u64,
    /// Fallback invocations across all breakers.
    pub fallback_invocations: u64,
    /// Call-count-weighted mean latency, in milliseconds.
    pub avg_latency_ms: f64,
}

/// Owns the set of breakers for a process and their service groups.
pub struct Registry<T, E> {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker<T, E>>, RandomState>>,
    groups: RwLock<HashMap<String, ServiceCircuitGroup, RandomState>>,
    dispatcher: Arc<EventDispatcher>,
}

impl<T, E> Default for Registry<T, E>
where
    E: std::error::Error + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Registry<T, E>
where
    E: std::error::Error + 'static,
{
    /// Creates an empty registry with its own event dispatcher.
    pub fn new() -> Self {
        Self {
            breakers: RwLock::new(HashMap::default()),
            groups: RwLock::new(HashMap::default()),
            dispatcher: Arc::new(EventDispatcher::new()),
        }
    }

    /// The dispatcher all registered breakers publish through.
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Builds the breaker and takes ownership of it.
    ///
    /// The registry's dispatcher is injected unless the builder set one
    /// explicitly. Names are unique; re-registering is a config error.
    pub fn register(
        &self,
        builder: BreakerBuilder<T, E>,
    ) -> Result<Arc<CircuitBreaker<T, E>>, ConfigError> {
        let builder = if builder.dispatcher_is_set() {
            builder
        } else {
            builder.dispatcher(Arc::clone(&self.dispatcher))
        };
        let breaker = Arc::new(builder.build()?);

        let mut breakers = self.breakers.write();
        if breakers.contains_key(breaker.name()) {
            return Err(ConfigError::DuplicateName(breaker.name().to_string()));
        }
        breakers.insert(breaker.name().to_string(), Arc::clone(&breaker));
        tracing::info!(breaker = %breaker.name(), service = %breaker.service(), "registered circuit breaker");
        Ok(breaker)
    }

    /// Fetches one breaker by name.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker<T, E>>> {
        self.breakers.read().get(name).cloned()
    }

    /// Breakers whose owning-service label matches `service`.
    pub fn by_service(&self, service: &str) -> Vec<Arc<CircuitBreaker<T, E>>> {
        self.breakers
            .read()
            .values()
            .filter(|breaker| breaker.service() == service)
            .cloned()
            .collect()
    }

    /// All breakers, optionally filtered by current state.
    pub fn list(&self, state: Option<State>) -> Vec<Arc<CircuitBreaker<T, E>>> {
        self.breakers
            .read()
            .values()
            .filter(|breaker| state.is_none_or(|wanted| breaker.state() == wanted))
            .cloned()
            .collect()
    }

    /// Executes a unit of work under the named breaker's protection.
    pub async fn execute_call<F, Fut>(&self, name: &str, op: F) -> BreakerResult<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Clone,
    {
        let breaker = self
            .get(name)
            .ok_or_else(|| BreakerError::BreakerNotFound(name.to_string()))?;
        breaker.execute(op).await
    }

    /// Manually forces the named breaker into `to`.
    pub fn force_transition(
        &self,
        name: &str,
        to: State,
        reason: impl Into<String>,
        actor: impl Into<String>,
    ) -> Result<(), BreakerError<E>> {
        let breaker = self
            .get(name)
            .ok_or_else(|| BreakerError::BreakerNotFound(name.to_string()))?;
        breaker.force_transition(to, reason, actor);
        Ok(())
    }

    /// Resets the named breaker to closed with zeroed metrics.
    pub fn reset(&self, name: &str) -> Result<(), BreakerError<E>> {
        let breaker = self
            .get(name)
            .ok_or_else(|| BreakerError::BreakerNotFound(name.to_string()))?;
        breaker.reset();
        Ok(())
    }

    /// Recent call records for the named breaker, newest first.
    pub fn call_records(&self, name: &str, limit: usize) -> Result<Vec<CallRecord>, BreakerError<E>> {
        let breaker = self
            .get(name)
            .ok_or_else(|| BreakerError::BreakerNotFound(name.to_string()))?;
        Ok(breaker.call_records(limit))
    }

    /// Transition history for the named breaker.
    pub fn history(&self, name: &str) -> Result<Vec<StateTransition>, BreakerError<E>> {
        let breaker = self
            .get(name)
            .ok_or_else(|| BreakerError::BreakerNotFound(name.to_string()))?;
        Ok(breaker.history())
    }

    /// Aggregate statistics across every registered breaker.
    pub fn stats(&self) -> RegistryStats {
        let breakers = self.breakers.read();
        let mut stats = RegistryStats {
            total_breakers: breakers.len(),
            closed: 0,
            open: 0,
            half_open: 0,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            rejected_calls: 0,
            bulkhead_rejections: 0,
            timeouts: 0,
            retry_attempts: 0,
            fallback_invocations: 0,
            avg_latency_ms: 0.0,
        };
        let mut weighted_latency = 0.0;
        for breaker in breakers.values() {
            match breaker.state() {
                State::Closed => stats.closed += 1,
                State::Open => stats.open += 1,
                State::HalfOpen => stats.half_open += 1,
            }
            let snapshot = breaker.metrics();
            stats.total_calls += snapshot.total_calls;
            stats.successful_calls += snapshot.successful_calls;
            stats.failed_calls += snapshot.failed_calls;
            stats.rejected_calls += snapshot.rejected_calls;
            stats.bulkhead_rejections += snapshot.bulkhead_rejections;
            stats.timeouts += snapshot.timeouts;
            stats.retry_attempts += snapshot.retry_attempts;
            stats.fallback_invocations += snapshot.fallback_invocations;
            weighted_latency += snapshot.avg_latency_ms * snapshot.total_calls as f64;
        }
        if stats.total_calls > 0 {
            stats.avg_latency_ms = weighted_latency / stats.total_calls as f64;
        }
        stats
    }

    /// Defines or replaces a service circuit group.
    pub fn define_group(&self, group: ServiceCircuitGroup) {
        self.groups.write().insert(group.name.clone(), group);
    }

    /// Aggregate state of a group, recomputed from current member states.
    pub fn group_state(&self, name: &str) -> Option<State> {
        let groups = self.groups.read();
        let group = groups.get(name)?;
        let states: Vec<(String, State)> = group
            .members
            .iter()
            .filter_map(|member| self.get(member).map(|b| (member.clone(), b.state())))
            .collect();
        Some(aggregate_state(&group.strategy, &states))
    }

    /// Aggregate health of a group: any unhealthy member makes the group
    /// unhealthy, else any degraded member makes it degraded.
    pub fn group_health(&self, name: &str) -> Option<HealthStatus> {
        let groups = self.groups.read();
        let group = groups.get(name)?;
        let mut aggregate = HealthStatus::Healthy;
        for member in &group.members {
            let Some(breaker) = self.get(member) else {
                continue;
            };
            match breaker.health().status {
                HealthStatus::Unhealthy => return Some(HealthStatus::Unhealthy),
                HealthStatus::Degraded => aggregate = HealthStatus::Degraded,
                HealthStatus::Healthy => {}
            }
        }
        Some(aggregate)
    }
}

fn aggregate_state(strategy: &AggregationStrategy, states: &[(String, State)]) -> State {
    if states.is_empty() {
        return State::Closed;
    }
    let open = states.iter().filter(|(_, s)| *s == State::Open).count();
    let half_open = states.iter().filter(|(_, s)| *s == State::HalfOpen).count();

    match strategy {
        AggregationStrategy::AnyOpen => {
            if open > 0 {
                State::Open
            } else if half_open > 0 {
                State::HalfOpen
            } else {
                State::Closed
            }
        }
        AggregationStrategy::AllOpen => {
            if open == states.len() {
                State::Open
            } else if open > 0 || half_open > 0 {
                State::HalfOpen
            } else {
                State::Closed
            }
        }
        AggregationStrategy::MajorityOpen => {
            if open * 2 > states.len() {
                State::Open
            } else if open > 0 || half_open > 0 {
                State::HalfOpen
            } else {
                State::Closed
            }
        }
        AggregationStrategy::Weighted {
            weights,
            open_threshold,
        } => {
            let weight_of = |name: &str| weights.get(name).copied().unwrap_or(1.0);
            let total: f64 = states.iter().map(|(name, _)| weight_of(name)).sum();
            let open_weight: f64 = states
                .iter()
                .filter(|(_, s)| *s == State::Open)
                .map(|(name, _)| weight_of(name))
                .sum();
            if total > 0.0 && open_weight / total >= *open_threshold {
                State::Open
            } else if open > 0 || half_open > 0 {
                State::HalfOpen
            } else {
                State::Closed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn states(entries: &[(&str, State)]) -> Vec<(String, State)> {
        entries
            .iter()
            .map(|(name, state)| (name.to_string(), *state))
            .collect()
    }

    #[test]
    fn any_open_trips_on_a_single_member() {
        let members = states(&[("a", State::Closed), ("b", State::Open)]);
        assert_eq!(
            aggregate_state(&AggregationStrategy::AnyOpen, &members),
            State::Open
        );
    }

    #[test]
    fn all_open_requires_every_member() {
        let strategy = AggregationStrategy::AllOpen;
        let partial = states(&[("a", State::Open), ("b", State::Closed)]);
        assert_eq!(aggregate_state(&strategy, &partial), State::HalfOpen);

        let full = states(&[("a", State::Open), ("b", State::Open)]);
        assert_eq!(aggregate_state(&strategy, &full), State::Open);
    }

    #[test]
    fn majority_open_counts_strictly_more_than_half() {
        let strategy = AggregationStrategy::MajorityOpen;
        let half = states(&[("a", State::Open), ("b", State::Closed)]);
        assert_eq!(aggregate_state(&strategy, &half), State::HalfOpen);

        let majority = states(&[
            ("a", State::Open),
            ("b", State::Open),
            ("c", State::Closed),
        ]);
        assert_eq!(aggregate_state(&strategy, &majority), State::Open);
    }

    #[test]
    fn weighted_uses_configured_threshold() {
        let mut weights = HashMap::default();
        weights.insert("primary".to_string(), 3.0);
        let strategy = AggregationStrategy::Weighted {
            weights,
            open_threshold: 0.7,
        };

        let primary_open = states(&[("primary", State::Open), ("replica", State::Closed)]);
        assert_eq!(aggregate_state(&strategy, &primary_open), State::Open);

        let replica_open = states(&[("primary", State::Closed), ("replica", State::Open)]);
        assert_eq!(aggregate_state(&strategy, &replica_open), State::HalfOpen);
    }

    #[test]
    fn empty_group_is_closed() {
        assert_eq!(
            aggregate_state(&AggregationStrategy::AnyOpen, &[]),
            State::Closed
        );
    }
}
