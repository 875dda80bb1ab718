//! # breakwater
//!
//! A lock-efficient resilience engine for async Rust services: per-dependency
//! circuit breakers composed with bulkhead, retry, timeout and fallback
//! policies, owned by an explicit registry.
//!
//! ## The circuit breaker pattern
//!
//! A breaker gates calls to one dependency through three states:
//!
//! - **Closed**: calls pass through and outcomes are recorded into a sliding
//!   window of recent calls.
//! - **Open**: calls are rejected immediately. Once the configured wait
//!   duration elapses the next gate check moves the circuit to half-open.
//! - **Half-open**: a bounded number of trial calls probe recovery; enough
//!   successes close the circuit, enough failures reopen it.
//!
//! The circuit opens when, after a minimum number of recorded calls, the
//! window's failure rate or slow-call rate crosses its threshold.
//!
//! ## Basic usage
//!
//! ```rust
//! use breakwater::{BreakerError, CircuitBreaker, Registry};
//! use std::error::Error;
//! use std::fmt;
//! use std::time::Duration;
//!
//! #[derive(Debug)]
//! struct ServiceError(String);
//!
//! impl fmt::Display for ServiceError {
//!     fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
//!         write!(f, "service error: {}", self.0)
//!     }
//! }
//!
//! impl Error for ServiceError {}
//!
//! # async fn demo() {
//! let registry: Registry<String, ServiceError> = Registry::new();
//! registry
//!     .register(
//!         CircuitBreaker::builder("payments-api")
//!             .failure_rate_threshold(50.0)
//!             .minimum_calls(10)
//!             .wait_duration_in_open(Duration::from_secs(30)),
//!     )
//!     .expect("valid config");
//!
//! match registry
//!     .execute_call("payments-api", || async { Ok("charged".to_string()) })
//!     .await
//! {
//!     Ok(result) => println!("call succeeded: {result}"),
//!     Err(BreakerError::CircuitOpen(name)) => println!("{name} is open"),
//!     Err(err) => println!("call failed: {err}"),
//! }
//! # }
//! ```
//!
//! ## Policy composition
//!
//! Each breaker optionally attaches a bulkhead (concurrency ceiling applied
//! before the gate), a retry policy with linear, exponential or fibonacci
//! backoff, a per-attempt timeout, and a fallback that substitutes a result
//! when the gate rejects or the call finally fails. Every execution records
//! exactly one terminal outcome, so observability survives even when a
//! fallback masks the error from the caller.
//!
//! ## Events
//!
//! State changes, failures, slow calls, successes and resets are published
//! synchronously to listeners registered on the registry's
//! [`EventDispatcher`]. Delivery is isolated per listener; transports such
//! as webhooks or pagers subscribe from outside the engine.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod breaker;
mod bulkhead;
mod config;
mod error;
mod events;
mod fallback;
mod health;
mod metrics;
pub mod prelude;
mod registry;
mod retry;
mod state;
mod window;

// Re-exports
pub use breaker::{CircuitBreaker, StateTransition};
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadStats};
pub use config::{BreakerBuilder, BreakerConfig, TimeoutConfig, WindowKind};
pub use error::{BreakerError, BreakerResult, ConfigError, ErrorClass};
pub use events::{Event, EventDispatcher, EventKind, ListenerId};
pub use fallback::{Fallback, FallbackHandler, FallbackStats};
pub use health::{HealthMonitor, HealthProbe, HealthSnapshot, HealthStatus};
pub use metrics::{CallRecord, StatsSnapshot};
pub use registry::{AggregationStrategy, Registry, RegistryStats, ServiceCircuitGroup};
pub use retry::{Backoff, RetryConfig};
pub use state::State;
pub use window::WindowStats;
