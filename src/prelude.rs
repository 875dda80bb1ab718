//! Re-exports of the types most callers need.
//!
//! # Example
//! ```rust,no_run
//! use breakwater::prelude::*;
//! ```

pub use crate::breaker::CircuitBreaker;
pub use crate::bulkhead::BulkheadConfig;
pub use crate::config::{BreakerBuilder, BreakerConfig, WindowKind};
pub use crate::error::{BreakerError, BreakerResult};
pub use crate::events::EventKind;
pub use crate::fallback::Fallback;
pub use crate::registry::{AggregationStrategy, Registry, ServiceCircuitGroup};
pub use crate::retry::{Backoff, RetryConfig};
pub use crate::state::State;
