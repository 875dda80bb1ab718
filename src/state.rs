//! Circuit breaker states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents the possible states of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Circuit is closed and calls pass through.
    Closed,

    /// Circuit is open and calls are rejected.
    Open,

    /// Circuit is allowing a bounded number of trial calls to probe recovery.
    HalfOpen,
}

impl State {
    /// Stable lowercase label used in events, history and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
