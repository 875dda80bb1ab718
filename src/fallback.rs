//! Fallback result substitution.
//!
//! A fallback is attached per breaker and consulted when the gate rejects a
//! call or the executor reports a final failure. Producing the substitute is
//! itself fallible; a fallback failure is counted here but never surfaces to
//! the caller in place of the original error.

use ahash::RandomState;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Boxed delegate for the handler variant.
pub type FallbackHandler<T> =
    Box<dyn Fn() -> Result<T, Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

enum Kind<T> {
    Static(T),
    Default(T),
    Cache {
        store: RwLock<HashMap<String, T, RandomState>>,
        key: String,
    },
    Handler(FallbackHandler<T>),
}

impl<T> Kind<T> {
    fn label(&self) -> &'static str {
        match self {
            Kind::Static(_) => "static",
            Kind::Default(_) => "default",
            Kind::Cache { .. } => "cache",
            Kind::Handler(_) => "function",
        }
    }
}

/// Point-in-time fallback counters for the query surface.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackStats {
    /// Which variant is attached.
    pub variant: &'static str,
    /// Times the fallback was consulted.
    pub invocations: u64,
    /// Times a substitute was produced.
    pub successes: u64,
    /// Times producing the substitute itself failed.
    pub failures: u64,
}

/// A substitute-result producer attached to one breaker.
pub struct Fallback<T> {
    kind: Kind<T>,
    invocations: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl<T> Fallback<T> {
    fn with_kind(kind: Kind<T>) -> Self {
        Self {
            kind,
            invocations: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// A fixed substitute value.
    pub fn static_value(value: T) -> Self {
        Self::with_kind(Kind::Static(value))
    }

    /// The type's neutral value, captured at attach time.
    pub fn default_value() -> Self
    where
        T: Default,
    {
        Self::with_kind(Kind::Default(T::default()))
    }

    /// Look up a previously cached successful result under `key`.
    ///
    /// The breaker populates the store on every successful call; a lookup
    /// before any success is a fallback failure (cache miss).
    pub fn cache(key: impl Into<String>) -> Self {
        Self::with_kind(Kind::Cache {
            store: RwLock::new(HashMap::default()),
            key: key.into(),
        })
    }

    /// Delegate to an external handler.
    pub fn handler(handler: FallbackHandler<T>) -> Self {
        Self::with_kind(Kind::Handler(handler))
    }

    /// Stores a successful result for later cache lookups. No-op for other
    /// variants.
    pub fn cache_put(&self, value: &T)
    where
        T: Clone,
    {
        if let Kind::Cache { store, key } = &self.kind {
            store.write().insert(key.clone(), value.clone());
        }
    }

    /// Attempts to produce a substitute, updating the counters.
    ///
    /// `None` means the fallback itself failed; the caller must propagate
    /// the original error.
    pub fn produce(&self) -> Option<T>
    where
        T: Clone,
    {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let produced = match &self.kind {
            Kind::Static(value) | Kind::Default(value) => Some(value.clone()),
            Kind::Cache { store, key } => store.read().get(key).cloned(),
            Kind::Handler(handler) => match handler() {
                Ok(value) => Some(value),
                Err(err) => {
                    tracing::warn!(error = %err, "fallback handler failed");
                    None
                }
            },
        };
        if produced.is_some() {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        produced
    }

    /// Current counters.
    pub fn stats(&self) -> FallbackStats {
        FallbackStats {
            variant: self.kind.label(),
            invocations: self.invocations.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
