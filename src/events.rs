//! Event kinds, payloads and the in-process dispatcher.
//!
//! Delivery is synchronous and per-listener isolated: a panicking listener
//! is logged and skipped, never allowed to block the rest. Transports
//! (webhook, email, pager) subscribe from outside; this module only decides
//! and hands over the payload.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::state::State;

/// Number of recent events retained for the query surface.
const RECENT_EVENT_CAPACITY: usize = 512;

/// Kinds of breaker events a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The breaker moved between states.
    StateChange,

    /// A protected call recorded a failure outcome.
    Failure,

    /// A call exceeded the slow-call duration threshold.
    SlowCall,

    /// A protected call recorded a success outcome.
    Success,

    /// The breaker was reset to closed with zeroed metrics.
    Reset,
}

/// Structured event payload handed to listeners.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Name of the breaker that fired the event.
    pub breaker: String,
    /// What happened.
    pub kind: EventKind,
    /// Wall-clock time of the event.
    pub at: DateTime<Utc>,
    /// Breaker state when the event fired.
    pub state: State,
    /// Kind-specific detail fields.
    pub payload: serde_json::Value,
}

/// Handle identifying a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ListenerFn = Box<dyn Fn(&Event) + Send + Sync>;

struct Listener {
    id: ListenerId,
    kinds: Vec<EventKind>,
    callback: ListenerFn,
    last_triggered: Mutex<Option<DateTime<Utc>>>,
}

impl Listener {
    fn interested_in(&self, kind: EventKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

/// Synchronous publish/subscribe dispatcher shared by a registry's breakers.
pub struct EventDispatcher {
    listeners: RwLock<Vec<Arc<Listener>>>,
    next_id: AtomicU64,
    recent: Mutex<VecDeque<Event>>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    /// Creates an empty dispatcher.
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_EVENT_CAPACITY)),
        }
    }

    /// Registers a listener for the given kinds. An empty kind list means
    /// every kind. Returns a handle usable with [`unsubscribe`].
    ///
    /// [`unsubscribe`]: EventDispatcher::unsubscribe
    pub fn subscribe<F>(&self, kinds: &[EventKind], callback: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(Arc::new(Listener {
            id,
            kinds: kinds.to_vec(),
            callback: Box::new(callback),
            last_triggered: Mutex::new(None),
        }));
        id
    }

    /// Removes a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|listener| listener.id != id);
        listeners.len() != before
    }

    /// Delivers an event to every interested listener and appends it to the
    /// bounded recent-event log.
    pub fn publish(&self, event: Event) {
        {
            let mut recent = self.recent.lock();
            if recent.len() == RECENT_EVENT_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }

        let listeners: Vec<Arc<Listener>> = self.listeners.read().clone();
        for listener in listeners {
            if !listener.interested_in(event.kind) {
                continue;
            }
            *listener.last_triggered.lock() = Some(Utc::now());
            let outcome = catch_unwind(AssertUnwindSafe(|| (listener.callback)(&event)));
            if outcome.is_err() {
                tracing::warn!(
                    breaker = %event.breaker,
                    kind = ?event.kind,
                    "event listener panicked; continuing delivery"
                );
            }
        }
    }

    /// Most recent events, newest first, up to `limit`.
    pub fn recent_events(&self, limit: usize) -> Vec<Event> {
        self.recent
            .lock()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// When the listener last received an event, if ever.
    pub fn last_triggered(&self, id: ListenerId) -> Option<DateTime<Utc>> {
        self.listeners
            .read()
            .iter()
            .find(|listener| listener.id == id)
            .and_then(|listener| *listener.last_triggered.lock())
    }
}

impl Event {
    /// Builds an event stamped with the current wall-clock time.
    pub fn now(
        breaker: impl Into<String>,
        kind: EventKind,
        state: State,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            breaker: breaker.into(),
            kind,
            at: Utc::now(),
            state,
            payload,
        }
    }
}
