//! Bulkhead concurrency limiting.
//!
//! Two variants: a semaphore bulkhead (permit pool, bounded wait) and a
//! queue bulkhead (bounded queue in front of a fixed pool of concurrency
//! slots). Both hand out an RAII permit whose drop releases the slot on
//! every exit path, including cancellation.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bulkhead configuration, attached per breaker.
#[derive(Debug, Clone)]
pub enum BulkheadConfig {
    /// Permit-pool bulkhead: callers wait up to `max_wait` for one of
    /// `max_concurrent` permits, then are rejected.
    Semaphore {
        /// Concurrency ceiling.
        max_concurrent: usize,
        /// How long a caller may wait for a permit.
        max_wait: Duration,
        /// Serve waiting callers in arrival order.
        fair: bool,
    },
    /// Queued bulkhead: a bounded queue of `queue_size` in front of
    /// `worker_count` concurrency slots.
    Queue {
        /// Number of calls that may execute at once.
        worker_count: usize,
        /// Number of admitted calls that may wait for a slot.
        queue_size: usize,
        /// How long a queued caller may wait for a slot.
        max_wait: Duration,
    },
}

/// Point-in-time bulkhead counters for the query surface.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BulkheadStats {
    /// Configured concurrency ceiling.
    pub max_concurrent: usize,
    /// Permits currently free.
    pub available: usize,
    /// Permits currently held by in-flight calls.
    pub active: usize,
    /// Calls rejected because the ceiling was reached within the wait budget.
    pub rejections: u64,
}

/// Marker returned when the bulkhead cannot admit a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadFull;

/// Concurrency limiter shared by all callers of one breaker.
pub struct Bulkhead {
    execution: Arc<Semaphore>,
    admission: Option<Arc<Semaphore>>,
    max_concurrent: usize,
    max_wait: Duration,
    fair: bool,
    rejections: AtomicU64,
}

/// RAII admission token. Dropping it releases the slot.
pub struct BulkheadPermit {
    _execution: OwnedSemaphorePermit,
    _admission: Option<OwnedSemaphorePermit>,
}

impl Bulkhead {
    /// Builds a bulkhead from its configuration.
    pub fn new(config: &BulkheadConfig) -> Self {
        match *config {
            BulkheadConfig::Semaphore {
                max_concurrent,
                max_wait,
                fair,
            } => Self {
                execution: Arc::new(Semaphore::new(max_concurrent)),
                admission: None,
                max_concurrent,
                max_wait,
                fair,
                rejections: AtomicU64::new(0),
            },
            BulkheadConfig::Queue {
                worker_count,
                queue_size,
                max_wait,
            } => Self {
                execution: Arc::new(Semaphore::new(worker_count)),
                admission: Some(Arc::new(Semaphore::new(worker_count + queue_size))),
                max_concurrent: worker_count,
                max_wait,
                fair: true,
                rejections: AtomicU64::new(0),
            },
        }
    }

    /// Acquires an admission permit, waiting up to the configured budget.
    ///
    /// Returns [`BulkheadFull`] when the queue is full or no execution slot
    /// frees up in time. The rejection counter is bumped on every failure.
    pub async fn acquire(&self) -> Result<BulkheadPermit, BulkheadFull> {
        // Queue admission is immediate: a full queue rejects without waiting.
        let admission = match &self.admission {
            Some(queue) => match Arc::clone(queue).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => return Err(self.reject()),
            },
            None => None,
        };

        if !self.fair {
            if let Ok(permit) = Arc::clone(&self.execution).try_acquire_owned() {
                return Ok(BulkheadPermit {
                    _execution: permit,
                    _admission: admission,
                });
            }
            if self.max_wait.is_zero() {
                return Err(self.reject());
            }
        }

        let waited =
            tokio::time::timeout(self.max_wait, Arc::clone(&self.execution).acquire_owned()).await;
        match waited {
            Ok(Ok(permit)) => Ok(BulkheadPermit {
                _execution: permit,
                _admission: admission,
            }),
            _ => Err(self.reject()),
        }
    }

    /// Current permit counters.
    pub fn stats(&self) -> BulkheadStats {
        let available = self.execution.available_permits();
        BulkheadStats {
            max_concurrent: self.max_concurrent,
            available,
            active: self.max_concurrent.saturating_sub(available),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }

    fn reject(&self) -> BulkheadFull {
        self.rejections.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(max_concurrent = self.max_concurrent, "bulkhead rejected call");
        BulkheadFull
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn semaphore_bulkhead(max_concurrent: usize, max_wait: Duration) -> Bulkhead {
        Bulkhead::new(&BulkheadConfig::Semaphore {
            max_concurrent,
            max_wait,
            fair: true,
        })
    }

    #[tokio::test]
    async fn grants_up_to_the_ceiling() {
        let bulkhead = semaphore_bulkhead(2, Duration::from_millis(10));
        let first = bulkhead.acquire().await;
        let second = bulkhead.acquire().await;
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(bulkhead.stats().active, 2);

        let third = bulkhead.acquire().await;
        assert_eq!(third.err(), Some(BulkheadFull));
        assert_eq!(bulkhead.stats().rejections, 1);
    }

    #[tokio::test]
    async fn drop_releases_the_permit() {
        let bulkhead = semaphore_bulkhead(1, Duration::from_millis(10));
        let permit = bulkhead.acquire().await;
        assert!(permit.is_ok());
        drop(permit);
        assert_eq!(bulkhead.stats().active, 0);
        assert!(bulkhead.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn waiter_gets_permit_when_one_frees_up() {
        let bulkhead = Arc::new(semaphore_bulkhead(1, Duration::from_millis(500)));
        let held = bulkhead.acquire().await.expect("first acquire");

        let contender = {
            let bulkhead = Arc::clone(&bulkhead);
            tokio::spawn(async move { bulkhead.acquire().await.is_ok() })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);
        assert!(contender.await.expect("join"));
    }

    #[tokio::test]
    async fn queue_variant_bounds_queue_and_wait() {
        let bulkhead = Arc::new(Bulkhead::new(&BulkheadConfig::Queue {
            worker_count: 1,
            queue_size: 1,
            max_wait: Duration::from_millis(200),
        }));

        let _running = bulkhead.acquire().await.expect("worker slot");

        // Second call occupies the one queue slot and waits.
        let queued = {
            let bulkhead = Arc::clone(&bulkhead);
            tokio::spawn(async move { bulkhead.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Queue is now full: a third call is rejected immediately.
        let overflow = bulkhead.acquire().await;
        assert_eq!(overflow.err(), Some(BulkheadFull));

        // The queued caller eventually times out against the held worker slot.
        assert_eq!(queued.await.expect("join").err(), Some(BulkheadFull));
    }
}
