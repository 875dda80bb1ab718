//! Sliding windows of recent call outcomes.
//!
//! Two shapes are supported: a count-based ring buffer that keeps the last
//! `size` outcomes, and a time-based window that aggregates outcomes into
//! fixed buckets and evicts whole buckets as they age out. Both answer the
//! same question: the failure and slow-call rates over recent calls.

use smallvec::SmallVec;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::ErrorClass;

/// One recorded call outcome.
#[derive(Debug, Clone, Copy)]
pub struct CallOutcome {
    /// When the outcome was recorded.
    pub at: Instant,
    /// Whether the call succeeded.
    pub success: bool,
    /// Wall time the call took.
    pub duration: Duration,
    /// Whether the duration exceeded the slow-call threshold.
    pub slow: bool,
    /// Failure classification, when the call failed.
    pub error_class: Option<ErrorClass>,
}

/// Aggregated view over the entries currently in the window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowStats {
    /// Total outcomes in the window.
    pub total: u64,
    /// Failed outcomes in the window.
    pub failed: u64,
    /// Slow outcomes in the window (independent of success).
    pub slow: u64,
}

impl WindowStats {
    /// Failure rate as a percentage. Zero when the window is empty.
    pub fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.failed as f64 / self.total as f64 * 100.0
    }

    /// Slow-call rate as a percentage. Zero when the window is empty.
    pub fn slow_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.slow as f64 / self.total as f64 * 100.0
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    started: Instant,
    total: u64,
    failed: u64,
    slow: u64,
}

/// A sliding window over recent call outcomes.
#[derive(Debug)]
pub struct SlidingWindow {
    inner: Inner,
}

#[derive(Debug)]
enum Inner {
    Count {
        entries: VecDeque<CallOutcome>,
        capacity: usize,
    },
    Time {
        buckets: SmallVec<[Bucket; 16]>,
        span: Duration,
        bucket_size: Duration,
    },
}

impl SlidingWindow {
    /// Creates a count-based window holding the last `capacity` outcomes.
    pub fn count_based(capacity: usize) -> Self {
        Self {
            inner: Inner::Count {
                entries: VecDeque::with_capacity(capacity),
                capacity,
            },
        }
    }

    /// Creates a time-based window spanning `span`, split into `buckets` buckets.
    pub fn time_based(span: Duration, buckets: usize) -> Self {
        let bucket_size = span / buckets.max(1) as u32;
        Self {
            inner: Inner::Time {
                buckets: SmallVec::new(),
                span,
                bucket_size,
            },
        }
    }

    /// Records one outcome, evicting aged-out entries first.
    pub fn record(&mut self, outcome: CallOutcome) {
        match &mut self.inner {
            Inner::Count { entries, capacity } => {
                if entries.len() == *capacity {
                    entries.pop_front();
                }
                entries.push_back(outcome);
            }
            Inner::Time {
                buckets,
                span,
                bucket_size,
            } => {
                evict_old(buckets, *span, outcome.at);

                let fits_last = buckets
                    .last()
                    .is_some_and(|b| outcome.at.duration_since(b.started) < *bucket_size);
                if !fits_last {
                    buckets.push(Bucket {
                        started: outcome.at,
                        total: 0,
                        failed: 0,
                        slow: 0,
                    });
                }
                if let Some(bucket) = buckets.last_mut() {
                    bucket.total += 1;
                    if !outcome.success {
                        bucket.failed += 1;
                    }
                    if outcome.slow {
                        bucket.slow += 1;
                    }
                }
            }
        }
    }

    /// Current totals and rates over the live entries.
    pub fn stats(&mut self) -> WindowStats {
        match &mut self.inner {
            Inner::Count { entries, .. } => {
                let mut stats = WindowStats {
                    total: entries.len() as u64,
                    ..WindowStats::default()
                };
                for entry in entries.iter() {
                    if !entry.success {
                        stats.failed += 1;
                    }
                    if entry.slow {
                        stats.slow += 1;
                    }
                }
                stats
            }
            Inner::Time { buckets, span, .. } => {
                evict_old(buckets, *span, Instant::now());
                let mut stats = WindowStats::default();
                for bucket in buckets.iter() {
                    stats.total += bucket.total;
                    stats.failed += bucket.failed;
                    stats.slow += bucket.slow;
                }
                stats
            }
        }
    }

    /// Discards all recorded outcomes.
    pub fn clear(&mut self) {
        match &mut self.inner {
            Inner::Count { entries, .. } => entries.clear(),
            Inner::Time { buckets, .. } => buckets.clear(),
        }
    }
}

fn evict_old(buckets: &mut SmallVec<[Bucket; 16]>, span: Duration, now: Instant) {
    while let Some(first) = buckets.first() {
        if now.duration_since(first.started) > span {
            buckets.remove(0);
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn outcome(success: bool, slow: bool) -> CallOutcome {
        CallOutcome {
            at: Instant::now(),
            success,
            duration: Duration::from_millis(10),
            slow,
            error_class: if success {
                None
            } else {
                Some(ErrorClass::Operation)
            },
        }
    }

    #[test]
    fn count_window_evicts_oldest() {
        let mut window = SlidingWindow::count_based(3);
        window.record(outcome(false, false));
        window.record(outcome(true, false));
        window.record(outcome(true, false));
        window.record(outcome(true, false)); // evicts the failure

        let stats = window.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.failed, 0);
    }

    #[test]
    fn rates_are_percentages() {
        let mut window = SlidingWindow::count_based(10);
        for _ in 0..6 {
            window.record(outcome(false, false));
        }
        for _ in 0..4 {
            window.record(outcome(true, true));
        }

        let stats = window.stats();
        assert!((stats.failure_rate() - 60.0).abs() < f64::EPSILON);
        assert!((stats.slow_rate() - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_window_reports_zero_rates() {
        let mut window = SlidingWindow::time_based(Duration::from_secs(10), 10);
        let stats = window.stats();
        assert_eq!(stats.failure_rate(), 0.0);
        assert_eq!(stats.slow_rate(), 0.0);
    }

    #[test]
    fn slowness_and_failure_are_independent_axes() {
        let mut window = SlidingWindow::count_based(10);
        window.record(outcome(true, true)); // slow success
        window.record(outcome(false, true)); // slow failure

        let stats = window.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.slow, 2);
    }

    #[test]
    fn time_window_evicts_aged_buckets() {
        let mut window = SlidingWindow::time_based(Duration::from_millis(100), 4);
        for _ in 0..5 {
            window.record(outcome(false, false));
        }
        assert_eq!(window.stats().total, 5);

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(window.stats().total, 0);

        // Rates start over once the old buckets are gone.
        window.record(outcome(true, false));
        let stats = window.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.failure_rate(), 0.0);
    }

    #[test]
    fn clear_empties_the_window() {
        let mut window = SlidingWindow::count_based(5);
        window.record(outcome(false, false));
        window.clear();
        assert_eq!(window.stats().total, 0);
    }

    proptest! {
        #[test]
        fn count_window_never_exceeds_capacity(
            capacity in 1usize..64,
            outcomes in proptest::collection::vec(any::<(bool, bool)>(), 0..256),
        ) {
            let mut window = SlidingWindow::count_based(capacity);
            for (success, slow) in outcomes {
                window.record(outcome(success, slow));
                prop_assert!(window.stats().total as usize <= capacity);
            }
        }

        #[test]
        fn failed_and_slow_never_exceed_total(
            outcomes in proptest::collection::vec(any::<(bool, bool)>(), 0..128),
        ) {
            let mut window = SlidingWindow::count_based(32);
            for (success, slow) in outcomes {
                window.record(outcome(success, slow));
            }
            let stats = window.stats();
            prop_assert!(stats.failed <= stats.total);
            prop_assert!(stats.slow <= stats.total);
        }
    }
}
