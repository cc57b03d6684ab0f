//! Metrics for the executor and the transaction log.
//!
//! Plain atomic counters, gauges and histograms grouped per subsystem:
//!
//! ```text
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │       ExecutorMetrics        │   │          LogMetrics          │
//! │ - submitted / rejected       │   │ - appended / refused         │
//! │ - dispatched (now / later)   │   │ - drained                    │
//! │ - completed / cancelled      │   │ - protocol violations        │
//! │ - readiness faults           │   │                              │
//! │ - pending gauge, wait hist.  │   │                              │
//! └──────────────────────────────┘   └──────────────────────────────┘
//! ```

mod counters;
mod gauges;
mod histograms;

pub use counters::Counter;
pub use gauges::Gauge;
pub use histograms::{Histogram, HistogramSnapshot, PENDING_WAIT_BUCKETS};

use std::time::Duration;

/// Metrics recorded by the blocking-aware executor.
#[derive(Debug)]
pub struct ExecutorMetrics {
    /// Units accepted by `submit`.
    pub submitted: Counter,
    /// Units dispatched directly from `submit`.
    pub dispatched_immediately: Counter,
    /// Units parked on submission.
    pub parked: Counter,
    /// Units dispatched by a recheck.
    pub dispatched_from_pending: Counter,
    /// Unit bodies that ran to completion.
    pub completed: Counter,
    /// Units cancelled before they started.
    pub cancelled: Counter,
    /// Submissions rejected (shutdown or saturation).
    pub rejected: Counter,
    /// Readiness gates that panicked.
    pub readiness_faults: Counter,
    /// Recheck passes performed.
    pub rechecks: Counter,
    /// Units currently parked.
    pub pending: Gauge,
    /// Time spent parked before dispatch.
    pub pending_wait: Histogram,
}

impl ExecutorMetrics {
    pub fn new() -> Self {
        Self {
            submitted: Counter::new("executor_units_submitted_total"),
            dispatched_immediately: Counter::new("executor_units_dispatched_immediately_total"),
            parked: Counter::new("executor_units_parked_total"),
            dispatched_from_pending: Counter::new("executor_units_dispatched_from_pending_total"),
            completed: Counter::new("executor_units_completed_total"),
            cancelled: Counter::new("executor_units_cancelled_total"),
            rejected: Counter::new("executor_units_rejected_total"),
            readiness_faults: Counter::new("executor_readiness_faults_total"),
            rechecks: Counter::new("executor_rechecks_total"),
            pending: Gauge::new("executor_units_pending"),
            pending_wait: Histogram::with_buckets(
                "executor_pending_wait_seconds",
                PENDING_WAIT_BUCKETS,
            ),
        }
    }

    pub fn record_pending_wait(&self, waited: Duration) {
        self.pending_wait.observe_duration(waited);
    }

    pub fn snapshot(&self) -> ExecutorMetricsSnapshot {
        ExecutorMetricsSnapshot {
            submitted: self.submitted.get(),
            dispatched_immediately: self.dispatched_immediately.get(),
            parked: self.parked.get(),
            dispatched_from_pending: self.dispatched_from_pending.get(),
            completed: self.completed.get(),
            cancelled: self.cancelled.get(),
            rejected: self.rejected.get(),
            readiness_faults: self.readiness_faults.get(),
            rechecks: self.rechecks.get(),
            pending: self.pending.get(),
            pending_wait: self.pending_wait.snapshot(),
        }
    }
}

impl Default for ExecutorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`ExecutorMetrics`].
#[derive(Debug, Clone)]
pub struct ExecutorMetricsSnapshot {
    pub submitted: u64,
    pub dispatched_immediately: u64,
    pub parked: u64,
    pub dispatched_from_pending: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub readiness_faults: u64,
    pub rechecks: u64,
    pub pending: i64,
    pub pending_wait: HistogramSnapshot,
}

impl ExecutorMetricsSnapshot {
    /// Units that reached the pool, by either path.
    pub fn dispatched(&self) -> u64 {
        self.dispatched_immediately + self.dispatched_from_pending
    }
}

/// Metrics recorded by the transaction log.
#[derive(Debug)]
pub struct LogMetrics {
    /// Entries appended.
    pub appended: Counter,
    /// `log_if_needed` calls that returned false.
    pub refused: Counter,
    /// Entries handed out by `drain` or `drain_and_lock`.
    pub drained: Counter,
    /// Appends attempted by the drain-lock holder and unlocks without a lock.
    pub protocol_violations: Counter,
}

impl LogMetrics {
    pub fn new() -> Self {
        Self {
            appended: Counter::new("txlog_entries_appended_total"),
            refused: Counter::new("txlog_appends_refused_total"),
            drained: Counter::new("txlog_entries_drained_total"),
            protocol_violations: Counter::new("txlog_protocol_violations_total"),
        }
    }

    pub fn snapshot(&self) -> LogMetricsSnapshot {
        LogMetricsSnapshot {
            appended: self.appended.get(),
            refused: self.refused.get(),
            drained: self.drained.get(),
            protocol_violations: self.protocol_violations.get(),
        }
    }
}

impl Default for LogMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`LogMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogMetricsSnapshot {
    pub appended: u64,
    pub refused: u64,
    pub drained: u64,
    pub protocol_violations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_snapshot() {
        let metrics = ExecutorMetrics::new();
        metrics.submitted.inc_by(3);
        metrics.dispatched_immediately.inc();
        metrics.dispatched_from_pending.inc_by(2);
        metrics.pending.add(2);
        metrics.record_pending_wait(Duration::from_millis(2));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.submitted, 3);
        assert_eq!(snapshot.dispatched(), 3);
        assert_eq!(snapshot.pending, 2);
        assert_eq!(snapshot.pending_wait.count, 1);
    }

    #[test]
    fn test_log_snapshot() {
        let metrics = LogMetrics::new();
        metrics.appended.inc_by(5);
        metrics.drained.inc_by(5);
        metrics.refused.inc();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.appended, 5);
        assert_eq!(snapshot.drained, 5);
        assert_eq!(snapshot.refused, 1);
        assert_eq!(snapshot.protocol_violations, 0);
    }
}
