//! Testing utilities for the executor and the transaction log.
//!
//! [`ManualGate`] is a readiness gate a test opens and closes by hand, and
//! [`RunRecorder`] records which unit bodies ran and in what order. Together they
//! make the executor's guarantees directly observable:
//!
//! ```rust
//! use rehash_core::testing::{ManualGate, RunRecorder};
//! use rehash_core::{BlockingAwareExecutor, ExecutorConfig, UnitOfWork};
//!
//! let executor = BlockingAwareExecutor::new(ExecutorConfig::default()).unwrap();
//! let gate = ManualGate::closed();
//! let recorder = RunRecorder::new();
//!
//! executor.submit(UnitOfWork::new(gate.clone(), recorder.task(0))).unwrap();
//! assert_eq!(executor.pending_count(), 1);
//!
//! gate.open();
//! executor.recheck_pending();
//! assert!(recorder.wait_for_count(1, std::time::Duration::from_secs(5)));
//! ```
//!
//! The scenario suites below exercise the public API end to end.

mod executor_scenarios;
mod rehash_scenarios;
mod txlog_scenarios;
#[cfg(test)]
pub(crate) mod utils;

use crate::executor::ReadinessGate;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A readiness gate flipped by hand. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ManualGate {
    open: Arc<AtomicBool>,
    evaluations: Arc<AtomicU64>,
}

impl ManualGate {
    /// A gate that starts closed.
    pub fn closed() -> Self {
        Self::default()
    }

    /// A gate that starts open.
    pub fn opened() -> Self {
        let gate = Self::default();
        gate.open();
        gate
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// How many times the executor asked this gate.
    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::SeqCst)
    }
}

impl ReadinessGate for ManualGate {
    fn is_ready(&self) -> bool {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        self.is_open()
    }
}

/// Records unit bodies as they run. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct RunRecorder {
    runs: Arc<Mutex<Vec<usize>>>,
}

impl RunRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tag: usize) {
        self.runs.lock().push(tag);
    }

    /// A unit body that records `tag`.
    pub fn task(&self, tag: usize) -> impl FnOnce() + Send + 'static {
        let recorder = self.clone();
        move || recorder.record(tag)
    }

    /// Tags in the order their bodies ran.
    pub fn runs(&self) -> Vec<usize> {
        self.runs.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.runs.lock().len()
    }

    /// How many times `tag` ran.
    pub fn times(&self, tag: usize) -> usize {
        self.runs.lock().iter().filter(|&&t| t == tag).count()
    }

    /// Block until at least `expected` bodies ran.
    pub fn wait_for_count(&self, expected: usize, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.count() >= expected {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.count() >= expected
    }
}
