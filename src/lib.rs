//! Concurrency core for a data grid moving keys between nodes.
//!
//! This crate provides the two pieces a node needs while its data ownership
//! changes:
//! - **BlockingAwareExecutor**: a bounded pool that never lets blocked work
//!   occupy a thread. Units carry a readiness gate; closed units are parked
//!   and re-examined on `recheck_pending`.
//! - **TransactionLog**: a write-ahead buffer for writes issued during a
//!   rehash, drained incrementally and finally under an exclusive lock.
//!
//! # Features
//!
//! - Parked units dispatched in submission order, exactly once
//! - Panicking readiness checks isolated and reported, never retried
//! - Lock-free appends to the log; drains concurrent with appends
//! - Scoped drain lock released on drop
//! - `RehashCoordinator` and `KeyLockTable` wiring the two together, with
//!   writes to one key applied in routing order across a rehash
//!
//! # Example
//!
//! ```rust
//! use rehash_core::{BlockingAwareExecutor, CacheWrite, ExecutorConfig, TransactionLog, UnitOfWork};
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//!
//! let executor = BlockingAwareExecutor::new(ExecutorConfig::default()).unwrap();
//!
//! // Park a unit until the flag is set
//! let ready = Arc::new(AtomicBool::new(false));
//! let gate = ready.clone();
//! executor
//!     .submit(UnitOfWork::new(move || gate.load(Ordering::SeqCst), || println!("ran")))
//!     .unwrap();
//! assert_eq!(executor.pending_count(), 1);
//!
//! ready.store(true, Ordering::SeqCst);
//! executor.recheck_pending();
//!
//! // Buffer writes while a rehash is in progress
//! let log = TransactionLog::<CacheWrite>::default();
//! log.enable().unwrap();
//! assert!(log.log_if_needed(CacheWrite::put("user:1", "Alice")));
//! let guard = log.drain_and_lock().unwrap();
//! assert_eq!(guard.len(), 1);
//! guard.unlock_and_disable().unwrap();
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            RehashCoordinator                │
//! │  • begin_rehash / complete_rehash           │
//! │  • route_write(cmd)                         │
//! └─────────────────────────────────────────────┘
//!          │                        │
//!          ▼                        ▼
//! ┌─────────────────┐     ┌──────────────────────┐
//! │ TransactionLog  │     │ BlockingAwareExecutor│◄── KeyLockTable
//! │ (rehash window) │     │ (gated units)        │    (unlock_all)
//! └─────────────────┘     └──────────────────────┘
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod testing;
pub mod topology;
pub mod txlog;
pub mod types;

// Re-export main types for convenience
pub use config::{CoreConfig, DrainContention, ExecutorConfig, LogConfig};
pub use error::{Error, ExecutorError, LogError, ReadinessFault, Result};
pub use types::{CacheWrite, Key, TopologyId, UnitId, WriteCommand};

// Re-export executor types
pub use executor::{
    AlwaysReady, BlockingAwareExecutor, BoundedPool, CollectingErrorSink, ErrorSink,
    ExecutorBuilder, LogErrorSink, ReadinessGate, RecheckReport, RecheckTrigger, RuntimePool,
    UnitHandle, UnitOfWork, UnitState, WorkerPool,
};

// Re-export transaction log types
pub use txlog::{DrainGuard, LogEntry, LogState, TransactionLog};

// Re-export topology types
pub use topology::{
    KeyLockTable, KeysUnlocked, LockOwner, RehashCoordinator, RehashSummary, WriteApplier,
    WriteRoute, WriteSequencer, WriteTicket,
};

// Re-export metrics types
pub use metrics::{
    Counter, ExecutorMetricsSnapshot, Gauge, Histogram, HistogramSnapshot, LogMetricsSnapshot,
};
