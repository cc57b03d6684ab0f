//! Blocking-aware task execution.
//!
//! A bounded pool deadlocks once every thread is blocked on a condition that
//! only another queued task can resolve. This executor keeps blocked work off
//! the pool: each unit carries a [`ReadinessGate`], units with a closed gate
//! are parked in a [`TaskQueue`], and collaborators call
//! [`BlockingAwareExecutor::recheck_pending`] after any event that may open a
//! gate.
//!
//! # Architecture
//!
//! ```text
//!   submit(unit) ──► gate open & pool has room? ──yes──► WorkerPool
//!                         │ no                              ▲
//!                         ▼                                 │
//!                    TaskQueue (submission order)           │
//!                         │                                 │
//!   recheck_pending() ────┴── single pass, ready units ─────┘
//!   (lock release, topology stable, periodic sweep)
//! ```

mod pool;
mod queue;
mod service;
mod sink;
mod unit;

pub use pool::{BoundedPool, Job, PoolRejection, RuntimePool, WorkerPool};
pub use queue::{Pending, Scan, TaskQueue, Verdict};
pub use service::{BlockingAwareExecutor, ExecutorBuilder, RecheckReport, RecheckTrigger};
pub use sink::{CollectingErrorSink, ErrorSink, LogErrorSink};
pub use unit::{AlwaysReady, ReadinessGate, UnitHandle, UnitOfWork, UnitState};
