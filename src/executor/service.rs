//! The blocking-aware executor.

use super::pool::{BoundedPool, Job, JobHooks, PoolRejection, WorkerPool};
use super::queue::{Pending, TaskQueue, Verdict};
use super::sink::{ErrorSink, LogErrorSink};
use super::unit::{StateCell, UnitHandle, UnitOfWork, UnitState};
use crate::clock::{MonotonicClock, TimeSource};
use crate::config::ExecutorConfig;
use crate::error::{ExecutorError, ReadinessFault, Result};
use crate::metrics::{ExecutorMetrics, ExecutorMetricsSnapshot};
use crate::types::UnitId;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Something that can be told "conditions changed, look at parked units".
pub trait RecheckTrigger: Send + Sync {
    fn trigger_recheck(&self);
}

/// Outcome of one [`BlockingAwareExecutor::recheck_pending`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecheckReport {
    /// Parked units inspected.
    pub scanned: usize,
    /// Units handed to the pool.
    pub dispatched: usize,
    /// Units found ready but put back because the pool was saturated.
    pub deferred: usize,
    /// Units removed because their gate panicked.
    pub faulted: usize,
    /// Units parked after the pass.
    pub still_pending: usize,
}

struct Parked {
    unit: UnitOfWork,
    state: Arc<StateCell>,
    parked_at: Instant,
}

struct Shared {
    pool: Arc<dyn WorkerPool>,
    queue: TaskQueue<Parked>,
    // Serializes rechecks and shutdown.
    scan_lock: Mutex<()>,
    shutdown: AtomicBool,
    max_pending: Option<usize>,
    // Set while ready units wait for pool room; a finishing job then rechecks.
    awaiting_capacity: AtomicBool,
    metrics: ExecutorMetrics,
    error_sink: Arc<dyn ErrorSink>,
    clock: Arc<dyn TimeSource>,
    hooks: Weak<dyn JobHooks>,
    sweeper_stopped: Mutex<bool>,
    sweeper_wakeup: Condvar,
}

impl Shared {
    fn submit(&self, unit: UnitOfWork) -> std::result::Result<UnitHandle, ExecutorError> {
        if self.shutdown.load(Ordering::SeqCst) {
            self.metrics.rejected.inc();
            debug!(unit = %unit.id(), "Rejected submission after shutdown");
            return Err(ExecutorError::Shutdown);
        }

        let state = Arc::new(StateCell::new());
        let handle = UnitHandle::new(unit.id(), Arc::clone(&state));
        self.metrics.submitted.inc();

        if !self.pool.has_capacity() {
            self.park(unit, state, true)?;
            return Ok(handle);
        }

        match unit.check_ready() {
            Err(message) => self.fault(unit, &state, message),
            Ok(true) => self.dispatch(unit, state)?,
            Ok(false) => {
                // Evaluate again under the scan lock: a recheck that finished
                // between the first evaluation and the push would miss the unit.
                let scan = self.scan_lock.lock();
                match unit.check_ready() {
                    Err(message) => self.fault(unit, &state, message),
                    Ok(false) => self.park(unit, state, false)?,
                    Ok(true) => {
                        drop(scan);
                        self.dispatch(unit, state)?;
                    }
                }
            }
        }
        Ok(handle)
    }

    fn dispatch(
        &self,
        unit: UnitOfWork,
        state: Arc<StateCell>,
    ) -> std::result::Result<(), ExecutorError> {
        let id = unit.id();
        state.set(UnitState::Dispatched);
        match self.pool.execute(Job::new(unit, state, self.hooks.clone())) {
            Ok(()) => {
                self.metrics.dispatched_immediately.inc();
                trace!(unit = %id, "Dispatched on submit");
                Ok(())
            }
            Err(PoolRejection::Saturated(job)) => {
                let (unit, state) = job.into_parts();
                self.park(unit, state, true)
            }
            Err(PoolRejection::Shutdown(job)) => {
                let (_, state) = job.into_parts();
                state.set(UnitState::Cancelled);
                self.metrics.rejected.inc();
                if self.shutdown.load(Ordering::SeqCst) {
                    Err(ExecutorError::Shutdown)
                } else {
                    warn!(unit = %id, "Worker pool shut down underneath the executor");
                    Err(ExecutorError::PoolRejected(id))
                }
            }
        }
    }

    fn park(
        &self,
        unit: UnitOfWork,
        state: Arc<StateCell>,
        awaiting_capacity: bool,
    ) -> std::result::Result<(), ExecutorError> {
        let id = unit.id();
        state.set(UnitState::Pending);
        let parked = Parked {
            unit,
            state,
            parked_at: self.clock.now(),
        };

        let seq = match self.queue.push_bounded(parked, self.max_pending) {
            Ok(seq) => seq,
            Err((_, pending)) => {
                self.metrics.rejected.inc();
                warn!(unit = %id, pending, "Pending queue full, rejecting unit");
                return Err(ExecutorError::Saturated { pending });
            }
        };
        self.metrics.parked.inc();
        self.metrics.pending.set(self.queue.len() as i64);
        debug!(unit = %id, seq, awaiting_capacity, "Unit parked");

        if self.shutdown.load(Ordering::SeqCst) {
            // Lost the race with shutdown_now's drain.
            self.cancel_parked();
        } else if awaiting_capacity {
            self.awaiting_capacity.store(true, Ordering::SeqCst);
            if self.pool.has_capacity() {
                self.capacity_freed();
            }
        }
        Ok(())
    }

    fn fault(&self, unit: UnitOfWork, state: &StateCell, message: String) {
        state.set(UnitState::Faulted);
        self.metrics.readiness_faults.inc();
        self.error_sink.readiness_fault(ReadinessFault {
            unit: unit.id(),
            label: unit.label().map(str::to_string),
            message,
        });
    }

    fn recheck(&self) -> RecheckReport {
        let report = self.recheck_pass();
        // A slot freed while the pass was deferring units has no other trigger.
        if report.deferred > 0 && self.pool.has_capacity() {
            self.capacity_freed();
        }
        report
    }

    fn recheck_pass(&self) -> RecheckReport {
        let _scan = self.scan_lock.lock();
        if self.shutdown.load(Ordering::SeqCst) {
            return RecheckReport::default();
        }
        self.metrics.rechecks.inc();
        self.awaiting_capacity.store(false, Ordering::SeqCst);

        let scan = self.queue.scan(|parked: &Parked| match parked.unit.check_ready() {
            Ok(true) => Verdict::Ready,
            Ok(false) => Verdict::Wait,
            Err(message) => Verdict::Evict(message),
        });

        let mut report = RecheckReport {
            scanned: scan.scanned,
            faulted: scan.evicted.len(),
            ..Default::default()
        };

        for (entry, message) in scan.evicted {
            let Parked { unit, state, .. } = entry.item;
            self.fault(unit, &state, message);
        }

        let mut ready = scan.ready.into_iter();
        while let Some(Pending { seq, item }) = ready.next() {
            let Parked {
                unit,
                state,
                parked_at,
            } = item;
            let id = unit.id();
            state.set(UnitState::Dispatched);

            match self.pool.execute(Job::new(unit, state, self.hooks.clone())) {
                Ok(()) => {
                    report.dispatched += 1;
                    self.metrics.dispatched_from_pending.inc();
                    self.metrics
                        .record_pending_wait(self.clock.now().saturating_duration_since(parked_at));
                    trace!(unit = %id, seq, "Dispatched parked unit");
                }
                Err(PoolRejection::Saturated(job)) => {
                    let (unit, state) = job.into_parts();
                    let mut deferred = vec![Pending {
                        seq,
                        item: Parked {
                            unit,
                            state,
                            parked_at,
                        },
                    }];
                    deferred.extend(ready.by_ref());
                    for entry in &deferred {
                        entry.item.state.set(UnitState::Pending);
                    }
                    report.deferred = deferred.len();
                    self.queue.reinsert(deferred);
                    self.awaiting_capacity.store(true, Ordering::SeqCst);
                    warn!(deferred = report.deferred, "Worker pool saturated, ready units stay parked");
                    break;
                }
                Err(PoolRejection::Shutdown(job)) => {
                    let (_, state) = job.into_parts();
                    state.set(UnitState::Cancelled);
                    self.metrics.cancelled.inc();
                    for rest in ready.by_ref() {
                        rest.item.state.set(UnitState::Cancelled);
                        self.metrics.cancelled.inc();
                    }
                    break;
                }
            }
        }

        report.still_pending = self.queue.len();
        self.metrics.pending.set(report.still_pending as i64);
        if report.dispatched > 0 || report.faulted > 0 {
            debug!(
                scanned = report.scanned,
                dispatched = report.dispatched,
                faulted = report.faulted,
                still_pending = report.still_pending,
                "Recheck pass finished"
            );
        }
        report
    }

    fn capacity_freed(&self) {
        if self.awaiting_capacity.swap(false, Ordering::SeqCst) {
            self.recheck();
        }
    }

    fn cancel_parked(&self) -> usize {
        let parked = self.queue.drain_all();
        for entry in &parked {
            entry.item.state.set(UnitState::Cancelled);
            self.metrics.cancelled.inc();
        }
        self.metrics.pending.set(0);
        parked.len()
    }

    fn shutdown_now(&self) -> usize {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return 0;
        }
        self.stop_sweeper();

        let _scan = self.scan_lock.lock();
        let parked = self.cancel_parked();
        let unstarted = self.pool.shutdown_now();
        let unstarted_count = unstarted.len();
        for job in unstarted {
            job.cancel();
        }

        info!(parked, unstarted = unstarted_count, "Executor shut down");
        parked + unstarted_count
    }

    fn stop_sweeper(&self) {
        *self.sweeper_stopped.lock() = true;
        self.sweeper_wakeup.notify_all();
    }
}

impl JobHooks for Shared {
    fn completed(&self, id: UnitId) {
        self.metrics.completed.inc();
        trace!(unit = %id, "Unit completed");
        self.capacity_freed();
    }

    fn cancelled(&self, id: UnitId) {
        self.metrics.cancelled.inc();
        trace!(unit = %id, "Unit cancelled before start");
    }
}

/// Builder for [`BlockingAwareExecutor`].
pub struct ExecutorBuilder {
    config: ExecutorConfig,
    pool: Option<Arc<dyn WorkerPool>>,
    error_sink: Arc<dyn ErrorSink>,
    clock: Arc<dyn TimeSource>,
}

impl ExecutorBuilder {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            pool: None,
            error_sink: Arc::new(LogErrorSink),
            clock: Arc::new(MonotonicClock),
        }
    }

    /// Use an existing pool instead of spawning a [`BoundedPool`].
    pub fn pool(mut self, pool: Arc<dyn WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = sink;
        self
    }

    pub fn time_source(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<BlockingAwareExecutor> {
        self.config.validate()?;
        let pool: Arc<dyn WorkerPool> = match self.pool {
            Some(pool) => pool,
            None => Arc::new(BoundedPool::new(
                self.config.worker_threads,
                self.config.queue_capacity,
                &self.config.thread_name,
            )?),
        };

        let error_sink = self.error_sink;
        let clock = self.clock;
        let max_pending = self.config.max_pending;
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let hooks: Weak<dyn JobHooks> = weak.clone();
            Shared {
                pool,
                queue: TaskQueue::new(),
                scan_lock: Mutex::new(()),
                shutdown: AtomicBool::new(false),
                max_pending,
                awaiting_capacity: AtomicBool::new(false),
                metrics: ExecutorMetrics::new(),
                error_sink,
                clock,
                hooks,
                sweeper_stopped: Mutex::new(false),
                sweeper_wakeup: Condvar::new(),
            }
        });

        let sweeper = match self.config.recheck_interval {
            Some(interval) => Some(spawn_sweeper(&shared, interval, &self.config.thread_name)?),
            None => None,
        };

        info!(
            max_pending = ?max_pending,
            recheck_interval = ?self.config.recheck_interval,
            "Blocking-aware executor started"
        );

        Ok(BlockingAwareExecutor {
            shared,
            sweeper: Mutex::new(sweeper),
        })
    }
}

fn spawn_sweeper(
    shared: &Arc<Shared>,
    interval: Duration,
    thread_name: &str,
) -> std::result::Result<JoinHandle<()>, ExecutorError> {
    let weak = Arc::downgrade(shared);
    thread::Builder::new()
        .name(format!("{}-sweeper", thread_name))
        .spawn(move || loop {
            let Some(shared) = weak.upgrade() else {
                break;
            };
            {
                let mut stopped = shared.sweeper_stopped.lock();
                if !*stopped {
                    shared.sweeper_wakeup.wait_for(&mut stopped, interval);
                }
                if *stopped {
                    break;
                }
            }
            let report = shared.recheck();
            if report.dispatched > 0 {
                debug!(dispatched = report.dispatched, "Periodic sweep dispatched parked units");
            }
        })
        .map_err(|e| ExecutorError::Spawn(e.to_string()))
}

/// Executor that never lets a pool thread sit on a unit that cannot make
/// progress.
///
/// Units whose gate is closed are parked instead of dispatched. Whoever
/// changes the condition a gate depends on (releasing a lock, finishing a
/// rehash, receiving a remote response) calls
/// [`recheck_pending`](Self::recheck_pending), which dispatches every parked
/// unit whose gate has opened, in submission order.
///
/// # Example
///
/// ```rust,no_run
/// use rehash_core::{BlockingAwareExecutor, ExecutorConfig, UnitOfWork};
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
///
/// let executor = BlockingAwareExecutor::new(ExecutorConfig::default()).unwrap();
/// let lock_free = Arc::new(AtomicBool::new(false));
///
/// let gate = lock_free.clone();
/// executor
///     .submit(UnitOfWork::new(move || gate.load(Ordering::SeqCst), || println!("applied")))
///     .unwrap();
///
/// lock_free.store(true, Ordering::SeqCst);
/// executor.recheck_pending();
/// ```
pub struct BlockingAwareExecutor {
    shared: Arc<Shared>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl BlockingAwareExecutor {
    /// Create an executor over a new [`BoundedPool`].
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        ExecutorBuilder::new(config).build()
    }

    pub fn builder(config: ExecutorConfig) -> ExecutorBuilder {
        ExecutorBuilder::new(config)
    }

    /// Dispatch the unit now if it is ready and the pool has room, otherwise
    /// park it. Never blocks on the unit.
    pub fn submit(&self, unit: UnitOfWork) -> Result<UnitHandle> {
        Ok(self.shared.submit(unit)?)
    }

    /// Dispatch every parked unit whose gate has opened. Safe to call from any
    /// thread, as often as wanted.
    pub fn recheck_pending(&self) -> RecheckReport {
        self.shared.recheck()
    }

    /// Stop accepting work and cancel everything not yet started.
    ///
    /// Returns the number of cancelled units. Running units are not waited
    /// for.
    pub fn shutdown_now(&self) -> usize {
        let cancelled = self.shared.shutdown_now();
        if let Some(sweeper) = self.sweeper.lock().take() {
            let _ = sweeper.join();
        }
        cancelled
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Number of parked units.
    pub fn pending_count(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn metrics(&self) -> ExecutorMetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl RecheckTrigger for BlockingAwareExecutor {
    fn trigger_recheck(&self) {
        self.recheck_pending();
    }
}

impl Drop for BlockingAwareExecutor {
    fn drop(&mut self) {
        self.shutdown_now();
    }
}

impl std::fmt::Debug for BlockingAwareExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingAwareExecutor")
            .field("pending", &self.pending_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
