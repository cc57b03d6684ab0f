//! Worker pools the executor dispatches ready units to.
//!
//! The executor only needs three things from a pool: hand it a job without
//! blocking, ask whether it has room, and stop it. [`BoundedPool`] runs jobs
//! on a fixed set of named threads fed by a bounded channel; [`RuntimePool`]
//! runs them on a tokio runtime's blocking threads.

use super::unit::{panic_message, StateCell, UnitOfWork, UnitState};
use crate::error::ExecutorError;
use crate::types::UnitId;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// Callbacks from a job back into its executor.
pub(crate) trait JobHooks: Send + Sync {
    fn completed(&self, id: UnitId);
    fn cancelled(&self, id: UnitId);
}

struct NoHooks;

impl JobHooks for NoHooks {
    fn completed(&self, _id: UnitId) {}
    fn cancelled(&self, _id: UnitId) {}
}

/// A dispatched unit, ready to run on a pool thread.
pub struct Job {
    unit: UnitOfWork,
    state: Arc<StateCell>,
    hooks: Weak<dyn JobHooks>,
}

impl Job {
    pub(crate) fn new(unit: UnitOfWork, state: Arc<StateCell>, hooks: Weak<dyn JobHooks>) -> Self {
        Self { unit, state, hooks }
    }

    /// A job not attached to any executor.
    pub fn detached(unit: UnitOfWork) -> Self {
        let state = Arc::new(StateCell::new());
        state.set(UnitState::Dispatched);
        let hooks: Weak<dyn JobHooks> = Weak::<NoHooks>::new();
        Self::new(unit, state, hooks)
    }

    pub fn id(&self) -> UnitId {
        self.unit.id()
    }

    /// Run the body. A panicking body is logged; the unit still completes.
    pub fn run(self) {
        self.run_then(|| {});
    }

    /// Run the body, then call `release` before the executor is told the
    /// job finished. Pools use it to free the slot the job occupied, so the
    /// recheck triggered by completion sees the freed capacity.
    pub(crate) fn run_then(self, release: impl FnOnce()) {
        let Job { unit, state, hooks } = self;
        let id = unit.id();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| unit.run())) {
            error!(unit = %id, "unit body panicked: {}", panic_message(&*payload));
        }
        state.set(UnitState::Completed);
        release();
        if let Some(hooks) = hooks.upgrade() {
            hooks.completed(id);
        }
    }

    /// Drop the job without running it.
    pub fn cancel(self) {
        let id = self.unit.id();
        if self.state.transition(UnitState::Dispatched, UnitState::Cancelled) {
            if let Some(hooks) = self.hooks.upgrade() {
                hooks.cancelled(id);
            }
        }
    }

    pub(crate) fn into_parts(self) -> (UnitOfWork, Arc<StateCell>) {
        (self.unit, self.state)
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("unit", &self.unit).finish()
    }
}

/// Why a pool refused a job. The job is handed back untouched.
#[derive(Debug)]
pub enum PoolRejection {
    /// The pool is at capacity.
    Saturated(Job),
    /// The pool has been shut down.
    Shutdown(Job),
}

/// A bounded pool of worker threads.
pub trait WorkerPool: Send + Sync {
    /// Queue a job for execution without blocking.
    fn execute(&self, job: Job) -> Result<(), PoolRejection>;

    /// Whether `execute` would currently accept a job.
    fn has_capacity(&self) -> bool;

    /// Stop accepting jobs and return the ones that never started.
    fn shutdown_now(&self) -> Vec<Job>;

    fn is_shutdown(&self) -> bool;
}

/// Fixed-size thread pool over a bounded channel.
pub struct BoundedPool {
    sender: Sender<Job>,
    receiver: Receiver<Job>,
    capacity: usize,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BoundedPool {
    /// Spawn `worker_threads` threads named `{thread_name}-{i}`.
    pub fn new(
        worker_threads: usize,
        queue_capacity: usize,
        thread_name: &str,
    ) -> Result<Self, ExecutorError> {
        let (sender, receiver) = crossbeam_channel::bounded::<Job>(queue_capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let active = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(worker_threads);
        for i in 0..worker_threads {
            let receiver = receiver.clone();
            let shutdown = Arc::clone(&shutdown);
            let active = Arc::clone(&active);

            let handle = thread::Builder::new()
                .name(format!("{}-{}", thread_name, i))
                .spawn(move || worker_loop(receiver, shutdown, active))
                .map_err(|e| ExecutorError::Spawn(e.to_string()))?;
            workers.push(handle);
        }

        debug!(worker_threads, queue_capacity, "Started bounded worker pool");

        Ok(Self {
            sender,
            receiver,
            capacity: queue_capacity,
            shutdown,
            active,
            workers: Mutex::new(workers),
        })
    }

    /// Jobs currently running.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Jobs waiting for a worker.
    pub fn queued_count(&self) -> usize {
        self.sender.len()
    }

    /// Wait for every worker thread to exit. Only returns after shutdown.
    pub fn join(&self) {
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            let _ = handle.join();
        }
    }
}

fn worker_loop(receiver: Receiver<Job>, shutdown: Arc<AtomicBool>, active: Arc<AtomicUsize>) {
    while !shutdown.load(Ordering::Acquire) {
        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(job) => {
                if shutdown.load(Ordering::Acquire) {
                    job.cancel();
                    break;
                }
                active.fetch_add(1, Ordering::SeqCst);
                job.run_then(|| {
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

impl WorkerPool for BoundedPool {
    fn execute(&self, job: Job) -> Result<(), PoolRejection> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(PoolRejection::Shutdown(job));
        }
        match self.sender.try_send(job) {
            Ok(()) => {
                if self.shutdown.load(Ordering::Acquire) {
                    // Sent after shutdown_now drained the queue.
                    for job in self.receiver.try_iter() {
                        job.cancel();
                    }
                }
                Ok(())
            }
            Err(TrySendError::Full(job)) => Err(PoolRejection::Saturated(job)),
            Err(TrySendError::Disconnected(job)) => Err(PoolRejection::Shutdown(job)),
        }
    }

    fn has_capacity(&self) -> bool {
        !self.shutdown.load(Ordering::Acquire) && self.sender.len() < self.capacity
    }

    fn shutdown_now(&self) -> Vec<Job> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        let unstarted: Vec<Job> = self.receiver.try_iter().collect();
        info!(unstarted = unstarted.len(), "Bounded worker pool shut down");
        unstarted
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for BoundedPool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for BoundedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedPool")
            .field("capacity", &self.capacity)
            .field("queued", &self.queued_count())
            .field("active", &self.active_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// Pool backed by a tokio runtime's blocking threads, bounded by an
/// in-flight limit.
pub struct RuntimePool {
    handle: tokio::runtime::Handle,
    max_in_flight: usize,
    in_flight: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl RuntimePool {
    pub fn new(handle: tokio::runtime::Handle, max_in_flight: usize) -> Self {
        Self {
            handle,
            max_in_flight,
            in_flight: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Use the runtime of the calling context.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current(max_in_flight: usize) -> Self {
        Self::new(tokio::runtime::Handle::current(), max_in_flight)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Releases an in-flight slot when the blocking task ends.
struct Slot(Arc<AtomicUsize>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool for RuntimePool {
    fn execute(&self, job: Job) -> Result<(), PoolRejection> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(PoolRejection::Shutdown(job));
        }
        let max = self.max_in_flight;
        if self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_err()
        {
            return Err(PoolRejection::Saturated(job));
        }

        let slot = Slot(Arc::clone(&self.in_flight));
        let shutdown = Arc::clone(&self.shutdown);
        self.handle.spawn_blocking(move || {
            if shutdown.load(Ordering::Acquire) {
                drop(slot);
                job.cancel();
            } else {
                job.run_then(move || drop(slot));
            }
        });
        Ok(())
    }

    fn has_capacity(&self) -> bool {
        !self.shutdown.load(Ordering::Acquire) && self.in_flight() < self.max_in_flight
    }

    // Queued blocking tasks cannot be pulled back from tokio; they observe the
    // flag and cancel themselves instead.
    fn shutdown_now(&self) -> Vec<Job> {
        self.shutdown.store(true, Ordering::Release);
        Vec::new()
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for RuntimePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimePool")
            .field("max_in_flight", &self.max_in_flight)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::utils::wait_for_blocking;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_bounded_pool_runs_jobs() {
        let pool = BoundedPool::new(2, 16, "test-pool").unwrap();
        let counter = Arc::new(AtomicU32::new(0));

        for _ in 0..10 {
            let counter = counter.clone();
            pool.execute(Job::detached(UnitOfWork::ready(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();
        }

        assert!(wait_for_blocking(|| counter.load(Ordering::SeqCst) == 10, WAIT));
        pool.shutdown_now();
        pool.join();
    }

    #[test]
    fn test_bounded_pool_saturation() {
        let pool = BoundedPool::new(1, 1, "test-pool").unwrap();
        let release = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicBool::new(false));

        let (r, s) = (release.clone(), started.clone());
        pool.execute(Job::detached(UnitOfWork::ready(move || {
            s.store(true, Ordering::SeqCst);
            while !r.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        })))
        .unwrap();
        assert!(wait_for_blocking(|| started.load(Ordering::SeqCst), WAIT));

        // One slot in the channel, then full.
        pool.execute(Job::detached(UnitOfWork::ready(|| {}))).unwrap();
        assert!(!pool.has_capacity());
        let rejected = pool.execute(Job::detached(UnitOfWork::ready(|| {})));
        assert!(matches!(rejected, Err(PoolRejection::Saturated(_))));

        release.store(true, Ordering::SeqCst);
        assert!(wait_for_blocking(|| pool.has_capacity(), WAIT));
        pool.shutdown_now();
        pool.join();
    }

    #[test]
    fn test_bounded_pool_shutdown_returns_unstarted() {
        let pool = BoundedPool::new(1, 8, "test-pool").unwrap();
        let release = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicBool::new(false));
        let ran = Arc::new(AtomicU32::new(0));

        let (r, s) = (release.clone(), started.clone());
        pool.execute(Job::detached(UnitOfWork::ready(move || {
            s.store(true, Ordering::SeqCst);
            while !r.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        })))
        .unwrap();
        assert!(wait_for_blocking(|| started.load(Ordering::SeqCst), WAIT));

        for _ in 0..3 {
            let ran = ran.clone();
            pool.execute(Job::detached(UnitOfWork::ready(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();
        }

        let unstarted = pool.shutdown_now();
        assert_eq!(unstarted.len(), 3);
        assert!(pool.is_shutdown());
        assert!(matches!(
            pool.execute(Job::detached(UnitOfWork::ready(|| {}))),
            Err(PoolRejection::Shutdown(_))
        ));

        release.store(true, Ordering::SeqCst);
        pool.join();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_runtime_pool_limits_in_flight() {
        let pool = RuntimePool::current(1);
        let release = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));

        let (r, d) = (release.clone(), done.clone());
        pool.execute(Job::detached(UnitOfWork::ready(move || {
            while !r.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            d.store(true, Ordering::SeqCst);
        })))
        .unwrap();

        assert!(!pool.has_capacity());
        assert!(matches!(
            pool.execute(Job::detached(UnitOfWork::ready(|| {}))),
            Err(PoolRejection::Saturated(_))
        ));

        release.store(true, Ordering::SeqCst);
        let start = Instant::now();
        while !(done.load(Ordering::SeqCst) && pool.has_capacity()) {
            assert!(start.elapsed() < Duration::from_secs(5));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
