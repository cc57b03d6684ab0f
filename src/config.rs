//! Configuration types for the executor and the transaction log.

use crate::error::{Error, Result};
use std::time::Duration;

/// Aggregate configuration for a node's rehash core.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    /// Blocking-aware executor configuration.
    pub executor: ExecutorConfig,

    /// Transaction log configuration.
    pub log: LogConfig,
}

impl CoreConfig {
    /// Set executor configuration.
    pub fn with_executor_config(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    /// Set transaction log configuration.
    pub fn with_log_config(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    /// Reject configurations that cannot make progress.
    pub fn validate(&self) -> Result<()> {
        self.executor.validate()
    }
}

/// Configuration for the blocking-aware executor and its default pool.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of worker threads in the pool.
    pub worker_threads: usize,

    /// Units the pool may hold queued before it reports saturation.
    pub queue_capacity: usize,

    /// Maximum number of parked units. None means unbounded.
    pub max_pending: Option<usize>,

    /// Interval of the fallback sweep over parked units.
    /// None disables the sweep; collaborators must call `recheck_pending`.
    pub recheck_interval: Option<Duration>,

    /// Prefix for worker and sweeper thread names.
    pub thread_name: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);
        Self {
            worker_threads: cpus,
            queue_capacity: 1000,
            max_pending: None,
            recheck_interval: None,
            thread_name: "rehash-worker".to_string(),
        }
    }
}

impl ExecutorConfig {
    /// Set number of worker threads.
    pub fn with_worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n;
        self
    }

    /// Set pool queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Bound the pending queue.
    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = Some(max);
        self
    }

    /// Enable the periodic sweep over parked units.
    pub fn with_recheck_interval(mut self, interval: Duration) -> Self {
        self.recheck_interval = Some(interval);
        self
    }

    /// Set the thread name prefix.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(Error::Config("worker_threads must be at least 1".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be at least 1".to_string()));
        }
        if self.max_pending == Some(0) {
            return Err(Error::Config("max_pending must be at least 1".to_string()));
        }
        if self.recheck_interval == Some(Duration::ZERO) {
            return Err(Error::Config("recheck_interval must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// What an appender does when it finds the log held by `drain_and_lock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainContention {
    /// Wait until the drain lock is released, then re-evaluate.
    #[default]
    Block,

    /// Return false immediately.
    FailFast,
}

/// Transaction log configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Behaviour of appenders while a drain lock is held.
    pub drain_contention: DrainContention,

    /// Backlog size above which the coordinator keeps draining incrementally
    /// before taking the exclusive drain lock.
    pub drain_threshold: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            drain_contention: DrainContention::Block,
            drain_threshold: 100,
        }
    }
}

impl LogConfig {
    /// Set the drain contention policy.
    pub fn with_drain_contention(mut self, contention: DrainContention) -> Self {
        self.drain_contention = contention;
        self
    }

    /// Set the incremental drain threshold.
    pub fn with_drain_threshold(mut self, threshold: usize) -> Self {
        self.drain_threshold = threshold;
        self
    }
}
