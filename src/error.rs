//! Error types for the executor and the transaction log.

use crate::types::UnitId;
use thiserror::Error;

/// Result type alias for rehash-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Executor submission or dispatch errors.
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// Transaction log protocol errors.
    #[error("transaction log error: {0}")]
    Log(#[from] LogError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Buffered writes that could not be re-applied after a rehash. The
    /// rest of the batch was still replayed.
    #[error("replay failed for entries {failed:?} ({replayed} replayed): {message}")]
    Replay {
        /// Log sequence numbers of the entries that failed.
        failed: Vec<u64>,
        replayed: usize,
        /// The first failure.
        message: String,
    },

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors reported synchronously to submitters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// The executor has been shut down.
    #[error("executor is shut down")]
    Shutdown,

    /// Too many parked units (backpressure).
    #[error("executor saturated: too many pending units ({pending})")]
    Saturated { pending: usize },

    /// The worker pool refused the unit outright.
    #[error("worker pool rejected unit {0}")]
    PoolRejected(UnitId),

    /// Failed to start a background thread.
    #[error("failed to spawn thread: {0}")]
    Spawn(String),
}

/// Transaction log protocol violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// `unlock_and_disable` without a held drain lock.
    #[error("unlock requested but no drain lock is held")]
    NotDraining,

    /// Another caller already holds the drain lock, or the holder tried to
    /// wait on its own lock.
    #[error("a drain is already in progress")]
    DrainInProgress,
}

/// A readiness gate panicked while being evaluated.
///
/// The unit is never run nor retried; the fault goes to the configured
/// [`ErrorSink`](crate::executor::ErrorSink).
#[derive(Error, Debug, Clone)]
#[error("readiness check of unit {unit} failed: {message}")]
pub struct ReadinessFault {
    pub unit: UnitId,
    pub label: Option<String>,
    pub message: String,
}
