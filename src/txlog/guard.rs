//! Scoped ownership of the drain lock.

use super::log::{LogEntry, TransactionLog};
use crate::error::LogError;
use crate::types::WriteCommand;
use std::fmt;
use std::marker::PhantomData;
use tracing::warn;

/// Proof that the caller holds the drain lock of a [`TransactionLog`].
///
/// While the guard lives no write is appended to the log. Releasing it, by
/// [`unlock_and_disable`](Self::unlock_and_disable) or by drop, leaves the
/// log disabled.
///
/// The lock belongs to the thread that called
/// [`TransactionLog::drain_and_lock`]: that thread's appends are refused
/// rather than blocked, so the guard is `!Send` and must be released where
/// it was taken.
///
/// ```compile_fail
/// use rehash_core::{CacheWrite, TransactionLog};
///
/// let log = TransactionLog::<CacheWrite>::default();
/// std::thread::scope(|s| {
///     let guard = log.drain_and_lock().unwrap();
///     s.spawn(move || drop(guard));
/// });
/// ```
#[must_use = "the drain lock is released as soon as the guard is dropped"]
pub struct DrainGuard<'a, C: WriteCommand> {
    log: &'a TransactionLog<C>,
    epoch: u64,
    entries: Vec<LogEntry<C>>,
    released: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl<'a, C: WriteCommand> DrainGuard<'a, C> {
    pub(super) fn new(log: &'a TransactionLog<C>, epoch: u64, entries: Vec<LogEntry<C>>) -> Self {
        Self {
            log,
            epoch,
            entries,
            released: false,
            _thread_bound: PhantomData,
        }
    }

    /// Entries taken when the lock was acquired, in append order.
    pub fn entries(&self) -> &[LogEntry<C>] {
        &self.entries
    }

    /// Move the entries out, keeping the lock.
    pub fn take_entries(&mut self) -> Vec<LogEntry<C>> {
        std::mem::take(&mut self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release the drain lock and disable logging.
    ///
    /// Fails with [`LogError::NotDraining`] if the lock was already released
    /// or reset by someone else.
    pub fn unlock_and_disable(mut self) -> Result<(), LogError> {
        self.released = true;
        self.log.release(Some(self.epoch))
    }
}

impl<C: WriteCommand> Drop for DrainGuard<'_, C> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.log.release(Some(self.epoch)).is_ok() {
            warn!(
                epoch = self.epoch,
                unreplayed = self.entries.len(),
                "Drain guard dropped without unlock_and_disable"
            );
        }
    }
}

impl<C: WriteCommand> fmt::Debug for DrainGuard<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrainGuard")
            .field("epoch", &self.epoch)
            .field("entries", &self.entries.len())
            .finish()
    }
}
