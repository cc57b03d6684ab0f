//! The transaction log and its state machine.

use super::guard::DrainGuard;
use crate::config::{DrainContention, LogConfig};
use crate::error::LogError;
use crate::metrics::{LogMetrics, LogMetricsSnapshot};
use crate::types::{Key, WriteCommand};
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use tracing::{debug, info, warn};

/// Logging state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    /// Writes are applied directly; nothing is logged.
    Disabled,
    /// Writes are buffered.
    Enabled,
    /// A `drain_and_lock` holder owns the log; nothing is appended until it
    /// releases.
    Draining,
}

impl fmt::Display for LogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Enabled => write!(f, "enabled"),
            Self::Draining => write!(f, "draining"),
        }
    }
}

/// A buffered write: the command and the keys it targets.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry<C> {
    seq: u64,
    keys: Vec<Key>,
    command: C,
}

impl<C> LogEntry<C> {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn command(&self) -> &C {
        &self.command
    }

    pub fn into_command(self) -> C {
        self.command
    }
}

#[derive(Debug, Clone, Copy)]
struct DrainHolder {
    epoch: u64,
    thread: ThreadId,
}

/// Write-ahead buffer used while data ownership is moving.
///
/// Appends take the state lock shared and push into a lock-free queue, so
/// appenders never exclude each other. `drain_and_lock` takes the state lock
/// exclusively, which waits only for appends already in flight.
///
/// Typical use by a rehash coordinator:
///
/// ```rust
/// use rehash_core::{CacheWrite, TransactionLog};
///
/// let log = TransactionLog::<CacheWrite>::default();
/// log.enable().unwrap();
/// assert!(log.log_if_needed(CacheWrite::put("k", "v")));
///
/// while log.size() > 100 {
///     for entry in log.drain() {
///         // re-apply entry.command() against the new owners
///         let _ = entry;
///     }
/// }
///
/// let guard = log.drain_and_lock().unwrap();
/// for entry in guard.entries() {
///     let _ = entry; // re-apply before any new write is admitted
/// }
/// guard.unlock_and_disable().unwrap();
/// assert!(!log.is_enabled());
/// ```
pub struct TransactionLog<C: WriteCommand> {
    state: RwLock<LogState>,
    entries: SegQueue<LogEntry<C>>,
    next_seq: AtomicU64,
    drain_epoch: AtomicU64,
    holder: Mutex<Option<DrainHolder>>,
    // Held while leaving `Draining`, so blocked appenders never miss the wakeup.
    release_lock: Mutex<()>,
    released: Condvar,
    config: LogConfig,
    metrics: LogMetrics,
}

impl<C: WriteCommand> TransactionLog<C> {
    pub fn new(config: LogConfig) -> Self {
        Self {
            state: RwLock::new(LogState::Disabled),
            entries: SegQueue::new(),
            next_seq: AtomicU64::new(0),
            drain_epoch: AtomicU64::new(0),
            holder: Mutex::new(None),
            release_lock: Mutex::new(()),
            released: Condvar::new(),
            config,
            metrics: LogMetrics::new(),
        }
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Start buffering writes. No-op if already enabled.
    pub fn enable(&self) -> Result<(), LogError> {
        let mut state = self.state.write();
        match *state {
            LogState::Disabled => {
                *state = LogState::Enabled;
                info!("Transaction logging enabled");
                Ok(())
            }
            LogState::Enabled => Ok(()),
            LogState::Draining => Err(LogError::DrainInProgress),
        }
    }

    /// True only while writes are being buffered.
    pub fn is_enabled(&self) -> bool {
        *self.state.read() == LogState::Enabled
    }

    pub fn state(&self) -> LogState {
        *self.state.read()
    }

    /// Approximate number of buffered entries.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Buffer `command` if logging is enabled.
    ///
    /// Returns true when the command was logged, in which case the caller
    /// must not apply it. Returns false when disabled or draining.
    pub fn log_if_needed(&self, command: C) -> bool {
        self.try_log(command).is_ok()
    }

    /// Like [`log_if_needed`](Self::log_if_needed), but hands a refused
    /// command back so the caller can apply it.
    pub fn try_log(&self, command: C) -> Result<(), C> {
        loop {
            {
                let state = self.state.read();
                match *state {
                    LogState::Enabled => {
                        self.append(command);
                        return Ok(());
                    }
                    LogState::Disabled => {
                        self.metrics.refused.inc();
                        return Err(command);
                    }
                    LogState::Draining => {}
                }
            }
            if !self.wait_for_release() {
                self.metrics.refused.inc();
                return Err(command);
            }
        }
    }

    /// Buffer every command if logging is enabled; all or nothing.
    pub fn log_all_if_needed<I>(&self, commands: I) -> bool
    where
        I: IntoIterator<Item = C>,
    {
        let commands: Vec<C> = commands.into_iter().collect();
        loop {
            {
                let state = self.state.read();
                match *state {
                    LogState::Enabled => {
                        for command in commands {
                            self.append(command);
                        }
                        return true;
                    }
                    LogState::Disabled => {
                        self.metrics.refused.inc();
                        return false;
                    }
                    LogState::Draining => {}
                }
            }
            if !self.wait_for_release() {
                self.metrics.refused.inc();
                return false;
            }
        }
    }

    fn append(&self, command: C) {
        let keys = command.affected_keys();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.entries.push(LogEntry { seq, keys, command });
        self.metrics.appended.inc();
    }

    /// Called by an appender that found the log draining. True means the
    /// drain lock was released and the state must be read again.
    fn wait_for_release(&self) -> bool {
        if self.is_drain_holder() {
            self.metrics.protocol_violations.inc();
            warn!("Write logged by the thread holding the drain lock; refusing");
            return false;
        }
        match self.config.drain_contention {
            DrainContention::FailFast => false,
            DrainContention::Block => {
                self.block_until_released();
                true
            }
        }
    }

    /// Block until no drain lock is held, whatever the contention setting.
    ///
    /// Fails with [`LogError::DrainInProgress`] when called by the thread
    /// holding the lock, which would otherwise wait on itself.
    pub fn wait_while_draining(&self) -> Result<(), LogError> {
        if self.is_drain_holder() {
            self.metrics.protocol_violations.inc();
            warn!("Drain lock holder waited for its own release; refusing");
            return Err(LogError::DrainInProgress);
        }
        self.block_until_released();
        Ok(())
    }

    fn block_until_released(&self) {
        let mut release = self.release_lock.lock();
        while *self.state.read() == LogState::Draining {
            self.released.wait(&mut release);
        }
    }

    // The holder is the acquiring thread; `DrainGuard` is `!Send` so it
    // cannot be released from anywhere else.
    fn is_drain_holder(&self) -> bool {
        self.holder
            .lock()
            .map(|h| h.thread == thread::current().id())
            .unwrap_or(false)
    }

    /// Remove and return every entry currently buffered, in append order.
    ///
    /// Appends may continue concurrently; whatever lands after the snapshot
    /// is left for the next drain.
    pub fn drain(&self) -> Vec<LogEntry<C>> {
        let available = self.entries.len();
        let mut drained = Vec::with_capacity(available);
        for _ in 0..available {
            match self.entries.pop() {
                Some(entry) => drained.push(entry),
                None => break,
            }
        }
        self.metrics.drained.inc_by(drained.len() as u64);
        debug!(entries = drained.len(), remaining = self.size(), "Drained transaction log");
        drained
    }

    /// Take the drain lock and every remaining entry.
    ///
    /// No write is appended until the returned guard is released, either
    /// through [`DrainGuard::unlock_and_disable`] or by dropping it. The
    /// caller re-applies the entries while holding the guard.
    pub fn drain_and_lock(&self) -> Result<DrainGuard<'_, C>, LogError> {
        let mut state = self.state.write();
        if *state == LogState::Draining {
            return Err(LogError::DrainInProgress);
        }
        let previous = *state;
        *state = LogState::Draining;

        let epoch = self.drain_epoch.fetch_add(1, Ordering::Relaxed) + 1;
        *self.holder.lock() = Some(DrainHolder {
            epoch,
            thread: thread::current().id(),
        });

        let entries: Vec<LogEntry<C>> = std::iter::from_fn(|| self.entries.pop()).collect();
        drop(state);

        self.metrics.drained.inc_by(entries.len() as u64);
        info!(entries = entries.len(), %previous, "Drain lock acquired");
        Ok(DrainGuard::new(self, epoch, entries))
    }

    /// Release the drain lock and disable logging.
    ///
    /// Fails with [`LogError::NotDraining`] when no drain lock is held.
    pub fn unlock_and_disable(&self) -> Result<(), LogError> {
        self.release(None).inspect_err(|_| {
            self.metrics.protocol_violations.inc();
            warn!("unlock_and_disable called without a held drain lock");
        })
    }

    /// Release the lock taken by drain `epoch`, or whichever is held when
    /// `epoch` is None.
    pub(super) fn release(&self, epoch: Option<u64>) -> Result<(), LogError> {
        {
            let _release = self.release_lock.lock();
            let mut state = self.state.write();
            let mut holder = self.holder.lock();
            let owned = match (*holder, epoch) {
                (Some(h), Some(e)) => h.epoch == e,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if *state != LogState::Draining || !owned {
                return Err(LogError::NotDraining);
            }
            *state = LogState::Disabled;
            *holder = None;
        }
        self.released.notify_all();
        info!("Drain lock released, transaction logging disabled");
        Ok(())
    }

    /// Operator recovery: discard buffered entries, drop any drain lock and
    /// disable logging. Returns the number of discarded entries.
    pub fn force_reset(&self) -> usize {
        let discarded = {
            let _release = self.release_lock.lock();
            let mut state = self.state.write();
            let previous = *state;
            *state = LogState::Disabled;
            *self.holder.lock() = None;
            let discarded = std::iter::from_fn(|| self.entries.pop()).count();
            warn!(%previous, discarded, "Transaction log force-reset");
            discarded
        };
        self.released.notify_all();
        discarded
    }

    pub fn metrics(&self) -> LogMetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl<C: WriteCommand> Default for TransactionLog<C> {
    fn default() -> Self {
        Self::new(LogConfig::default())
    }
}

impl<C: WriteCommand> fmt::Debug for TransactionLog<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionLog")
            .field("state", &self.state())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CacheWrite;
    use bytes::Bytes;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    fn put(i: usize) -> CacheWrite {
        CacheWrite::put(format!("key-{i}"), format!("value-{i}"))
    }

    fn key_of(entry: &LogEntry<CacheWrite>) -> Bytes {
        entry.keys()[0].clone()
    }

    #[test]
    fn test_disabled_log_refuses() {
        let log = TransactionLog::<CacheWrite>::default();
        assert_eq!(log.state(), LogState::Disabled);
        assert!(!log.log_if_needed(put(0)));
        assert!(!log.log_all_if_needed(vec![put(1), put(2)]));
        assert_eq!(log.size(), 0);
        assert_eq!(log.metrics().refused, 2);
    }

    #[test]
    fn test_enable_is_idempotent() {
        let log = TransactionLog::<CacheWrite>::default();
        log.enable().unwrap();
        log.enable().unwrap();
        assert!(log.is_enabled());
    }

    #[test]
    fn test_entries_record_keys() {
        let log = TransactionLog::<CacheWrite>::default();
        log.enable().unwrap();
        assert!(log.log_all_if_needed(vec![
            CacheWrite::PutAll {
                entries: vec![
                    (Bytes::from_static(b"a"), Bytes::from_static(b"1")),
                    (Bytes::from_static(b"b"), Bytes::from_static(b"2")),
                ],
            },
            CacheWrite::remove("c"),
        ]));

        let drained = log.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].keys().len(), 2);
        assert_eq!(drained[1].keys(), &[Bytes::from_static(b"c")]);
        assert!(drained[0].seq() < drained[1].seq());
    }

    #[test]
    fn test_drain_and_lock_then_unlock() {
        let log = TransactionLog::<CacheWrite>::default();
        log.enable().unwrap();
        for i in 0..3 {
            assert!(log.log_if_needed(put(i)));
        }

        let guard = log.drain_and_lock().unwrap();
        assert_eq!(guard.len(), 3);
        assert_eq!(log.state(), LogState::Draining);
        assert!(!log.is_enabled());
        guard.unlock_and_disable().unwrap();

        assert_eq!(log.size(), 0);
        assert!(!log.is_enabled());
        assert_eq!(log.state(), LogState::Disabled);
        assert!(!log.log_if_needed(put(9)));
    }

    #[test]
    fn test_guard_drop_releases_lock() {
        let log = TransactionLog::<CacheWrite>::default();
        log.enable().unwrap();
        {
            let _guard = log.drain_and_lock().unwrap();
            assert_eq!(log.state(), LogState::Draining);
        }
        assert_eq!(log.state(), LogState::Disabled);
        log.enable().unwrap();
        assert!(log.log_if_needed(put(1)));
    }

    #[test]
    fn test_second_drain_and_lock_fails() {
        let log = TransactionLog::<CacheWrite>::default();
        let guard = log.drain_and_lock().unwrap();
        assert_eq!(log.drain_and_lock().err(), Some(LogError::DrainInProgress));
        assert_eq!(log.enable(), Err(LogError::DrainInProgress));
        drop(guard);
    }

    #[test]
    fn test_unlock_without_lock_is_violation() {
        let log = TransactionLog::<CacheWrite>::default();
        assert_eq!(log.unlock_and_disable(), Err(LogError::NotDraining));
        assert_eq!(log.metrics().protocol_violations, 1);
    }

    #[test]
    fn test_stale_guard_does_not_release_newer_drain() {
        let log = TransactionLog::<CacheWrite>::default();
        let first = log.drain_and_lock().unwrap();
        log.unlock_and_disable().unwrap();

        let second = log.drain_and_lock().unwrap();
        assert_eq!(first.unlock_and_disable(), Err(LogError::NotDraining));
        assert_eq!(log.state(), LogState::Draining);
        second.unlock_and_disable().unwrap();
        assert_eq!(log.state(), LogState::Disabled);
    }

    #[test]
    fn test_holder_append_does_not_deadlock() {
        let log = TransactionLog::<CacheWrite>::default();
        log.enable().unwrap();
        let guard = log.drain_and_lock().unwrap();

        // Block mode, same thread: refused instead of waiting on itself.
        assert!(!log.log_if_needed(put(1)));
        assert_eq!(log.metrics().protocol_violations, 1);
        guard.unlock_and_disable().unwrap();
    }

    #[test]
    fn test_fail_fast_appender_returns_immediately() {
        let log = Arc::new(TransactionLog::<CacheWrite>::new(
            LogConfig::default().with_drain_contention(DrainContention::FailFast),
        ));
        log.enable().unwrap();
        let guard = log.drain_and_lock().unwrap();

        let other = Arc::clone(&log);
        let logged = thread::spawn(move || other.log_if_needed(put(1))).join().unwrap();
        assert!(!logged);
        assert_eq!(log.metrics().protocol_violations, 0);
        drop(guard);
    }

    #[test]
    fn test_blocking_appender_waits_for_release() {
        let log = Arc::new(TransactionLog::<CacheWrite>::default());
        log.enable().unwrap();
        let guard = log.drain_and_lock().unwrap();

        let returned = Arc::new(AtomicBool::new(false));
        let (other, flag) = (Arc::clone(&log), returned.clone());
        let appender = thread::spawn(move || {
            let logged = other.log_if_needed(put(1));
            flag.store(true, Ordering::SeqCst);
            logged
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!returned.load(Ordering::SeqCst));

        guard.unlock_and_disable().unwrap();
        assert!(!appender.join().unwrap());
        assert!(returned.load(Ordering::SeqCst));
        assert_eq!(log.size(), 0);
    }

    #[test]
    fn test_wait_while_draining_blocks_even_when_fail_fast() {
        let log = Arc::new(TransactionLog::<CacheWrite>::new(
            LogConfig::default().with_drain_contention(DrainContention::FailFast),
        ));
        log.enable().unwrap();
        let guard = log.drain_and_lock().unwrap();
        assert_eq!(log.wait_while_draining(), Err(LogError::DrainInProgress));
        assert_eq!(log.metrics().protocol_violations, 1);

        let returned = Arc::new(AtomicBool::new(false));
        let (other, flag) = (Arc::clone(&log), returned.clone());
        let waiter = thread::spawn(move || {
            let waited = other.wait_while_draining();
            flag.store(true, Ordering::SeqCst);
            (waited, other.state())
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!returned.load(Ordering::SeqCst));

        guard.unlock_and_disable().unwrap();
        assert_eq!(waiter.join().unwrap(), (Ok(()), LogState::Disabled));
    }

    #[test]
    fn test_concurrent_appends_and_drains_lose_nothing() {
        const WRITERS: usize = 4;
        const PER_WRITER: usize = 500;

        let log = TransactionLog::<CacheWrite>::default();
        log.enable().unwrap();
        let writers_done = AtomicBool::new(false);
        let mut seen: Vec<Bytes> = Vec::new();

        thread::scope(|s| {
            let mut writers = Vec::new();
            for w in 0..WRITERS {
                let log = &log;
                writers.push(s.spawn(move || {
                    for i in 0..PER_WRITER {
                        assert!(log.log_if_needed(put(w * PER_WRITER + i)));
                    }
                }));
            }

            let drainer = s.spawn(|| {
                let mut drained = Vec::new();
                while !writers_done.load(Ordering::SeqCst) {
                    drained.extend(log.drain().iter().map(key_of));
                    thread::yield_now();
                }
                drained
            });

            for writer in writers {
                writer.join().unwrap();
            }
            writers_done.store(true, Ordering::SeqCst);
            seen.extend(drainer.join().unwrap());
        });

        let guard = log.drain_and_lock().unwrap();
        seen.extend(guard.entries().iter().map(key_of));
        guard.unlock_and_disable().unwrap();

        let unique: HashSet<Bytes> = seen.iter().cloned().collect();
        assert_eq!(seen.len(), WRITERS * PER_WRITER);
        assert_eq!(unique.len(), WRITERS * PER_WRITER);
    }

    #[test]
    fn test_force_reset_recovers_leaked_guard() {
        let log = TransactionLog::<CacheWrite>::default();
        log.enable().unwrap();
        log.log_if_needed(put(1));
        std::mem::forget(log.drain_and_lock().unwrap());
        assert_eq!(log.state(), LogState::Draining);

        assert_eq!(log.force_reset(), 0);
        assert_eq!(log.state(), LogState::Disabled);
        log.enable().unwrap();
        assert!(log.log_if_needed(put(2)));
    }
}
