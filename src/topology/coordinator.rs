//! Drives the transaction log and the executor through a topology change.

use super::locks::KeyLockTable;
use super::sequencer::{WriteSequencer, WriteTicket};
use crate::error::{Error, Result};
use crate::executor::{
    BlockingAwareExecutor, ReadinessGate, RecheckReport, RecheckTrigger, UnitHandle, UnitOfWork,
};
use crate::txlog::{LogEntry, LogState, TransactionLog};
use crate::types::{TopologyId, WriteCommand};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Applies a write to local storage.
pub trait WriteApplier<C>: Send + Sync + 'static {
    fn apply(&self, command: C) -> Result<()>;
}

/// Where [`RehashCoordinator::route_write`] sent a write.
#[derive(Debug)]
pub enum WriteRoute {
    /// Logged; it is applied when the log is replayed.
    Buffered,
    /// Submitted to the executor behind its key locks and any earlier write
    /// to the same keys.
    Submitted(UnitHandle),
}

impl WriteRoute {
    pub fn is_buffered(&self) -> bool {
        matches!(self, Self::Buffered)
    }
}

/// Outcome of [`RehashCoordinator::complete_rehash`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RehashSummary {
    /// Topology the rehash was started for.
    pub topology: Option<TopologyId>,
    /// Entries replayed by incremental drains.
    pub incremental_replayed: usize,
    /// Entries replayed under the drain lock.
    pub final_replayed: usize,
    /// Replayed entries handed to the executor because an earlier write to
    /// one of their keys was still pending. Included in the counts above.
    pub deferred: usize,
    /// The recheck issued once the topology was stable.
    pub recheck: RecheckReport,
    pub elapsed: Duration,
}

impl RehashSummary {
    pub fn total_replayed(&self) -> usize {
        self.incremental_replayed + self.final_replayed
    }
}

#[derive(Debug, Default)]
struct ReplayOutcome {
    applied: usize,
    deferred: usize,
    failed: Vec<u64>,
    first_error: Option<String>,
}

impl ReplayOutcome {
    fn replayed(&self) -> usize {
        self.applied + self.deferred
    }

    fn fail(&mut self, seq: u64, err: Error) {
        error!(seq, error = %err, "Failed to replay buffered write");
        self.failed.push(seq);
        self.first_error.get_or_insert_with(|| err.to_string());
    }

    fn absorb(&mut self, other: ReplayOutcome) {
        self.applied += other.applied;
        self.deferred += other.deferred;
        self.failed.extend(other.failed);
        if self.first_error.is_none() {
            self.first_error = other.first_error;
        }
    }

    fn into_error(self) -> Option<Error> {
        if self.failed.is_empty() {
            return None;
        }
        let replayed = self.replayed();
        Some(Error::Replay {
            failed: self.failed,
            replayed,
            message: self.first_error.unwrap_or_default(),
        })
    }
}

/// Coordinates writes while a rehash is in progress.
///
/// Between [`begin_rehash`](Self::begin_rehash) and
/// [`complete_rehash`](Self::complete_rehash) writes are buffered in the
/// log. Outside that window they run on the executor once their keys are
/// unlocked.
///
/// Writes to the same key reach the applier in the order they were routed.
/// A write parked behind a key lock before the rehash stays ahead of the
/// buffered writes to that key: replay hands those to the executor behind
/// it instead of applying them inline.
pub struct RehashCoordinator<C: WriteCommand, A: WriteApplier<C>> {
    /// Write buffer for the rehash window.
    log: Arc<TransactionLog<C>>,

    /// Runs writes that are not buffered.
    executor: Arc<BlockingAwareExecutor>,

    /// Key locks gating direct writes.
    locks: Arc<KeyLockTable>,

    /// Per-key order of writes not yet applied.
    sequencer: Arc<WriteSequencer>,

    /// Storage the writes land in.
    applier: Arc<A>,

    /// Backlog above which incremental drains continue.
    drain_threshold: usize,

    /// Topology being installed, if any.
    topology: Mutex<Option<TopologyId>>,

    /// One replay at a time, so batches keep their log order.
    replay_lock: Mutex<()>,
}

impl<C: WriteCommand, A: WriteApplier<C>> RehashCoordinator<C, A> {
    /// Create a coordinator and register the executor as the recheck
    /// listener of the lock table and the write sequencer.
    pub fn new(
        log: Arc<TransactionLog<C>>,
        executor: Arc<BlockingAwareExecutor>,
        locks: Arc<KeyLockTable>,
        applier: Arc<A>,
    ) -> Self {
        let listener: Weak<dyn RecheckTrigger> = Arc::downgrade(&executor) as Weak<dyn RecheckTrigger>;
        locks.set_recheck_listener(listener.clone());
        let sequencer = Arc::new(WriteSequencer::new());
        sequencer.set_recheck_listener(listener);
        let drain_threshold = log.config().drain_threshold;
        Self {
            log,
            executor,
            locks,
            sequencer,
            applier,
            drain_threshold,
            topology: Mutex::new(None),
            replay_lock: Mutex::new(()),
        }
    }

    pub fn log(&self) -> &Arc<TransactionLog<C>> {
        &self.log
    }

    pub fn executor(&self) -> &Arc<BlockingAwareExecutor> {
        &self.executor
    }

    pub fn locks(&self) -> &Arc<KeyLockTable> {
        &self.locks
    }

    /// Writes submitted or deferred and not yet applied.
    pub fn outstanding_writes(&self) -> usize {
        self.sequencer.outstanding()
    }

    /// Topology of the rehash in progress.
    pub fn active_topology(&self) -> Option<TopologyId> {
        *self.topology.lock()
    }

    pub fn is_rehashing(&self) -> bool {
        self.log.state() != LogState::Disabled
    }

    /// Start buffering writes for a move to `topology_id`.
    pub fn begin_rehash(&self, topology_id: TopologyId) -> Result<()> {
        self.log.enable()?;
        let previous = self.topology.lock().replace(topology_id);
        info!(topology_id, ?previous, "Rehash started, writes are now logged");
        Ok(())
    }

    /// Buffer `command`, or submit it to the executor gated on its keys.
    ///
    /// A write arriving while the drain lock is held waits for the final
    /// replay to finish, even with [`DrainContention::FailFast`], so it can
    /// never overtake a buffered write.
    ///
    /// [`DrainContention::FailFast`]: crate::config::DrainContention::FailFast
    pub fn route_write(&self, command: C) -> Result<WriteRoute> {
        let mut command = command;
        loop {
            command = match self.log.try_log(command) {
                Ok(()) => return Ok(WriteRoute::Buffered),
                Err(command) => command,
            };
            match self.log.state() {
                LogState::Disabled => break,
                LogState::Draining => self.log.wait_while_draining()?,
                // A new rehash started; log it there.
                LogState::Enabled => {}
            }
        }

        let ticket = self.sequencer.enqueue(command.affected_keys());
        let handle = self.submit_in_turn(command, ticket, "write")?;
        debug!(unit = %handle.id(), "Write submitted to executor");
        Ok(WriteRoute::Submitted(handle))
    }

    /// Replay while the backlog exceeds the drain threshold.
    ///
    /// Returns the number of entries replayed. A failed entry does not stop
    /// the drain; failures are reported together once the backlog is below
    /// the threshold.
    pub fn drain_incremental(&self) -> Result<usize> {
        let outcome = self.drain_backlog();
        let replayed = outcome.replayed();
        match outcome.into_error() {
            Some(err) => Err(err),
            None => Ok(replayed),
        }
    }

    fn drain_backlog(&self) -> ReplayOutcome {
        let mut outcome = ReplayOutcome::default();
        while self.log.size() > self.drain_threshold {
            let batch = self.log.drain();
            if batch.is_empty() {
                break;
            }
            outcome.absorb(self.replay(batch));
        }
        if outcome.replayed() > 0 {
            debug!(
                replayed = outcome.replayed(),
                remaining = self.log.size(),
                "Incremental drain finished"
            );
        }
        outcome
    }

    /// Replay the backlog, take the drain lock, replay the rest and end
    /// logging. Parked units are rechecked once the log is disabled.
    ///
    /// Replay failures do not stop the rehash. Every other entry is still
    /// replayed, the lock is released, the topology is cleared and parked
    /// units are rechecked before [`Error::Replay`] reports the failures.
    #[tracing::instrument(skip(self))]
    pub fn complete_rehash(&self) -> Result<RehashSummary> {
        let started = Instant::now();
        let incremental = self.drain_backlog();

        let mut guard = self.log.drain_and_lock()?;
        let last = self.replay(guard.take_entries());
        let released = guard.unlock_and_disable();

        let topology = self.topology.lock().take();
        let recheck = self.executor.recheck_pending();
        released?;

        let summary = RehashSummary {
            topology,
            incremental_replayed: incremental.replayed(),
            final_replayed: last.replayed(),
            deferred: incremental.deferred + last.deferred,
            recheck,
            elapsed: started.elapsed(),
        };

        let mut outcome = incremental;
        outcome.absorb(last);
        if let Some(err) = outcome.into_error() {
            warn!(?topology, error = %err, "Rehash complete with replay failures");
            return Err(err);
        }

        info!(
            ?topology,
            replayed = summary.total_replayed(),
            deferred = summary.deferred,
            dispatched = recheck.dispatched,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Rehash complete"
        );
        Ok(summary)
    }

    /// Apply `entries` in log order. An entry whose keys are locked, or
    /// still owed to an earlier write, is handed to the executor behind it.
    fn replay(&self, entries: Vec<LogEntry<C>>) -> ReplayOutcome {
        let _replay = self.replay_lock.lock();
        let mut outcome = ReplayOutcome::default();
        for entry in entries {
            let seq = entry.seq();
            let ticket = self.sequencer.enqueue(entry.keys().to_vec());
            if ticket.is_next() && self.locks.is_unlocked(entry.keys()) {
                let applied = self.applier.apply(entry.into_command());
                ticket.complete();
                match applied {
                    Ok(()) => outcome.applied += 1,
                    Err(e) => outcome.fail(seq, e),
                }
                continue;
            }
            match self.submit_in_turn(entry.into_command(), ticket, "replay") {
                Ok(handle) => {
                    debug!(seq, unit = %handle.id(), "Replay deferred behind an earlier write");
                    outcome.deferred += 1;
                }
                Err(e) => outcome.fail(seq, e),
            }
        }
        outcome
    }

    /// Submit `command` gated on its turn and on its keys being unlocked.
    fn submit_in_turn(&self, command: C, ticket: WriteTicket, label: &str) -> Result<UnitHandle> {
        let turn = ticket.turn();
        let unlocked = self.locks.keys_unlocked_gate(ticket.keys().to_vec());
        let applier = Arc::clone(&self.applier);
        let unit = UnitOfWork::new(
            move || turn.is_ready() && unlocked.is_ready(),
            move || {
                if let Err(e) = applier.apply(command) {
                    error!(error = %e, "Failed to apply write");
                }
                ticket.complete();
            },
        )
        .with_label(label);
        self.executor.submit(unit)
    }
}

impl<C: WriteCommand, A: WriteApplier<C>> std::fmt::Debug for RehashCoordinator<C, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RehashCoordinator")
            .field("topology", &self.active_topology())
            .field("log", &self.log)
            .field("executor", &self.executor)
            .field("sequencer", &self.sequencer)
            .finish()
    }
}
