//! Per-key write ordering.
//!
//! Every write that reaches storage outside the log's own replay path takes a
//! ticket for the keys it touches. A ticket is runnable only while it is the
//! oldest live ticket on each of those keys, so two writes to the same key
//! are applied in the order their tickets were issued even when one of them
//! sits parked behind a key lock.

use crate::executor::RecheckTrigger;
use crate::types::Key;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tracing::trace;

#[derive(Default)]
struct Queues {
    by_key: HashMap<Key, VecDeque<u64>>,
    next_ticket: u64,
    live: usize,
}

/// Issues [`WriteTicket`]s and tracks which one is next on every key.
pub struct WriteSequencer {
    queues: Mutex<Queues>,

    /// Notified when a completed ticket leaves a successor waiting.
    listener: RwLock<Option<Weak<dyn RecheckTrigger>>>,
}

impl WriteSequencer {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            listener: RwLock::new(None),
        }
    }

    pub fn set_recheck_listener(&self, listener: Weak<dyn RecheckTrigger>) {
        *self.listener.write() = Some(listener);
    }

    /// Queue a write on `keys`. The ticket goes behind every live ticket
    /// sharing a key with it.
    pub fn enqueue(self: &Arc<Self>, keys: Vec<Key>) -> WriteTicket {
        let id = {
            let mut queues = self.queues.lock();
            let id = queues.next_ticket;
            queues.next_ticket += 1;
            queues.live += 1;
            for key in &keys {
                queues.by_key.entry(key.clone()).or_default().push_back(id);
            }
            id
        };
        trace!(ticket = id, keys = keys.len(), "Write ticket issued");
        WriteTicket {
            sequencer: Arc::clone(self),
            id,
            keys,
            retired: false,
        }
    }

    /// True when no live ticket touches any of `keys`.
    pub fn is_idle(&self, keys: &[Key]) -> bool {
        let queues = self.queues.lock();
        keys.iter().all(|key| !queues.by_key.contains_key(key))
    }

    /// Number of tickets issued and not yet retired.
    pub fn outstanding(&self) -> usize {
        self.queues.lock().live
    }

    fn is_next(&self, id: u64, keys: &[Key]) -> bool {
        let queues = self.queues.lock();
        keys.iter()
            .all(|key| queues.by_key.get(key).and_then(|q| q.front()) == Some(&id))
    }

    /// Remove `id` from its keys. Returns true when another ticket still
    /// waits on one of them.
    fn retire(&self, id: u64, keys: &[Key]) -> bool {
        let mut queues = self.queues.lock();
        queues.live -= 1;
        let mut waiting = false;
        for key in keys {
            let Some(queue) = queues.by_key.get_mut(key) else {
                continue;
            };
            queue.retain(|t| *t != id);
            if queue.is_empty() {
                queues.by_key.remove(key);
            } else {
                waiting = true;
            }
        }
        waiting
    }

    fn notify(&self) {
        let listener = self.listener.read().as_ref().and_then(Weak::upgrade);
        if let Some(listener) = listener {
            listener.trigger_recheck();
        }
    }
}

impl Default for WriteSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WriteSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queues = self.queues.lock();
        f.debug_struct("WriteSequencer")
            .field("live", &queues.live)
            .field("keys", &queues.by_key.len())
            .finish()
    }
}

/// A place in line for one write.
///
/// [`complete`](Self::complete) retires it and rechecks the executor when a
/// successor is waiting. Dropping it retires it without a recheck, which is
/// what happens to writes cancelled at shutdown.
pub struct WriteTicket {
    sequencer: Arc<WriteSequencer>,
    id: u64,
    keys: Vec<Key>,
    retired: bool,
}

impl WriteTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// True while this ticket heads the line on every one of its keys.
    pub fn is_next(&self) -> bool {
        self.sequencer.is_next(self.id, &self.keys)
    }

    /// A gate-side view of this ticket.
    pub fn turn(&self) -> Turn {
        Turn {
            sequencer: Arc::clone(&self.sequencer),
            id: self.id,
            keys: self.keys.clone(),
        }
    }

    /// Retire the ticket after its write was applied.
    pub fn complete(mut self) {
        self.retired = true;
        if self.sequencer.retire(self.id, &self.keys) {
            self.sequencer.notify();
        }
    }
}

impl Drop for WriteTicket {
    fn drop(&mut self) {
        // Must not recheck here: units are dropped with the executor's scan
        // lock held.
        if !self.retired {
            self.sequencer.retire(self.id, &self.keys);
        }
    }
}

impl std::fmt::Debug for WriteTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTicket")
            .field("id", &self.id)
            .field("keys", &self.keys.len())
            .finish()
    }
}

/// Read-only handle on a ticket, for use inside a readiness gate.
#[derive(Clone)]
pub struct Turn {
    sequencer: Arc<WriteSequencer>,
    id: u64,
    keys: Vec<Key>,
}

impl Turn {
    pub fn is_ready(&self) -> bool {
        self.sequencer.is_next(self.id, &self.keys)
    }
}

impl std::fmt::Debug for Turn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Turn").field("id", &self.id).finish()
    }
}
