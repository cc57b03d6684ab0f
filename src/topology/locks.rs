//! Per-key locks held by in-flight transactions.
//!
//! Releasing locks is one of the events that can open a readiness gate, so
//! the table notifies the executor after every release.

use crate::executor::{ReadinessGate, RecheckTrigger};
use crate::types::Key;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Identifies a lock holder, typically a transaction.
pub type LockOwner = u64;

/// Table of key locks.
///
/// Acquisition is all-or-nothing: either every requested key is granted or
/// none is. An owner may re-acquire keys it already holds.
pub struct KeyLockTable {
    /// Key to current holder.
    locks: DashMap<Key, LockOwner>,

    /// Holder to the keys it owns.
    owned: DashMap<LockOwner, Vec<Key>>,

    /// Serializes acquisitions so partial grants are never visible.
    acquire: Mutex<()>,

    /// Notified after locks are released.
    listener: RwLock<Option<Weak<dyn RecheckTrigger>>>,
}

impl KeyLockTable {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
            owned: DashMap::new(),
            acquire: Mutex::new(()),
            listener: RwLock::new(None),
        }
    }

    /// Register the executor to recheck when locks are released.
    pub fn set_recheck_listener(&self, listener: Weak<dyn RecheckTrigger>) {
        *self.listener.write() = Some(listener);
    }

    /// Try to lock every key in `keys` for `owner`.
    pub fn try_lock(&self, owner: LockOwner, keys: &[Key]) -> bool {
        let _acquire = self.acquire.lock();

        let conflict = keys.iter().any(|key| {
            self.locks
                .get(key)
                .map(|holder| *holder != owner)
                .unwrap_or(false)
        });
        if conflict {
            trace!(owner, keys = keys.len(), "Key lock contended");
            return false;
        }

        let mut held = self.owned.entry(owner).or_default();
        for key in keys {
            if self.locks.insert(key.clone(), owner).is_none() {
                held.push(key.clone());
            }
        }
        trace!(owner, held = held.len(), "Key locks acquired");
        true
    }

    /// Release every key held by `owner` and notify the listener.
    ///
    /// Returns the number of keys released.
    pub fn unlock_all(&self, owner: LockOwner) -> usize {
        let released = match self.owned.remove(&owner) {
            Some((_, keys)) => keys
                .iter()
                .filter(|key| self.locks.remove_if(*key, |_, holder| *holder == owner).is_some())
                .count(),
            None => 0,
        };

        if released > 0 {
            trace!(owner, released, "Key locks released");
            self.notify();
        }
        released
    }

    fn notify(&self) {
        let listener = self.listener.read().as_ref().and_then(Weak::upgrade);
        if let Some(listener) = listener {
            listener.trigger_recheck();
        }
    }

    /// True when none of `keys` is locked.
    pub fn is_unlocked(&self, keys: &[Key]) -> bool {
        keys.iter().all(|key| !self.locks.contains_key(key))
    }

    /// Current holder of `key`.
    pub fn holder(&self, key: &Key) -> Option<LockOwner> {
        self.locks.get(key).map(|holder| *holder)
    }

    /// Number of locked keys.
    pub fn locked_count(&self) -> usize {
        self.locks.len()
    }

    /// A gate that opens once none of `keys` is locked.
    pub fn keys_unlocked_gate(self: &Arc<Self>, keys: Vec<Key>) -> KeysUnlocked {
        KeysUnlocked {
            table: Arc::clone(self),
            keys,
        }
    }
}

impl Default for KeyLockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KeyLockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLockTable")
            .field("locked", &self.locks.len())
            .field("owners", &self.owned.len())
            .finish()
    }
}

/// Readiness gate over a set of keys. See [`KeyLockTable::keys_unlocked_gate`].
#[derive(Debug, Clone)]
pub struct KeysUnlocked {
    table: Arc<KeyLockTable>,
    keys: Vec<Key>,
}

impl KeysUnlocked {
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }
}

impl ReadinessGate for KeysUnlocked {
    fn is_ready(&self) -> bool {
        self.table.is_unlocked(&self.keys)
    }
}
