//! Core types shared by the executor, the transaction log and the coordinator.

use bytes::Bytes;
use std::fmt;

/// A cache key. Cheap to clone.
pub type Key = Bytes;

/// Identifier of a cluster topology (bumped on every membership change).
pub type TopologyId = u64;

/// Identity of a unit of work. Used for logging only, never for ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(u64);

impl UnitId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

/// A mutating command that can be buffered in the transaction log.
///
/// Key extraction is supplied by the command itself; the log only records
/// the result alongside the command.
pub trait WriteCommand: Send + Sync + 'static {
    /// Keys written by this command. Empty for commands that touch the whole
    /// store (e.g. a clear); those are not ordered against keyed writes.
    fn affected_keys(&self) -> Vec<Key>;
}

/// Write commands issued against the grid.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheWrite {
    /// Insert or update a key-value pair.
    Put { key: Key, value: Bytes },

    /// Insert or update several pairs at once.
    PutAll { entries: Vec<(Key, Bytes)> },

    /// Replace the value only if the key is present.
    Replace { key: Key, value: Bytes },

    /// Delete a key.
    Remove { key: Key },

    /// Clear all entries.
    Clear,
}

impl CacheWrite {
    /// Create a Put command.
    pub fn put(key: impl Into<Key>, value: impl Into<Bytes>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Create a Remove command.
    pub fn remove(key: impl Into<Key>) -> Self {
        Self::Remove { key: key.into() }
    }
}

impl WriteCommand for CacheWrite {
    fn affected_keys(&self) -> Vec<Key> {
        match self {
            Self::Put { key, .. } | Self::Replace { key, .. } | Self::Remove { key } => {
                vec![key.clone()]
            }
            Self::PutAll { entries } => entries.iter().map(|(k, _)| k.clone()).collect(),
            Self::Clear => Vec::new(),
        }
    }
}
