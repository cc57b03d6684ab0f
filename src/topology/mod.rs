//! Topology change coordination.
//!
//! The [`RehashCoordinator`] ties the transaction log and the executor
//! together for the lifetime of a rehash. The [`KeyLockTable`] provides the
//! key locks that gate direct writes, and the [`WriteSequencer`] keeps writes
//! to the same key in routing order.

mod coordinator;
mod locks;
mod sequencer;

pub use coordinator::{RehashCoordinator, RehashSummary, WriteApplier, WriteRoute};
pub use locks::{KeyLockTable, KeysUnlocked, LockOwner};
pub use sequencer::{Turn, WriteSequencer, WriteTicket};
