//! Transaction log for writes issued while data ownership is changing.
//!
//! While a rehash moves keys between nodes, a write applied against the old
//! owners may be lost. Writes are instead logged here and replayed against
//! the new owners once the move is done:
//!
//! 1. `enable()` when the rehash starts.
//! 2. Writers call `log_if_needed`; a true result means "buffered, do not
//!    apply".
//! 3. The coordinator drains incrementally while the backlog is large.
//! 4. `drain_and_lock()` takes the final batch and blocks new appends.
//! 5. After replaying it, the guard's `unlock_and_disable()` ends logging.

mod guard;
mod log;

pub use guard::DrainGuard;
pub use log::{LogEntry, LogState, TransactionLog};
