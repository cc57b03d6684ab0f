//! Monotonic time source used for instrumentation.

use std::time::Instant;

/// Source of monotonic timestamps. Only metrics depend on it, never
/// correctness.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Instant;
}

/// The system monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl TimeSource for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
