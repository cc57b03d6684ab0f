//! Destination for readiness faults.

use crate::error::ReadinessFault;
use parking_lot::Mutex;
use tracing::error;

/// Receives units whose readiness gate panicked.
///
/// Such units are already removed and marked faulted when the sink is called;
/// the sink only reports.
pub trait ErrorSink: Send + Sync {
    fn readiness_fault(&self, fault: ReadinessFault);
}

/// Logs faults through `tracing`.
#[derive(Debug, Default)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn readiness_fault(&self, fault: ReadinessFault) {
        error!(
            unit = %fault.unit,
            label = fault.label.as_deref().unwrap_or("-"),
            "Readiness check panicked, unit dropped: {}",
            fault.message
        );
    }
}

/// Keeps every fault in memory.
#[derive(Debug, Default)]
pub struct CollectingErrorSink {
    faults: Mutex<Vec<ReadinessFault>>,
}

impl CollectingErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> Vec<ReadinessFault> {
        self.faults.lock().clone()
    }
}

impl ErrorSink for CollectingErrorSink {
    fn readiness_fault(&self, fault: ReadinessFault) {
        self.faults.lock().push(fault);
    }
}
