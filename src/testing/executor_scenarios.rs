//! End-to-end scenarios for the blocking-aware executor.
