//! End-to-end scenarios for the transaction log.

#[cfg(test)]
mod tests {
    use crate::config::{DrainContention, LogConfig};
    use crate::txlog::{LogEntry, LogState, TransactionLog};
    use crate::types::CacheWrite;
    use bytes::Bytes;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use test_log::test;

    fn put(i: usize) -> CacheWrite {
        CacheWrite::put(format!("key-{i}"), format!("value-{i}"))
    }

    fn key(entry: &LogEntry<CacheWrite>) -> Bytes {
        entry.keys()[0].clone()
    }

    // ========================================================================
    // Enable, incremental drain, final drain under lock, disable
    // ========================================================================
    #[test]
    fn drain_then_lock_then_disable() {
        let log = TransactionLog::<CacheWrite>::default();
        assert!(!log.log_if_needed(put(0)), "refused before enable");

        log.enable().unwrap();
        for i in 1..=5 {
            assert!(log.log_if_needed(put(i)));
        }
        assert_eq!(log.size(), 5);

        let drained: Vec<CacheWrite> = log.drain().into_iter().map(LogEntry::into_command).collect();
        assert_eq!(drained, (1..=5).map(put).collect::<Vec<_>>());
        assert_eq!(log.size(), 0);

        assert!(log.log_if_needed(put(6)));
        let guard = log.drain_and_lock().unwrap();
        assert_eq!(guard.len(), 1);
        assert_eq!(guard.entries()[0].command(), &put(6));

        assert!(!log.log_if_needed(put(7)), "refused while drain lock is held");
        guard.unlock_and_disable().unwrap();

        assert!(!log.is_enabled());
        assert_eq!(log.size(), 0);
        assert!(!log.log_if_needed(put(8)), "refused after disable");

        let metrics = log.metrics();
        assert_eq!(metrics.appended, 6);
        assert_eq!(metrics.drained, 6);
        assert_eq!(metrics.refused, 3);
    }

    // ========================================================================
    // Drains racing appenders: nothing is lost or duplicated
    // ========================================================================
    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn concurrent_drains_cover_every_append() {
        const WRITERS: usize = 4;
        const PER_WRITER: usize = 250;

        let log = Arc::new(TransactionLog::<CacheWrite>::default());
        log.enable().unwrap();

        let mut writers = Vec::new();
        for w in 0..WRITERS {
            let log = Arc::clone(&log);
            writers.push(tokio::task::spawn_blocking(move || {
                for i in 0..PER_WRITER {
                    assert!(log.log_if_needed(put(w * PER_WRITER + i)));
                }
            }));
        }

        let mut seen = Vec::new();
        while writers.iter().any(|w| !w.is_finished()) {
            seen.extend(log.drain().iter().map(key));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for writer in writers {
            writer.await.unwrap();
        }

        let guard = log.drain_and_lock().unwrap();
        seen.extend(guard.entries().iter().map(key));
        guard.unlock_and_disable().unwrap();

        let unique: HashSet<Bytes> = seen.iter().cloned().collect();
        assert_eq!(seen.len(), WRITERS * PER_WRITER);
        assert_eq!(unique.len(), WRITERS * PER_WRITER);
        assert_eq!(log.size(), 0);
    }

    // ========================================================================
    // Appenders blocked by the drain lock observe the disabled log
    // ========================================================================
    #[test]
    fn blocked_appenders_see_disabled_log() {
        let log = Arc::new(TransactionLog::<CacheWrite>::default());
        log.enable().unwrap();
        let guard = log.drain_and_lock().unwrap();

        let finished = Arc::new(AtomicBool::new(false));
        let appenders: Vec<_> = (0..3)
            .map(|i| {
                let (log, finished) = (Arc::clone(&log), finished.clone());
                thread::spawn(move || {
                    let logged = log.log_if_needed(put(i));
                    finished.store(true, Ordering::SeqCst);
                    logged
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        assert!(!finished.load(Ordering::SeqCst));

        guard.unlock_and_disable().unwrap();
        for appender in appenders {
            assert!(!appender.join().unwrap());
        }
        assert_eq!(log.state(), LogState::Disabled);
        assert_eq!(log.size(), 0);
    }

    // ========================================================================
    // Fail-fast appenders never wait
    // ========================================================================
    #[test]
    fn fail_fast_appenders_refuse_while_draining() {
        let log = Arc::new(TransactionLog::<CacheWrite>::new(
            LogConfig::default().with_drain_contention(DrainContention::FailFast),
        ));
        log.enable().unwrap();
        let guard = log.drain_and_lock().unwrap();

        let other = Arc::clone(&log);
        assert!(!thread::spawn(move || other.log_if_needed(put(1))).join().unwrap());

        drop(guard);
        log.enable().unwrap();
        assert!(log.log_if_needed(put(2)));
        assert_eq!(log.size(), 1);
    }
}
