//! Rehash scenarios: coordinator, transaction log, key locks and executor
//! working together.

#[cfg(test)]
mod tests {
    use crate::config::{CoreConfig, ExecutorConfig, LogConfig};
    use crate::error::Result;
    use crate::executor::{BlockingAwareExecutor, UnitOfWork, UnitState};
    use crate::testing::utils::wait_for;
    use crate::testing::RunRecorder;
    use crate::topology::{KeyLockTable, RehashCoordinator, WriteApplier, WriteRoute};
    use crate::txlog::TransactionLog;
    use crate::types::{CacheWrite, Key};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use test_log::test;

    /// Storage recording the order writes were applied in.
    #[derive(Default)]
    struct Store {
        data: Mutex<HashMap<Key, Bytes>>,
        order: Mutex<Vec<Key>>,
    }

    impl WriteApplier<CacheWrite> for Store {
        fn apply(&self, command: CacheWrite) -> Result<()> {
            if let CacheWrite::Put { key, value, .. } = command {
                self.order.lock().push(key.clone());
                self.data.lock().insert(key, value);
            }
            Ok(())
        }
    }

    impl Store {
        fn get(&self, key: &'static str) -> Option<Bytes> {
            self.data.lock().get(&Bytes::from_static(key.as_bytes())).cloned()
        }
    }

    fn node(store: Arc<Store>, config: CoreConfig) -> RehashCoordinator<CacheWrite, Store> {
        config.validate().unwrap();
        let executor = BlockingAwareExecutor::new(config.executor).unwrap();
        RehashCoordinator::new(
            Arc::new(TransactionLog::new(config.log)),
            Arc::new(executor),
            Arc::new(KeyLockTable::new()),
            store,
        )
    }

    fn config(drain_threshold: usize) -> CoreConfig {
        CoreConfig::default()
            .with_executor_config(ExecutorConfig::default().with_worker_threads(2))
            .with_log_config(LogConfig::default().with_drain_threshold(drain_threshold))
    }

    // ========================================================================
    // Writes during a rehash are replayed in order, later writes go direct
    // ========================================================================
    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn rehash_replays_buffered_writes() {
        let store = Arc::new(Store::default());
        let coord = node(store.clone(), config(3));

        coord.begin_rehash(2).unwrap();
        for i in 0..10 {
            let route = coord
                .route_write(CacheWrite::put(format!("k{i}"), format!("v{i}")))
                .unwrap();
            assert!(route.is_buffered());
        }
        assert!(store.order.lock().is_empty());

        // Backlog 10 > threshold 3: drained and replayed before the lock.
        assert_eq!(coord.drain_incremental().unwrap(), 10);
        coord.route_write(CacheWrite::put("k10", "v10")).unwrap();

        let summary = coord.complete_rehash().unwrap();
        assert_eq!(summary.topology, Some(2));
        assert_eq!(summary.final_replayed, 1);
        let expected: Vec<Key> = (0..=10).map(|i| Bytes::from(format!("k{i}"))).collect();
        assert_eq!(*store.order.lock(), expected);

        let WriteRoute::Submitted(handle) = coord.route_write(CacheWrite::put("after", "x")).unwrap() else {
            panic!("writes after the rehash go to the executor");
        };
        let done = wait_for(
            || handle.state() == UnitState::Completed,
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await;
        assert!(done);
        assert_eq!(store.get("after"), Some(Bytes::from_static(b"x")));
    }

    // ========================================================================
    // Direct writes wait for key locks; releasing them rechecks
    // ========================================================================
    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn lock_release_dispatches_parked_writes() {
        let store = Arc::new(Store::default());
        let coord = node(store.clone(), config(100));
        let hot = vec![Bytes::from_static(b"hot")];
        assert!(coord.locks().try_lock(1, &hot));

        let mut handles = Vec::new();
        for i in 0..5 {
            match coord.route_write(CacheWrite::put("hot", format!("v{i}"))).unwrap() {
                WriteRoute::Submitted(handle) => handles.push(handle),
                WriteRoute::Buffered => panic!("no rehash in progress"),
            }
        }
        coord.route_write(CacheWrite::put("cold", "c")).unwrap();

        let cold_done = wait_for(
            || store.get("cold").is_some(),
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await;
        assert!(cold_done, "unlocked key is written immediately");
        assert_eq!(coord.executor().pending_count(), 5);
        assert_eq!(store.get("hot"), None);

        coord.locks().unlock_all(1);
        let hot_done = wait_for(
            || handles.iter().all(|h| h.state() == UnitState::Completed),
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await;
        assert!(hot_done, "unlock_all should recheck the executor");
        assert_eq!(coord.executor().pending_count(), 0);
    }

    // ========================================================================
    // A write parked behind a transaction before the rehash keeps its place
    // ahead of writes buffered during it
    // ========================================================================
    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn parked_write_lands_before_buffered_write() {
        let store = Arc::new(Store::default());
        let coord = node(store.clone(), config(100));
        let k = vec![Bytes::from_static(b"k")];
        assert!(coord.locks().try_lock(1, &k));

        let WriteRoute::Submitted(parked) = coord.route_write(CacheWrite::put("k", "v1")).unwrap() else {
            panic!("no rehash in progress");
        };
        coord.begin_rehash(2).unwrap();
        assert!(coord.route_write(CacheWrite::put("k", "v2")).unwrap().is_buffered());
        // Unrelated buffered writes still replay inline.
        assert!(coord.route_write(CacheWrite::put("other", "o")).unwrap().is_buffered());

        let summary = coord.complete_rehash().unwrap();
        assert_eq!(summary.final_replayed, 2);
        assert_eq!(summary.deferred, 1);
        assert_eq!(store.get("other"), Some(Bytes::from_static(b"o")));
        assert_eq!(store.get("k"), None);
        assert_eq!(parked.state(), UnitState::Pending);

        coord.locks().unlock_all(1);
        let settled = wait_for(
            || coord.outstanding_writes() == 0,
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await;
        assert!(settled);
        assert_eq!(store.get("k"), Some(Bytes::from_static(b"v2")));
        let k_order: Vec<Key> = store.order.lock().iter().filter(|key| **key == k[0]).cloned().collect();
        assert_eq!(k_order.len(), 2);
        assert_eq!(coord.executor().pending_count(), 0);
    }

    // ========================================================================
    // Completing a rehash rechecks parked units
    // ========================================================================
    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn complete_rehash_rechecks_parked_units() {
        let store = Arc::new(Store::default());
        let coord = node(store.clone(), config(100));

        coord.begin_rehash(5).unwrap();

        // Parked behind the rehash itself, not behind a key lock.
        let log = Arc::clone(coord.log());
        let recorder = RunRecorder::new();
        coord
            .executor()
            .submit(UnitOfWork::new(
                move || !log.is_enabled(),
                recorder.task(1),
            ))
            .unwrap();

        coord.executor().recheck_pending();
        assert_eq!(coord.executor().pending_count(), 1);

        let summary = coord.complete_rehash().unwrap();
        assert_eq!(summary.recheck.dispatched, 1);
        let ran = wait_for(|| recorder.count() == 1, Duration::from_secs(5), Duration::from_millis(10)).await;
        assert!(ran);
    }
}
