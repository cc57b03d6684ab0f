//! Walk through a rehash: writers keep writing while ownership moves,
//! a transaction holds key locks, and everything lands once the move is done.

use bytes::Bytes;
use parking_lot::Mutex;
use rehash_core::{
    BlockingAwareExecutor, CacheWrite, CoreConfig, ExecutorConfig, Key, KeyLockTable, LogConfig,
    RehashCoordinator, TransactionLog, WriteApplier, WriteRoute,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Toy storage engine.
#[derive(Default)]
struct MemoryStore {
    data: Mutex<HashMap<Key, Bytes>>,
}

impl WriteApplier<CacheWrite> for MemoryStore {
    fn apply(&self, command: CacheWrite) -> rehash_core::Result<()> {
        let mut data = self.data.lock();
        match command {
            CacheWrite::Put { key, value } | CacheWrite::Replace { key, value } => {
                data.insert(key, value);
            }
            CacheWrite::PutAll { entries } => data.extend(entries),
            CacheWrite::Remove { key } => {
                data.remove(&key);
            }
            CacheWrite::Clear => data.clear(),
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter("rehash_core=debug,info")
        .init();

    let config = CoreConfig::default()
        .with_executor_config(
            ExecutorConfig::default()
                .with_worker_threads(2)
                .with_recheck_interval(Duration::from_millis(500)),
        )
        .with_log_config(LogConfig::default().with_drain_threshold(16));
    config.validate()?;

    let store = Arc::new(MemoryStore::default());
    let coordinator = Arc::new(RehashCoordinator::new(
        Arc::new(TransactionLog::new(config.log.clone())),
        Arc::new(BlockingAwareExecutor::new(config.executor.clone())?),
        Arc::new(KeyLockTable::new()),
        store.clone(),
    ));

    // A transaction holds "user:0" for a while
    let user0 = vec![Bytes::from_static(b"user:0")];
    coordinator.locks().try_lock(1, &user0);

    println!("--- Before rehash ---");
    for i in 0..4 {
        let route = coordinator.route_write(CacheWrite::put(format!("user:{i}"), "v1"))?;
        if let WriteRoute::Submitted(handle) = route {
            println!("  user:{i} -> {} ({})", handle.id(), handle.state());
        }
    }

    println!("\n--- Rehash to topology 2 ---");
    coordinator.begin_rehash(2)?;
    let writer = {
        let coordinator = Arc::clone(&coordinator);
        tokio::task::spawn_blocking(move || {
            let mut buffered = 0;
            for i in 0..100 {
                let route = coordinator.route_write(CacheWrite::put(format!("user:{}", i % 10), "v2"));
                if matches!(route, Ok(WriteRoute::Buffered)) {
                    buffered += 1;
                }
            }
            buffered
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let replayed = coordinator.drain_incremental()?;
    println!("Incrementally replayed {replayed} writes");

    let buffered = writer.await?;
    let summary = coordinator.complete_rehash()?;
    println!("Buffered {buffered} writes during the rehash");
    println!(
        "Rehash complete: {} replayed ({} behind user:0's parked write), {} units dispatched, {:?}",
        summary.total_replayed(),
        summary.deferred,
        summary.recheck.dispatched,
        summary.elapsed
    );

    println!("\n--- Transaction commits ---");
    let released = coordinator.locks().unlock_all(1);
    println!("Released {released} key lock(s)");
    while coordinator.outstanding_writes() > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // The parked pre-rehash write lands first, then the buffered ones.
    println!("user:0 = {:?}", store.data.lock().get(&user0[0]));

    let metrics = coordinator.executor().metrics();
    println!("\nExecutor metrics:");
    println!("  Submitted: {}", metrics.submitted);
    println!("  Parked: {}", metrics.parked);
    println!("  Completed: {}", metrics.completed);
    println!("  Pending: {}", metrics.pending);

    let log = coordinator.log().metrics();
    println!("\nLog metrics:");
    println!("  Appended: {}", log.appended);
    println!("  Drained: {}", log.drained);

    println!("\nStore has {} keys", store.data.lock().len());
    coordinator.executor().shutdown_now();

    Ok(())
}
