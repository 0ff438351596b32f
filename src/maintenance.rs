use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::ReservationEngine;
use crate::store::WalStore;

/// Background task that periodically reconciles every resource's allocation
/// with its confirmed reservations and drops idle admission semaphores.
pub async fn run_reconciler(engine: ReservationEngine, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(engine.config().reconcile_interval);
    // The first tick completes immediately; skip it so startup isn't a sweep.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        match engine.reconcile_all().await {
            Ok(report) if report.corrected > 0 => info!(
                checked = report.checked,
                corrected = report.corrected,
                skipped = report.skipped,
                "reconciliation sweep corrected allocations"
            ),
            Ok(report) => tracing::debug!(checked = report.checked, skipped = report.skipped, "reconciliation sweep clean"),
            Err(e) => tracing::warn!("reconciliation sweep failed: {e}"),
        }
        let pruned = engine.admission().prune_idle();
        if pruned > 0 {
            tracing::debug!(pruned, "pruned idle admission semaphores");
        }
    }
    info!("reconciler stopped");
}

/// Background task that compacts the WAL once enough appends have piled up.
pub async fn run_compactor(
    store: Arc<WalStore>,
    threshold: u64,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let appends = store.appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact().await {
            Ok(()) => info!(appends, "WAL compacted"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
    info!("compactor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::config::EngineConfig;
    use crate::lock::InMemoryLockManager;
    use crate::model::*;
    use crate::store::ResourceStore;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("seatlock_test_maintenance");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn rid(s: &str) -> ResourceId {
        ResourceId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn reconciler_repairs_drift_and_stops() {
        let store = Arc::new(WalStore::open(&test_wal_path("reconciler.wal")).unwrap());
        store
            .create_resource(Resource::new(rid("R1"), "route", 10))
            .await
            .unwrap();
        store.compare_and_update_allocation(&rid("R1"), 0, 4).await.unwrap();

        let config = EngineConfig {
            reconcile_interval: Duration::from_millis(20),
            ..EngineConfig::default()
        };
        let engine = ReservationEngine::new(
            config,
            store.clone(),
            Arc::new(InMemoryLockManager::new()),
            Arc::new(InMemoryCache::new(Duration::from_secs(30))),
        );
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_reconciler(engine, shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.read_resource(&rid("R1")).await.unwrap().allocated, 0);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("reconciler should stop on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn compactor_runs_past_threshold() {
        let path = test_wal_path("compactor.wal");
        let store = Arc::new(WalStore::open(&path).unwrap());
        store
            .create_resource(Resource::new(rid("R1"), "route", 100))
            .await
            .unwrap();
        for v in 0..10 {
            store.compare_and_update_allocation(&rid("R1"), v, 1).await.unwrap();
        }
        assert_eq!(store.appends_since_compact().await, 11);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_compactor(
            store.clone(),
            5,
            Duration::from_millis(10),
            shutdown.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(store.appends_since_compact().await, 0);
        let resource = store.read_resource(&rid("R1")).await.unwrap();
        assert_eq!((resource.allocated, resource.version), (10, 10));
    }
}
