use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use seatlock::cache::InMemoryCache;
use seatlock::config::EngineConfig;
use seatlock::engine::{ReservationEngine, ReservationError, ReserveRequest, RetryPolicy};
use seatlock::lock::{InMemoryLockManager, LockManager};
use seatlock::model::{AvailabilitySource, Resource, ResourceId, ReservationStatus};
use seatlock::store::{ResourceStore, WalStore};

// ── Test infrastructure ──────────────────────────────────────

fn wal_path() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("seatlock_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join("seatlock.wal")
}

fn rid(s: &str) -> ResourceId {
    ResourceId::parse(s).unwrap()
}

fn config(instance: usize) -> EngineConfig {
    EngineConfig {
        instance_id: format!("instance-{instance}"),
        lock_wait_timeout: Duration::from_secs(5),
        operation_timeout: Duration::from_secs(10),
        ..EngineConfig::default()
    }
}

/// Several service instances sharing one store, lock service and cache.
struct Cluster {
    engines: Vec<ReservationEngine>,
    store: Arc<WalStore>,
    locks: Arc<InMemoryLockManager>,
}

async fn cluster(path: &PathBuf, instances: usize, resources: &[(&str, u32)]) -> Cluster {
    let store = Arc::new(WalStore::open(path).unwrap());
    for (id, total) in resources {
        store
            .create_resource(Resource::new(rid(id), "route", *total))
            .await
            .unwrap();
    }
    let locks = Arc::new(InMemoryLockManager::new());
    let cache = Arc::new(InMemoryCache::new(Duration::from_secs(30)));
    let engines = (0..instances)
        .map(|i| ReservationEngine::new(config(i), store.clone(), locks.clone(), cache.clone()))
        .collect();
    Cluster {
        engines,
        store,
        locks,
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn instances_never_overbook_and_state_survives_restart() {
    let path = wal_path();
    let c = cluster(&path, 4, &[("BUS-1", 25), ("BUS-2", 7)]).await;

    let mut handles = Vec::new();
    for i in 0..120 {
        let engine = c.engines[i % c.engines.len()].clone();
        let resource = if i % 3 == 0 { "BUS-2" } else { "BUS-1" };
        let quantity = (i % 2 + 1) as u32;
        let request = ReserveRequest::new(resource, format!("rider-{i}"), quantity);
        handles.push(tokio::spawn(async move {
            engine.reserve_with_retry(&request, &RetryPolicy::default()).await
        }));
    }

    let mut confirmed = Vec::new();
    for joined in join_all(handles).await {
        let receipt = assert_ok!(joined.unwrap());
        if receipt.is_confirmed() {
            confirmed.push(receipt.reservation_id);
        } else {
            assert!(matches!(
                receipt.reason,
                Some(ReservationError::InsufficientCapacity { .. })
            ));
        }
    }

    for (id, total) in [("BUS-1", 25), ("BUS-2", 7)] {
        let resource = c.store.read_resource(&rid(id)).await.unwrap();
        assert!(resource.allocated <= total);
        assert_eq!(
            resource.allocated as u64,
            c.store.confirmed_quantity(&rid(id)).await.unwrap()
        );
    }
    // With 120 requests of 1-2 units, both resources end up full or within one unit.
    let bus1 = c.store.read_resource(&rid("BUS-1")).await.unwrap();
    assert!(bus1.available() <= 1);

    let before: Vec<Resource> = vec![
        bus1,
        c.store.read_resource(&rid("BUS-2")).await.unwrap(),
    ];
    drop(c);

    let reopened = WalStore::open(&path).unwrap();
    for resource in before {
        assert_eq!(reopened.read_resource(&resource.id).await.unwrap(), resource);
    }
    for id in confirmed {
        assert_eq!(
            reopened.read_reservation(id).await.unwrap().status,
            ReservationStatus::Confirmed
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_capacity_goes_to_the_next_rider() {
    let path = wal_path();
    let c = cluster(&path, 2, &[("FERRY", 3)]).await;
    let (a, b) = (&c.engines[0], &c.engines[1]);

    let mut held = Vec::new();
    for i in 0..3 {
        let receipt = a.reserve("FERRY", &format!("rider-{i}"), 1).await.unwrap();
        assert!(receipt.is_confirmed());
        held.push(receipt.reservation_id);
    }
    let full = b.reserve("FERRY", "late", 1).await.unwrap();
    assert_eq!(full.status, ReservationStatus::Failed);

    let cancelled = b.cancel(held[1]).await.unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);

    let retry = a.reserve("FERRY", "late", 1).await.unwrap();
    assert!(retry.is_confirmed());
    let resource = c.store.read_resource(&rid("FERRY")).await.unwrap();
    assert_eq!(resource.allocated, 3);
    assert_eq!(c.store.confirmed_quantity(&rid("FERRY")).await.unwrap(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn availability_matches_store_after_churn() {
    let path = wal_path();
    let c = cluster(&path, 3, &[("TRAIN", 40)]).await;

    let mut handles = Vec::new();
    for i in 0..60 {
        let engine = c.engines[i % c.engines.len()].clone();
        handles.push(tokio::spawn(async move {
            let receipt = engine.reserve("TRAIN", &format!("rider-{i}"), 1).await?;
            if receipt.is_confirmed() && i % 4 == 0 {
                engine.cancel(receipt.reservation_id).await?;
            }
            // Readers interleave with writers on every instance.
            engine.get_availability("TRAIN").await?;
            Ok::<_, ReservationError>(())
        }));
    }
    for joined in join_all(handles).await {
        assert_ok!(joined.unwrap());
    }

    let resource = c.store.read_resource(&rid("TRAIN")).await.unwrap();
    for engine in &c.engines {
        let availability = engine.get_availability("TRAIN").await.unwrap();
        assert_eq!(availability.as_of_version, resource.version);
        assert_eq!(availability.available, resource.available());
        assert_eq!(availability.total, 40);
    }
    assert_eq!(
        resource.allocated as u64,
        c.store.confirmed_quantity(&rid("TRAIN")).await.unwrap()
    );
}

#[tokio::test]
async fn abandoned_lock_is_taken_over_after_its_lease() {
    let path = wal_path();
    let c = cluster(&path, 1, &[("SHUTTLE", 2)]).await;

    // A crashed instance that never releases.
    let lease = Duration::from_millis(150);
    let stale = c
        .locks
        .acquire(&rid("SHUTTLE"), "crashed-instance", lease, Duration::ZERO)
        .await
        .unwrap();

    let start = Instant::now();
    let receipt = c.engines[0].reserve("SHUTTLE", "rider", 1).await.unwrap();
    assert!(receipt.is_confirmed());
    assert!(start.elapsed() >= Duration::from_millis(100));

    // The crashed holder's token is dead now.
    assert_err!(c.locks.renew(&stale, lease).await);
    assert!(c.locks.holder(&rid("SHUTTLE")).is_none());
}

#[tokio::test]
async fn reservations_made_before_restart_can_be_cancelled_after() {
    let path = wal_path();
    let c = cluster(&path, 1, &[("COACH", 5)]).await;
    let receipt = c.engines[0].reserve("COACH", "rider", 3).await.unwrap();
    assert!(receipt.is_confirmed());
    drop(c);

    let store = Arc::new(WalStore::open(&path).unwrap());
    let engine = ReservationEngine::new(
        config(0),
        store.clone(),
        Arc::new(InMemoryLockManager::new()),
        Arc::new(InMemoryCache::new(Duration::from_secs(30))),
    );
    let first = engine.get_availability("COACH").await.unwrap();
    assert_eq!((first.available, first.source), (2, AvailabilitySource::Store));

    assert_ok!(engine.cancel(receipt.reservation_id).await);
    let after = engine.get_availability("COACH").await.unwrap();
    assert_eq!(after.available, 5);
    assert_eq!(after.source, AvailabilitySource::Cache);
    assert_eq!(store.confirmed_quantity(&rid("COACH")).await.unwrap(), 0);
}
