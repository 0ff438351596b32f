use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

use seatlock::breaker::CircuitBreaker;
use seatlock::cache::{AvailabilityCache, InMemoryCache};
use seatlock::config::EngineConfig;
use seatlock::engine::{ReservationEngine, ReserveRequest, RetryPolicy};
use seatlock::lock::{BreakerLockManager, InMemoryLockManager, LockManager};
use seatlock::maintenance;
use seatlock::model::{Resource, ResourceId};
use seatlock::store::{ResourceStore, WalStore};

type BoxError = Box<dyn std::error::Error>;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

async fn open_locks(config: &EngineConfig) -> Result<Arc<dyn LockManager>, BoxError> {
    let breaker = Arc::new(CircuitBreaker::new(
        "lock",
        config.breaker_failure_threshold,
        config.breaker_open_timeout,
    ));
    #[cfg(feature = "redis")]
    if let Ok(url) = std::env::var("SEATLOCK_REDIS_LOCK_URL") {
        info!("  locks: redis");
        let redis = seatlock::lock::RedisLockManager::new(&url).await?;
        return Ok(Arc::new(BreakerLockManager::new(redis, breaker)));
    }
    info!("  locks: in-process");
    Ok(Arc::new(BreakerLockManager::new(InMemoryLockManager::new(), breaker)))
}

async fn open_cache(config: &EngineConfig) -> Result<Arc<dyn AvailabilityCache>, BoxError> {
    #[cfg(feature = "redis")]
    if let Ok(url) = std::env::var("SEATLOCK_REDIS_CACHE_URL") {
        info!("  cache: redis");
        let redis = seatlock::cache::RedisCache::new(&url, config.cache_ttl_ceiling).await?;
        return Ok(Arc::new(redis));
    }
    info!("  cache: in-process");
    Ok(Arc::new(InMemoryCache::new(config.cache_ttl_ceiling)))
}

/// Returns the store plus, for the WAL backend, the handle the compactor needs.
async fn open_store(data_dir: &str) -> Result<(Arc<dyn ResourceStore>, Option<Arc<WalStore>>), BoxError> {
    #[cfg(feature = "postgres")]
    if let Ok(url) = std::env::var("DATABASE_URL") {
        info!("  store: postgres");
        let pg = seatlock::store::PgStore::connect(&url).await?;
        pg.ensure_schema().await?;
        return Ok((Arc::new(pg), None));
    }
    std::fs::create_dir_all(data_dir)?;
    let path = PathBuf::from(data_dir).join("seatlock.wal");
    info!("  store: wal at {}", path.display());
    let wal = Arc::new(WalStore::open(&path)?);
    Ok((wal.clone(), Some(wal)))
}

/// Fire `workers` concurrent reservations at one resource and check that
/// confirmed units never exceed capacity.
async fn run_drill(engine: &ReservationEngine, workers: usize, quantity: u32, capacity: u32) -> Result<(), BoxError> {
    let resource_id = ResourceId::parse(&format!("drill-{}", Ulid::new()))?;
    engine
        .store()
        .create_resource(Resource::new(resource_id.clone(), "drill", capacity))
        .await?;
    info!(resource_id = %resource_id, workers, quantity, capacity, "starting contention drill");

    let started = Instant::now();
    let mut handles = Vec::with_capacity(workers);
    for i in 0..workers {
        let engine = engine.clone();
        let request = ReserveRequest::new(resource_id.as_str(), format!("drill-worker-{i}"), quantity);
        handles.push(tokio::spawn(async move {
            engine.reserve_with_retry(&request, &RetryPolicy::default()).await
        }));
    }

    let mut outcomes: BTreeMap<&'static str, usize> = BTreeMap::new();
    for handle in handles {
        let label = match handle.await? {
            Ok(receipt) => receipt.reason.as_ref().map_or("confirmed", |r| r.label()),
            Err(e) => e.label(),
        };
        *outcomes.entry(label).or_default() += 1;
    }
    let elapsed = started.elapsed();

    let resource = engine.store().read_resource(&resource_id).await?;
    let confirmed_units = engine.store().confirmed_quantity(&resource_id).await?;
    for (outcome, count) in &outcomes {
        info!("  {outcome}: {count}");
    }
    info!(
        allocated = resource.allocated,
        confirmed_units,
        version = resource.version,
        elapsed_ms = elapsed.as_millis() as u64,
        "drill finished"
    );

    if resource.allocated > resource.total || confirmed_units != resource.allocated as u64 {
        tracing::error!(
            allocated = resource.allocated,
            total = resource.total,
            confirmed_units,
            "capacity invariant violated"
        );
        return Err("capacity invariant violated".into());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let metrics_port: Option<u16> = std::env::var("SEATLOCK_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    seatlock::observability::init(metrics_port);

    let config = EngineConfig::from_env();
    config.validate()?;
    let data_dir = std::env::var("SEATLOCK_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let workers: usize = env_or("SEATLOCK_DRILL_WORKERS", 100);
    let quantity: u32 = env_or("SEATLOCK_DRILL_QUANTITY", 1);
    let capacity: u32 = env_or("SEATLOCK_DRILL_CAPACITY", 50);

    info!("seatlock instance {}", config.instance_id);
    info!("  lock wait: {}ms, lease: {}ms", config.lock_wait_timeout.as_millis(), config.lock_lease.as_millis());
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));
    let (store, wal) = open_store(&data_dir).await?;
    let locks = open_locks(&config).await?;
    let cache = open_cache(&config).await?;

    let compact_threshold = config.compact_threshold;
    let engine = ReservationEngine::new(config, store, locks, cache);

    let shutdown = CancellationToken::new();
    let mut background = vec![tokio::spawn(maintenance::run_reconciler(
        engine.clone(),
        shutdown.clone(),
    ))];
    if let Some(wal) = wal {
        background.push(tokio::spawn(maintenance::run_compactor(
            wal,
            compact_threshold,
            Duration::from_secs(10),
            shutdown.clone(),
        )));
    }

    let result = tokio::select! {
        result = run_drill(&engine, workers, quantity, capacity) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, abandoning drill");
            Ok(())
        }
    };

    shutdown.cancel();
    for task in background {
        let _ = task.await;
    }
    result
}
