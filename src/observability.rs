use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: reservation attempts by terminal outcome. Labels: outcome.
pub const RESERVATIONS_TOTAL: &str = "seatlock_reservations_total";

/// Histogram: end-to-end `reserve` latency in seconds. Labels: outcome.
pub const RESERVATION_DURATION_SECONDS: &str = "seatlock_reservation_duration_seconds";

/// Counter: cancel calls by outcome. Labels: outcome.
pub const CANCELLATIONS_TOTAL: &str = "seatlock_cancellations_total";

/// Histogram: time spent waiting for the distributed lock, in seconds.
pub const LOCK_ACQUIRE_DURATION_SECONDS: &str = "seatlock_lock_acquire_duration_seconds";

// ── Contention and cache behaviour ──────────────────────────────

/// Counter: availability cache lookups. Labels: result (hit, miss, error).
pub const CACHE_LOOKUPS_TOTAL: &str = "seatlock_cache_lookups_total";

/// Counter: requests rejected from the cache without taking a lock.
pub const FAST_PATH_REJECTIONS_TOTAL: &str = "seatlock_fast_path_rejections_total";

/// Counter: VERIFYING re-runs after a version conflict.
pub const OPTIMISTIC_RETRIES_TOTAL: &str = "seatlock_optimistic_retries_total";

/// Counter: requests that never got a local admission permit.
pub const ADMISSION_REJECTED_TOTAL: &str = "seatlock_admission_rejected_total";

/// Counter: allocations repaired by reconciliation.
pub const RECONCILE_CORRECTIONS_TOTAL: &str = "seatlock_reconcile_corrections_total";

/// Gauge: breaker state (0 closed, 1 open, 2 half-open). Labels: breaker.
pub const CIRCUIT_BREAKER_STATE: &str = "seatlock_circuit_breaker_state";

// ── USE metrics (storage) ───────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "seatlock_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "seatlock_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on port {port}: {e}"),
    }
}
