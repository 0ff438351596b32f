use std::time::Duration;

use ulid::Ulid;

/// Tunables for the reservation engine and its collaborators.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Identity this instance uses as lock holder.
    pub instance_id: String,
    /// How long `acquire` may wait for a held lock before giving up.
    pub lock_wait_timeout: Duration,
    /// Lease length of an acquired lock.
    pub lock_lease: Duration,
    /// Renew before committing when less than this much lease is left.
    pub lease_renew_margin: Duration,
    /// How many times a version conflict re-runs VERIFYING.
    pub max_optimistic_retries: u32,
    /// Upper bound on cache entry age. Invalidation is event-driven; this only caps staleness.
    pub cache_ttl_ceiling: Duration,
    /// Bound on lock wait + store round-trips before COMMITTING begins.
    pub operation_timeout: Duration,
    /// In-process permits per resource in front of the distributed lock.
    pub admission_permits: usize,
    pub breaker_failure_threshold: u32,
    pub breaker_open_timeout: Duration,
    pub reconcile_interval: Duration,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("seatlock-{}", Ulid::new()),
            lock_wait_timeout: Duration::from_millis(300),
            lock_lease: Duration::from_millis(5_000),
            lease_renew_margin: Duration::from_millis(1_000),
            max_optimistic_retries: 3,
            cache_ttl_ceiling: Duration::from_millis(30_000),
            operation_timeout: Duration::from_millis(2_000),
            admission_permits: 1,
            breaker_failure_threshold: 5,
            breaker_open_timeout: Duration::from_millis(30_000),
            reconcile_interval: Duration::from_millis(30_000),
            compact_threshold: 1_000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn env_ms(name: &str, default: Duration) -> Duration {
    env_parse::<u64>(name)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

impl EngineConfig {
    /// Read `SEATLOCK_*` variables, falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            instance_id: std::env::var("SEATLOCK_INSTANCE_ID").unwrap_or(d.instance_id),
            lock_wait_timeout: env_ms("SEATLOCK_LOCK_WAIT_MS", d.lock_wait_timeout),
            lock_lease: env_ms("SEATLOCK_LOCK_LEASE_MS", d.lock_lease),
            lease_renew_margin: env_ms("SEATLOCK_LEASE_RENEW_MARGIN_MS", d.lease_renew_margin),
            max_optimistic_retries: env_parse("SEATLOCK_MAX_OPTIMISTIC_RETRIES")
                .unwrap_or(d.max_optimistic_retries),
            cache_ttl_ceiling: env_ms("SEATLOCK_CACHE_TTL_MS", d.cache_ttl_ceiling),
            operation_timeout: env_ms("SEATLOCK_OPERATION_TIMEOUT_MS", d.operation_timeout),
            admission_permits: env_parse("SEATLOCK_ADMISSION_PERMITS")
                .unwrap_or(d.admission_permits),
            breaker_failure_threshold: env_parse("SEATLOCK_BREAKER_FAILURES")
                .unwrap_or(d.breaker_failure_threshold),
            breaker_open_timeout: env_ms("SEATLOCK_BREAKER_OPEN_MS", d.breaker_open_timeout),
            reconcile_interval: env_ms("SEATLOCK_RECONCILE_INTERVAL_MS", d.reconcile_interval),
            compact_threshold: env_parse("SEATLOCK_COMPACT_THRESHOLD")
                .unwrap_or(d.compact_threshold),
        }
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.instance_id.is_empty() {
            return Err("instance id is empty");
        }
        if self.lock_lease <= self.lease_renew_margin {
            return Err("lock lease must be longer than the renew margin");
        }
        if self.max_optimistic_retries == 0 {
            return Err("optimistic retry bound must be at least 1");
        }
        if self.admission_permits == 0 {
            return Err("admission permits must be at least 1");
        }
        if self.lock_wait_timeout.is_zero() || self.operation_timeout.is_zero() {
            return Err("timeouts must be non-zero");
        }
        Ok(())
    }
}
