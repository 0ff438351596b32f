mod availability;
mod cancel;
mod error;
mod reconcile;
mod reserve;
mod retry;

pub use error::ReservationError;
pub use reconcile::ReconcileReport;
pub use retry::{ReserveRequest, RetryPolicy};

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use ulid::Ulid;

use crate::admission::LocalAdmission;
use crate::cache::AvailabilityCache;
use crate::config::EngineConfig;
use crate::limits::{MAX_QUANTITY, MAX_REQUESTER_ID_LEN};
use crate::lock::{HeldLock, LockError, LockManager};
use crate::model::*;
use crate::store::ResourceStore;

/// Result of a `reserve` call that got as far as producing a reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveReceipt {
    pub reservation_id: Ulid,
    pub resource_id: ResourceId,
    /// CONFIRMED or FAILED.
    pub status: ReservationStatus,
    /// Why a FAILED reservation failed.
    pub reason: Option<ReservationError>,
}

impl ReserveReceipt {
    pub fn is_confirmed(&self) -> bool {
        self.status == ReservationStatus::Confirmed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelReceipt {
    pub reservation_id: Ulid,
    pub status: ReservationStatus,
}

/// The reservation state machine over a store, a lock manager and a cache.
///
/// Cheap to clone; clones share every collaborator. Several engines (one per
/// service instance) may share the same store, lock manager and cache.
#[derive(Clone)]
pub struct ReservationEngine {
    store: Arc<dyn ResourceStore>,
    locks: Arc<dyn LockManager>,
    cache: Arc<dyn AvailabilityCache>,
    admission: Arc<LocalAdmission>,
    config: Arc<EngineConfig>,
}

/// Lock and admission permit held across VERIFYING and COMMITTING.
pub(super) struct CriticalSection {
    lock: HeldLock,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl ReservationEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn ResourceStore>,
        locks: Arc<dyn LockManager>,
        cache: Arc<dyn AvailabilityCache>,
    ) -> Self {
        let admission = Arc::new(LocalAdmission::new(config.admission_permits));
        Self {
            store,
            locks,
            cache,
            admission,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub fn admission(&self) -> &LocalAdmission {
        &self.admission
    }

    fn holder_id(&self, operation_id: &Ulid) -> String {
        format!("{}:{operation_id}", self.config.instance_id)
    }

    /// INIT checks. Returns the parsed resource id.
    pub(super) fn validate_request(
        resource_id: &str,
        requester_id: &str,
        quantity: u32,
    ) -> Result<ResourceId, ReservationError> {
        let resource_id = ResourceId::parse(resource_id)
            .map_err(|e| ReservationError::InvalidRequest(e.to_string()))?;
        if requester_id.is_empty() {
            return Err(ReservationError::InvalidRequest("requester id is empty".into()));
        }
        if requester_id.len() > MAX_REQUESTER_ID_LEN {
            return Err(ReservationError::InvalidRequest("requester id too long".into()));
        }
        if quantity == 0 {
            return Err(ReservationError::InvalidRequest("quantity must be positive".into()));
        }
        if quantity > MAX_QUANTITY {
            return Err(ReservationError::InvalidRequest(format!(
                "quantity exceeds limit of {MAX_QUANTITY}"
            )));
        }
        Ok(resource_id)
    }

    /// LOCKING: local admission, then the distributed lock, both within
    /// `lock_wait_timeout` and never past `deadline`.
    pub(super) async fn enter_critical_section(
        &self,
        resource_id: &ResourceId,
        operation_id: &Ulid,
        deadline: Instant,
    ) -> Result<CriticalSection, ReservationError> {
        let start = Instant::now();
        let budget = self
            .config
            .lock_wait_timeout
            .min(deadline.saturating_duration_since(start));

        let permit = self
            .admission
            .acquire(resource_id, budget)
            .await
            .ok_or_else(|| ReservationError::LockContention {
                resource_id: resource_id.clone(),
                waited: start.elapsed(),
            })?;

        let remaining = budget.saturating_sub(start.elapsed());
        let lock = HeldLock::acquire(
            self.locks.clone(),
            resource_id,
            &self.holder_id(operation_id),
            self.config.lock_lease,
            remaining,
        )
        .await;
        metrics::histogram!(crate::observability::LOCK_ACQUIRE_DURATION_SECONDS)
            .record(start.elapsed().as_secs_f64());

        match lock {
            Ok(lock) => Ok(CriticalSection {
                lock,
                _permit: permit,
            }),
            Err(LockError::Unavailable { .. }) => Err(ReservationError::LockContention {
                resource_id: resource_id.clone(),
                waited: start.elapsed(),
            }),
            Err(e) => {
                tracing::error!(resource_id = %resource_id, "lock service error: {e}");
                Err(e.into())
            }
        }
    }

    /// Renew the lease if less than the configured margin is left.
    pub(super) async fn ensure_lease(&self, section: &mut CriticalSection) -> Result<(), LockError> {
        if section.lock.token().remaining() >= self.config.lease_renew_margin {
            return Ok(());
        }
        section.lock.renew(self.config.lock_lease).await
    }

    /// Replace the cache entry with the post-mutation snapshot, falling back
    /// to invalidation. Never fails the caller.
    pub(super) async fn refresh_cache(&self, resource: &Resource) {
        if let Err(e) = self
            .cache
            .put(&resource.id, resource.snapshot(), resource.version)
            .await
        {
            tracing::warn!(resource_id = %resource.id, "cache put failed, invalidating: {e}");
            if let Err(e) = self.cache.invalidate(&resource.id).await {
                tracing::error!(resource_id = %resource.id, "cache invalidation failed: {e}");
            }
        }
    }

    /// Bound on lock wait plus store round-trips before COMMITTING.
    pub(super) fn operation_deadline(&self) -> (Instant, Duration) {
        let timeout = self.config.operation_timeout;
        (Instant::now() + timeout, timeout)
    }
}
