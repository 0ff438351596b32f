use tokio::time::Instant;

use crate::lock::LockError;
use crate::model::*;
use crate::store::StoreError;

use super::{CriticalSection, ReservationEngine, ReservationError, ReserveReceipt};

impl ReservationEngine {
    /// Reserve `quantity` units of `resource_id` for `requester_id`.
    ///
    /// Business outcomes and transient failures come back as a FAILED
    /// receipt with a reason. `Err` is reserved for invalid input, unknown
    /// resources and store outages.
    pub async fn reserve(
        &self,
        resource_id: &str,
        requester_id: &str,
        quantity: u32,
    ) -> Result<ReserveReceipt, ReservationError> {
        self.reserve_recorded(resource_id, requester_id, quantity, true)
            .await
    }

    /// `reserve`, persisting a retryable FAILED outcome only when
    /// `record_retryable` is set. The retry helper clears it for every
    /// attempt but the last so one logical request leaves one record.
    pub(super) async fn reserve_recorded(
        &self,
        resource_id: &str,
        requester_id: &str,
        quantity: u32,
        record_retryable: bool,
    ) -> Result<ReserveReceipt, ReservationError> {
        let start = Instant::now();
        let result = self
            .reserve_attempt(resource_id, requester_id, quantity, record_retryable)
            .await;

        let outcome = match &result {
            Ok(receipt) => match &receipt.reason {
                None => "confirmed",
                Some(reason) => reason.label(),
            },
            Err(e) => e.label(),
        };
        metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "outcome" => outcome)
            .increment(1);
        metrics::histogram!(crate::observability::RESERVATION_DURATION_SECONDS, "outcome" => outcome)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn reserve_attempt(
        &self,
        resource_id: &str,
        requester_id: &str,
        quantity: u32,
        record_retryable: bool,
    ) -> Result<ReserveReceipt, ReservationError> {
        // INIT
        let resource_id = Self::validate_request(resource_id, requester_id, quantity)?;
        let mut reservation =
            Reservation::pending(resource_id.clone(), requester_id.to_string(), quantity);

        match self.run_to_commit(&mut reservation).await {
            Ok(()) => Ok(ReserveReceipt {
                reservation_id: reservation.id,
                resource_id,
                status: ReservationStatus::Confirmed,
                reason: None,
            }),
            Err(reason) if reason.is_reservation_outcome() => {
                if record_retryable || !reason.is_retryable() {
                    self.record_failed(&mut reservation, &reason).await;
                }
                Ok(ReserveReceipt {
                    reservation_id: reservation.id,
                    resource_id,
                    status: ReservationStatus::Failed,
                    reason: Some(reason),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Persist a FAILED reservation so a later cancel of its id is a no-op.
    async fn record_failed(&self, reservation: &mut Reservation, reason: &ReservationError) {
        match reason {
            ReservationError::InsufficientCapacity { .. } => tracing::debug!(
                reservation_id = %reservation.id,
                resource_id = %reservation.resource_id,
                "reservation failed: {reason}"
            ),
            _ => tracing::info!(
                reservation_id = %reservation.id,
                resource_id = %reservation.resource_id,
                "reservation failed: {reason}"
            ),
        }
        reservation.transition(ReservationStatus::Failed, now_ms());
        if let Err(e) = self.store.write_reservation(reservation).await {
            tracing::warn!(reservation_id = %reservation.id, "could not record FAILED reservation: {e}");
        }
    }

    /// LOCKING → VERIFYING → COMMITTING. On `Ok` the reservation is CONFIRMED and persisted.
    async fn run_to_commit(&self, reservation: &mut Reservation) -> Result<(), ReservationError> {
        let resource_id = reservation.resource_id.clone();
        let quantity = reservation.quantity;

        if let Some(available) = self.fast_path_reject(&resource_id, quantity).await {
            return Err(ReservationError::InsufficientCapacity {
                resource_id,
                requested: quantity,
                available,
            });
        }

        let (deadline, timeout) = self.operation_deadline();
        let start = Instant::now();
        let locked = tokio::time::timeout_at(deadline, async {
            tracing::debug!(reservation_id = %reservation.id, resource_id = %resource_id, "LOCKING");
            let section = self
                .enter_critical_section(&resource_id, &reservation.id, deadline)
                .await?;
            tracing::debug!(reservation_id = %reservation.id, resource_id = %resource_id, "VERIFYING");
            match self.verify(&resource_id, quantity).await {
                Ok(resource) => Ok::<_, ReservationError>((section, resource)),
                Err(e) => {
                    section.lock.release().await;
                    Err(e)
                }
            }
        })
        .await;

        let (section, resource) = match locked {
            Ok(Ok(held)) => held,
            Ok(Err(e)) => return Err(e),
            // The dropped future releases the lock through its guard.
            Err(_) => {
                tracing::info!(
                    resource_id = %resource_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "reservation timed out before commit"
                );
                return Err(ReservationError::OperationTimeout {
                    resource_id,
                    elapsed: start.elapsed(),
                });
            }
        };

        // COMMITTING runs to completion on its own task even if the caller
        // stops polling us.
        let engine = self.clone();
        let pending = reservation.clone();
        let committed = tokio::spawn(async move { engine.commit(section, resource, pending).await })
            .await
            .map_err(|e| ReservationError::StoreUnavailable(format!("commit task failed: {e}")))??;
        *reservation = committed;
        Ok(())
    }

    /// Reject from the cache alone when it already shows too little capacity,
    /// returning the cached availability. A cache error or miss never rejects.
    async fn fast_path_reject(&self, resource_id: &ResourceId, quantity: u32) -> Option<u32> {
        let entry = match self.cache.get(resource_id).await {
            Ok(Some(entry)) => {
                metrics::counter!(crate::observability::CACHE_LOOKUPS_TOTAL, "result" => "hit")
                    .increment(1);
                entry
            }
            Ok(None) => {
                metrics::counter!(crate::observability::CACHE_LOOKUPS_TOTAL, "result" => "miss")
                    .increment(1);
                return None;
            }
            Err(e) => {
                metrics::counter!(crate::observability::CACHE_LOOKUPS_TOTAL, "result" => "error")
                    .increment(1);
                tracing::warn!(resource_id = %resource_id, "cache lookup failed: {e}");
                return None;
            }
        };
        let available = entry.snapshot.available();
        if available >= quantity {
            return None;
        }
        metrics::counter!(crate::observability::FAST_PATH_REJECTIONS_TOTAL).increment(1);
        tracing::debug!(
            resource_id = %resource_id,
            cached_version = entry.version,
            available,
            quantity,
            "fast-path rejection"
        );
        Some(available)
    }

    /// Authoritative store read under the lock.
    async fn verify(&self, resource_id: &ResourceId, quantity: u32) -> Result<Resource, ReservationError> {
        let resource = self.store.read_resource(resource_id).await?;
        if resource.available() < quantity {
            return Err(ReservationError::InsufficientCapacity {
                resource_id: resource_id.clone(),
                requested: quantity,
                available: resource.available(),
            });
        }
        Ok(resource)
    }

    /// The lease lapsed after VERIFYING and before the CAS. Whatever was
    /// verified under it is void: re-read the row and report the attempt as
    /// a concurrent modification rather than a lock wait.
    async fn lease_lost(
        &self,
        resource_id: &ResourceId,
        verified_version: u64,
        attempts: u32,
        cause: LockError,
    ) -> ReservationError {
        if cause.is_backend_fault() {
            tracing::error!(resource_id = %resource_id, "lease renewal failed: {cause}");
            return cause.into();
        }
        match self.store.read_resource(resource_id).await {
            Ok(current) => {
                tracing::warn!(
                    resource_id = %resource_id,
                    verified_version,
                    current_version = current.version,
                    moved = current.version != verified_version,
                    "lease lost before commit: {cause}"
                );
                ReservationError::ConcurrentModification {
                    resource_id: resource_id.clone(),
                    attempts,
                }
            }
            Err(e) => e.into(),
        }
    }

    /// CAS the allocation, persist CONFIRMED, refresh the cache, release.
    async fn commit(
        &self,
        mut section: CriticalSection,
        mut resource: Resource,
        mut reservation: Reservation,
    ) -> Result<Reservation, ReservationError> {
        let resource_id = reservation.resource_id.clone();
        let quantity = reservation.quantity;
        let mut retries = 0u32;

        tracing::debug!(reservation_id = %reservation.id, resource_id = %resource_id, "COMMITTING");
        let updated = loop {
            if let Err(e) = self.ensure_lease(&mut section).await {
                section.lock.release().await;
                return Err(self.lease_lost(&resource_id, resource.version, retries + 1, e).await);
            }

            match self
                .store
                .compare_and_update_allocation(&resource_id, resource.version, quantity as i64)
                .await
            {
                Ok(updated) => break updated,
                Err(StoreError::VersionConflict { actual, .. }) => {
                    metrics::counter!(crate::observability::OPTIMISTIC_RETRIES_TOTAL).increment(1);
                    // Someone wrote without our lock, or our lease lapsed. Only
                    // keep going if we provably still hold it.
                    if let Err(e) = section.lock.renew(self.config.lock_lease).await {
                        tracing::warn!(
                            resource_id = %resource_id,
                            expected = resource.version,
                            actual,
                            "version conflict after lease loss: {e}"
                        );
                        section.lock.release().await;
                        return Err(ReservationError::ConcurrentModification {
                            resource_id,
                            attempts: retries + 1,
                        });
                    }
                    if retries >= self.config.max_optimistic_retries {
                        section.lock.release().await;
                        return Err(ReservationError::ConcurrentModification {
                            resource_id,
                            attempts: retries + 1,
                        });
                    }
                    retries += 1;
                    tracing::debug!(reservation_id = %reservation.id, retries, "re-VERIFYING");
                    match self.verify(&resource_id, quantity).await {
                        Ok(fresh) => resource = fresh,
                        Err(e) => {
                            section.lock.release().await;
                            return Err(e);
                        }
                    }
                }
                Err(StoreError::CapacityViolation { allocated, total, .. }) => {
                    section.lock.release().await;
                    return Err(ReservationError::InsufficientCapacity {
                        resource_id,
                        requested: quantity,
                        available: total.saturating_sub(allocated),
                    });
                }
                Err(e) => {
                    tracing::error!(resource_id = %resource_id, "allocation update failed: {e}");
                    section.lock.release().await;
                    return Err(e.into());
                }
            }
        };

        reservation.transition(ReservationStatus::Confirmed, now_ms());
        if let Err(e) = self.store.write_reservation(&reservation).await {
            tracing::error!(
                reservation_id = %reservation.id,
                resource_id = %resource_id,
                "could not persist CONFIRMED reservation, rolling back allocation: {e}"
            );
            match self
                .store
                .compare_and_update_allocation(&resource_id, updated.version, -(quantity as i64))
                .await
            {
                Ok(rolled_back) => self.refresh_cache(&rolled_back).await,
                // Left for reconciliation to repair.
                Err(rollback) => tracing::error!(resource_id = %resource_id, "rollback failed: {rollback}"),
            }
            section.lock.release().await;
            return Err(ReservationError::StoreUnavailable(e.to_string()));
        }

        self.refresh_cache(&updated).await;
        section.lock.release().await;
        tracing::debug!(
            reservation_id = %reservation.id,
            resource_id = %resource_id,
            quantity,
            version = updated.version,
            "CONFIRMED"
        );
        Ok(reservation)
    }
}
