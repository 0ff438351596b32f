use tokio::time::Instant;
use ulid::Ulid;

use crate::lock::LockError;
use crate::model::*;
use crate::store::StoreError;

use super::{CancelReceipt, CriticalSection, ReservationEngine, ReservationError};

impl ReservationEngine {
    /// Return a CONFIRMED reservation's capacity and mark it CANCELLED.
    /// Cancelling a CANCELLED or FAILED reservation succeeds without effect.
    pub async fn cancel(&self, reservation_id: Ulid) -> Result<CancelReceipt, ReservationError> {
        let result = self.cancel_attempt(reservation_id).await;
        let outcome = match &result {
            Ok(_) => "cancelled",
            Err(e) => e.label(),
        };
        metrics::counter!(crate::observability::CANCELLATIONS_TOTAL, "outcome" => outcome)
            .increment(1);
        result
    }

    async fn cancel_attempt(&self, reservation_id: Ulid) -> Result<CancelReceipt, ReservationError> {
        let reservation = self.store.read_reservation(reservation_id).await?;
        if let Some(done) = Self::already_settled(&reservation)? {
            return Ok(done);
        }

        let resource_id = reservation.resource_id.clone();
        let operation_id = Ulid::new();
        let (deadline, _) = self.operation_deadline();
        let start = Instant::now();
        let locked = tokio::time::timeout_at(deadline, async {
            let section = self
                .enter_critical_section(&resource_id, &operation_id, deadline)
                .await?;
            // Re-read under the lock: a concurrent cancel may have won.
            match self.store.read_reservation(reservation_id).await {
                Ok(current) => Ok::<_, ReservationError>((section, current)),
                Err(e) => {
                    section.lock.release().await;
                    Err(ReservationError::from(e))
                }
            }
        })
        .await;

        let (section, current) = match locked {
            Ok(Ok(held)) => held,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(ReservationError::OperationTimeout {
                    resource_id,
                    elapsed: start.elapsed(),
                });
            }
        };
        if let Some(done) = Self::already_settled(&current)? {
            section.lock.release().await;
            return Ok(done);
        }

        let engine = self.clone();
        tokio::spawn(async move { engine.commit_cancel(section, current).await })
            .await
            .map_err(|e| ReservationError::StoreUnavailable(format!("cancel task failed: {e}")))?
    }

    /// `Some` when there is nothing left to do for this reservation.
    fn already_settled(reservation: &Reservation) -> Result<Option<CancelReceipt>, ReservationError> {
        match reservation.status {
            ReservationStatus::Cancelled | ReservationStatus::Failed => Ok(Some(CancelReceipt {
                reservation_id: reservation.id,
                status: reservation.status,
            })),
            ReservationStatus::Confirmed => Ok(None),
            ReservationStatus::Pending => Err(ReservationError::InvalidRequest(format!(
                "reservation {} is still pending",
                reservation.id
            ))),
        }
    }

    /// The lease lapsed before the allocation was returned. Re-read the
    /// reservation: if another canceller settled it meanwhile, that outcome
    /// stands; otherwise the attempt lost to a concurrent writer.
    async fn cancel_lease_lost(
        &self,
        reservation: &Reservation,
        attempts: u32,
        cause: LockError,
    ) -> Result<CancelReceipt, ReservationError> {
        if cause.is_backend_fault() {
            tracing::error!(resource_id = %reservation.resource_id, "lease renewal failed: {cause}");
            return Err(cause.into());
        }
        let current = self.store.read_reservation(reservation.id).await?;
        tracing::warn!(
            reservation_id = %reservation.id,
            resource_id = %reservation.resource_id,
            status = current.status.as_str(),
            "lease lost before cancel: {cause}"
        );
        if let Some(done) = Self::already_settled(&current)? {
            return Ok(done);
        }
        Err(ReservationError::ConcurrentModification {
            resource_id: reservation.resource_id.clone(),
            attempts,
        })
    }

    async fn commit_cancel(
        &self,
        mut section: CriticalSection,
        reservation: Reservation,
    ) -> Result<CancelReceipt, ReservationError> {
        let resource_id = reservation.resource_id.clone();
        let delta = -(reservation.quantity as i64);
        let mut retries = 0u32;

        let updated = loop {
            if let Err(e) = self.ensure_lease(&mut section).await {
                section.lock.release().await;
                return self.cancel_lease_lost(&reservation, retries + 1, e).await;
            }
            let resource = match self.store.read_resource(&resource_id).await {
                Ok(resource) => resource,
                Err(e) => {
                    section.lock.release().await;
                    return Err(e.into());
                }
            };
            match self
                .store
                .compare_and_update_allocation(&resource_id, resource.version, delta)
                .await
            {
                Ok(updated) => break updated,
                Err(StoreError::VersionConflict { .. }) if retries < self.config.max_optimistic_retries => {
                    metrics::counter!(crate::observability::OPTIMISTIC_RETRIES_TOTAL).increment(1);
                    if section.lock.renew(self.config.lock_lease).await.is_err() {
                        section.lock.release().await;
                        return Err(ReservationError::ConcurrentModification {
                            resource_id,
                            attempts: retries + 1,
                        });
                    }
                    retries += 1;
                }
                Err(StoreError::VersionConflict { .. }) => {
                    section.lock.release().await;
                    return Err(ReservationError::ConcurrentModification {
                        resource_id,
                        attempts: retries + 1,
                    });
                }
                Err(e) => {
                    // A CapacityViolation here means allocated has drifted below
                    // the confirmed ledger; reconciliation repairs it.
                    tracing::error!(
                        reservation_id = %reservation.id,
                        resource_id = %resource_id,
                        "capacity release failed: {e}"
                    );
                    section.lock.release().await;
                    return Err(ReservationError::StoreUnavailable(e.to_string()));
                }
            }
        };

        let cancelled = match self
            .store
            .update_reservation_status(reservation.id, ReservationStatus::Cancelled, now_ms())
            .await
        {
            Ok(cancelled) => cancelled,
            Err(e) => {
                tracing::error!(
                    reservation_id = %reservation.id,
                    "could not mark reservation CANCELLED, restoring allocation: {e}"
                );
                match self
                    .store
                    .compare_and_update_allocation(&resource_id, updated.version, -delta)
                    .await
                {
                    Ok(restored) => self.refresh_cache(&restored).await,
                    Err(restore) => tracing::error!(resource_id = %resource_id, "restore failed: {restore}"),
                }
                section.lock.release().await;
                return Err(e.into());
            }
        };

        self.refresh_cache(&updated).await;
        section.lock.release().await;
        tracing::debug!(
            reservation_id = %reservation.id,
            resource_id = %resource_id,
            quantity = reservation.quantity,
            version = updated.version,
            "CANCELLED"
        );
        Ok(CancelReceipt {
            reservation_id: cancelled.id,
            status: cancelled.status,
        })
    }
}
