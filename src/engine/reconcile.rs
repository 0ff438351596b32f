use tokio::time::Instant;
use ulid::Ulid;

use crate::model::*;

use super::{ReservationEngine, ReservationError};

/// What one sweep over every resource found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub corrected: usize,
    /// Resources skipped because the lock was busy or the store failed.
    pub skipped: usize,
}

impl ReservationEngine {
    /// Under the resource's lock, make `allocated` equal the sum of CONFIRMED
    /// quantities. Returns the delta applied, if any.
    ///
    /// Drift only appears after a crash or store failure between the
    /// allocation update and the reservation write.
    pub async fn reconcile(&self, resource_id: &ResourceId) -> Result<Option<i64>, ReservationError> {
        let operation_id = Ulid::new();
        let deadline = Instant::now() + self.config.operation_timeout;
        let section = self
            .enter_critical_section(resource_id, &operation_id, deadline)
            .await?;

        let result = async {
            let resource = self.store.read_resource(resource_id).await?;
            let confirmed = self.store.confirmed_quantity(resource_id).await?;
            let target = if confirmed > resource.total as u64 {
                tracing::error!(
                    resource_id = %resource_id,
                    confirmed,
                    total = resource.total,
                    "confirmed reservations exceed capacity; clamping allocation to total"
                );
                resource.total
            } else {
                confirmed as u32
            };
            let delta = target as i64 - resource.allocated as i64;
            if delta == 0 {
                return Ok(None);
            }

            let updated = self
                .store
                .compare_and_update_allocation(resource_id, resource.version, delta)
                .await?;
            metrics::counter!(crate::observability::RECONCILE_CORRECTIONS_TOTAL).increment(1);
            tracing::warn!(
                resource_id = %resource_id,
                from = resource.allocated,
                to = updated.allocated,
                version = updated.version,
                "reconciled allocation with confirmed reservations"
            );
            self.refresh_cache(&updated).await;
            Ok::<_, ReservationError>(Some(delta))
        }
        .await;

        section.lock.release().await;
        result
    }

    /// Reconcile every resource in the store. Per-resource failures are
    /// logged and counted as skipped.
    pub async fn reconcile_all(&self) -> Result<ReconcileReport, ReservationError> {
        let mut report = ReconcileReport::default();
        for resource_id in self.store.list_resources().await? {
            report.checked += 1;
            match self.reconcile(&resource_id).await {
                Ok(Some(_)) => report.corrected += 1,
                Ok(None) => {}
                Err(ReservationError::LockContention { .. }) => {
                    tracing::debug!(resource_id = %resource_id, "reconcile skipped: resource busy");
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::warn!(resource_id = %resource_id, "reconcile failed: {e}");
                    report.skipped += 1;
                }
            }
        }
        Ok(report)
    }
}
