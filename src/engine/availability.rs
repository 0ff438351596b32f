use crate::model::*;

use super::{ReservationEngine, ReservationError};

impl ReservationEngine {
    /// Best-effort availability, served from the cache when possible.
    /// On a miss the store is read and the cache populated. Takes no lock.
    pub async fn get_availability(&self, resource_id: &str) -> Result<Availability, ReservationError> {
        let resource_id = ResourceId::parse(resource_id)
            .map_err(|e| ReservationError::InvalidRequest(e.to_string()))?;

        match self.cache.get(&resource_id).await {
            Ok(Some(entry)) => {
                metrics::counter!(crate::observability::CACHE_LOOKUPS_TOTAL, "result" => "hit")
                    .increment(1);
                return Ok(Availability {
                    resource_id,
                    total: entry.snapshot.total,
                    available: entry.snapshot.available(),
                    as_of_version: entry.version,
                    source: AvailabilitySource::Cache,
                });
            }
            Ok(None) => {
                metrics::counter!(crate::observability::CACHE_LOOKUPS_TOTAL, "result" => "miss")
                    .increment(1);
            }
            Err(e) => {
                metrics::counter!(crate::observability::CACHE_LOOKUPS_TOTAL, "result" => "error")
                    .increment(1);
                tracing::warn!(resource_id = %resource_id, "cache lookup failed, reading store: {e}");
            }
        }

        let resource = self.store.read_resource(&resource_id).await?;
        if let Err(e) = self
            .cache
            .put(&resource_id, resource.snapshot(), resource.version)
            .await
        {
            tracing::warn!(resource_id = %resource_id, "cache populate failed: {e}");
        }
        Ok(Availability {
            resource_id,
            total: resource.total,
            available: resource.available(),
            as_of_version: resource.version,
            source: AvailabilitySource::Store,
        })
    }
}
