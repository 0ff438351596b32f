//! PostgreSQL-backed [`ResourceStore`] for multi-instance deployments.
//!
//! Only available with the `postgres` feature. The compare-and-update is a
//! single conditional `UPDATE ... RETURNING`, so the version check, the
//! capacity bounds and the bump happen atomically in the database.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use ulid::Ulid;

use crate::model::*;

use super::{ResourceStore, StoreError};

const FOREIGN_KEY_VIOLATION: &str = "23503";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS resources (
        id TEXT PRIMARY KEY,
        category TEXT NOT NULL,
        total BIGINT NOT NULL CHECK (total >= 0),
        allocated BIGINT NOT NULL DEFAULT 0,
        version BIGINT NOT NULL DEFAULT 0,
        CHECK (allocated >= 0 AND allocated <= total)
    )",
    "CREATE TABLE IF NOT EXISTS reservations (
        id TEXT PRIMARY KEY,
        resource_id TEXT NOT NULL REFERENCES resources(id),
        requester_id TEXT NOT NULL,
        quantity BIGINT NOT NULL CHECK (quantity > 0),
        status TEXT NOT NULL,
        created_at BIGINT NOT NULL,
        resolved_at BIGINT
    )",
    "CREATE INDEX IF NOT EXISTS reservations_resource_status
        ON reservations (resource_id, status)",
];

pub struct PgStore {
    pool: PgPool,
}

fn unavailable(operation: &str, e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(format!("{operation}: {e}"))
}

/// Counts live in BIGINT columns; anything outside `u32` is a corrupt row.
fn count(column: &str, value: i64) -> Result<u32, StoreError> {
    u32::try_from(value)
        .map_err(|_| StoreError::Unavailable(format!("{column} out of range: {value}")))
}

fn resource_from_row(row: &PgRow) -> Result<Resource, StoreError> {
    let get = |e: sqlx::Error| unavailable("decode resource", e);
    let id: String = row.try_get("id").map_err(get)?;
    let total: i64 = row.try_get("total").map_err(get)?;
    let allocated: i64 = row.try_get("allocated").map_err(get)?;
    let version: i64 = row.try_get("version").map_err(get)?;
    Ok(Resource {
        id: ResourceId::parse(&id).map_err(|e| StoreError::Unavailable(e.into()))?,
        category: row.try_get("category").map_err(get)?,
        total: count("total", total)?,
        allocated: count("allocated", allocated)?,
        version: u64::try_from(version)
            .map_err(|_| StoreError::Unavailable(format!("version out of range: {version}")))?,
    })
}

fn reservation_from_row(row: &PgRow) -> Result<Reservation, StoreError> {
    let get = |e: sqlx::Error| unavailable("decode reservation", e);
    let id: String = row.try_get("id").map_err(get)?;
    let resource_id: String = row.try_get("resource_id").map_err(get)?;
    let quantity: i64 = row.try_get("quantity").map_err(get)?;
    let status: String = row.try_get("status").map_err(get)?;
    Ok(Reservation {
        id: Ulid::from_string(&id).map_err(|e| StoreError::Unavailable(e.to_string()))?,
        resource_id: ResourceId::parse(&resource_id)
            .map_err(|e| StoreError::Unavailable(e.into()))?,
        requester_id: row.try_get("requester_id").map_err(get)?,
        quantity: count("quantity", quantity)?,
        status: ReservationStatus::parse(&status)
            .ok_or_else(|| StoreError::Unavailable(format!("unknown status {status}")))?,
        created_at: row.try_get("created_at").map_err(get)?,
        resolved_at: row.try_get("resolved_at").map_err(get)?,
    })
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(url)
            .await
            .map_err(|e| unavailable("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| unavailable("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for PgStore {
    async fn create_resource(&self, resource: Resource) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO resources (id, category, total, allocated, version)
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (id) DO NOTHING",
        )
        .bind(resource.id.as_str())
        .bind(&resource.category)
        .bind(i64::from(resource.total))
        .bind(i64::from(resource.allocated))
        .bind(resource.version as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| unavailable("create_resource", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(resource.id.to_string()));
        }
        Ok(())
    }

    async fn read_resource(&self, id: &ResourceId) -> Result<Resource, StoreError> {
        let row = sqlx::query(
            "SELECT id, category, total, allocated, version FROM resources WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| unavailable("read_resource", e))?
        .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        resource_from_row(&row)
    }

    async fn compare_and_update_allocation(
        &self,
        id: &ResourceId,
        expected_version: u64,
        delta: i64,
    ) -> Result<Resource, StoreError> {
        let updated = sqlx::query(
            "UPDATE resources
             SET allocated = allocated + $3, version = version + 1
             WHERE id = $1 AND version = $2 AND allocated + $3 BETWEEN 0 AND total
             RETURNING id, category, total, allocated, version",
        )
        .bind(id.as_str())
        .bind(expected_version as i64)
        .bind(delta)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| unavailable("compare_and_update_allocation", e))?;

        if let Some(row) = updated {
            return resource_from_row(&row);
        }

        // No row matched: work out which guard failed.
        let current = self.read_resource(id).await?;
        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                resource_id: id.clone(),
                expected: expected_version,
                actual: current.version,
            });
        }
        Err(StoreError::CapacityViolation {
            resource_id: id.clone(),
            allocated: current.allocated,
            total: current.total,
            delta,
        })
    }

    async fn write_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO reservations
                (id, resource_id, requester_id, quantity, status, created_at, resolved_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT (id) DO NOTHING",
        )
        .bind(reservation.id.to_string())
        .bind(reservation.resource_id.as_str())
        .bind(&reservation.requester_id)
        .bind(i64::from(reservation.quantity))
        .bind(reservation.status.as_str())
        .bind(reservation.created_at)
        .bind(reservation.resolved_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => {
                Err(StoreError::AlreadyExists(reservation.id.to_string()))
            }
            Ok(_) => Ok(()),
            Err(e)
                if e.as_database_error()
                    .and_then(|d| d.code())
                    .is_some_and(|c| c == FOREIGN_KEY_VIOLATION) =>
            {
                Err(StoreError::NotFound(reservation.resource_id.clone()))
            }
            Err(e) => Err(unavailable("write_reservation", e)),
        }
    }

    async fn read_reservation(&self, id: Ulid) -> Result<Reservation, StoreError> {
        let row = sqlx::query(
            "SELECT id, resource_id, requester_id, quantity, status, created_at, resolved_at
             FROM reservations WHERE id = $1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| unavailable("read_reservation", e))?
        .ok_or(StoreError::ReservationNotFound(id))?;
        reservation_from_row(&row)
    }

    async fn update_reservation_status(
        &self,
        id: Ulid,
        status: ReservationStatus,
        at: Ms,
    ) -> Result<Reservation, StoreError> {
        let current = self.read_reservation(id).await?;
        if current.status == status {
            return Ok(current);
        }
        if !current.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                id,
                from: current.status,
                to: status,
            });
        }

        // Conditional on the status we validated against.
        let updated = sqlx::query(
            "UPDATE reservations SET status = $1, resolved_at = $2
             WHERE id = $3 AND status = $4
             RETURNING id, resource_id, requester_id, quantity, status, created_at, resolved_at",
        )
        .bind(status.as_str())
        .bind(at)
        .bind(id.to_string())
        .bind(current.status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| unavailable("update_reservation_status", e))?;

        match updated {
            Some(row) => reservation_from_row(&row),
            None => {
                let now = self.read_reservation(id).await?;
                if now.status == status {
                    Ok(now)
                } else {
                    Err(StoreError::InvalidTransition {
                        id,
                        from: now.status,
                        to: status,
                    })
                }
            }
        }
    }

    async fn list_resources(&self) -> Result<Vec<ResourceId>, StoreError> {
        let rows = sqlx::query("SELECT id FROM resources ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| unavailable("list_resources", e))?;
        rows.iter()
            .map(|row| {
                let id: String = row
                    .try_get("id")
                    .map_err(|e| unavailable("decode resource id", e))?;
                ResourceId::parse(&id).map_err(|e| StoreError::Unavailable(e.into()))
            })
            .collect()
    }

    async fn confirmed_quantity(&self, id: &ResourceId) -> Result<u64, StoreError> {
        // Distinguish "no reservations" from "no resource".
        self.read_resource(id).await?;
        let row = sqlx::query(
            "SELECT COALESCE(SUM(quantity), 0)::BIGINT AS confirmed
             FROM reservations WHERE resource_id = $1 AND status = 'CONFIRMED'",
        )
        .bind(id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| unavailable("confirmed_quantity", e))?;
        let confirmed: i64 = row
            .try_get("confirmed")
            .map_err(|e| unavailable("decode confirmed", e))?;
        Ok(confirmed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_outside_u32_are_rejected() {
        assert_eq!(count("total", 0).unwrap(), 0);
        assert_eq!(count("total", u32::MAX as i64).unwrap(), u32::MAX);
        assert!(matches!(count("total", -1), Err(StoreError::Unavailable(_))));
        assert!(matches!(
            count("allocated", u32::MAX as i64 + 1),
            Err(StoreError::Unavailable(_))
        ));
    }
}
