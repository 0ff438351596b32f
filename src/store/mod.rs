//! Resource Store: the single source of truth for capacity and reservations.

mod wal_store;
#[cfg(feature = "postgres")]
mod postgres;

pub use wal_store::WalStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::{Ms, Reservation, ReservationStatus, Resource, ResourceId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(ResourceId),
    ReservationNotFound(Ulid),
    AlreadyExists(String),
    VersionConflict {
        resource_id: ResourceId,
        expected: u64,
        actual: u64,
    },
    /// The delta would take `allocated` outside `[0, total]`.
    CapacityViolation {
        resource_id: ResourceId,
        allocated: u32,
        total: u32,
        delta: i64,
    },
    InvalidTransition {
        id: Ulid,
        from: ReservationStatus,
        to: ReservationStatus,
    },
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "resource not found: {id}"),
            StoreError::ReservationNotFound(id) => write!(f, "reservation not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            StoreError::VersionConflict {
                resource_id,
                expected,
                actual,
            } => write!(
                f,
                "version conflict on {resource_id}: expected {expected}, found {actual}"
            ),
            StoreError::CapacityViolation {
                resource_id,
                allocated,
                total,
                delta,
            } => write!(
                f,
                "allocation change {delta:+} on {resource_id} leaves [0, {total}] (allocated {allocated})"
            ),
            StoreError::InvalidTransition { id, from, to } => {
                write!(f, "reservation {id}: illegal transition {from} -> {to}")
            }
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Durable storage of resources and reservations.
///
/// `compare_and_update_allocation` is the only way `allocated` changes and
/// must succeed only when the stored version equals `expected_version`,
/// bumping it by exactly one.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Administrative seeding. Fails with `AlreadyExists` on a duplicate id.
    async fn create_resource(&self, resource: Resource) -> Result<(), StoreError>;

    async fn read_resource(&self, id: &ResourceId) -> Result<Resource, StoreError>;

    async fn compare_and_update_allocation(
        &self,
        id: &ResourceId,
        expected_version: u64,
        delta: i64,
    ) -> Result<Resource, StoreError>;

    /// Insert a new reservation record. Fails with `AlreadyExists` on a duplicate id.
    async fn write_reservation(&self, reservation: &Reservation) -> Result<(), StoreError>;

    async fn read_reservation(&self, id: Ulid) -> Result<Reservation, StoreError>;

    /// Move a reservation along its lifecycle. Setting the status it already
    /// has is a no-op; any other illegal move is `InvalidTransition`.
    async fn update_reservation_status(
        &self,
        id: Ulid,
        status: ReservationStatus,
        at: Ms,
    ) -> Result<Reservation, StoreError>;

    async fn list_resources(&self) -> Result<Vec<ResourceId>, StoreError>;

    /// Sum of quantities of CONFIRMED reservations on the resource.
    async fn confirmed_quantity(&self, id: &ResourceId) -> Result<u64, StoreError>;
}
