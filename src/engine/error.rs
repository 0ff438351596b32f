use std::time::Duration;

use ulid::Ulid;

use crate::lock::LockError;
use crate::model::ResourceId;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationError {
    InvalidRequest(String),
    ResourceNotFound(ResourceId),
    ReservationNotFound(Ulid),
    LockContention {
        resource_id: ResourceId,
        waited: Duration,
    },
    InsufficientCapacity {
        resource_id: ResourceId,
        requested: u32,
        available: u32,
    },
    ConcurrentModification {
        resource_id: ResourceId,
        attempts: u32,
    },
    OperationTimeout {
        resource_id: ResourceId,
        elapsed: Duration,
    },
    StoreUnavailable(String),
}

impl ReservationError {
    /// Transient failures a caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReservationError::LockContention { .. }
                | ReservationError::ConcurrentModification { .. }
                | ReservationError::OperationTimeout { .. }
        )
    }

    /// Failures that still produce a FAILED reservation rather than an
    /// error return.
    pub(crate) fn is_reservation_outcome(&self) -> bool {
        self.is_retryable() || matches!(self, ReservationError::InsufficientCapacity { .. })
    }

    /// Stable metrics label.
    pub fn label(&self) -> &'static str {
        match self {
            ReservationError::InvalidRequest(_) => "invalid_request",
            ReservationError::ResourceNotFound(_) => "resource_not_found",
            ReservationError::ReservationNotFound(_) => "reservation_not_found",
            ReservationError::LockContention { .. } => "lock_contention",
            ReservationError::InsufficientCapacity { .. } => "insufficient_capacity",
            ReservationError::ConcurrentModification { .. } => "concurrent_modification",
            ReservationError::OperationTimeout { .. } => "operation_timeout",
            ReservationError::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

impl std::fmt::Display for ReservationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReservationError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            ReservationError::ResourceNotFound(id) => write!(f, "resource not found: {id}"),
            ReservationError::ReservationNotFound(id) => write!(f, "reservation not found: {id}"),
            ReservationError::LockContention {
                resource_id,
                waited,
            } => write!(
                f,
                "lock contention on {resource_id}: gave up after {}ms",
                waited.as_millis()
            ),
            ReservationError::InsufficientCapacity {
                resource_id,
                requested,
                available,
            } => write!(
                f,
                "insufficient capacity on {resource_id}: requested {requested}, available {available}"
            ),
            ReservationError::ConcurrentModification {
                resource_id,
                attempts,
            } => write!(
                f,
                "concurrent modification of {resource_id} after {attempts} attempts"
            ),
            ReservationError::OperationTimeout {
                resource_id,
                elapsed,
            } => write!(
                f,
                "operation on {resource_id} timed out after {}ms",
                elapsed.as_millis()
            ),
            ReservationError::StoreUnavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for ReservationError {}

impl From<StoreError> for ReservationError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ReservationError::ResourceNotFound(id),
            StoreError::ReservationNotFound(id) => ReservationError::ReservationNotFound(id),
            StoreError::VersionConflict { resource_id, .. } => {
                ReservationError::ConcurrentModification {
                    resource_id,
                    attempts: 1,
                }
            }
            other => ReservationError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<LockError> for ReservationError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Unavailable {
                resource_id,
                waited,
            } => ReservationError::LockContention {
                resource_id,
                waited,
            },
            LockError::Expired(resource_id) => ReservationError::LockContention {
                resource_id,
                waited: Duration::ZERO,
            },
            other => ReservationError::StoreUnavailable(other.to_string()),
        }
    }
}
