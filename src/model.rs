use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::MAX_RESOURCE_ID_LEN;

/// Unix milliseconds. The only wall-clock type.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Identifier of an allocatable resource (route, segment, vehicle slot...).
///
/// Used verbatim in lock and cache keys, so it is restricted to
/// `[A-Za-z0-9_.:-]` and bounded in length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn parse(raw: &str) -> Result<Self, &'static str> {
        if raw.is_empty() {
            return Err("resource id is empty");
        }
        if raw.len() > MAX_RESOURCE_ID_LEN {
            return Err("resource id too long");
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
        {
            return Err("resource id contains invalid characters");
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable row: total capacity and how much of it is allocated.
///
/// `allocated <= total` always holds; `version` moves by exactly one per
/// successful mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub category: String,
    pub total: u32,
    pub allocated: u32,
    pub version: u64,
}

impl Resource {
    pub fn new(id: ResourceId, category: impl Into<String>, total: u32) -> Self {
        Self {
            id,
            category: category.into(),
            total,
            allocated: 0,
            version: 0,
        }
    }

    pub fn available(&self) -> u32 {
        self.total.saturating_sub(self.allocated)
    }

    /// The allocated count after applying `delta`, or `None` if it would leave `[0, total]`.
    pub fn allocation_after(&self, delta: i64) -> Option<u32> {
        let next = self.allocated as i64 + delta;
        if next < 0 || next > self.total as i64 {
            return None;
        }
        Some(next as u32)
    }

    pub fn snapshot(&self) -> AvailabilitySnapshot {
        AvailabilitySnapshot {
            total: self.total,
            allocated: self.allocated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Failed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::Failed => "FAILED",
            ReservationStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ReservationStatus::Pending),
            "CONFIRMED" => Some(ReservationStatus::Confirmed),
            "FAILED" => Some(ReservationStatus::Failed),
            "CANCELLED" => Some(ReservationStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Pending)
    }

    /// Legal lifecycle moves: PENDING → CONFIRMED | FAILED, CONFIRMED → CANCELLED.
    pub fn can_transition_to(&self, next: ReservationStatus) -> bool {
        matches!(
            (self, next),
            (ReservationStatus::Pending, ReservationStatus::Confirmed)
                | (ReservationStatus::Pending, ReservationStatus::Failed)
                | (ReservationStatus::Confirmed, ReservationStatus::Cancelled)
        )
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A claim against a resource's capacity. References the resource; never owns capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: ResourceId,
    pub requester_id: String,
    pub quantity: u32,
    pub status: ReservationStatus,
    pub created_at: Ms,
    /// When the reservation reached CONFIRMED, FAILED or CANCELLED.
    pub resolved_at: Option<Ms>,
}

impl Reservation {
    pub fn pending(resource_id: ResourceId, requester_id: String, quantity: u32) -> Self {
        Self {
            id: Ulid::new(),
            resource_id,
            requester_id,
            quantity,
            status: ReservationStatus::Pending,
            created_at: now_ms(),
            resolved_at: None,
        }
    }

    /// Move to `next` if the lifecycle allows it. Returns false (and leaves
    /// the reservation untouched) otherwise.
    pub fn transition(&mut self, next: ReservationStatus, at: Ms) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.resolved_at = Some(at);
        true
    }
}

/// Proof of holding the distributed lock on one resource until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub resource_id: ResourceId,
    pub holder: String,
    /// Unique per acquisition; release and renew only act on a matching token.
    pub token: Ulid,
    pub expires_at: tokio::time::Instant,
}

impl LockToken {
    pub fn remaining(&self) -> Duration {
        self.expires_at
            .saturating_duration_since(tokio::time::Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilitySnapshot {
    pub total: u32,
    pub allocated: u32,
}

impl AvailabilitySnapshot {
    pub fn available(&self) -> u32 {
        self.total.saturating_sub(self.allocated)
    }
}

/// Advisory cache value. May be stale until replaced or invalidated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub resource_id: ResourceId,
    pub snapshot: AvailabilitySnapshot,
    /// Resource version the snapshot was derived from.
    pub version: u64,
    pub cached_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilitySource {
    Cache,
    Store,
}

/// Best-effort availability answer for the read API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub resource_id: ResourceId,
    pub total: u32,
    pub available: u32,
    pub as_of_version: u64,
    pub source: AvailabilitySource,
}

/// WAL record format. Flat, one variant per durable mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// Full row; also used as the snapshot record when compacting.
    ResourceCreated { resource: Resource },
    AllocationChanged {
        resource_id: ResourceId,
        delta: i64,
        /// Version after the change.
        version: u64,
    },
    ReservationWritten { reservation: Reservation },
    ReservationStatusChanged {
        id: Ulid,
        status: ReservationStatus,
        at: Ms,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(s: &str) -> ResourceId {
        ResourceId::parse(s).unwrap()
    }

    #[test]
    fn resource_id_validation() {
        assert!(ResourceId::parse("R1").is_ok());
        assert!(ResourceId::parse("route:ICN-GMP.seg_2").is_ok());
        assert_eq!(ResourceId::parse(""), Err("resource id is empty"));
        assert!(ResourceId::parse("has space").is_err());
        assert!(ResourceId::parse("slash/bad").is_err());
        let long = "x".repeat(MAX_RESOURCE_ID_LEN + 1);
        assert_eq!(ResourceId::parse(&long), Err("resource id too long"));
    }

    #[test]
    fn allocation_bounds() {
        let mut r = Resource::new(rid("R1"), "route", 10);
        assert_eq!(r.allocation_after(10), Some(10));
        assert_eq!(r.allocation_after(11), None);
        assert_eq!(r.allocation_after(-1), None); // never below zero
        r.allocated = 4;
        assert_eq!(r.available(), 6);
        assert_eq!(r.allocation_after(-4), Some(0));
        assert_eq!(r.allocation_after(6), Some(10));
    }

    #[test]
    fn zero_capacity_resource() {
        let r = Resource::new(rid("empty"), "route", 0);
        assert_eq!(r.available(), 0);
        assert_eq!(r.allocation_after(1), None);
        assert_eq!(r.allocation_after(0), Some(0));
    }

    #[test]
    fn lifecycle_transitions() {
        let mut res = Reservation::pending(rid("R1"), "alice".into(), 2);
        assert!(res.resolved_at.is_none());
        assert!(!res.transition(ReservationStatus::Cancelled, 1)); // not confirmed yet
        assert!(res.transition(ReservationStatus::Confirmed, 5));
        assert_eq!(res.resolved_at, Some(5));
        assert!(!res.transition(ReservationStatus::Failed, 6));
        assert!(res.transition(ReservationStatus::Cancelled, 7));
        assert_eq!(res.status, ReservationStatus::Cancelled);
        assert!(!res.transition(ReservationStatus::Cancelled, 8));
        assert_eq!(res.resolved_at, Some(7));
    }

    #[test]
    fn failed_is_terminal() {
        let mut res = Reservation::pending(rid("R1"), "bob".into(), 1);
        assert!(res.transition(ReservationStatus::Failed, 1));
        assert!(res.status.is_terminal());
        assert!(!res.transition(ReservationStatus::Confirmed, 2));
        assert!(!res.transition(ReservationStatus::Cancelled, 2));
    }

    #[test]
    fn status_text_roundtrip() {
        for s in [
            ReservationStatus::Pending,
            ReservationStatus::Confirmed,
            ReservationStatus::Failed,
            ReservationStatus::Cancelled,
        ] {
            assert_eq!(ReservationStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(ReservationStatus::parse("confirmed"), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AllocationChanged {
            resource_id: rid("R1"),
            delta: -3,
            version: 7,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn cache_entry_json_has_top_level_version() {
        // The Redis monotonic-put script reads `version` straight off the JSON.
        let entry = CacheEntry {
            resource_id: rid("R1"),
            snapshot: AvailabilitySnapshot { total: 10, allocated: 6 },
            version: 4,
            cached_at: 0,
        };
        let json: serde_json::Value = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["version"], 4);
        assert_eq!(json["resource_id"], "R1");
    }
}
