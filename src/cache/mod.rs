//! Cache Layer: advisory availability snapshots, replaced or invalidated on
//! every resource mutation and never trusted to confirm a reservation.

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::InMemoryCache;
#[cfg(feature = "redis")]
pub use self::redis::RedisCache;

use async_trait::async_trait;

use crate::model::{AvailabilitySnapshot, CacheEntry, ResourceId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    Backend(String),
    Serialization(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Backend(e) => write!(f, "cache backend error: {e}"),
            CacheError::Serialization(e) => write!(f, "cache entry serialization error: {e}"),
        }
    }
}

impl std::error::Error for CacheError {}

#[async_trait]
pub trait AvailabilityCache: Send + Sync {
    async fn get(&self, resource_id: &ResourceId) -> Result<Option<CacheEntry>, CacheError>;

    /// Store a snapshot derived from resource `version`. Ignored if the cache
    /// already holds a newer version, so a slow reader can't overwrite a
    /// fresher entry written after a commit.
    async fn put(
        &self,
        resource_id: &ResourceId,
        snapshot: AvailabilitySnapshot,
        version: u64,
    ) -> Result<(), CacheError>;

    async fn invalidate(&self, resource_id: &ResourceId) -> Result<(), CacheError>;
}
