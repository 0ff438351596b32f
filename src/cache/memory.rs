use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::model::{now_ms, AvailabilitySnapshot, CacheEntry, ResourceId};

use super::{AvailabilityCache, CacheError};

/// Process-local availability cache. Entries older than the TTL ceiling are
/// treated as misses and dropped on read.
#[derive(Debug)]
pub struct InMemoryCache {
    entries: DashMap<ResourceId, CacheEntry>,
    ttl_ceiling: Duration,
}

impl InMemoryCache {
    pub fn new(ttl_ceiling: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl_ceiling,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl AvailabilityCache for InMemoryCache {
    async fn get(&self, resource_id: &ResourceId) -> Result<Option<CacheEntry>, CacheError> {
        let ttl_ms = self.ttl_ceiling.as_millis() as i64;
        let now = now_ms();
        match self.entries.get(resource_id) {
            None => return Ok(None),
            Some(e) if now - e.cached_at < ttl_ms => return Ok(Some(e.clone())),
            Some(_) => {}
        }
        // Read guard is gone; a fresher concurrent put survives the check.
        self.entries
            .remove_if(resource_id, |_, e| now - e.cached_at >= ttl_ms);
        Ok(None)
    }

    async fn put(
        &self,
        resource_id: &ResourceId,
        snapshot: AvailabilitySnapshot,
        version: u64,
    ) -> Result<(), CacheError> {
        let entry = CacheEntry {
            resource_id: resource_id.clone(),
            snapshot,
            version,
            cached_at: now_ms(),
        };
        self.entries
            .entry(resource_id.clone())
            .and_modify(|current| {
                if current.version <= version {
                    *current = entry.clone();
                }
            })
            .or_insert(entry);
        Ok(())
    }

    async fn invalidate(&self, resource_id: &ResourceId) -> Result<(), CacheError> {
        self.entries.remove(resource_id);
        Ok(())
    }
}
