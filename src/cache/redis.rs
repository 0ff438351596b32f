//! Redis-backed availability cache. Only available with the `redis` feature.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use crate::model::{now_ms, AvailabilitySnapshot, CacheEntry, ResourceId};

use super::{AvailabilityCache, CacheError};

/// Writes only if no stored entry carries a newer version.
const PUT_SCRIPT: &str = r#"
    local current = redis.call('GET', KEYS[1])
    if current then
        local ok, decoded = pcall(cjson.decode, current)
        if ok and type(decoded) == 'table' then
            local stored = tonumber(decoded['version'])
            if stored and stored > tonumber(ARGV[2]) then
                return 0
            end
        end
    end
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[3])
    return 1
"#;

#[derive(Clone)]
pub struct RedisCache {
    conn_manager: ConnectionManager,
    ttl_ceiling: Duration,
}

impl RedisCache {
    pub async fn new(redis_url: &str, ttl_ceiling: Duration) -> Result<Self, CacheError> {
        let client = Client::open(redis_url)
            .map_err(|e| CacheError::Backend(format!("failed to create Redis client: {e}")))?;
        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            CacheError::Backend(format!("failed to create Redis connection manager: {e}"))
        })?;
        Ok(Self {
            conn_manager,
            ttl_ceiling,
        })
    }

    fn cache_key(resource_id: &ResourceId) -> String {
        format!("reservation:availability:{resource_id}")
    }
}

#[async_trait]
impl AvailabilityCache for RedisCache {
    async fn get(&self, resource_id: &ResourceId) -> Result<Option<CacheEntry>, CacheError> {
        let mut conn = self.conn_manager.clone();
        let raw: Option<String> = conn
            .get(Self::cache_key(resource_id))
            .await
            .map_err(|e| CacheError::Backend(format!("GET failed: {e}")))?;
        raw.map(|json| {
            serde_json::from_str(&json).map_err(|e| CacheError::Serialization(e.to_string()))
        })
        .transpose()
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
        let json =
            serde_json::to_string(&entry).map_err(|e| CacheError::Serialization(e.to_string()))?;
        let mut conn = self.conn_manager.clone();
        let written: i64 = redis::Script::new(PUT_SCRIPT)
            .key(Self::cache_key(resource_id))
            .arg(json)
            .arg(version)
            .arg((self.ttl_ceiling.as_millis() as u64).max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(format!("put script failed: {e}")))?;
        if written == 0 {
            tracing::debug!(resource_id = %resource_id, version, "skipped stale cache put");
        }
        Ok(())
    }

    async fn invalidate(&self, resource_id: &ResourceId) -> Result<(), CacheError> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .del(Self::cache_key(resource_id))
            .await
            .map_err(|e| CacheError::Backend(format!("DEL failed: {e}")))?;
        Ok(())
    }
}
