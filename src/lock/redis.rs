//! Redis-backed lock manager.
//!
//! Only available with the `redis` feature. Acquire is `SET NX PX`; renew and
//! release are compare-and-act scripts keyed by the acquisition token, so a
//! holder whose lease expired can never extend or delete its successor's lock.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::Client;
use tokio::time::Instant;
use ulid::Ulid;

use crate::model::{LockToken, ResourceId};

use super::{LockError, LockManager};

const RENEW_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('PEXPIRE', KEYS[1], ARGV[2])
    end
    return 0
"#;

const RELEASE_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

const POLL_BASE: Duration = Duration::from_millis(5);
const POLL_MAX: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct RedisLockManager {
    conn_manager: ConnectionManager,
}

impl RedisLockManager {
    pub async fn new(redis_url: &str) -> Result<Self, LockError> {
        let client = Client::open(redis_url)
            .map_err(|e| LockError::Backend(format!("failed to create Redis client: {e}")))?;
        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            LockError::Backend(format!("failed to create Redis connection manager: {e}"))
        })?;
        Ok(Self { conn_manager })
    }

    fn lock_key(resource_id: &ResourceId) -> String {
        format!("reservation:lock:{resource_id}")
    }

    fn lease_ms(lease: Duration) -> u64 {
        (lease.as_millis() as u64).max(1)
    }

    async fn try_set(&self, key: &str, token: &Ulid, lease: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn_manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token.to_string())
            .arg("NX")
            .arg("PX")
            .arg(Self::lease_ms(lease))
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(format!("SET NX failed: {e}")))?;
        Ok(reply.is_some())
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire(
        &self,
        resource_id: &ResourceId,
        holder: &str,
        lease: Duration,
        wait: Duration,
    ) -> Result<LockToken, LockError> {
        let key = Self::lock_key(resource_id);
        let token = Ulid::new();
        let start = Instant::now();
        let deadline = start + wait;
        let mut backoff = POLL_BASE;

        loop {
            // Measured before the round-trip so our view of the lease never outlives Redis's.
            let attempt_at = Instant::now();
            if self.try_set(&key, &token, lease).await? {
                return Ok(LockToken {
                    resource_id: resource_id.clone(),
                    holder: holder.to_string(),
                    token,
                    expires_at: attempt_at + lease,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Unavailable {
                    resource_id: resource_id.clone(),
                    waited: start.elapsed(),
                });
            }
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=5));
            let delay = (backoff + jitter).min(deadline - now);
            tokio::time::sleep(delay).await;
            backoff = backoff.saturating_mul(2).min(POLL_MAX);
        }
    }

    async fn renew(&self, token: &LockToken, lease: Duration) -> Result<LockToken, LockError> {
        let mut conn = self.conn_manager.clone();
        let attempt_at = Instant::now();
        let renewed: i64 = redis::Script::new(RENEW_SCRIPT)
            .key(Self::lock_key(&token.resource_id))
            .arg(token.token.to_string())
            .arg(Self::lease_ms(lease))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(format!("renew script failed: {e}")))?;
        if renewed == 0 {
            return Err(LockError::Expired(token.resource_id.clone()));
        }
        Ok(LockToken {
            expires_at: attempt_at + lease,
            ..token.clone()
        })
    }

    async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        let mut conn = self.conn_manager.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(Self::lock_key(&token.resource_id))
            .arg(token.token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(format!("release script failed: {e}")))?;
        if deleted == 0 {
            tracing::debug!(resource_id = %token.resource_id, "release found no live lease");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(5);

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into())
    }

    fn fresh_id() -> ResourceId {
        ResourceId::parse(&format!("lock-test-{}", Ulid::new())).unwrap()
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn second_holder_waits_then_gives_up() {
        let locks = RedisLockManager::new(&redis_url()).await.unwrap();
        let id = fresh_id();
        let a = locks.acquire(&id, "a", LEASE, Duration::ZERO).await.unwrap();

        let err = locks
            .acquire(&id, "b", LEASE, Duration::from_millis(60))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Unavailable { .. }), "{err}");

        locks.release(&a).await.unwrap();
        let b = locks.acquire(&id, "b", LEASE, Duration::ZERO).await.unwrap();
        locks.release(&b).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn expired_holder_cannot_touch_its_successor() {
        let locks = RedisLockManager::new(&redis_url()).await.unwrap();
        let id = fresh_id();
        let stale = locks
            .acquire(&id, "a", Duration::from_millis(50), Duration::ZERO)
            .await
            .unwrap();
        let successor = locks
            .acquire(&id, "b", LEASE, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(
            locks.renew(&stale, LEASE).await.unwrap_err(),
            LockError::Expired(id.clone())
        );
        // A stale release is a no-op; the successor still owns the key.
        locks.release(&stale).await.unwrap();
        let err = locks
            .acquire(&id, "c", LEASE, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Unavailable { .. }), "{err}");

        let renewed = locks.renew(&successor, LEASE).await.unwrap();
        assert!(renewed.expires_at >= successor.expires_at);
        locks.release(&renewed).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn renew_keeps_a_live_lease() {
        let locks = RedisLockManager::new(&redis_url()).await.unwrap();
        let id = fresh_id();
        let token = locks
            .acquire(&id, "a", Duration::from_millis(100), Duration::ZERO)
            .await
            .unwrap();
        let token = locks.renew(&token, Duration::from_millis(400)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let err = locks
            .acquire(&id, "b", LEASE, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Unavailable { .. }), "{err}");
        locks.release(&token).await.unwrap();
    }
}
