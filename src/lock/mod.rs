//! Distributed Lock Manager: exclusive, leased, renewable locks keyed by resource id.

mod breaker;
mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use breaker::BreakerLockManager;
pub use memory::InMemoryLockManager;
#[cfg(feature = "redis")]
pub use self::redis::RedisLockManager;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::model::{LockToken, ResourceId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Someone else held the lock for the whole wait budget.
    Unavailable {
        resource_id: ResourceId,
        waited: Duration,
    },
    /// The token no longer owns the lease.
    Expired(ResourceId),
    /// The breaker in front of the lock service is open.
    CircuitOpen,
    Backend(String),
}

impl LockError {
    /// Contention and lease loss say the backend is healthy; only these two
    /// are excluded from circuit-breaker failure counts.
    pub fn is_backend_fault(&self) -> bool {
        matches!(self, LockError::Backend(_) | LockError::CircuitOpen)
    }
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Unavailable {
                resource_id,
                waited,
            } => write!(
                f,
                "lock on {resource_id} unavailable after {}ms",
                waited.as_millis()
            ),
            LockError::Expired(id) => write!(f, "lock lease on {id} expired"),
            LockError::CircuitOpen => write!(f, "lock service circuit open"),
            LockError::Backend(e) => write!(f, "lock backend error: {e}"),
        }
    }
}

impl std::error::Error for LockError {}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Block up to `wait` for exclusive ownership of `resource_id`, then hold
    /// it for `lease` unless renewed.
    async fn acquire(
        &self,
        resource_id: &ResourceId,
        holder: &str,
        lease: Duration,
        wait: Duration,
    ) -> Result<LockToken, LockError>;

    /// Extend a still-valid lease to `lease` from now.
    async fn renew(&self, token: &LockToken, lease: Duration) -> Result<LockToken, LockError>;

    /// Give the lock up. A no-op if the lease already expired or was taken over.
    async fn release(&self, token: &LockToken) -> Result<(), LockError>;
}

/// An acquired lock that is released when dropped.
///
/// Prefer [`HeldLock::release`] so the release is awaited; the drop path
/// spawns it onto the current runtime.
pub struct HeldLock {
    manager: Arc<dyn LockManager>,
    token: LockToken,
    released: bool,
}

impl HeldLock {
    pub async fn acquire(
        manager: Arc<dyn LockManager>,
        resource_id: &ResourceId,
        holder: &str,
        lease: Duration,
        wait: Duration,
    ) -> Result<Self, LockError> {
        let token = manager.acquire(resource_id, holder, lease, wait).await?;
        Ok(Self {
            manager,
            token,
            released: false,
        })
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }

    pub async fn renew(&mut self, lease: Duration) -> Result<(), LockError> {
        self.token = self.manager.renew(&self.token, lease).await?;
        Ok(())
    }

    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.manager.release(&self.token).await {
            tracing::warn!(resource_id = %self.token.resource_id, "lock release failed: {e}");
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let manager = self.manager.clone();
        let token = self.token.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = manager.release(&token).await {
                    tracing::warn!(resource_id = %token.resource_id, "deferred lock release failed: {e}");
                }
            });
        }
    }
}
