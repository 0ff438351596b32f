use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Notify;
use tokio::time::Instant;
use ulid::Ulid;

use crate::model::{LockToken, ResourceId};

use super::{LockError, LockManager};

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    token: Ulid,
    expires_at: Instant,
}

/// Process-local lock manager. Exclusive across every engine sharing the
/// same `Arc`, which makes it the backend for single-node deployments and
/// for multi-engine tests.
#[derive(Debug, Default)]
pub struct InMemoryLockManager {
    leases: DashMap<ResourceId, Lease>,
    released: Notify,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the lock if it is free or its lease has run out. On failure,
    /// returns when the current lease ends.
    fn try_claim(&self, resource_id: &ResourceId, holder: &str, lease: Duration) -> Result<LockToken, Instant> {
        let now = Instant::now();
        let claim = Lease {
            holder: holder.to_string(),
            token: Ulid::new(),
            expires_at: now + lease,
        };
        match self.leases.entry(resource_id.clone()) {
            Entry::Occupied(mut e) => {
                if e.get().expires_at > now {
                    return Err(e.get().expires_at);
                }
                tracing::debug!(
                    resource_id = %resource_id,
                    previous = %e.get().holder,
                    "taking over expired lease"
                );
                e.insert(claim.clone());
            }
            Entry::Vacant(v) => {
                v.insert(claim.clone());
            }
        }
        Ok(LockToken {
            resource_id: resource_id.clone(),
            holder: claim.holder,
            token: claim.token,
            expires_at: claim.expires_at,
        })
    }

    /// Current holder, if the lease is still live.
    pub fn holder(&self, resource_id: &ResourceId) -> Option<String> {
        self.leases
            .get(resource_id)
            .filter(|l| l.expires_at > Instant::now())
            .map(|l| l.holder.clone())
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire(
        &self,
        resource_id: &ResourceId,
        holder: &str,
        lease: Duration,
        wait: Duration,
    ) -> Result<LockToken, LockError> {
        let start = Instant::now();
        let deadline = start + wait;
        loop {
            // Register before checking so a release between the check and
            // the await still wakes us.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let held_until = match self.try_claim(resource_id, holder, lease) {
                Ok(token) => return Ok(token),
                Err(held_until) => held_until,
            };
            if Instant::now() >= deadline {
                return Err(LockError::Unavailable {
                    resource_id: resource_id.clone(),
                    waited: start.elapsed(),
                });
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(held_until.min(deadline)) => {}
            }
        }
    }

    async fn renew(&self, token: &LockToken, lease: Duration) -> Result<LockToken, LockError> {
        let now = Instant::now();
        match self.leases.get_mut(&token.resource_id) {
            Some(mut current) if current.token == token.token && current.expires_at > now => {
                current.expires_at = now + lease;
                Ok(LockToken {
                    expires_at: current.expires_at,
                    ..token.clone()
                })
            }
            _ => Err(LockError::Expired(token.resource_id.clone())),
        }
    }

    async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        let removed = self
            .leases
            .remove_if(&token.resource_id, |_, l| l.token == token.token)
            .is_some();
        if removed {
            self.released.notify_waiters();
        }
        Ok(())
    }
}
