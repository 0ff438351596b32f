use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::model::{LockToken, ResourceId};

use super::{LockError, LockManager};

/// Guards a lock backend with a [`CircuitBreaker`]. While the breaker is open
/// acquisition fails fast with [`LockError::CircuitOpen`]; it never proceeds
/// without the lock.
pub struct BreakerLockManager<L> {
    inner: L,
    breaker: Arc<CircuitBreaker>,
}

impl<L: LockManager> BreakerLockManager<L> {
    pub fn new(inner: L, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    fn record<T>(&self, result: &Result<T, LockError>) {
        match result {
            Err(e) if e.is_backend_fault() => self.breaker.record_failure(),
            _ => self.breaker.record_success(),
        }
    }
}

#[async_trait]
impl<L: LockManager> LockManager for BreakerLockManager<L> {
    async fn acquire(
        &self,
        resource_id: &ResourceId,
        holder: &str,
        lease: Duration,
        wait: Duration,
    ) -> Result<LockToken, LockError> {
        if !self.breaker.allow_request() {
            return Err(LockError::CircuitOpen);
        }
        let result = self.inner.acquire(resource_id, holder, lease, wait).await;
        self.record(&result);
        result
    }

    async fn renew(&self, token: &LockToken, lease: Duration) -> Result<LockToken, LockError> {
        // A holder keeps talking to the backend even when the breaker is open:
        // failing its renewal would only strand the lease.
        let result = self.inner.renew(token, lease).await;
        self.record(&result);
        result
    }

    async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        let result = self.inner.release(token).await;
        self.record(&result);
        result
    }
}
