use std::time::Duration;

use rand::Rng;

use super::{ReservationEngine, ReservationError, ReserveReceipt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveRequest {
    pub resource_id: String,
    pub requester_id: String,
    pub quantity: u32,
}

impl ReserveRequest {
    pub fn new(resource_id: impl Into<String>, requester_id: impl Into<String>, quantity: u32) -> Self {
        Self {
            resource_id: resource_id.into(),
            requester_id: requester_id.into(),
            quantity,
        }
    }
}

/// Exponential backoff with jitter for retryable reservation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(20),
            max: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1` (attempts count from 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX));
        let capped = exp.min(self.max);
        let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 2);
        capped + Duration::from_millis(jitter_ms)
    }
}

impl ReservationEngine {
    /// `reserve`, re-run while the failure is retryable and attempts remain.
    /// Returns the last receipt; only its FAILED record is persisted.
    pub async fn reserve_with_retry(
        &self,
        request: &ReserveRequest,
        policy: &RetryPolicy,
    ) -> Result<ReserveReceipt, ReservationError> {
        let mut attempt = 1;
        loop {
            let last = attempt >= policy.max_attempts;
            let receipt = self
                .reserve_recorded(&request.resource_id, &request.requester_id, request.quantity, last)
                .await?;
            let retryable = receipt
                .reason
                .as_ref()
                .is_some_and(ReservationError::is_retryable);
            if !retryable || last {
                return Ok(receipt);
            }
            let delay = policy.backoff(attempt);
            tracing::debug!(
                resource_id = %request.resource_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying reservation"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
