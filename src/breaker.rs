use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Successful trial requests needed in half-open before the breaker closes again.
pub const HALF_OPEN_SUCCESSES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Gauge encoding for `seatlock_circuit_breaker_state`.
    pub fn as_gauge(&self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::Open => 1.0,
            BreakerState::HalfOpen => 2.0,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

/// Trips after `failure_threshold` consecutive failures, rejects for
/// `open_timeout`, then lets trial requests through until enough succeed.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    open_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, open_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            open_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
            }),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        // State is a handful of counters; a panic mid-update can't corrupt it.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: BreakerState) {
        metrics::gauge!(crate::observability::CIRCUIT_BREAKER_STATE, "breaker" => self.name.clone())
            .set(state.as_gauge());
    }

    /// Whether a call may go to the backend now. Moves OPEN → HALF_OPEN once
    /// the open timeout has elapsed.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.open_timeout)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    drop(inner);
                    tracing::warn!(breaker = %self.name, "circuit half-open, probing backend");
                    self.publish(BreakerState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner();
        inner.consecutive_failures = 0;
        if inner.state == BreakerState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= HALF_OPEN_SUCCESSES {
                inner.state = BreakerState::Closed;
                inner.half_open_successes = 0;
                inner.opened_at = None;
                drop(inner);
                tracing::warn!(breaker = %self.name, "circuit closed");
                self.publish(BreakerState::Closed);
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner();
        inner.consecutive_failures += 1;
        let trip = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.consecutive_failures >= self.failure_threshold,
            BreakerState::Open => false,
        };
        if trip {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.half_open_successes = 0;
            let failures = inner.consecutive_failures;
            drop(inner);
            tracing::warn!(breaker = %self.name, failures, "circuit opened");
            self.publish(BreakerState::Open);
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner().state
    }

    pub fn reset(&self) {
        let mut inner = self.inner();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.opened_at = None;
        drop(inner);
        self.publish(BreakerState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_threshold() {
        let b = CircuitBreaker::new("test", 3, Duration::from_secs(60));
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.allow_request());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow_request());
    }

    #[test]
    fn success_resets_failure_streak() {
        let b = CircuitBreaker::new("test", 2, Duration::from_secs(60));
        b.record_failure();
        b.record_success();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_closes_after_trial_successes() {
        let b = CircuitBreaker::new("test", 1, Duration::from_millis(20));
        b.record_failure();
        assert!(!b.allow_request());
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(b.allow_request());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        for _ in 0..HALF_OPEN_SUCCESSES - 1 {
            b.record_success();
            assert_eq!(b.state(), BreakerState::HalfOpen);
        }
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let b = CircuitBreaker::new("test", 5, Duration::from_millis(20));
        for _ in 0..5 {
            b.record_failure();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(b.allow_request());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow_request());
    }

    #[test]
    fn reset_closes() {
        let b = CircuitBreaker::new("test", 1, Duration::from_secs(60));
        b.record_failure();
        b.reset();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.allow_request());
    }
}
