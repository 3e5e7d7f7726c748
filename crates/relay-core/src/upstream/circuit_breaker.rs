use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Failure bookkeeping and FSM state, updated together under one lock.
#[derive(Debug)]
struct BreakerInner {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    state: CircuitBreakerState,
}

/// Per-endpoint circuit breaker.
///
/// Keeps one misbehaving URL of a provider from eating every endpoint attempt while the
/// other URLs of the same provider are still fine. Provider-level health is tracked
/// separately by the strategy.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    threshold: u32,
    cooldown: Duration,
}

/// Circuit breaker state machine.
///
/// - `Closed` -> `Open`: consecutive failures reach the threshold
/// - `Open` -> `HalfOpen`: cooldown elapsed, one probe request allowed
/// - `HalfOpen` -> `Closed` on success, back to `Open` on failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                consecutive_failures: 0,
                opened_at: None,
                state: CircuitBreakerState::Closed,
            }),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    /// Returns `true` if a request may be sent, moving `Open` to `HalfOpen` once the
    /// cooldown has elapsed.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen => true,
            CircuitBreakerState::Open => {
                let cooled_down =
                    inner.opened_at.map_or(true, |opened| opened.elapsed() >= self.cooldown);
                if cooled_down {
                    inner.state = CircuitBreakerState::HalfOpen;
                    tracing::debug!("circuit breaker half-open");
                }
                cooled_down
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if inner.state != CircuitBreakerState::Closed {
            inner.state = CircuitBreakerState::Closed;
            inner.opened_at = None;
            tracing::info!("circuit breaker closed after successful request");
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let reopen = inner.state == CircuitBreakerState::HalfOpen;
        if reopen || inner.consecutive_failures >= self.threshold {
            if inner.state != CircuitBreakerState::Open {
                tracing::warn!(
                    failures = inner.consecutive_failures,
                    threshold = self.threshold,
                    "circuit breaker opened"
                );
            }
            inner.state = CircuitBreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    #[must_use]
    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }
}
