// ============================================================================
// Circuit Breaker
// ============================================================================
//
// One breaker per logical service, guarding calls to that service's
// instances collectively. Prevents cascading failures by rejecting
// requests to a service that keeps failing at the network level.
//
// States:
// - Closed: normal operation, transient failures counted
// - Open: requests rejected immediately
// - Half-Open: a single probe is allowed; success closes, failure reopens
//
// Only network/timeout failures count toward the breaker. Any HTTP-level
// response from the upstream, error status or not, is a handled response
// and records success.
//
// ============================================================================

use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::error::UpstreamError;
use crate::metrics::GATEWAY_CIRCUIT_BREAKER_STATE;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

/// All mutable breaker state lives behind one lock so concurrent
/// transitions cannot observe or produce a torn state.
#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Consecutive transient failures while Closed
    failure_count: u32,
    /// Successful probes while HalfOpen
    success_count: u32,
    /// When the breaker last entered Open
    opened_at: Option<Instant>,
    /// Whether the single HalfOpen probe slot is taken
    probe_in_flight: bool,
    /// When the in-flight probe was admitted. A probe whose caller was
    /// dropped before recording a result releases its slot once
    /// reset_timeout has elapsed since admission.
    probe_started_at: Option<Instant>,
}

/// Circuit breaker for one service
pub struct CircuitBreaker {
    service: String,
    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout: Duration,
    inner: RwLock<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold.max(1),
            reset_timeout: Duration::from_secs(config.reset_timeout_secs),
            inner: RwLock::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                probe_in_flight: false,
                probe_started_at: None,
            }),
        }
    }

    /// Check whether a request may proceed.
    ///
    /// Evaluates the timed Open -> HalfOpen transition lazily here rather
    /// than on a background timer. In HalfOpen only one probe is admitted;
    /// concurrent callers are rejected until its result is recorded.
    pub async fn allow_request(&self) -> Result<(), UpstreamError> {
        let mut inner = self.inner.write().await;

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                if elapsed >= self.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    inner.probe_in_flight = true;
                    inner.probe_started_at = Some(Instant::now());
                    self.set_state_gauge(CircuitState::HalfOpen);
                    tracing::info!(
                        service = %self.service,
                        "Circuit breaker transitioning to half-open, admitting probe"
                    );
                    Ok(())
                } else {
                    Err(UpstreamError::CircuitOpen(self.service.clone()))
                }
            }
            CircuitState::HalfOpen => {
                let probe_elapsed = inner
                    .probe_started_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);

                if inner.probe_in_flight && probe_elapsed < self.reset_timeout {
                    Err(UpstreamError::CircuitOpen(self.service.clone()))
                } else {
                    // Either the slot is free, or the admitted probe never
                    // recorded a result (its caller was dropped) and the
                    // slot is stale; hand it to this caller
                    inner.probe_in_flight = true;
                    inner.probe_started_at = Some(Instant::now());
                    Ok(())
                }
            }
        }
    }

    /// Record a handled response (any HTTP status) from an admitted call
    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.probe_started_at = None;
                inner.success_count += 1;

                if inner.success_count >= self.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                    self.set_state_gauge(CircuitState::Closed);
                    tracing::info!(
                        service = %self.service,
                        "Circuit breaker closed after successful probe"
                    );
                }
            }
            CircuitState::Open => {
                // A call admitted before the trip completed after it; the
                // timed transition still governs recovery.
            }
        }
    }

    /// Record a transient (network/timeout) failure from an admitted call
    pub async fn record_failure(&self) {
        let mut inner = self.inner.write().await;

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;

                if inner.failure_count >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    self.set_state_gauge(CircuitState::Open);
                    tracing::warn!(
                        service = %self.service,
                        failure_count = inner.failure_count,
                        threshold = self.failure_threshold,
                        "Circuit breaker opened due to consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                // Probe failed: reopen and restart the timer
                inner.probe_in_flight = false;
                inner.probe_started_at = None;
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.success_count = 0;
                self.set_state_gauge(CircuitState::Open);
                tracing::warn!(
                    service = %self.service,
                    "Circuit breaker reopened after failed half-open probe"
                );
            }
            CircuitState::Open => {}
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    pub async fn failure_count(&self) -> u32 {
        self.inner.read().await.failure_count
    }

    fn set_state_gauge(&self, state: CircuitState) {
        GATEWAY_CIRCUIT_BREAKER_STATE
            .with_label_values(&[&self.service])
            .set(state.as_gauge());
    }
}
