//! Circuit breaker pattern implementation.
//!
//! The breaker counts consecutive failures across calls. Once they reach the
//! threshold it opens and rejects calls without running them. After the reset
//! timeout one trial call is let through: success closes the circuit, failure
//! opens it again for another full timeout.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CircuitBreakerError, GuardError, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, one trial request is allowed
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Milliseconds to stay open before allowing a trial call
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    60_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    /// The reset timeout as a [`Duration`].
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// Check that the threshold is positive.
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(GuardError::Config(
                "failure_threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    total_successes: u64,
    total_failures: u64,
    rejected: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
            total_successes: 0,
            total_failures: 0,
            rejected: 0,
        }
    }
}

/// Circuit breaker guarding one dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

/// Releases the half-open trial slot if the trial call is dropped before finishing.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.inner.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    /// Create with default configuration
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Name of the guarded dependency
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Run `operation` through the breaker.
    ///
    /// Returns [`CircuitBreakerError::Open`] without running the operation when
    /// the circuit is open, or half-open with a trial already in flight.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> std::result::Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let is_trial = self.acquire()?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: is_trial,
        };

        let result = operation().await;
        guard.armed = false;

        match result {
            Ok(value) => {
                self.record_success(is_trial);
                Ok(value)
            }
            Err(error) => {
                self.record_failure(is_trial);
                Err(CircuitBreakerError::Inner(error))
            }
        }
    }

    /// Decide whether a call may run; `Ok(true)` marks a half-open trial.
    fn acquire<E>(&self) -> std::result::Result<bool, CircuitBreakerError<E>> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.reset_timeout() {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(breaker = %self.name, "Circuit breaker half-open, testing");
                    Ok(true)
                } else {
                    inner.rejected += 1;
                    Err(self.open_error())
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.rejected += 1;
                    Err(self.open_error())
                } else {
                    inner.trial_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn open_error<E>(&self) -> CircuitBreakerError<E> {
        CircuitBreakerError::Open {
            name: self.name.clone(),
        }
    }

    /// Only the half-open trial may close the circuit; late results of calls
    /// admitted while closed leave an open or half-open circuit alone.
    fn record_success(&self, is_trial: bool) {
        let mut inner = self.inner.lock();
        inner.total_successes += 1;
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen if is_trial => {
                inner.consecutive_failures = 0;
                inner.trial_in_flight = false;
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                info!(breaker = %self.name, "Circuit breaker closed");
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn record_failure(&self, is_trial: bool) {
        let mut inner = self.inner.lock();
        inner.total_failures += 1;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            CircuitState::HalfOpen if is_trial => {
                inner.trial_in_flight = false;
                Self::open(&mut inner);
                warn!(breaker = %self.name, "Circuit breaker trial failed, reopening");
            }
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    Self::open(&mut inner);
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker opened"
                    );
                } else {
                    debug!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker recorded failure"
                    );
                }
            }
            // A call admitted while closed finished after the circuit opened.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn open(inner: &mut BreakerState) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        info!(breaker = %self.name, "Circuit breaker reset");
    }

    /// Force the circuit open (for manual intervention)
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.trial_in_flight = false;
        Self::open(&mut inner);
        warn!(breaker = %self.name, "Circuit breaker forced open");
    }

    /// Get current statistics
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            rejected: inner.rejected,
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerStats {
    /// Current state
    pub state: CircuitState,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Calls that succeeded
    pub total_successes: u64,
    /// Calls that failed
    pub total_failures: u64,
    /// Calls rejected without running
    pub rejected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("dependency down")]
    struct Down;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test-dependency",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout_ms: reset_ms,
            },
        )
    }

    async fn fail(cb: &CircuitBreaker) -> std::result::Result<(), CircuitBreakerError<Down>> {
        cb.call(|| async { Err::<(), _>(Down) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> std::result::Result<u32, CircuitBreakerError<Down>> {
        cb.call(|| async { Ok::<_, Down>(7) }).await
    }

    #[test]
    fn test_circuit_breaker_initial_state() {
        let cb = CircuitBreaker::with_defaults("test-dependency");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.name(), "test-dependency");
        assert_eq!(cb.stats().consecutive_failures, 0);
    }

    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
        let zero = CircuitBreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let cb = breaker(3, 1_000);

        for _ in 0..2 {
            assert!(fail(&cb).await.unwrap_err().into_inner().is_some());
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let cb = breaker(3, 1_000);

        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        succeed(&cb).await.unwrap();
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_short_circuits() {
        let cb = breaker(1, 1_000);
        fail(&cb).await.unwrap_err();

        let calls = AtomicU32::new(0);
        let result = cb
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Down>(())
            })
            .await;

        assert!(result.unwrap_err().is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cb.stats().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let cb = breaker(2, 1_000);
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1_000)).await;

        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_and_restarts_timeout() {
        let cb = breaker(1, 1_000);
        fail(&cb).await.unwrap_err();

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(fail(&cb).await.unwrap_err().into_inner().is_some());
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(succeed(&cb).await.unwrap_err().is_open());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(succeed(&cb).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_single_trial() {
        let cb = breaker(1, 1_000);
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(1_000)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = cb.call(|| async move {
            let _ = release_rx.await;
            Ok::<_, Down>(1)
        });
        let second = async {
            tokio::task::yield_now().await;
            let rejected = succeed(&cb).await.unwrap_err().is_open();
            let _ = release_tx.send(());
            rejected
        };

        let (trial_result, second_rejected) = tokio::join!(trial, second);
        assert!(second_rejected);
        assert_eq!(trial_result.unwrap(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_does_not_end_half_open_trial() {
        let cb = std::sync::Arc::new(breaker(1, 1_000));

        let (late_tx, late_rx) = tokio::sync::oneshot::channel::<()>();
        let late = tokio::spawn({
            let cb = std::sync::Arc::clone(&cb);
            async move {
                cb.call(|| async move {
                    let _ = late_rx.await;
                    Ok::<_, Down>(0)
                })
                .await
                .is_ok()
            }
        });
        tokio::task::yield_now().await;

        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_millis(1_000)).await;

        let (trial_tx, trial_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = tokio::spawn({
            let cb = std::sync::Arc::clone(&cb);
            async move {
                cb.call(|| async move {
                    let _ = trial_rx.await;
                    Ok::<_, Down>(1)
                })
                .await
                .is_ok()
            }
        });
        tokio::task::yield_now().await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let _ = late_tx.send(());
        assert!(late.await.unwrap());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(succeed(&cb).await.unwrap_err().is_open());

        let _ = trial_tx.send(());
        assert!(trial.await.unwrap());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_releases_slot() {
        let cb = breaker(1, 1_000);
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(1_000)).await;

        {
            let pending = cb.call(|| std::future::pending::<std::result::Result<(), Down>>());
            let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
            assert!(timed_out.is_err());
        }

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_force_open_and_reset() {
        let cb = CircuitBreaker::with_defaults("test-dependency");
        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(succeed(&cb).await.unwrap_err().is_open());

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(succeed(&cb).await.is_ok());
    }
}
