//! Retry policy with exponential backoff.
//!
//! An operation is retried only when its error looks transient (network or
//! timeout failures) or belongs to one of the caller's retryable error
//! classes. Everything else is returned after the first attempt.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{GuardError, Result};

/// Observer called with `(attempt, error)` before each backoff wait.
pub type RetryObserver = Arc<dyn Fn(u32, &(dyn StdError + 'static)) + Send + Sync>;

const TRANSIENT_MARKERS: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "econnrefused",
    "connection refused",
    "econnreset",
    "connection reset",
];

/// Whether `error` (or anything in its source chain) looks like a transient
/// network or timeout failure.
pub fn is_transient(error: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::BrokenPipe
            ) {
                return true;
            }
        }
        if let Some(http_err) = err.downcast_ref::<reqwest::Error>() {
            if http_err.is_timeout() || http_err.is_connect() {
                return true;
            }
        }

        let message = err.to_string().to_lowercase();
        if TRANSIENT_MARKERS.iter().any(|m| message.contains(m)) {
            return true;
        }

        current = err.source();
    }
    false
}

/// A category of errors the caller wants retried.
#[derive(Clone, Copy)]
pub struct ErrorClass {
    name: &'static str,
    matches: fn(&(dyn StdError + 'static)) -> bool,
}

fn is_instance<E: StdError + 'static>(error: &(dyn StdError + 'static)) -> bool {
    error.is::<E>()
}

impl ErrorClass {
    /// Errors of concrete type `E`.
    pub fn of<E: StdError + 'static>() -> Self {
        Self {
            name: std::any::type_name::<E>(),
            matches: is_instance::<E>,
        }
    }

    /// Errors accepted by `predicate`.
    pub fn custom(name: &'static str, predicate: fn(&(dyn StdError + 'static)) -> bool) -> Self {
        Self {
            name,
            matches: predicate,
        }
    }

    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether `error` or any of its sources belongs to this class.
    pub fn matches(&self, error: &(dyn StdError + 'static)) -> bool {
        let mut current = Some(error);
        while let Some(err) = current {
            if (self.matches)(err) {
                return true;
            }
            current = err.source();
        }
        false
    }
}

impl fmt::Debug for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ErrorClass").field(&self.name).finish()
    }
}

/// Retry configuration
#[derive(Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 - 1.0)
    pub jitter: f64,
    /// Error classes retried in addition to transient errors
    pub retryable_errors: Vec<ErrorClass>,
    /// Called before each wait
    pub on_retry: Option<RetryObserver>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
            jitter: 0.0,
            retryable_errors: Vec::new(),
            on_retry: None,
        }
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter", &self.jitter)
            .field("retryable_errors", &self.retryable_errors)
            .field("on_retry", &self.on_retry.as_ref().map(|_| "<observer>"))
            .finish()
    }
}

impl RetryConfig {
    /// Also retry errors of type `E`.
    pub fn retry_on<E: StdError + 'static>(mut self) -> Self {
        self.retryable_errors.push(ErrorClass::of::<E>());
        self
    }

    /// Set the retry observer.
    pub fn on_retry<F>(mut self, observer: F) -> Self
    where
        F: Fn(u32, &(dyn StdError + 'static)) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    /// Check the numeric settings.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(GuardError::Config("max_attempts must be at least 1".to_string()));
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err(GuardError::Config(
                "backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(GuardError::Config("jitter must be within 0.0..=1.0".to_string()));
        }
        if self.max_delay < self.initial_delay {
            return Err(GuardError::Config(
                "max_delay must not be smaller than initial_delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry policy implementation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a new retry policy with the given configuration
    ///
    /// A configuration that fails [`RetryConfig::validate`] is logged and its
    /// out-of-range values are treated as the nearest valid ones; use
    /// [`RetryPolicy::try_new`] to reject it instead.
    pub fn new(config: RetryConfig) -> Self {
        if let Err(e) = config.validate() {
            warn!(error = %e, "Invalid retry configuration, clamping out-of-range values");
        }
        Self { config }
    }

    /// Create a policy, rejecting a configuration that fails validation.
    pub fn try_new(config: RetryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Create a policy with custom max attempts
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self::new(RetryConfig {
            max_attempts,
            ..Default::default()
        })
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.config.initial_delay.as_millis() as f64;
        let max = self.config.max_delay.as_millis() as f64;
        let multiplier = match self.config.backoff_multiplier {
            m if m.is_finite() && m >= 1.0 => m,
            _ => 1.0,
        };
        let delay = match base * multiplier.powi(exponent) {
            d if d.is_finite() => d.clamp(0.0, max),
            _ => max,
        };

        let jitter = match self.config.jitter {
            j if j.is_finite() => j.clamp(0.0, 1.0),
            _ => 0.0,
        };
        let range = delay * jitter;
        let delay = if range > 0.0 {
            let offset = rand::thread_rng().gen_range(-range..=range);
            (delay + offset).clamp(0.0, max)
        } else {
            delay
        };

        Duration::from_millis(delay as u64)
    }

    /// Check if an error is retryable
    pub fn is_retryable(&self, error: &(dyn StdError + 'static)) -> bool {
        is_transient(error) || self.config.retryable_errors.iter().any(|c| c.matches(error))
    }

    /// Execute an operation with retry logic
    ///
    /// Returns the error from the final attempt if every attempt fails, or the
    /// first non-retryable error.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: StdError + 'static,
    {
        self.execute_with_stats(operation).await.into_result()
    }

    /// Execute an operation and report how many attempts it took.
    pub async fn execute_with_stats<F, Fut, T, E>(&self, mut operation: F) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: StdError + 'static,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Retry succeeded");
                    }
                    return RetryResult::Success {
                        value,
                        attempts: attempt,
                    };
                }
                Err(error) => {
                    if !self.is_retryable(&error) {
                        debug!(attempt, error = %error, "Non-retryable error");
                        return RetryResult::NonRetryable {
                            error,
                            attempts: attempt,
                        };
                    }
                    if attempt >= max_attempts {
                        warn!(attempts = attempt, error = %error, "Retries exhausted");
                        return RetryResult::Exhausted {
                            error,
                            attempts: attempt,
                        };
                    }

                    self.notify(attempt, &error);

                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after error"
                    );

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn notify(&self, attempt: u32, error: &(dyn StdError + 'static)) {
        let Some(observer) = &self.config.on_retry else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| observer(attempt, error))).is_err() {
            warn!(attempt, "Retry observer panicked, continuing");
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

/// Retry `operation` under `config`.
pub async fn retry<F, Fut, T, E>(operation: F, config: RetryConfig) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: StdError + 'static,
{
    RetryPolicy::new(config).execute(operation).await
}

/// Result of a retry operation
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// Operation succeeded
    Success {
        /// The returned value
        value: T,
        /// Number of attempts made
        attempts: u32,
    },
    /// Operation failed on every allowed attempt
    Exhausted {
        /// The final error
        error: E,
        /// Number of attempts made
        attempts: u32,
    },
    /// Operation failed with non-retryable error
    NonRetryable {
        /// The error
        error: E,
        /// Number of attempts made
        attempts: u32,
    },
}

impl<T, E> RetryResult<T, E> {
    /// Convert to a Result
    pub fn into_result(self) -> std::result::Result<T, E> {
        match self {
            Self::Success { value, .. } => Ok(value),
            Self::Exhausted { error, .. } | Self::NonRetryable { error, .. } => Err(error),
        }
    }

    /// Check if the operation succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Number of times the operation ran.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::NonRetryable { attempts, .. } => *attempts,
        }
    }
}

/// Builder for retry policy
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    config: RetryConfig,
}

impl RetryPolicyBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set max attempts
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    /// Set initial delay
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.config.initial_delay = delay;
        self
    }

    /// Set max delay
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.backoff_multiplier = multiplier;
        self
    }

    /// Set jitter factor
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.config.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Also retry errors of type `E`
    pub fn retry_on<E: StdError + 'static>(mut self) -> Self {
        self.config = self.config.retry_on::<E>();
        self
    }

    /// Set the retry observer
    pub fn on_retry<F>(mut self, observer: F) -> Self
    where
        F: Fn(u32, &(dyn StdError + 'static)) + Send + Sync + 'static,
    {
        self.config = self.config.on_retry(observer);
        self
    }

    /// Build the policy
    pub fn build(self) -> RetryPolicy {
        RetryPolicy::new(self.config)
    }
}
