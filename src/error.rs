//! Error types for aias-guard.

use thiserror::Error;

/// Main error type for aias-guard operations.
#[derive(Error, Debug)]
pub enum GuardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Remote key-value store returned something we could not use
    #[error("Store error: {0}")]
    Store(String),

    /// HTTP transport errors talking to the remote store
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for aias-guard operations.
pub type Result<T> = std::result::Result<T, GuardError>;

/// Error returned by [`CircuitBreaker::call`](crate::resilience::CircuitBreaker::call).
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// The circuit is open and the call was not attempted.
    #[error("Circuit breaker '{name}' is open")]
    Open {
        /// Name of the breaker that rejected the call
        name: String,
    },

    /// The wrapped operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    /// Returns `true` if the call was short-circuited.
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open { .. })
    }

    /// Returns the wrapped operation's error, if the operation ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitBreakerError::Inner(e) => Some(e),
            CircuitBreakerError::Open { .. } => None,
        }
    }
}
