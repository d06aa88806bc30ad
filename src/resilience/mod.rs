//! Resilience patterns for calls to flaky dependencies:
//! - Retry policy with exponential backoff
//! - Circuit breaker for a dependency that is currently down

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use retry::{
    is_transient, retry, ErrorClass, RetryConfig, RetryObserver, RetryPolicy, RetryPolicyBuilder,
    RetryResult,
};
