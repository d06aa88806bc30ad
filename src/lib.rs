//! AIAS Guard - request guarding primitives for API route handlers
//!
//! This crate bundles the protections API handlers put in front of their work:
//! a fixed-window rate limiter that can share counters through a remote
//! key-value store, retry with exponential backoff, a circuit breaker, and a
//! TTL memory cache for expensive lookups.

pub mod cache;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod resilience;
pub mod sweeper;

pub use cache::TtlCache;
pub use config::GuardConfig;
pub use error::{CircuitBreakerError, GuardError, Result};
pub use ratelimit::{RateLimitConfig, RateLimitResult, RateLimiter};
pub use resilience::{retry, CircuitBreaker, RetryConfig, RetryPolicy};
