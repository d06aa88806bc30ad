//! Fixed-window rate limiting.

mod backend;
mod counter;
mod key;
mod limiter;
mod memory;
mod remote;
mod rules;

pub use backend::RateLimitStore;
pub use counter::{now_ms, RateLimitConfig, RateLimitEntry, RateLimitResult};
pub use key::RateLimitKey;
pub use limiter::{RateLimiter, DEFAULT_KEY_PREFIX, DEFAULT_SWEEP_PROBABILITY};
pub use memory::MemoryStore;
pub use remote::HttpKvStore;
pub use rules::{RateLimitRules, RouteRule};
