//! TTL memory cache.

mod ttl;

pub use ttl::{CacheEntry, CacheStats, TtlCache};
