//! Store trait for sharing counters across instances.

use std::time::Duration;

use async_trait::async_trait;

use super::counter::RateLimitEntry;
use crate::error::Result;

/// A key-value store that can hold rate limit counters for several instances.
///
/// The limiter performs one `get` followed by one `set` per check. The pair is
/// not atomic, so concurrent checks on the same key from different instances
/// may under-count.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Read the counter for `key`, or `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<RateLimitEntry>>;

    /// Write the counter for `key`, expiring it after `ttl`.
    async fn set(&self, key: &str, entry: &RateLimitEntry, ttl: Duration) -> Result<()>;
}
