//! In-memory cache with per-entry expiry.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::trace;

use crate::config::CacheConfig;
use crate::sweeper::{deadline_after, spawn_sweeper, Sweep, SweeperHandle};

/// A cached value and the instant it stops being served.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The cached value
    pub data: V,
    /// After this instant the entry is treated as absent
    pub expires: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires
    }
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups that returned a value
    pub hits: u64,
    /// Lookups that found nothing or an expired entry
    pub misses: u64,
    /// Entries currently stored, expired or not
    pub entries: usize,
}

/// Key → value cache with per-entry TTL.
///
/// Expired entries are removed lazily on `get` and by [`TtlCache::sweep_expired`],
/// which a background sweeper can run on an interval.
pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    fill_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty cache with a five minute default TTL.
    pub fn new() -> Self {
        Self::with_default_ttl(Duration::from_secs(300))
    }

    /// Create an empty cache with the given default TTL.
    pub fn with_default_ttl(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            fill_locks: DashMap::new(),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        }
    }

    /// Create a cache from configuration and start its background sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_config(config: &CacheConfig) -> Arc<Self> {
        let cache = Arc::new(Self::with_default_ttl(config.default_ttl()));
        cache.start_sweeper(config.sweep_interval());
        cache
    }

    /// TTL callers use when they have no better value.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Get a live value; expired entries are removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.data.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
            trace!(key = %key, "Evicted expired cache entry");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store `data` under `key` for `ttl`, replacing any existing entry.
    ///
    /// A TTL too large to represent keeps the entry for decades.
    pub fn set(&self, key: impl Into<String>, data: V, ttl: Duration) {
        let expires = deadline_after(Instant::now(), ttl);
        self.entries.insert(key.into(), CacheEntry { data, expires });
    }

    /// Remove `key`; returns whether an entry was present.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Return the cached value for `key`, or run `fetcher`, cache its value for
    /// `ttl` and return it.
    ///
    /// Concurrent misses on the same key each run `fetcher`; use
    /// [`TtlCache::with_cache_coalesced`] to run it once. Errors from `fetcher`
    /// are returned and nothing is cached.
    pub async fn with_cache<F, Fut, E>(&self, key: &str, fetcher: F, ttl: Duration) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let value = fetcher().await?;
        self.set(key, value.clone(), ttl);
        Ok(value)
    }

    /// Like [`TtlCache::with_cache`], but concurrent misses on the same key wait
    /// for a single `fetcher` call instead of each running their own.
    ///
    /// If the fetch fails, the next waiter runs its own fetcher.
    pub async fn with_cache_coalesced<F, Fut, E>(
        &self,
        key: &str,
        fetcher: F,
        ttl: Duration,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let lock = Arc::clone(self.fill_locks.entry(key.to_string()).or_default().value());
        let result = {
            let _fill = lock.lock().await;
            match self.get(key) {
                Some(value) => Ok(value),
                None => match fetcher().await {
                    Ok(value) => {
                        self.set(key, value.clone(), ttl);
                        Ok(value)
                    }
                    Err(e) => Err(e),
                },
            }
        };

        // The map and this function hold the only references when nobody else waits.
        self.fill_locks
            .remove_if(key, |_, l| Arc::strong_count(l) <= 2);
        drop(lock);

        result
    }

    /// Remove every entry that expired before `now`.
    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hit/miss statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    /// Sweep expired entries every `interval` in the background.
    ///
    /// Replaces any sweeper already running. Must be called from within a
    /// tokio runtime.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let handle = spawn_sweeper("ttl-cache", Arc::downgrade(self), interval);
        *self.sweeper.lock() = Some(handle);
    }

    /// Stop the background sweeper, if one is running.
    pub async fn stop_sweeper(&self) {
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }
}

impl<V> Default for TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Sweep for TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }
}
