//! Process-local counter storage.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::counter::{now_ms, RateLimitConfig, RateLimitEntry, RateLimitResult};
use crate::sweeper::Sweep;

/// In-memory map of rate limit counters.
///
/// Check-and-increment for a key runs under the map's shard lock, so it is
/// atomic with respect to other callers in this process. Limits are enforced
/// per process: separate instances each keep their own counts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, RateLimitEntry>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request against `key` and return the decision.
    pub fn check(&self, key: &str, config: &RateLimitConfig, now_ms: i64) -> RateLimitResult {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now_ms) {
                    *entry = RateLimitEntry::start(now_ms, config);
                    debug!(key = %key, reset_time = entry.reset_time, "Window reset");
                } else {
                    entry.record_hit();
                }
                entry.decision(config)
            }
            Entry::Vacant(vacant) => {
                let entry = RateLimitEntry::start(now_ms, config);
                debug!(
                    key = %key,
                    max_requests = config.max_requests,
                    window_ms = config.window_ms,
                    "Creating new rate limit counter"
                );
                vacant.insert(entry);
                entry.decision(config)
            }
        }
    }

    /// Current state for `key`, without counting a request.
    pub fn peek(&self, key: &str) -> Option<RateLimitEntry> {
        self.entries.get(key).map(|e| *e.value())
    }

    /// Remove every entry whose window ended before `now_ms`.
    pub fn sweep_expired_at(&self, now_ms: i64) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now_ms);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all counters.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl Sweep for MemoryStore {
    fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(now_ms())
    }
}
