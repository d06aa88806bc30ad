//! Core rate limiter implementation.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, trace, warn};

use super::backend::RateLimitStore;
use super::counter::{now_ms, RateLimitConfig, RateLimitEntry, RateLimitResult};
use super::key::RateLimitKey;
use super::memory::MemoryStore;
use super::remote::HttpKvStore;
use super::rules::RateLimitRules;
use crate::config::GuardConfig;
use crate::error::{GuardError, Result};
use crate::sweeper::{spawn_sweeper, Sweep, SweeperHandle};

/// Default namespace prepended to every key.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit";
/// Default chance that a check also sweeps expired in-memory counters.
pub const DEFAULT_SWEEP_PROBABILITY: f64 = 0.01;

/// Fixed-window rate limiter keyed by (path, identifier).
///
/// Counters live in a process-local [`MemoryStore`]. When a remote
/// [`RateLimitStore`] is attached, it is used first and the memory store
/// takes over for any call where the remote store fails.
///
/// Checks never fail: invalid input or store errors let the request through.
pub struct RateLimiter {
    memory: Arc<MemoryStore>,
    remote: Option<Arc<dyn RateLimitStore>>,
    rules: RateLimitRules,
    key_prefix: String,
    sweep_probability: f64,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl RateLimiter {
    /// Create an in-memory rate limiter with default settings.
    pub fn new() -> Self {
        Self {
            memory: Arc::new(MemoryStore::new()),
            remote: None,
            rules: RateLimitRules::default(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            sweep_probability: DEFAULT_SWEEP_PROBABILITY,
            sweeper: Mutex::new(None),
        }
    }

    /// Build a rate limiter from configuration.
    ///
    /// Attaches an [`HttpKvStore`] when the remote store is configured. The
    /// background sweeper is not started; see [`RateLimiter::start_sweeper`].
    pub fn from_config(config: &GuardConfig) -> Result<Self> {
        let settings = &config.rate_limiting;
        settings.rules.validate()?;

        let mut limiter = Self::new()
            .with_rules(settings.rules.clone())
            .with_key_prefix(settings.key_prefix.clone())
            .with_sweep_probability(settings.sweep_probability);

        if let Some(store) = HttpKvStore::from_config(&config.remote_store)? {
            debug!(url = %store.base_url(), "Using remote rate limit store");
            limiter = limiter.with_remote_store(Arc::new(store));
        }

        Ok(limiter)
    }

    /// Attach a remote store shared with other instances.
    pub fn with_remote_store(mut self, store: Arc<dyn RateLimitStore>) -> Self {
        self.remote = Some(store);
        self
    }

    /// Use `rules` for [`RateLimiter::check_route`].
    pub fn with_rules(mut self, rules: RateLimitRules) -> Self {
        self.rules = rules;
        self
    }

    /// Namespace prepended to every key.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Chance (0.0 to 1.0) that a check sweeps expired counters. 0 disables it.
    pub fn with_sweep_probability(mut self, probability: f64) -> Self {
        self.sweep_probability = if probability.is_nan() {
            0.0
        } else {
            probability.clamp(0.0, 1.0)
        };
        self
    }

    /// Whether a remote store is attached.
    pub fn has_remote_store(&self) -> bool {
        self.remote.is_some()
    }

    /// The configured route rules.
    pub fn rules(&self) -> &RateLimitRules {
        &self.rules
    }

    /// Count a request from `identifier` against `path` and decide whether it may proceed.
    pub async fn check_rate_limit(
        &self,
        path: &str,
        identifier: &str,
        config: &RateLimitConfig,
    ) -> RateLimitResult {
        let now = now_ms();

        if let Err(e) = Self::validate_input(path, identifier, config) {
            warn!(path = %path, error = %e, "Invalid rate limit input, allowing request");
            return RateLimitResult::fail_open(config, now);
        }

        let key = RateLimitKey::new(&self.key_prefix, path, identifier);
        trace!(key = %key, "Checking rate limit");

        self.maybe_sweep(now);

        if let Some(remote) = &self.remote {
            let outcome = AssertUnwindSafe(Self::check_remote(remote.as_ref(), &key, config, now))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(result)) => {
                    Self::log_decision(&key, &result);
                    return result;
                }
                Ok(Err(e)) => {
                    warn!(key = %key, error = %e, "Remote rate limit store failed, using in-memory counter");
                }
                Err(_) => {
                    warn!(key = %key, "Remote rate limit store panicked, using in-memory counter");
                }
            }
        }

        let result = self.memory.check(key.as_str(), config, now);
        Self::log_decision(&key, &result);
        result
    }

    /// Like [`RateLimiter::check_rate_limit`], with the limit taken from the route rules.
    pub async fn check_route(&self, path: &str, identifier: &str) -> RateLimitResult {
        let config = self.rules.limit_for(path);
        self.check_rate_limit(path, identifier, &config).await
    }

    /// In-memory state for (path, identifier), without counting a request.
    pub fn peek(&self, path: &str, identifier: &str) -> Option<RateLimitEntry> {
        let key = RateLimitKey::new(&self.key_prefix, path, identifier);
        self.memory.peek(key.as_str())
    }

    /// Remove expired in-memory counters now.
    pub fn sweep_expired(&self) -> usize {
        self.memory.sweep_expired()
    }

    /// Sweep expired in-memory counters every `interval` in the background.
    ///
    /// Replaces any sweeper already running. Must be called from within a
    /// tokio runtime.
    pub fn start_sweeper(&self, interval: Duration) {
        let handle = spawn_sweeper("rate-limiter", Arc::downgrade(&self.memory), interval);
        *self.sweeper.lock() = Some(handle);
    }

    /// Stop the background sweeper, if one is running.
    pub async fn stop_sweeper(&self) {
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    /// Number of in-memory counters.
    pub fn counter_count(&self) -> usize {
        self.memory.len()
    }

    /// Clear all in-memory counters.
    pub fn clear(&self) {
        self.memory.clear();
    }

    fn validate_input(path: &str, identifier: &str, config: &RateLimitConfig) -> Result<()> {
        if path.is_empty() {
            return Err(GuardError::Config("path must not be empty".to_string()));
        }
        if identifier.is_empty() {
            return Err(GuardError::Config("identifier must not be empty".to_string()));
        }
        config.validate()
    }

    async fn check_remote(
        store: &dyn RateLimitStore,
        key: &RateLimitKey,
        config: &RateLimitConfig,
        now: i64,
    ) -> Result<RateLimitResult> {
        let entry = match store.get(key.as_str()).await? {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.record_hit();
                entry
            }
            _ => RateLimitEntry::start(now, config),
        };

        store.set(key.as_str(), &entry, entry.ttl(now)).await?;
        Ok(entry.decision(config))
    }

    fn maybe_sweep(&self, now: i64) {
        if self.sweep_probability <= 0.0 {
            return;
        }
        if rand::thread_rng().gen::<f64>() < self.sweep_probability {
            let removed = self.memory.sweep_expired_at(now);
            if removed > 0 {
                debug!(removed, "Swept expired rate limit counters");
            }
        }
    }

    fn log_decision(key: &RateLimitKey, result: &RateLimitResult) {
        if !result.allowed {
            debug!(key = %key, reset_time = result.reset_time, "Rate limit exceeded");
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
