//! Fixed-window counters and per-call limit configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GuardError, Result};

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Limit applied to a single (path, identifier) counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Length of the fixed window in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Requests allowed per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max_requests() -> u32 {
    100
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_requests: default_max_requests(),
        }
    }
}

impl RateLimitConfig {
    /// Create a validated configuration.
    pub fn new(window_ms: u64, max_requests: u32) -> Result<Self> {
        let config = Self {
            window_ms,
            max_requests,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that both the window and the limit are positive.
    pub fn validate(&self) -> Result<()> {
        if self.window_ms == 0 {
            return Err(GuardError::Config("window_ms must be positive".to_string()));
        }
        if self.max_requests == 0 {
            return Err(GuardError::Config(
                "max_requests must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The window as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Counter state for one key.
///
/// This is also the value persisted in the remote store, serialized as
/// `{"count": .., "resetTime": ..}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitEntry {
    /// Requests observed in the current window
    pub count: u64,
    /// Epoch milliseconds at which the window ends
    pub reset_time: i64,
}

impl RateLimitEntry {
    /// Open a new window at `now_ms` holding a single request.
    pub fn start(now_ms: i64, config: &RateLimitConfig) -> Self {
        let window = i64::try_from(config.window_ms).unwrap_or(i64::MAX);
        Self {
            count: 1,
            reset_time: now_ms.saturating_add(window),
        }
    }

    /// Whether the window has ended.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.reset_time
    }

    /// Count one more request.
    ///
    /// Rejected requests are counted too; under fixed windows this only
    /// affects the stored count, never the reported decision.
    pub fn record_hit(&mut self) {
        self.count = self.count.saturating_add(1);
    }

    /// Time left in the window, never less than one millisecond.
    pub fn ttl(&self, now_ms: i64) -> Duration {
        let left = self.reset_time.saturating_sub(now_ms).max(1);
        Duration::from_millis(left as u64)
    }

    /// Decision for the request that produced this state.
    pub fn decision(&self, config: &RateLimitConfig) -> RateLimitResult {
        let max = u64::from(config.max_requests);
        if self.count > max {
            RateLimitResult {
                allowed: false,
                remaining: 0,
                reset_time: self.reset_time,
            }
        } else {
            RateLimitResult {
                allowed: true,
                remaining: (max - self.count) as u32,
                reset_time: self.reset_time,
            }
        }
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests left in the current window
    pub remaining: u32,
    /// Epoch milliseconds at which the window ends
    pub reset_time: i64,
}

impl RateLimitResult {
    /// The answer given when the limiter cannot decide.
    pub fn fail_open(config: &RateLimitConfig, now_ms: i64) -> Self {
        let window = i64::try_from(config.window_ms).unwrap_or(i64::MAX);
        Self {
            allowed: true,
            remaining: config.max_requests,
            reset_time: now_ms.saturating_add(window),
        }
    }
}
