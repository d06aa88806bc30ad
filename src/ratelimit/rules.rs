//! Per-route rate limit rules.
//!
//! Route handlers usually share a handful of limits ("auth endpoints get 5 per
//! minute, everything else 100"). Rules map path prefixes to a
//! [`RateLimitConfig`]; the longest matching prefix wins and unmatched paths
//! fall back to the default.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use super::counter::RateLimitConfig;
use crate::error::{GuardError, Result};

/// A complete set of route rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRules {
    /// Limit applied when no route matches
    #[serde(default)]
    pub default: RateLimitConfig,
    /// Route-specific limits
    #[serde(default)]
    pub routes: Vec<RouteRule>,
}

/// A limit for every path starting with `prefix`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Path prefix to match, e.g. `/api/auth`
    pub prefix: String,
    /// Length of the fixed window in milliseconds
    pub window_ms: u64,
    /// Requests allowed per window
    pub max_requests: u32,
    /// Optional name/description for this limit
    #[serde(default)]
    pub name: Option<String>,
}

impl RouteRule {
    /// Whether this rule covers `path`.
    pub fn matches(&self, path: &str) -> bool {
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || self.prefix.ends_with('/'),
            None => false,
        }
    }

    /// The limit this rule applies.
    pub fn config(&self) -> RateLimitConfig {
        RateLimitConfig {
            window_ms: self.window_ms,
            max_requests: self.max_requests,
        }
    }
}

impl RateLimitRules {
    /// Rules with only a default limit.
    pub fn new(default: RateLimitConfig) -> Self {
        Self {
            default,
            routes: Vec::new(),
        }
    }

    /// Add a route rule.
    pub fn with_route(mut self, prefix: impl Into<String>, config: RateLimitConfig) -> Self {
        self.routes.push(RouteRule {
            prefix: prefix.into(),
            window_ms: config.window_ms,
            max_requests: config.max_requests,
            name: None,
        });
        self
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: RateLimitRules = serde_yaml::from_str(yaml)
            .map_err(|e| GuardError::Config(format!("Failed to parse rate limit rules: {}", e)))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Check every limit in the set.
    pub fn validate(&self) -> Result<()> {
        self.default.validate()?;
        for rule in &self.routes {
            if rule.prefix.is_empty() {
                return Err(GuardError::Config("route prefix must not be empty".to_string()));
            }
            rule.config()
                .validate()
                .map_err(|e| GuardError::Config(format!("route {}: {}", rule.prefix, e)))?;
        }
        Ok(())
    }

    /// The most specific rule for `path`, if any.
    ///
    /// A prefix matches whole path segments only: `/api/auth` covers
    /// `/api/auth` and `/api/auth/login` but not `/api/authx`.
    pub fn rule_for(&self, path: &str) -> Option<&RouteRule> {
        self.routes
            .iter()
            .filter(|rule| rule.matches(path))
            .max_by_key(|rule| rule.prefix.len())
    }

    /// The limit that applies to `path`.
    pub fn limit_for(&self, path: &str) -> RateLimitConfig {
        self.rule_for(path)
            .map(RouteRule::config)
            .unwrap_or(self.default)
    }
}
