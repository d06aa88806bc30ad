//! Configuration management for the guard components.

use std::path::Path;
use std::time::Duration;

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GuardError, Result};
use crate::ratelimit::{RateLimitRules, DEFAULT_KEY_PREFIX, DEFAULT_SWEEP_PROBABILITY};
use crate::resilience::{CircuitBreakerConfig, RetryConfig};

/// Prefix for environment variable overrides, e.g. `AIAS_GUARD__CACHE__DEFAULT_TTL_SECS`.
pub const ENV_PREFIX: &str = "AIAS_GUARD";

/// Environment variable holding the remote store URL.
pub const KV_URL_ENV: &str = "KV_REST_API_URL";
/// Environment variable holding the remote store token.
pub const KV_TOKEN_ENV: &str = "KV_REST_API_TOKEN";

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Shared remote counter store
    #[serde(default)]
    pub remote_store: RemoteStoreConfig,

    /// TTL cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Default retry policy
    #[serde(default)]
    pub retry: RetrySettings,

    /// Default circuit breaker settings
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Chance that a check also sweeps expired counters
    #[serde(default = "default_sweep_probability")]
    pub sweep_probability: f64,

    /// Interval for a background counter sweep; none means probabilistic sweeps only
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,

    /// Namespace prepended to every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Default and per-route limits
    #[serde(default)]
    pub rules: RateLimitRules,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            sweep_probability: default_sweep_probability(),
            sweep_interval_secs: None,
            key_prefix: default_key_prefix(),
            rules: RateLimitRules::default(),
        }
    }
}

impl RateLimitingConfig {
    /// Background sweep interval, if one is configured.
    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

fn default_sweep_probability() -> f64 {
    DEFAULT_SWEEP_PROBABILITY
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Remote key-value store credentials. Both must be set for the store to be used.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStoreConfig {
    /// REST endpoint of the store
    #[serde(default)]
    pub url: Option<String>,

    /// Bearer token
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
}

impl std::fmt::Debug for RemoteStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStoreConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl RemoteStoreConfig {
    /// Read credentials from `KV_REST_API_URL` and `KV_REST_API_TOKEN`.
    ///
    /// Empty variables count as unset.
    pub fn from_env() -> Self {
        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            url: read(KV_URL_ENV),
            token: read(KV_TOKEN_ENV),
        }
    }

    /// Whether both the URL and token are present.
    pub fn is_configured(&self) -> bool {
        matches!((&self.url, &self.token), (Some(u), Some(t)) if !u.is_empty() && !t.is_empty())
    }
}

/// TTL cache configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL used when callers have no better value
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Interval between background sweeps
    #[serde(default = "default_cache_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_cache_sweep_interval(),
        }
    }
}

impl CacheConfig {
    /// The default TTL as a [`Duration`].
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// The sweep interval as a [`Duration`], at least one second.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_cache_sweep_interval() -> u64 {
    60
}

/// Serializable retry settings; see [`RetryConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Maximum number of attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound on any single delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Factor applied to the delay after each failed attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Random spread applied to each delay (0.0 - 1.0)
    #[serde(default)]
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: 0.0,
        }
    }
}

impl RetrySettings {
    /// Build a [`RetryConfig`] with no extra retryable classes and no observer.
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            jitter: self.jitter,
            ..RetryConfig::default()
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl GuardConfig {
    /// Load configuration from an optional file layered under `AIAS_GUARD__*`
    /// environment variables.
    ///
    /// Remote store credentials missing from both fall back to
    /// [`RemoteStoreConfig::from_env`].
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(Path::new(path)));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let mut config: GuardConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GuardError::Config(e.to_string()))?;

        if !config.remote_store.is_configured() {
            let env = RemoteStoreConfig::from_env();
            config.remote_store.url = config.remote_store.url.or(env.url);
            config.remote_store.token = config.remote_store.token.or(env.token);
        }

        config.validate()?;
        debug!(
            path = ?path,
            remote_store = config.remote_store.is_configured(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: GuardConfig =
            serde_yaml::from_str(&contents).map_err(|e| GuardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the components cannot work with.
    pub fn validate(&self) -> Result<()> {
        let p = self.rate_limiting.sweep_probability;
        if !(0.0..=1.0).contains(&p) {
            return Err(GuardError::Config(format!(
                "sweep_probability must be within 0.0..=1.0, got {}",
                p
            )));
        }
        self.rate_limiting.rules.validate()?;
        self.retry.to_retry_config().validate()?;
        self.circuit_breaker.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("aias-guard-{}-{}", std::process::id(), name));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = GuardConfig::default();
        assert_eq!(config.rate_limiting.sweep_probability, 0.01);
        assert_eq!(config.rate_limiting.key_prefix, "ratelimit");
        assert!(config.rate_limiting.sweep_interval().is_none());
        assert_eq!(config.rate_limiting.rules.default.window_ms, 60_000);
        assert_eq!(config.rate_limiting.rules.default.max_requests, 100);
        assert!(!config.remote_store.is_configured());
        assert_eq!(config.cache.default_ttl(), Duration::from_secs(300));
        assert_eq!(config.cache.sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_partial_yaml() {
        let path = write_temp(
            "partial.yaml",
            r#"
rate_limiting:
  key_prefix: "rl"
  rules:
    default:
      window_ms: 1000
      max_requests: 2
    routes:
      - prefix: /api/auth
        window_ms: 60000
        max_requests: 5
cache:
  default_ttl_secs: 10
"#,
        );

        let config = GuardConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.rate_limiting.key_prefix, "rl");
        assert_eq!(config.rate_limiting.rules.default.max_requests, 2);
        assert_eq!(config.rate_limiting.rules.limit_for("/api/auth/login").max_requests, 5);
        assert_eq!(config.cache.default_ttl_secs, 10);
        assert_eq!(config.cache.sweep_interval_secs, 60);
        assert_eq!(config.retry.initial_delay_ms, 1000);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_load_from_file() {
        let path = write_temp(
            "load.yaml",
            "retry:\n  max_attempts: 5\ncircuit_breaker:\n  failure_threshold: 2\n",
        );

        let config = GuardConfig::load(path.to_str()).unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.circuit_breaker.reset_timeout_ms, 60_000);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = GuardConfig::default();
        config.rate_limiting.sweep_probability = 1.5;
        assert!(config.validate().is_err());

        let mut config = GuardConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = GuardConfig::default();
        config.retry.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = GuardConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = GuardConfig::default();
        config.rate_limiting.rules.default.max_requests = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_missing() {
        let result = GuardConfig::from_file("/nonexistent/aias-guard.yaml");
        assert!(matches!(result, Err(GuardError::Io(_))));
    }

    #[test]
    fn test_retry_settings_conversion() {
        let settings = RetrySettings {
            max_attempts: 4,
            initial_delay_ms: 50,
            max_delay_ms: 400,
            backoff_multiplier: 3.0,
            jitter: 0.1,
        };
        let retry = settings.to_retry_config();
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.initial_delay, Duration::from_millis(50));
        assert_eq!(retry.max_delay, Duration::from_millis(400));
        assert!(retry.retryable_errors.is_empty());
        assert!(retry.on_retry.is_none());
    }

    #[test]
    fn test_remote_store_config() {
        let partial = RemoteStoreConfig {
            url: Some("https://kv.example.com".to_string()),
            token: None,
        };
        assert!(!partial.is_configured());

        let full = RemoteStoreConfig {
            url: Some("https://kv.example.com".to_string()),
            token: Some("secret".to_string()),
        };
        assert!(full.is_configured());
        assert!(!format!("{:?}", full).contains("secret"));

        let yaml = serde_yaml::to_string(&full).unwrap();
        assert!(!yaml.contains("secret"));
    }
}
