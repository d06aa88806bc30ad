//! REST key-value store client.
//!
//! Talks to a Redis-compatible store exposed over HTTP: each command is POSTed
//! to the base URL as a JSON array (`["GET", key]`, `["SET", key, value, "PX", ms]`)
//! with bearer-token authentication, and the reply is `{"result": ...}` or
//! `{"error": "..."}`.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::trace;

use super::backend::RateLimitStore;
use super::counter::RateLimitEntry;
use crate::config::RemoteStoreConfig;
use crate::error::{GuardError, Result};

/// HTTP client for a REST key-value store.
#[derive(Clone)]
pub struct HttpKvStore {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct KvReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

impl fmt::Debug for HttpKvStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpKvStore")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl HttpKvStore {
    /// Create a client for the store at `base_url`.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let token = token.into();
        if base_url.is_empty() {
            return Err(GuardError::Config("remote store url is empty".to_string()));
        }
        if token.is_empty() {
            return Err(GuardError::Config(
                "remote store token is empty".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            token,
        })
    }

    /// Build a client from configuration; `None` when no store is configured.
    pub fn from_config(config: &RemoteStoreConfig) -> Result<Option<Self>> {
        match (&config.url, &config.token) {
            (Some(url), Some(token)) => Self::new(url.clone(), token.clone()).map(Some),
            _ => Ok(None),
        }
    }

    /// The store's base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn command(&self, args: Value) -> Result<Option<Value>> {
        trace!(command = %args, "Sending key-value command");

        let reply: KvReply = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.token)
            .json(&args)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = reply.error {
            return Err(GuardError::Store(error));
        }
        Ok(reply.result.filter(|v| !v.is_null()))
    }
}

#[async_trait]
impl RateLimitStore for HttpKvStore {
    async fn get(&self, key: &str) -> Result<Option<RateLimitEntry>> {
        match self.command(json!(["GET", key])).await? {
            None => Ok(None),
            Some(Value::String(raw)) => Ok(Some(serde_json::from_str(&raw)?)),
            Some(other) => Err(GuardError::Store(format!(
                "unexpected GET result for {}: {}",
                key, other
            ))),
        }
    }

    async fn set(&self, key: &str, entry: &RateLimitEntry, ttl: Duration) -> Result<()> {
        let value = serde_json::to_string(entry)?;
        let ttl_ms = ttl.as_millis().max(1).to_string();
        self.command(json!(["SET", key, value, "PX", ttl_ms])).await?;
        Ok(())
    }
}
