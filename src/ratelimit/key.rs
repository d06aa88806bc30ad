//! Rate limit key generation.

use std::fmt;

/// A key that uniquely identifies a rate limit counter.
///
/// The key is composed of a namespace prefix, the protected path and the caller
/// identifier. Every (path, identifier) pair gets its own counter; there is no
/// budget shared across paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// The protected resource (usually an API route)
    pub path: String,
    /// The caller (IP address, user id, API key)
    pub identifier: String,
    rendered: String,
}

impl RateLimitKey {
    /// Create a new key under the given namespace prefix.
    pub fn new(prefix: &str, path: &str, identifier: &str) -> Self {
        // Escaping ':' in the path keeps ("a:b", "c") and ("a", "b:c") apart.
        let escaped_path = path.replace('%', "%25").replace(':', "%3A");
        Self {
            path: path.to_string(),
            identifier: identifier.to_string(),
            rendered: format!("{}:{}:{}", prefix, escaped_path, identifier),
        }
    }

    /// The string form used as the store key.
    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}
