//! Credentials and endpoint settings for a manager connection.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Login credentials for the manager interface.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Manager user name.
    pub user: String,
    /// Manager secret.
    pub secret: String,
}

impl Credentials {
    /// Create credentials from a user name and secret.
    #[must_use]
    pub fn new(user: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Endpoint settings handed to the transport on every connect attempt.
///
/// Stored by the session so reconnection reuses the same settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectOptions {
    /// Remote host.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Local address to bind, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_address: Option<String>,
    /// Local port to bind, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    /// Transport specific extras.
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::new("127.0.0.1", 5038)
    }
}

impl ConnectOptions {
    /// Create settings for `host:port`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            local_address: None,
            local_port: None,
            extra: HashMap::new(),
        }
    }

    /// `host:port` form used in logs and error messages.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get an extra setting by key.
    #[must_use]
    pub fn get_extra(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Set an extra setting.
    pub fn set_extra(&mut self, key: impl Into<String>, value: Value) {
        self.extra.insert(key.into(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_endpoint() {
        let options = ConnectOptions::default();
        assert_eq!(options.address(), "127.0.0.1:5038");
    }

    #[test]
    fn test_secret_is_not_logged() {
        let creds = Credentials::new("admin", "s3cret");
        let debug = format!("{creds:?}");
        assert!(debug.contains("admin"));
        assert!(!debug.contains("s3cret"));
    }
}
