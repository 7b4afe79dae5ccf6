//! Unified Redis key builder
//!
//! Every key the router touches goes through [`KeyBuilder`] so the
//! namespaces stay consistent and can be isolated per environment with a
//! configurable prefix (default `pushroute:`).

use crate::Config;

/// Builds the namespaced keys for sessions and device tokens
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    prefix: String,
}

impl KeyBuilder {
    /// Create a new `KeyBuilder` with the given prefix
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Create `KeyBuilder` from configuration
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.redis.key_prefix.clone())
    }

    /// Connection currently recorded for a recipient
    ///
    /// Type: String + TTL (7 days)
    /// Value: connection id
    #[must_use]
    pub fn session(&self, recipient_id: &str) -> String {
        format!("{}session:{}", self.prefix, recipient_id)
    }

    /// Device token registered by a recipient
    ///
    /// Type: String + TTL (7 days)
    /// Value: device token
    #[must_use]
    pub fn recipient_token(&self, recipient_id: &str) -> String {
        format!("{}recipient_token:{}", self.prefix, recipient_id)
    }

    /// Recipient owning a device token
    ///
    /// Type: String + TTL (7 days)
    /// Value: recipient id
    #[must_use]
    pub fn token_recipient(&self, device_token: &str) -> String {
        format!("{}token_recipient:{}", self.prefix, device_token)
    }

    /// Every device token not reported invalid
    ///
    /// Type: Hash (field = token, value = 1), no TTL
    #[must_use]
    pub fn device_tokens(&self) -> String {
        format!("{}device_tokens", self.prefix)
    }
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self::new("pushroute:")
    }
}
