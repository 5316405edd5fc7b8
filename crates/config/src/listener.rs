//! TLS listener and HTTP-01 responder settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Listener configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ListenerConfig {
    /// TLS listen address
    #[serde(default = "default_address")]
    pub address: String,

    /// Plain HTTP address for http-01 challenges and HTTPS redirects
    pub http_address: Option<String>,

    /// TCP keep-alive probe period; zero disables keep-alive
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Bound on a single TLS handshake including certificate retrieval
    #[serde(default = "default_handshake_timeout_secs")]
    #[validate(range(min = 1))]
    pub handshake_timeout_secs: u64,

    /// ALPN protocols offered to ordinary clients
    #[serde(default = "default_alpn")]
    pub alpn: Vec<String>,
}

fn default_address() -> String {
    "0.0.0.0:443".to_string()
}

pub(crate) fn default_keepalive_secs() -> u64 {
    180
}

pub(crate) fn default_handshake_timeout_secs() -> u64 {
    120
}

pub(crate) fn default_alpn() -> Vec<String> {
    vec!["h2".to_string(), "http/1.1".to_string()]
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            http_address: None,
            keepalive_secs: default_keepalive_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            alpn: default_alpn(),
        }
    }
}

impl ListenerConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_keepalive_is_valid() {
        let config = ListenerConfig {
            keepalive_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert!(config.keepalive().is_zero());
    }

    #[test]
    fn test_zero_handshake_timeout_is_rejected() {
        let config = ListenerConfig {
            handshake_timeout_secs: 0,
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("handshake_timeout_secs"));
    }
}
