//! ACME account and issuance settings.

use autocert_common::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Challenge types the coordinator can complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeType {
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
    #[serde(rename = "http-01")]
    Http01,
}

impl ChallengeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeType::TlsAlpn01 => "tls-alpn-01",
            ChallengeType::Http01 => "http-01",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tls-alpn-01" => Some(ChallengeType::TlsAlpn01),
            "http-01" => Some(ChallengeType::Http01),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ACME configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct AcmeConfig {
    /// Contact email for the ACME account
    #[validate(email(message = "must be a valid email address"))]
    pub email: String,

    /// Explicit directory URL, overrides `staging`
    #[validate(url(message = "must be a valid URL"))]
    pub directory_url: Option<String>,

    /// Use the Let's Encrypt staging directory
    #[serde(default)]
    pub staging: bool,

    /// Challenge types in order of preference
    #[serde(default = "default_challenges")]
    #[validate(length(min = 1, message = "at least one challenge type is required"))]
    pub challenges: Vec<ChallengeType>,

    /// Upper bound for one complete issuance attempt
    #[serde(default = "default_issuance_timeout_secs")]
    #[validate(range(min = 10, max = 3600))]
    pub issuance_timeout_secs: u64,

    /// Retry policy for transient ACME and cache failures
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Polling budget for authorization and order status
    #[serde(default = "default_poll")]
    pub poll: RetryPolicy,
}

pub(crate) fn default_challenges() -> Vec<ChallengeType> {
    vec![ChallengeType::TlsAlpn01, ChallengeType::Http01]
}

pub(crate) fn default_issuance_timeout_secs() -> u64 {
    300
}

pub(crate) fn default_poll() -> RetryPolicy {
    RetryPolicy::new(10, Duration::from_millis(250), Duration::from_secs(10))
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            email: String::new(),
            directory_url: None,
            staging: false,
            challenges: default_challenges(),
            issuance_timeout_secs: default_issuance_timeout_secs(),
            retry: RetryPolicy::default(),
            poll: default_poll(),
        }
    }
}

impl AcmeConfig {
    /// Directory URL in effect after applying `staging`
    pub fn directory(&self) -> &str {
        match (&self.directory_url, self.staging) {
            (Some(url), _) => url,
            (None, true) => LETS_ENCRYPT_STAGING,
            (None, false) => LETS_ENCRYPT_PRODUCTION,
        }
    }

    pub fn issuance_timeout(&self) -> Duration {
        Duration::from_secs(self.issuance_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_selection() {
        let mut config = AcmeConfig::default();
        assert_eq!(config.directory(), LETS_ENCRYPT_PRODUCTION);

        config.staging = true;
        assert_eq!(config.directory(), LETS_ENCRYPT_STAGING);

        config.directory_url = Some("https://localhost:14000/dir".to_string());
        assert_eq!(config.directory(), "https://localhost:14000/dir");
    }

    #[test]
    fn test_challenge_type_parse() {
        assert_eq!(ChallengeType::parse("tls-alpn-01"), Some(ChallengeType::TlsAlpn01));
        assert_eq!(ChallengeType::parse("HTTP-01"), Some(ChallengeType::Http01));
        assert_eq!(ChallengeType::parse("dns-01"), None);
    }

    #[test]
    fn test_field_validation() {
        let config = AcmeConfig {
            email: "not-an-email".to_string(),
            challenges: vec![],
            ..Default::default()
        };

        let errors = config.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("email"));
        assert!(fields.contains_key("challenges"));
    }
}
