//! Configuration for the autocert certificate manager.
//!
//! Configuration is read from a KDL file:
//!
//! ```kdl
//! acme {
//!     email "ops@example.com"
//!     staging #true
//!     challenges "tls-alpn-01" "http-01"
//! }
//! cache-dir "/var/lib/autocert"
//! hosts {
//!     allow "example.com" "www.example.com"
//!     pattern "*.apps.example.com"
//! }
//! listener {
//!     address "0.0.0.0:443"
//!     http-address "0.0.0.0:80"
//! }
//! ```
//!
//! Every field has a default except the contact email. [`AutocertConfig::validate`]
//! reports every problem at once rather than stopping at the first.

pub mod acme;
pub mod hosts;
pub mod kdl;
pub mod listener;
pub mod renewal;
pub mod validate;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub use acme::{AcmeConfig, ChallengeType, LETS_ENCRYPT_PRODUCTION, LETS_ENCRYPT_STAGING};
pub use autocert_common::{LogFormat, RetryPolicy};
pub use hosts::{HostsConfig, RateLimitConfig};
pub use listener::ListenerConfig;
pub use renewal::RenewalConfig;
pub use validate::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "AUTOCERT_CONFIG";

// ============================================================================
// Top-level configuration
// ============================================================================

/// Complete manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutocertConfig {
    #[serde(default)]
    pub acme: AcmeConfig,

    /// Directory holding cached certificates and the account key
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default)]
    pub renewal: RenewalConfig,

    #[serde(default)]
    pub hosts: HostsConfig,

    #[serde(default)]
    pub listener: ListenerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("autocert-cache")
}

impl Default for AutocertConfig {
    fn default() -> Self {
        Self {
            acme: AcmeConfig::default(),
            cache_dir: default_cache_dir(),
            renewal: RenewalConfig::default(),
            hosts: HostsConfig::default(),
            listener: ListenerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl AutocertConfig {
    /// Load and validate configuration from a KDL file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not parse, or fails
    /// validation. Validation warnings are logged.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;

        let config = Self::from_kdl(&content)
            .with_context(|| format!("invalid configuration in {}", path.display()))?;

        let result = config.validate();
        for warning in &result.warnings {
            tracing::warn!(warning = %warning.message, "Configuration warning");
        }
        result.into_result()?;

        info!(
            path = %path.display(),
            cache_dir = %config.cache_dir.display(),
            directory = config.acme.directory(),
            allowed_hosts = config.hosts.allow.len(),
            host_patterns = config.hosts.patterns.len(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Parse configuration from KDL text without validating it
    pub fn from_kdl(content: &str) -> Result<Self> {
        kdl::parse_document(content)
    }

    /// Run field and semantic validation, collecting every problem
    pub fn validate(&self) -> ValidationResult {
        validate::validate_config(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_from_file_loads_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
acme {{
    email "ops@example.com"
}}
hosts {{
    allow "example.com"
}}
"#
        )
        .unwrap();

        let config = AutocertConfig::from_file(file.path()).unwrap();
        assert_eq!(config.acme.email, "ops@example.com");
        assert_eq!(config.hosts.allow, vec!["example.com".to_string()]);
        assert_eq!(config.cache_dir, PathBuf::from("autocert-cache"));
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"acme {{ email "nobody" }}"#).unwrap();

        let err = AutocertConfig::from_file(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("email"));
    }

    #[test]
    fn test_from_file_missing() {
        assert!(AutocertConfig::from_file("/nonexistent/autocert.kdl").is_err());
    }
}
