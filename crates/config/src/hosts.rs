//! Host policy settings.
//!
//! With every list empty no hostname is approved for issuance.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Hostnames approved for certificate issuance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct HostsConfig {
    /// Exact hostnames
    #[serde(default)]
    pub allow: Vec<String>,

    /// Suffix patterns of the form `*.example.com`
    #[serde(default)]
    pub patterns: Vec<String>,

    /// Hostnames rejected even if allowed above
    #[serde(default)]
    pub deny: Vec<String>,

    /// Cap on approvals per window
    #[validate(nested)]
    pub rate_limit: Option<RateLimitConfig>,
}

impl HostsConfig {
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.patterns.is_empty()
    }
}

/// Approval rate limit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct RateLimitConfig {
    #[validate(range(min = 1))]
    pub max_approvals: u32,

    #[validate(range(min = 1))]
    pub window_secs: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Check the shape of a suffix pattern and return the suffix it covers
///
/// Accepts exactly one leading `*.` followed by a name containing no further
/// wildcards, e.g. `*.example.com` yields `example.com`.
pub fn pattern_suffix(pattern: &str) -> Result<&str, String> {
    let suffix = pattern
        .strip_prefix("*.")
        .ok_or_else(|| format!("pattern '{}' must start with '*.'", pattern))?;

    if suffix.is_empty() {
        return Err(format!("pattern '{}' has an empty suffix", pattern));
    }
    if suffix.contains('*') {
        return Err(format!(
            "pattern '{}' may only contain a single leading wildcard",
            pattern
        ));
    }
    if suffix.starts_with('.') || suffix.ends_with('.') || suffix.contains("..") {
        return Err(format!("pattern '{}' has an empty label", pattern));
    }

    Ok(suffix)
}
