//! Renewal and store bookkeeping settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Lower bound applied to the scheduler interval
pub const MIN_CHECK_INTERVAL_SECS: u64 = 60;

/// Renewal configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct RenewalConfig {
    /// Renew when a certificate has less than this left (default 30 days)
    #[serde(default = "default_renew_before_secs")]
    #[validate(range(min = 3600))]
    pub renew_before_secs: u64,

    /// Period between renewal scans (default 12 hours)
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// How long a failed attempt suppresses new attempts for the same host
    #[serde(default = "default_failure_cooldown_secs")]
    pub failure_cooldown_secs: u64,

    /// Idle time after which an entry is dropped from memory
    #[serde(default = "default_retention_secs")]
    #[validate(range(min = 60))]
    pub retention_secs: u64,

    /// Upper bound on entries kept in memory
    #[serde(default = "default_max_entries")]
    #[validate(range(min = 1))]
    pub max_entries: usize,
}

pub(crate) fn default_renew_before_secs() -> u64 {
    30 * 24 * 3600
}

pub(crate) fn default_check_interval_secs() -> u64 {
    12 * 3600
}

pub(crate) fn default_failure_cooldown_secs() -> u64 {
    60
}

pub(crate) fn default_retention_secs() -> u64 {
    7 * 24 * 3600
}

pub(crate) fn default_max_entries() -> usize {
    10_000
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            renew_before_secs: default_renew_before_secs(),
            check_interval_secs: default_check_interval_secs(),
            failure_cooldown_secs: default_failure_cooldown_secs(),
            retention_secs: default_retention_secs(),
            max_entries: default_max_entries(),
        }
    }
}

impl RenewalConfig {
    pub fn renew_before(&self) -> Duration {
        Duration::from_secs(self.renew_before_secs)
    }

    /// Scan interval, clamped to [`MIN_CHECK_INTERVAL_SECS`]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(MIN_CHECK_INTERVAL_SECS))
    }

    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_secs(self.failure_cooldown_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RenewalConfig::default();
        assert_eq!(config.renew_before(), Duration::from_secs(30 * 86400));
        assert_eq!(config.check_interval(), Duration::from_secs(12 * 3600));
    }

    #[test]
    fn test_check_interval_clamped() {
        let config = RenewalConfig {
            check_interval_secs: 5,
            ..Default::default()
        };
        assert_eq!(config.check_interval(), Duration::from_secs(60));
    }
}
