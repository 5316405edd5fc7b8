//! Configuration linting for operational pitfalls
//!
//! Produces warnings only.

use super::{ValidationResult, ValidationWarning};
use crate::AutocertConfig;

/// Let's Encrypt certificates are valid for 90 days
const TYPICAL_LIFETIME_SECS: u64 = 90 * 86_400;

/// Lint configuration
pub fn lint_config(config: &AutocertConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    if config.hosts.is_empty() {
        result.add_warning(ValidationWarning::new(
            "No hosts configured; every certificate request will be rejected",
        ));
    }

    if !config.hosts.patterns.is_empty() && config.hosts.rate_limit.is_none() {
        result.add_warning(ValidationWarning::new(
            "Host patterns are configured without a rate-limit; any subdomain can trigger issuance",
        ));
    }

    if config.renewal.renew_before_secs >= TYPICAL_LIFETIME_SECS {
        result.add_warning(ValidationWarning::new(format!(
            "renew-before ({} days) is not shorter than a 90 day certificate lifetime; certificates will renew on every check",
            config.renewal.renew_before_secs / 86_400
        )));
    }

    if config.renewal.check_interval_secs < crate::renewal::MIN_CHECK_INTERVAL_SECS {
        result.add_warning(ValidationWarning::new(format!(
            "check-interval-secs {} is below the minimum; {} will be used",
            config.renewal.check_interval_secs,
            crate::renewal::MIN_CHECK_INTERVAL_SECS
        )));
    }

    if config.renewal.check_interval_secs >= config.renewal.renew_before_secs {
        result.add_warning(ValidationWarning::new(
            "check-interval-secs is not shorter than renew-before; certificates may expire between checks",
        ));
    }

    if config.acme.directory_url.is_some() && config.acme.staging {
        result.add_warning(ValidationWarning::new(
            "Both directory-url and staging are set; directory-url takes precedence",
        ));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_hosts_warns() {
        let result = lint_config(&AutocertConfig::default());
        assert!(result
            .warnings
            .iter()
            .any(|w| w.message.contains("No hosts configured")));
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_patterns_without_rate_limit_warn() {
        let mut config = AutocertConfig::default();
        config.hosts.patterns.push("*.example.com".to_string());

        let result = lint_config(&config);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.message.contains("rate-limit")));
    }

    #[test]
    fn test_long_renew_before_warns() {
        let mut config = AutocertConfig::default();
        config.hosts.allow.push("example.com".to_string());
        config.renewal.renew_before_secs = 90 * 86_400;

        let result = lint_config(&config);
        assert_eq!(result.warnings.len(), 1);
    }
}
