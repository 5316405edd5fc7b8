//! Configuration validation
//!
//! Field-level checks come from the `validator` derives on each section;
//! cross-field and filesystem checks live in the submodules. All problems are
//! collected into one [`ValidationResult`].

mod cache;
mod lint;
mod network;

use std::fmt;
use validator::Validate;

use crate::hosts::pattern_suffix;
use crate::AutocertConfig;

pub use cache::validate_cache_dir;
pub use lint::lint_config;
pub use network::validate_addresses;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

/// Category of a validation error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Acme,
    Cache,
    Hosts,
    Renewal,
    Listener,
    Logging,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Acme => "acme",
            ErrorCategory::Cache => "cache",
            ErrorCategory::Hosts => "hosts",
            ErrorCategory::Renewal => "renewal",
            ErrorCategory::Listener => "listener",
            ErrorCategory::Logging => "logging",
        };
        f.write_str(name)
    }
}

/// A problem that prevents the configuration from being used
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

/// A problem worth reporting that does not block startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Collected validation outcome
#[derive(Debug, Default, Clone)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Convert into an error listing every problem, one per line
    pub fn into_result(self) -> anyhow::Result<()> {
        if self.errors.is_empty() {
            return Ok(());
        }

        let lines: Vec<String> = self.errors.iter().map(|e| format!("  - {}", e)).collect();
        Err(anyhow::anyhow!(
            "configuration has {} error(s):\n{}",
            self.errors.len(),
            lines.join("\n")
        ))
    }
}

/// Validate a complete configuration
pub fn validate_config(config: &AutocertConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    add_field_errors(&mut result, ErrorCategory::Acme, "acme", config.acme.validate());
    add_field_errors(&mut result, ErrorCategory::Renewal, "renewal", config.renewal.validate());
    add_field_errors(&mut result, ErrorCategory::Hosts, "hosts", config.hosts.validate());
    add_field_errors(
        &mut result,
        ErrorCategory::Listener,
        "listener",
        config.listener.validate(),
    );

    validate_acme(config, &mut result);
    validate_hosts(config, &mut result);
    validate_logging(config, &mut result);

    result.merge(validate_cache_dir(&config.cache_dir));
    result.merge(validate_addresses(&config.listener));
    result.merge(lint_config(config));

    result
}

fn add_field_errors(
    result: &mut ValidationResult,
    category: ErrorCategory,
    section: &str,
    outcome: Result<(), validator::ValidationErrors>,
) {
    let Err(errors) = outcome else {
        return;
    };

    let mut messages: Vec<String> = Vec::new();
    collect_field_errors(&errors, section, &mut messages);
    messages.sort();

    for message in messages {
        result.add_error(ValidationError::new(category, message));
    }
}

fn collect_field_errors(errors: &validator::ValidationErrors, prefix: &str, out: &mut Vec<String>) {
    for (field, kind) in errors.errors() {
        let path = format!("{}.{}", prefix, field);
        match kind {
            validator::ValidationErrorsKind::Field(list) => {
                for error in list {
                    let detail = error
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("failed '{}' check", error.code));
                    out.push(format!("{}: {}", path, detail));
                }
            }
            validator::ValidationErrorsKind::Struct(inner) => {
                collect_field_errors(inner, &path, out);
            }
            validator::ValidationErrorsKind::List(items) => {
                for (index, inner) in items {
                    collect_field_errors(inner, &format!("{}[{}]", path, index), out);
                }
            }
        }
    }
}

fn validate_acme(config: &AutocertConfig, result: &mut ValidationResult) {
    let challenges = &config.acme.challenges;
    for (i, challenge) in challenges.iter().enumerate() {
        if challenges[..i].contains(challenge) {
            result.add_error(ValidationError::new(
                ErrorCategory::Acme,
                format!("challenge type '{}' listed more than once", challenge),
            ));
        }
    }

    if challenges.contains(&crate::ChallengeType::Http01)
        && !challenges.contains(&crate::ChallengeType::TlsAlpn01)
        && config.listener.http_address.is_none()
    {
        result.add_error(ValidationError::new(
            ErrorCategory::Acme,
            "http-01 is the only challenge type but listener.http-address is not set",
        ));
    }

    for (name, policy) in [("retry", &config.acme.retry), ("poll", &config.acme.poll)] {
        if policy.max_attempts == 0 {
            result.add_error(ValidationError::new(
                ErrorCategory::Acme,
                format!("acme.{}.max-attempts must be at least 1", name),
            ));
        }
        if policy.initial_backoff_ms > policy.max_backoff_ms {
            result.add_error(ValidationError::new(
                ErrorCategory::Acme,
                format!(
                    "acme.{}.initial-backoff-ms ({}) exceeds max-backoff-ms ({})",
                    name, policy.initial_backoff_ms, policy.max_backoff_ms
                ),
            ));
        }
    }
}

fn validate_hosts(config: &AutocertConfig, result: &mut ValidationResult) {
    for host in config.hosts.allow.iter().chain(&config.hosts.deny) {
        if host.trim().is_empty() {
            result.add_error(ValidationError::new(
                ErrorCategory::Hosts,
                "host names must not be empty",
            ));
        } else if host.contains('*') {
            result.add_error(ValidationError::new(
                ErrorCategory::Hosts,
                format!(
                    "'{}' contains a wildcard; use 'pattern' for suffix matches",
                    host
                ),
            ));
        }
    }

    for pattern in &config.hosts.patterns {
        if let Err(message) = pattern_suffix(pattern) {
            result.add_error(ValidationError::new(ErrorCategory::Hosts, message));
        }
    }
}

fn validate_logging(config: &AutocertConfig, result: &mut ValidationResult) {
    let level = config.logging.level.to_ascii_lowercase();
    // Full filter directives such as "autocert=debug" are accepted as-is
    if !level.contains('=') && !LOG_LEVELS.contains(&level.as_str()) {
        result.add_error(ValidationError::new(
            ErrorCategory::Logging,
            format!(
                "invalid log level '{}'. Valid levels: {}",
                config.logging.level,
                LOG_LEVELS.join(", ")
            ),
        ));
    }
}
