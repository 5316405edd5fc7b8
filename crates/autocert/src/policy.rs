//! Host policy gate
//!
//! Decides whether the manager may attempt issuance for a server name. A
//! policy is consulted on every memory miss before any cache or network I/O,
//! so implementations must be cheap and must not block.
//!
//! Policies compose: [`AnyOf`] unions several allow rules, [`DenyList`]
//! carves exceptions out of an inner policy, and [`RateLimited`] caps how many
//! approvals an inner policy may grant per window. Any
//! `Fn(&str) -> bool + Send + Sync` closure is also a policy.
//!
//! Hostnames passed to [`HostPolicy::approve`] are already normalised
//! (lowercase ASCII, no trailing dot).

use std::collections::HashSet;
use std::time::{Duration, Instant};

use autocert_config::hosts::pattern_suffix;
use autocert_config::HostsConfig;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::AutocertError;
use crate::hostname::normalize_hostname;

/// Approves or rejects issuance for a hostname
pub trait HostPolicy: Send + Sync {
    fn approve(&self, hostname: &str) -> bool;
}

impl<F> HostPolicy for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn approve(&self, hostname: &str) -> bool {
        self(hostname)
    }
}

// ============================================================================
// Leaf policies
// ============================================================================

/// Rejects every hostname; the default when nothing is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl HostPolicy for DenyAll {
    fn approve(&self, _hostname: &str) -> bool {
        false
    }
}

/// Exact-match allow list
#[derive(Debug, Clone, Default)]
pub struct HostAllowList {
    hosts: HashSet<String>,
}

impl HostAllowList {
    /// Build an allow list, normalising every entry
    ///
    /// # Errors
    ///
    /// Returns [`AutocertError::Configuration`] if an entry is not a valid
    /// hostname.
    pub fn new<I, S>(hosts: I) -> Result<Self, AutocertError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hosts = hosts
            .into_iter()
            .map(|h| {
                normalize_hostname(h.as_ref()).map_err(|e| {
                    AutocertError::Configuration(format!("allow list entry: {}", e))
                })
            })
            .collect::<Result<HashSet<_>, _>>()?;

        Ok(Self { hosts })
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl HostPolicy for HostAllowList {
    fn approve(&self, hostname: &str) -> bool {
        self.hosts.contains(hostname)
    }
}

/// Matches every name strictly below a suffix, written `*.example.com`
///
/// `a.example.com` and `a.b.example.com` match; `example.com` itself does not.
#[derive(Debug, Clone)]
pub struct SuffixPattern {
    /// Normalised suffix with a leading dot, e.g. `.example.com`
    dotted_suffix: String,
}

impl SuffixPattern {
    /// # Errors
    ///
    /// Returns [`AutocertError::Configuration`] for patterns such as `*`,
    /// `*.`, `a*.b` or a wildcard anywhere but the leading label.
    pub fn new(pattern: &str) -> Result<Self, AutocertError> {
        let suffix = pattern_suffix(pattern).map_err(AutocertError::Configuration)?;

        // Single-label suffixes are fine here even though they are not valid
        // certificate names themselves
        let normalized = match normalize_hostname(suffix) {
            Ok(name) => name,
            Err(_) => normalize_hostname(&format!("x.{}", suffix))
                .map(|n| n["x.".len()..].to_string())
                .map_err(|e| {
                    AutocertError::Configuration(format!("pattern '{}': {}", pattern, e))
                })?,
        };

        Ok(Self {
            dotted_suffix: format!(".{}", normalized),
        })
    }
}

impl HostPolicy for SuffixPattern {
    fn approve(&self, hostname: &str) -> bool {
        hostname.len() > self.dotted_suffix.len() && hostname.ends_with(&self.dotted_suffix)
    }
}

// ============================================================================
// Combinators
// ============================================================================

/// Approves when any inner policy approves
#[derive(Default)]
pub struct AnyOf {
    policies: Vec<Box<dyn HostPolicy>>,
}

impl AnyOf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, policy: impl HostPolicy + 'static) -> Self {
        self.policies.push(Box::new(policy));
        self
    }

    pub fn push(&mut self, policy: Box<dyn HostPolicy>) {
        self.policies.push(policy);
    }
}

impl HostPolicy for AnyOf {
    fn approve(&self, hostname: &str) -> bool {
        self.policies.iter().any(|p| p.approve(hostname))
    }
}

/// Rejects listed names before consulting the inner policy
pub struct DenyList {
    denied: HashSet<String>,
    inner: Box<dyn HostPolicy>,
}

impl DenyList {
    /// # Errors
    ///
    /// Returns [`AutocertError::Configuration`] if an entry is not a valid
    /// hostname.
    pub fn new<I, S>(denied: I, inner: impl HostPolicy + 'static) -> Result<Self, AutocertError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::boxed(denied, Box::new(inner))
    }

    fn boxed<I, S>(denied: I, inner: Box<dyn HostPolicy>) -> Result<Self, AutocertError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let denied = denied
            .into_iter()
            .map(|h| {
                normalize_hostname(h.as_ref())
                    .map_err(|e| AutocertError::Configuration(format!("deny list entry: {}", e)))
            })
            .collect::<Result<HashSet<_>, _>>()?;

        Ok(Self { denied, inner })
    }
}

impl HostPolicy for DenyList {
    fn approve(&self, hostname: &str) -> bool {
        !self.denied.contains(hostname) && self.inner.approve(hostname)
    }
}

/// Caps the number of approvals granted per fixed window
///
/// Names the inner policy rejects do not consume the budget.
pub struct RateLimited {
    inner: Box<dyn HostPolicy>,
    max_approvals: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

struct WindowState {
    started: Instant,
    granted: u32,
}

impl RateLimited {
    pub fn new(inner: impl HostPolicy + 'static, max_approvals: u32, window: Duration) -> Self {
        Self::boxed(Box::new(inner), max_approvals, window)
    }

    fn boxed(inner: Box<dyn HostPolicy>, max_approvals: u32, window: Duration) -> Self {
        Self {
            inner,
            max_approvals,
            window,
            state: Mutex::new(WindowState {
                started: Instant::now(),
                granted: 0,
            }),
        }
    }
}

impl HostPolicy for RateLimited {
    fn approve(&self, hostname: &str) -> bool {
        if !self.inner.approve(hostname) {
            return false;
        }

        let mut state = self.state.lock();
        if state.started.elapsed() >= self.window {
            state.started = Instant::now();
            state.granted = 0;
        }

        if state.granted >= self.max_approvals {
            warn!(
                host = %hostname,
                max_approvals = self.max_approvals,
                window_secs = self.window.as_secs(),
                "Issuance approval rate limit reached"
            );
            return false;
        }

        state.granted += 1;
        true
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Build the policy described by a `hosts` configuration block
///
/// Nothing configured yields [`DenyAll`].
///
/// # Errors
///
/// Returns [`AutocertError::Configuration`] for invalid names or patterns.
pub fn from_config(config: &HostsConfig) -> Result<Box<dyn HostPolicy>, AutocertError> {
    if config.is_empty() {
        debug!("No hosts configured, denying all issuance");
        return Ok(Box::new(DenyAll));
    }

    let mut any = AnyOf::new();
    if !config.allow.is_empty() {
        any.push(Box::new(HostAllowList::new(&config.allow)?));
    }
    for pattern in &config.patterns {
        any.push(Box::new(SuffixPattern::new(pattern)?));
    }

    let mut policy: Box<dyn HostPolicy> = Box::new(any);

    if !config.deny.is_empty() {
        policy = Box::new(DenyList::boxed(&config.deny, policy)?);
    }

    if let Some(ref limit) = config.rate_limit {
        policy = Box::new(RateLimited::boxed(
            policy,
            limit.max_approvals,
            limit.window(),
        ));
    }

    debug!(
        allow = config.allow.len(),
        patterns = config.patterns.len(),
        deny = config.deny.len(),
        rate_limited = config.rate_limit.is_some(),
        "Built host policy"
    );

    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use autocert_config::RateLimitConfig;

    #[test]
    fn test_deny_all() {
        assert!(!DenyAll.approve("example.com"));
    }

    #[test]
    fn test_allow_list_normalises_entries() {
        let policy = HostAllowList::new(["Example.COM.", "www.example.com"]).unwrap();
        assert_eq!(policy.len(), 2);
        assert!(policy.approve("example.com"));
        assert!(policy.approve("www.example.com"));
        assert!(!policy.approve("api.example.com"));
    }

    #[test]
    fn test_allow_list_rejects_invalid_entry() {
        let err = HostAllowList::new(["ok.example.com", "not valid"]).unwrap_err();
        assert!(matches!(err, AutocertError::Configuration(_)));
    }

    #[test]
    fn test_suffix_pattern() {
        let policy = SuffixPattern::new("*.Example.com").unwrap();
        assert!(policy.approve("a.example.com"));
        assert!(policy.approve("a.b.example.com"));
        assert!(!policy.approve("example.com"));
        assert!(!policy.approve("badexample.com"));
        assert!(!policy.approve("a.example.org"));
    }

    #[test]
    fn test_suffix_pattern_single_label() {
        let policy = SuffixPattern::new("*.internal").unwrap();
        assert!(policy.approve("db.internal"));
        assert!(!policy.approve("internal"));
    }

    #[test]
    fn test_malformed_patterns_rejected() {
        for bad in ["*", "*.", "a*.b", "*.a.*.b", "example.com"] {
            assert!(
                matches!(SuffixPattern::new(bad), Err(AutocertError::Configuration(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_any_of_and_closure() {
        let policy = AnyOf::new()
            .with(HostAllowList::new(["example.com"]).unwrap())
            .with(|host: &str| host.ends_with(".test"));

        assert!(policy.approve("example.com"));
        assert!(policy.approve("a.test"));
        assert!(!policy.approve("example.org"));
        assert!(!AnyOf::new().approve("example.com"));
    }

    #[test]
    fn test_deny_list_overrides_inner() {
        let policy = DenyList::new(
            ["admin.example.com"],
            SuffixPattern::new("*.example.com").unwrap(),
        )
        .unwrap();

        assert!(policy.approve("www.example.com"));
        assert!(!policy.approve("admin.example.com"));
    }

    #[test]
    fn test_rate_limited_caps_approvals() {
        let policy = RateLimited::new(
            SuffixPattern::new("*.example.com").unwrap(),
            2,
            Duration::from_secs(3600),
        );

        // Rejections from the inner policy do not consume the budget
        assert!(!policy.approve("example.org"));
        assert!(policy.approve("a.example.com"));
        assert!(policy.approve("b.example.com"));
        assert!(!policy.approve("c.example.com"));
    }

    #[test]
    fn test_rate_limited_window_resets() {
        let policy = RateLimited::new(|_: &str| true, 1, Duration::from_millis(20));

        assert!(policy.approve("a.example.com"));
        assert!(!policy.approve("b.example.com"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(policy.approve("b.example.com"));
    }

    #[test]
    fn test_from_config_empty_denies() {
        let policy = from_config(&HostsConfig::default()).unwrap();
        assert!(!policy.approve("example.com"));
    }

    #[test]
    fn test_from_config_composes() {
        let config = HostsConfig {
            allow: vec!["example.com".into()],
            patterns: vec!["*.apps.example.com".into()],
            deny: vec!["admin.apps.example.com".into()],
            rate_limit: Some(RateLimitConfig {
                max_approvals: 3,
                window_secs: 3600,
            }),
        };
        let policy = from_config(&config).unwrap();

        assert!(policy.approve("example.com"));
        assert!(policy.approve("web.apps.example.com"));
        assert!(!policy.approve("admin.apps.example.com"));
        assert!(!policy.approve("www.example.com"));
        assert!(policy.approve("api.apps.example.com"));
        // Budget of three is now spent
        assert!(!policy.approve("more.apps.example.com"));
    }

    #[test]
    fn test_from_config_rejects_bad_pattern() {
        let config = HostsConfig {
            patterns: vec!["a*.example.com".into()],
            ..Default::default()
        };
        assert!(from_config(&config).is_err());
    }
}
