//! Section parsers for the top-level configuration blocks.

use ::kdl::KdlNode;
use anyhow::Result;
use autocert_common::{LogFormat, RetryPolicy};
use tracing::trace;

use super::helpers::{
    args, get_bool_entry, get_child, get_int_entry, get_prop, get_string_entry,
    get_string_list, to_u64,
};
use crate::{
    AcmeConfig, ChallengeType, HostsConfig, ListenerConfig, LoggingConfig, RateLimitConfig,
    RenewalConfig,
};

const SECS_PER_DAY: u64 = 86_400;

fn get_u64(node: &KdlNode, name: &str) -> Result<Option<u64>> {
    get_int_entry(node, name).map(|v| to_u64(v, name)).transpose()
}

/// Parse the `acme` block
pub fn parse_acme(node: &KdlNode) -> Result<AcmeConfig> {
    trace!("Parsing acme configuration block");
    let defaults = AcmeConfig::default();

    let challenges = match get_child(node, "challenges") {
        Some(child) => args(child)
            .map(|value| {
                let name = value.as_string().unwrap_or_default();
                ChallengeType::parse(name).ok_or_else(|| {
                    anyhow::anyhow!(
                        "Invalid challenge type '{}'. Valid types: tls-alpn-01, http-01",
                        value
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?,
        None => defaults.challenges,
    };

    let config = AcmeConfig {
        email: get_string_entry(node, "email").unwrap_or_default(),
        directory_url: get_string_entry(node, "directory-url"),
        staging: get_bool_entry(node, "staging").unwrap_or(false),
        challenges,
        issuance_timeout_secs: get_u64(node, "issuance-timeout-secs")?
            .unwrap_or(defaults.issuance_timeout_secs),
        retry: match get_child(node, "retry") {
            Some(child) => parse_retry(child, defaults.retry)?,
            None => defaults.retry,
        },
        poll: match get_child(node, "poll") {
            Some(child) => parse_retry(child, defaults.poll)?,
            None => defaults.poll,
        },
    };

    trace!(
        staging = config.staging,
        challenges = ?config.challenges,
        "Parsed acme configuration"
    );

    Ok(config)
}

fn parse_retry(node: &KdlNode, defaults: RetryPolicy) -> Result<RetryPolicy> {
    Ok(RetryPolicy {
        max_attempts: get_u64(node, "max-attempts")?
            .map(|v| v.min(u32::MAX as u64) as u32)
            .unwrap_or(defaults.max_attempts),
        initial_backoff_ms: get_u64(node, "initial-backoff-ms")?
            .unwrap_or(defaults.initial_backoff_ms),
        max_backoff_ms: get_u64(node, "max-backoff-ms")?.unwrap_or(defaults.max_backoff_ms),
    })
}

/// Parse the `renewal` block
///
/// `renew-before-days` and `renew-before-secs` are both accepted; the latter
/// wins when both are present.
pub fn parse_renewal(node: &KdlNode) -> Result<RenewalConfig> {
    trace!("Parsing renewal configuration block");
    let defaults = RenewalConfig::default();

    let renew_before_secs = match get_u64(node, "renew-before-secs")? {
        Some(secs) => secs,
        None => get_u64(node, "renew-before-days")?
            .map(|days| days.saturating_mul(SECS_PER_DAY))
            .unwrap_or(defaults.renew_before_secs),
    };

    Ok(RenewalConfig {
        renew_before_secs,
        check_interval_secs: get_u64(node, "check-interval-secs")?
            .unwrap_or(defaults.check_interval_secs),
        failure_cooldown_secs: get_u64(node, "failure-cooldown-secs")?
            .unwrap_or(defaults.failure_cooldown_secs),
        retention_secs: get_u64(node, "retention-secs")?.unwrap_or(defaults.retention_secs),
        max_entries: get_u64(node, "max-entries")?
            .map(|v| v as usize)
            .unwrap_or(defaults.max_entries),
    })
}

/// Parse the `hosts` block
pub fn parse_hosts(node: &KdlNode) -> Result<HostsConfig> {
    trace!("Parsing hosts configuration block");

    let rate_limit = match get_child(node, "rate-limit") {
        Some(child) => {
            let max = get_prop(child, "max")
                .and_then(|v| v.as_integer())
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "'rate-limit' requires a 'max' property, e.g., rate-limit max=10 window-secs=3600"
                    )
                })?;
            let window = get_prop(child, "window-secs")
                .and_then(|v| v.as_integer())
                .unwrap_or(3600);

            Some(RateLimitConfig {
                max_approvals: u32::try_from(max)
                    .map_err(|_| anyhow::anyhow!("'rate-limit' max is out of range"))?,
                window_secs: to_u64(window, "window-secs")?,
            })
        }
        None => None,
    };

    let hosts = HostsConfig {
        allow: get_string_list(node, "allow"),
        patterns: get_string_list(node, "pattern"),
        deny: get_string_list(node, "deny"),
        rate_limit,
    };

    trace!(
        allow = hosts.allow.len(),
        patterns = hosts.patterns.len(),
        deny = hosts.deny.len(),
        "Parsed hosts configuration"
    );

    Ok(hosts)
}

/// Parse the `listener` block
pub fn parse_listener(node: &KdlNode) -> Result<ListenerConfig> {
    trace!("Parsing listener configuration block");
    let defaults = ListenerConfig::default();

    let alpn = if get_child(node, "alpn").is_some() {
        get_string_list(node, "alpn")
    } else {
        defaults.alpn
    };

    Ok(ListenerConfig {
        address: get_string_entry(node, "address").unwrap_or(defaults.address),
        http_address: get_string_entry(node, "http-address"),
        keepalive_secs: get_u64(node, "keepalive-secs")?.unwrap_or(defaults.keepalive_secs),
        handshake_timeout_secs: get_u64(node, "handshake-timeout-secs")?
            .unwrap_or(defaults.handshake_timeout_secs),
        alpn,
    })
}

/// Parse the `logging` block
pub fn parse_logging(node: &KdlNode) -> LoggingConfig {
    let defaults = LoggingConfig::default();

    LoggingConfig {
        level: get_string_entry(node, "level").unwrap_or(defaults.level),
        format: get_string_entry(node, "format")
            .map(|s| LogFormat::from_str_loose(&s))
            .unwrap_or(defaults.format),
    }
}
