//! Server name normalisation.
//!
//! Every name reaching the policy, the store or the cache goes through
//! [`normalize_hostname`] first, so `Example.COM.` and `example.com` share one
//! store entry and one cache key.

use crate::error::AutocertError;

/// Longest DNS name in presentation form
const MAX_NAME_LEN: usize = 253;

/// Longest single DNS label
const MAX_LABEL_LEN: usize = 63;

/// Normalise a requested server name
///
/// Trims one trailing dot, lowercases, and converts internationalised names
/// to their ASCII form. Names that cannot appear in a certificate or would
/// escape a cache key are rejected.
///
/// # Errors
///
/// Returns [`AutocertError::InvalidServerName`] for empty names, names without
/// a dot, IP literals, wildcards, and names containing `/`, `\`, `+` or
/// whitespace.
pub fn normalize_hostname(name: &str) -> Result<String, AutocertError> {
    let trimmed = name.strip_suffix('.').unwrap_or(name);

    if trimmed.is_empty() {
        return Err(AutocertError::invalid_name(name, "empty name"));
    }
    if let Some(c) = trimmed
        .chars()
        .find(|c| matches!(c, '/' | '\\' | '+' | '*') || c.is_whitespace())
    {
        return Err(AutocertError::invalid_name(
            name,
            format!("contains forbidden character {:?}", c),
        ));
    }

    let ascii = match url::Host::parse(trimmed) {
        Ok(url::Host::Domain(domain)) => domain,
        Ok(url::Host::Ipv4(_)) | Ok(url::Host::Ipv6(_)) => {
            return Err(AutocertError::invalid_name(
                name,
                "IP addresses are not supported",
            ));
        }
        Err(e) => return Err(AutocertError::invalid_name(name, e.to_string())),
    };

    if !ascii.contains('.') {
        return Err(AutocertError::invalid_name(name, "name has no dot"));
    }
    if ascii.len() > MAX_NAME_LEN {
        return Err(AutocertError::invalid_name(name, "name too long"));
    }
    if ascii
        .split('.')
        .any(|label| label.is_empty() || label.len() > MAX_LABEL_LEN)
    {
        return Err(AutocertError::invalid_name(name, "empty or oversized label"));
    }

    Ok(ascii)
}
