//! Error types for certificate management
//!
//! [`AutocertError`] is `Clone` because one issuance outcome is handed to
//! every caller waiting on the same hostname.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the manager, the store and the listener
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AutocertError {
    /// The host policy refused issuance for this name
    #[error("host '{host}' is not approved for certificate issuance")]
    PolicyRejected { host: String },

    /// The requested server name cannot be used as a certificate name
    #[error("invalid server name '{name}': {reason}")]
    InvalidServerName { name: String, reason: String },

    /// The ACME server rejected the request or the validation failed
    #[error("ACME validation failed for '{host}': {detail}")]
    Protocol { host: String, detail: String },

    /// The CA refused to register or restore the ACME account
    #[error("ACME account error: {0}")]
    Account(String),

    /// Connectivity or server-side failure worth retrying
    #[error("transient ACME failure: {0}")]
    Transient(String),

    /// Durable storage failure
    #[error("certificate cache error: {0}")]
    Cache(String),

    /// Invalid construction-time settings
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Certificate or key material could not be built or parsed
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Certificate retrieval did not finish within the handshake bound
    #[error("no certificate for '{host}' within {timeout:?}")]
    HandshakeTimeout { host: String, timeout: Duration },

    /// The task performing issuance went away without reporting a result
    #[error("issuance for '{0}' was abandoned")]
    Abandoned(String),
}

impl AutocertError {
    /// Whether an immediate retry can succeed
    pub fn is_retriable(&self) -> bool {
        matches!(self, AutocertError::Transient(_))
    }

    /// Whether this is a policy rejection
    pub fn is_policy_rejection(&self) -> bool {
        matches!(self, AutocertError::PolicyRejected { .. })
    }

    pub(crate) fn invalid_name(name: &str, reason: impl Into<String>) -> Self {
        AutocertError::InvalidServerName {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors from a [`Cache`](crate::cache::Cache) backend
#[derive(Debug, Error)]
pub enum CacheError {
    /// No entry under the key
    #[error("cache miss")]
    Miss,

    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The key cannot be mapped to a storage location
    #[error("invalid cache key '{0}'")]
    InvalidKey(String),
}

/// Why a TLS connection was not established
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("TLS handshake I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The ClientHello carried no SNI server name
    #[error("client did not send a server name")]
    MissingServerName,

    /// The handshake did not finish within the handshake bound
    #[error("TLS handshake did not complete within {0:?}")]
    Timeout(Duration),

    /// No certificate could be obtained for the requested name
    #[error(transparent)]
    Certificate(#[from] AutocertError),

    /// A tls-alpn-01 validation handshake was answered and closed
    #[error("answered ACME tls-alpn-01 validation for '{host}'")]
    ChallengeServed { host: String },
}

impl HandshakeError {
    /// Whether this was an ACME validation handshake rather than a failure
    pub fn is_challenge(&self) -> bool {
        matches!(self, HandshakeError::ChallengeServed { .. })
    }
}

impl From<CacheError> for AutocertError {
    fn from(e: CacheError) -> Self {
        AutocertError::Cache(e.to_string())
    }
}

impl From<rcgen::Error> for AutocertError {
    fn from(e: rcgen::Error) -> Self {
        AutocertError::Certificate(e.to_string())
    }
}

impl From<rustls::Error> for AutocertError {
    fn from(e: rustls::Error) -> Self {
        AutocertError::Certificate(e.to_string())
    }
}
