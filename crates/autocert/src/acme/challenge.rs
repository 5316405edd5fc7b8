//! Pending ACME challenge material
//!
//! Holds what validation requests need while an order is in progress:
//!
//! - http-01: token -> key authorization, served at
//!   `/.well-known/acme-challenge/<token>`
//! - tls-alpn-01: hostname -> self-signed certificate carrying the
//!   `acmeIdentifier` extension, served to handshakes offering `acme-tls/1`
//!
//! Registration returns a [`ChallengeGuard`] that removes the material when
//! dropped, so a failed or cancelled issuance never leaves stale entries.

use std::sync::Arc;

use dashmap::DashMap;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use tracing::{debug, trace};

use crate::error::AutocertError;

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// ALPN protocol identifying tls-alpn-01 validation handshakes
pub const ACME_TLS_ALPN_PROTOCOL: &[u8] = b"acme-tls/1";

/// Pending challenge responses shared by the coordinator and the responders
///
/// Cloning shares the underlying maps.
#[derive(Debug, Clone, Default)]
pub struct ChallengeRegistry {
    /// token -> key authorization
    http: Arc<DashMap<String, String>>,
    /// hostname -> validation certificate
    tls_alpn: Arc<DashMap<String, Arc<CertifiedKey>>>,
}

impl ChallengeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an http-01 response until the returned guard is dropped
    pub fn register_http(&self, token: &str, key_authorization: &str) -> ChallengeGuard {
        debug!(token = %token, "Registering ACME HTTP-01 challenge");
        self.http
            .insert(token.to_string(), key_authorization.to_string());

        ChallengeGuard {
            registry: self.clone(),
            slot: Slot::Http(token.to_string()),
        }
    }

    /// Register a tls-alpn-01 certificate until the returned guard is dropped
    pub fn register_tls_alpn(&self, hostname: &str, cert: Arc<CertifiedKey>) -> ChallengeGuard {
        debug!(host = %hostname, "Registering ACME TLS-ALPN-01 challenge");
        self.tls_alpn.insert(hostname.to_string(), cert);

        ChallengeGuard {
            registry: self.clone(),
            slot: Slot::TlsAlpn(hostname.to_string()),
        }
    }

    /// Key authorization for an http-01 token
    pub fn http_response(&self, token: &str) -> Option<String> {
        let result = self.http.get(token).map(|v| v.clone());
        if result.is_some() {
            trace!(token = %token, "ACME challenge token found");
        } else {
            trace!(token = %token, "ACME challenge token not found");
        }
        result
    }

    /// Validation certificate for a tls-alpn-01 handshake
    pub fn tls_alpn_certificate(&self, hostname: &str) -> Option<Arc<CertifiedKey>> {
        self.tls_alpn.get(hostname).map(|v| Arc::clone(&v))
    }

    /// Token from an http-01 request path, if it is one
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
    }

    /// Number of registered challenges of both kinds
    pub fn pending_count(&self) -> usize {
        self.http.len() + self.tls_alpn.len()
    }

    /// Drop every registered challenge
    pub fn clear(&self) {
        let count = self.pending_count();
        self.http.clear();
        self.tls_alpn.clear();
        if count > 0 {
            debug!(cleared = count, "Cleared all pending ACME challenges");
        }
    }
}

#[derive(Debug)]
enum Slot {
    Http(String),
    TlsAlpn(String),
}

/// Removes a registered challenge on drop
#[derive(Debug)]
#[must_use = "the challenge is unregistered when the guard is dropped"]
pub struct ChallengeGuard {
    registry: ChallengeRegistry,
    slot: Slot,
}

impl Drop for ChallengeGuard {
    fn drop(&mut self) {
        match &self.slot {
            Slot::Http(token) => {
                if self.registry.http.remove(token).is_some() {
                    debug!(token = %token, "Removed ACME HTTP-01 challenge");
                }
            }
            Slot::TlsAlpn(host) => {
                if self.registry.tls_alpn.remove(host).is_some() {
                    debug!(host = %host, "Removed ACME TLS-ALPN-01 challenge");
                }
            }
        }
    }
}

/// Build the self-signed tls-alpn-01 validation certificate
///
/// `digest` is the SHA-256 of the key authorization; it is carried in the
/// critical `acmeIdentifier` extension.
pub fn tls_alpn_certificate(
    hostname: &str,
    digest: &[u8],
) -> Result<Arc<CertifiedKey>, AutocertError> {
    let mut params = rcgen::CertificateParams::new(vec![hostname.to_string()])?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params.custom_extensions = vec![rcgen::CustomExtension::new_acme_identifier(digest)];

    let key_pair = rcgen::KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&PrivateKeyDer::Pkcs8(
        PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
    ))?;

    Ok(Arc::new(CertifiedKey::new(
        vec![cert.der().clone()],
        signing_key,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_challenge_lifecycle() {
        let registry = ChallengeRegistry::new();

        let guard = registry.register_http("test-token", "test-key-auth");
        assert_eq!(
            registry.http_response("test-token"),
            Some("test-key-auth".to_string())
        );
        assert_eq!(registry.pending_count(), 1);

        drop(guard);
        assert_eq!(registry.http_response("test-token"), None);
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_tls_alpn_challenge_lifecycle() {
        let registry = ChallengeRegistry::new();
        let cert = tls_alpn_certificate("example.com", &[7u8; 32]).unwrap();

        let guard = registry.register_tls_alpn("example.com", cert);
        assert!(registry.tls_alpn_certificate("example.com").is_some());
        assert!(registry.tls_alpn_certificate("other.example.com").is_none());

        drop(guard);
        assert!(registry.tls_alpn_certificate("example.com").is_none());
    }

    #[test]
    fn test_tls_alpn_certificate_carries_identifier() {
        let cert = tls_alpn_certificate("example.com", &[0xAB; 32]).unwrap();
        let (_, parsed) = x509_parser::parse_x509_certificate(cert.cert[0].as_ref()).unwrap();

        // id-pe-acmeIdentifier
        let oid = x509_parser::oid_registry::Oid::from(&[1, 3, 6, 1, 5, 5, 7, 1, 31]).unwrap();
        let ext = parsed
            .extensions()
            .iter()
            .find(|e| e.oid == oid)
            .expect("acmeIdentifier extension");
        assert!(ext.critical);
        assert!(ext.value.ends_with(&[0xAB; 32]));
    }

    #[test]
    fn test_extract_token() {
        assert_eq!(
            ChallengeRegistry::extract_token("/.well-known/acme-challenge/abc123"),
            Some("abc123")
        );
        assert_eq!(ChallengeRegistry::extract_token("/other/path"), None);
        assert_eq!(
            ChallengeRegistry::extract_token("/.well-known/acme-challenge"),
            None
        );
    }

    #[test]
    fn test_clone_shares_state() {
        let registry = ChallengeRegistry::new();
        let other = registry.clone();

        let _guard = registry.register_http("token", "auth");
        assert_eq!(other.http_response("token"), Some("auth".to_string()));

        other.clear();
        assert_eq!(registry.pending_count(), 0);
    }
}
