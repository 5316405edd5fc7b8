//! rustls integration
//!
//! [`StoreResolver`] answers certificate requests from the store's memory
//! index, plus tls-alpn-01 validation handshakes from the challenge registry.
//! rustls resolvers are synchronous, so a miss only starts a background fetch
//! and fails the current handshake; the client's retry then succeeds.
//! [`Listener`](crate::Listener) avoids this by resolving the certificate
//! asynchronously before the handshake continues.

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tracing::{debug, trace};

use crate::acme::{ChallengeRegistry, ACME_TLS_ALPN_PROTOCOL};
use crate::error::AutocertError;
use crate::hostname::normalize_hostname;
use crate::store::CertificateStore;

/// Install aws-lc-rs as the process-wide rustls provider if none is set
pub fn ensure_crypto_provider() {
    // Fails only when a provider is already installed
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Whether the ClientHello is a tls-alpn-01 validation: `acme-tls/1` and nothing else
pub(crate) fn is_acme_validation<'a>(alpn: Option<impl Iterator<Item = &'a [u8]>>) -> bool {
    let Some(mut protocols) = alpn else {
        return false;
    };
    protocols.next() == Some(ACME_TLS_ALPN_PROTOCOL) && protocols.next().is_none()
}

/// Certificate resolver backed by the certificate store
#[derive(Debug)]
pub struct StoreResolver {
    store: Arc<CertificateStore>,
    challenges: ChallengeRegistry,
}

impl StoreResolver {
    pub fn new(store: Arc<CertificateStore>, challenges: ChallengeRegistry) -> Self {
        Self { store, challenges }
    }
}

impl ResolvesServerCert for StoreResolver {
    fn resolve(&self, hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(server_name) = hello.server_name() else {
            debug!("TLS handshake without SNI, no certificate");
            return None;
        };

        if is_acme_validation(hello.alpn()) {
            let hostname = normalize_hostname(server_name).ok()?;
            trace!(host = %hostname, "Answering tls-alpn-01 validation handshake");
            return self.challenges.tls_alpn_certificate(&hostname);
        }

        self.store
            .lookup_or_prefetch(server_name)
            .map(|bundle| bundle.certified_key())
    }
}

/// Resolver returning one fixed certificate
#[derive(Debug)]
pub(crate) struct FixedCert(pub(crate) Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCert {
    fn resolve(&self, _hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// Server config using `resolver`, advertising `alpn` in order
pub fn server_config(
    resolver: Arc<dyn ResolvesServerCert>,
    alpn: &[Vec<u8>],
) -> Result<ServerConfig, AutocertError> {
    let mut config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = alpn.to_vec();
    Ok(config)
}

/// Server config answering a tls-alpn-01 validation handshake
pub(crate) fn challenge_config(cert: Arc<CertifiedKey>) -> Result<ServerConfig, AutocertError> {
    server_config(Arc::new(FixedCert(cert)), &[ACME_TLS_ALPN_PROTOCOL.to_vec()])
}

/// ALPN list with `acme-tls/1` appended so validation handshakes negotiate
pub fn alpn_with_acme(alpn: &[String]) -> Vec<Vec<u8>> {
    let mut protocols: Vec<Vec<u8>> = alpn
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .filter(|p| p.as_slice() != ACME_TLS_ALPN_PROTOCOL)
        .collect();
    protocols.push(ACME_TLS_ALPN_PROTOCOL.to_vec());
    protocols
}
