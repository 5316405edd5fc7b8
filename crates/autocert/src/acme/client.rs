//! ACME client implementation using instant-acme

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use autocert_common::RetryPolicy;
use autocert_config::{AcmeConfig, ChallengeType};
use instant_acme::{
    Account, AuthorizationStatus, Challenge, ChallengeType as AcmeChallengeType, HttpClient,
    Identifier, NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::account::{load_or_register, AcmeTransport};
use super::challenge::{tls_alpn_certificate, ChallengeGuard, ChallengeRegistry};
use super::{classify_acme_error, CertIssuer};
use crate::bundle::CertBundle;
use crate::cache::Cache;
use crate::error::AutocertError;

/// ACME client issuing single-name certificates
///
/// The account is loaded (or registered) lazily on the first issuance and
/// reused afterwards.
pub struct AcmeClient {
    directory: String,
    email: String,
    /// Challenge types in preference order
    challenges: Vec<ChallengeType>,
    /// Whole-attempt retry for transient failures
    retry: RetryPolicy,
    /// Order and certificate polling cadence
    poll: RetryPolicy,
    issuance_timeout: Duration,
    cache: Arc<dyn Cache>,
    registry: ChallengeRegistry,
    transport: AcmeTransport,
    account: OnceCell<Account>,
}

impl AcmeClient {
    /// Create a client for the configured directory
    ///
    /// # Arguments
    ///
    /// * `config` - ACME settings (directory, contact, challenge preference)
    /// * `cache` - where the account is persisted
    /// * `registry` - shared with the responders answering validation requests
    pub fn new(
        config: &AcmeConfig,
        cache: Arc<dyn Cache>,
        registry: ChallengeRegistry,
    ) -> Result<Self, AutocertError> {
        if config.challenges.is_empty() {
            return Err(AutocertError::Configuration(
                "at least one challenge type is required".into(),
            ));
        }
        let directory = config.directory();
        if directory.is_empty() {
            return Err(AutocertError::Configuration(
                "ACME directory URL is empty".into(),
            ));
        }

        Ok(Self {
            directory: directory.to_string(),
            email: config.email.clone(),
            challenges: config.challenges.clone(),
            retry: config.retry,
            poll: config.poll,
            issuance_timeout: config.issuance_timeout(),
            cache,
            registry,
            transport: None,
            account: OnceCell::new(),
        })
    }

    /// Reach the CA through `http` instead of the built-in HTTPS client
    pub fn with_http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.transport = Some(http);
        self
    }

    pub fn directory(&self) -> &str {
        &self.directory
    }

    pub fn registry(&self) -> &ChallengeRegistry {
        &self.registry
    }

    async fn account(&self) -> Result<&Account, AutocertError> {
        self.account
            .get_or_try_init(|| {
                load_or_register(
                    self.cache.as_ref(),
                    &self.directory,
                    &self.email,
                    &self.transport,
                )
            })
            .await
    }

    /// One complete order: authorize, finalize, download
    async fn attempt(&self, hostname: &str) -> Result<CertBundle, AutocertError> {
        let account = self.account().await?;

        let identifiers = [Identifier::Dns(hostname.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| classify_acme_error(hostname, "new order", e))?;

        debug!(host = %hostname, status = ?order.state().status, "ACME order created");

        // Held until the order settles; dropping them unregisters the material
        let _guards = self.authorize(hostname, &mut order).await?;
        self.wait_until_ready(hostname, &mut order).await?;

        let (csr, key_pair) = generate_csr(hostname)?;
        order
            .finalize(&csr)
            .await
            .map_err(|e| classify_acme_error(hostname, "finalize order", e))?;

        let chain_pem = self.download_chain(hostname, &mut order).await?;

        let chain = rustls_pemfile::certs(&mut chain_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                AutocertError::Certificate(format!("invalid certificate chain from CA: {}", e))
            })?;

        CertBundle::new(vec![hostname.to_string()], chain, key_pair.serialize_der())
    }

    /// Register responses for every pending authorization and mark them ready
    async fn authorize(
        &self,
        hostname: &str,
        order: &mut Order,
    ) -> Result<Vec<ChallengeGuard>, AutocertError> {
        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| classify_acme_error(hostname, "fetch authorizations", e))?;

        let mut guards = Vec::new();
        let mut ready = Vec::new();

        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Valid => {
                    debug!(host = %hostname, "Authorization already valid");
                    continue;
                }
                AuthorizationStatus::Pending => {}
                ref other => {
                    return Err(AutocertError::Protocol {
                        host: hostname.to_string(),
                        detail: format!("authorization is {:?}", other),
                    });
                }
            }

            let (challenge, kind) = select_challenge(&self.challenges, &authz.challenges)
                .ok_or_else(|| AutocertError::Protocol {
                    host: hostname.to_string(),
                    detail: "CA offered no supported challenge type".into(),
                })?;

            let key_authorization = order.key_authorization(challenge);
            let guard = match kind {
                ChallengeType::Http01 => self
                    .registry
                    .register_http(&challenge.token, key_authorization.as_str()),
                ChallengeType::TlsAlpn01 => {
                    let cert = tls_alpn_certificate(hostname, key_authorization.digest().as_ref())?;
                    self.registry.register_tls_alpn(hostname, cert)
                }
            };

            debug!(host = %hostname, challenge = %kind, "Challenge response registered");
            guards.push(guard);
            ready.push(challenge.url.clone());
        }

        for url in &ready {
            order
                .set_challenge_ready(url)
                .await
                .map_err(|e| classify_acme_error(hostname, "set challenge ready", e))?;
        }

        Ok(guards)
    }

    /// Poll until the order is ready for finalization
    async fn wait_until_ready(&self, hostname: &str, order: &mut Order) -> Result<(), AutocertError> {
        let attempts = self.poll.attempts();
        let mut attempt = 1;

        loop {
            let state = order
                .refresh()
                .await
                .map_err(|e| classify_acme_error(hostname, "poll order", e))?;

            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    let order_problem = state.error.as_ref().map(ToString::to_string);
                    let detail = match challenge_problem(order).await {
                        Some(detail) => detail,
                        None => order_problem.unwrap_or_else(|| "order became invalid".into()),
                    };
                    warn!(host = %hostname, detail = %detail, "ACME validation failed");
                    return Err(AutocertError::Protocol {
                        host: hostname.to_string(),
                        detail,
                    });
                }
                _ => {}
            }

            if attempt >= attempts {
                return Err(AutocertError::Protocol {
                    host: hostname.to_string(),
                    detail: format!("order not ready after {} polls", attempts),
                });
            }
            tokio::time::sleep(self.poll.backoff(attempt)).await;
            attempt += 1;
        }
    }

    /// Poll for the issued chain after finalization
    async fn download_chain(&self, hostname: &str, order: &mut Order) -> Result<String, AutocertError> {
        let attempts = self.poll.attempts();
        let mut attempt = 1;

        loop {
            let chain = order
                .certificate()
                .await
                .map_err(|e| classify_acme_error(hostname, "download certificate", e))?;

            match chain {
                Some(chain) => return Ok(chain),
                None if attempt < attempts => {
                    debug!(host = %hostname, attempt, "Certificate not ready yet, waiting");
                    tokio::time::sleep(self.poll.backoff(attempt)).await;
                    attempt += 1;
                }
                None => {
                    return Err(AutocertError::Protocol {
                        host: hostname.to_string(),
                        detail: format!("certificate not available after {} polls", attempts),
                    })
                }
            }
        }
    }
}

#[async_trait]
impl CertIssuer for AcmeClient {
    async fn issue(&self, hostname: &str) -> Result<CertBundle, AutocertError> {
        let start = Instant::now();
        info!(host = %hostname, directory = %self.directory, "Requesting certificate");

        let issuance = self
            .retry
            .run("certificate issuance", AutocertError::is_retriable, || {
                self.attempt(hostname)
            });

        let result = match tokio::time::timeout(self.issuance_timeout, issuance).await {
            Ok(result) => result,
            Err(_) => Err(AutocertError::Transient(format!(
                "issuance for '{}' timed out after {:?}",
                hostname, self.issuance_timeout
            ))),
        };

        match &result {
            Ok(bundle) => info!(
                host = %hostname,
                elapsed_secs = start.elapsed().as_secs(),
                expires = %bundle.not_after(),
                "Certificate issued"
            ),
            Err(e) => warn!(
                host = %hostname,
                elapsed_secs = start.elapsed().as_secs(),
                error = %e,
                "Certificate issuance failed"
            ),
        }

        result
    }
}

impl std::fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeClient")
            .field("directory", &self.directory)
            .field("challenges", &self.challenges)
            .field("issuance_timeout", &self.issuance_timeout)
            .field("custom_transport", &self.transport.is_some())
            .field("has_account", &self.account.initialized())
            .finish()
    }
}

fn acme_type(kind: ChallengeType) -> AcmeChallengeType {
    match kind {
        ChallengeType::TlsAlpn01 => AcmeChallengeType::TlsAlpn01,
        ChallengeType::Http01 => AcmeChallengeType::Http01,
    }
}

/// Pick the first offered challenge matching the preference order
fn select_challenge<'a>(
    preferences: &[ChallengeType],
    offered: &'a [Challenge],
) -> Option<(&'a Challenge, ChallengeType)> {
    preferences.iter().find_map(|kind| {
        let wanted = acme_type(*kind);
        offered
            .iter()
            .find(|c| c.r#type == wanted)
            .map(|c| (c, *kind))
    })
}

/// First challenge error reported on the order's authorizations
async fn challenge_problem(order: &mut Order) -> Option<String> {
    let authorizations = order.authorizations().await.ok()?;
    authorizations
        .iter()
        .flat_map(|authz| authz.challenges.iter())
        .find_map(|c| c.error.as_ref().map(ToString::to_string))
}

/// Fresh key pair and DER CSR for one hostname
fn generate_csr(hostname: &str) -> Result<(Vec<u8>, KeyPair), AutocertError> {
    let key_pair = KeyPair::generate()?;

    let mut params = CertificateParams::new(vec![hostname.to_string()])?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname.to_string());
    params.distinguished_name = dn;

    let csr = params.serialize_request(&key_pair)?;
    Ok((csr.der().to_vec(), key_pair))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    fn challenge(kind: &str, token: &str) -> Challenge {
        serde_json::from_value(serde_json::json!({
            "type": kind,
            "url": format!("https://ca.test/chall/{}", token),
            "token": token,
            "status": "pending",
        }))
        .unwrap()
    }

    fn client(config: &AcmeConfig) -> Result<AcmeClient, AutocertError> {
        AcmeClient::new(config, Arc::new(MemoryCache::new()), ChallengeRegistry::new())
    }

    #[test]
    fn test_select_challenge_follows_preference() {
        let offered = vec![
            challenge("http-01", "h"),
            challenge("dns-01", "d"),
            challenge("tls-alpn-01", "t"),
        ];

        let (c, kind) =
            select_challenge(&[ChallengeType::TlsAlpn01, ChallengeType::Http01], &offered).unwrap();
        assert_eq!(kind, ChallengeType::TlsAlpn01);
        assert_eq!(c.token, "t");

        let (c, kind) =
            select_challenge(&[ChallengeType::Http01, ChallengeType::TlsAlpn01], &offered).unwrap();
        assert_eq!(kind, ChallengeType::Http01);
        assert_eq!(c.token, "h");
    }

    #[test]
    fn test_select_challenge_falls_back() {
        let offered = vec![challenge("http-01", "h")];
        let (_, kind) =
            select_challenge(&[ChallengeType::TlsAlpn01, ChallengeType::Http01], &offered).unwrap();
        assert_eq!(kind, ChallengeType::Http01);

        let only_dns = vec![challenge("dns-01", "d")];
        assert!(select_challenge(&[ChallengeType::TlsAlpn01], &only_dns).is_none());
    }

    #[test]
    fn test_generate_csr() {
        let (csr, key_pair) = generate_csr("example.com").unwrap();
        assert!(!csr.is_empty());
        assert!(!key_pair.serialize_der().is_empty());
    }

    #[test]
    fn test_new_requires_challenges() {
        let config = AcmeConfig {
            challenges: Vec::new(),
            ..Default::default()
        };
        assert!(matches!(
            client(&config),
            Err(AutocertError::Configuration(_))
        ));
    }

    #[test]
    fn test_new_uses_configured_directory() {
        let config = AcmeConfig {
            staging: true,
            ..Default::default()
        };
        let client = client(&config).unwrap();
        assert_eq!(client.directory(), autocert_config::LETS_ENCRYPT_STAGING);
    }

    #[tokio::test]
    async fn test_unreachable_ca_exhausts_retries() {
        crate::tls::ensure_crypto_provider();
        let config = AcmeConfig {
            directory_url: Some("http://127.0.0.1:9/directory".to_string()),
            retry: RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(1)),
            ..Default::default()
        };
        let client = client(&config).unwrap();

        let err = client.issue("example.com").await.unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(client.registry().pending_count(), 0);
    }
}
