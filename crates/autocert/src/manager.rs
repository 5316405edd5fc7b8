//! Certificate manager
//!
//! One [`Manager`] per process owns the cache, host policy, ACME client,
//! certificate store and renewal scheduler, and hands out TLS listeners and
//! rustls server configurations backed by them.
//!
//! ```no_run
//! # async fn example() -> anyhow::Result<()> {
//! use autocert::Manager;
//! use autocert_config::AutocertConfig;
//!
//! let config = AutocertConfig::from_file("autocert.kdl")?;
//! let manager = Manager::from_config(config)?;
//! manager.start().await?;
//!
//! let listener = manager.listen("0.0.0.0:443").await?;
//! loop {
//!     let (connecting, _peer) = listener.accept().await?;
//!     tokio::spawn(async move {
//!         if let Ok(_tls) = connecting.handshake().await {
//!             // serve the connection
//!         }
//!     });
//! }
//! # }
//! ```

use std::sync::Arc;

use autocert_config::AutocertConfig;
use instant_acme::HttpClient;
use parking_lot::Mutex;
use rustls::ServerConfig;
use tokio::net::ToSocketAddrs;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acme::http::HttpChallengeResponder;
use crate::acme::{AcmeClient, CertIssuer, ChallengeRegistry};
use crate::bundle::CertBundle;
use crate::cache::{Cache, DirCache};
use crate::error::AutocertError;
use crate::listener::{CertAcceptor, Listener};
use crate::policy::{self, HostPolicy};
use crate::scheduler::RenewalScheduler;
use crate::store::{CertificateStore, StoreSettings};
use crate::tls::{alpn_with_acme, ensure_crypto_provider, server_config, StoreResolver};

/// Builder for [`Manager`]
///
/// Anything not supplied is built from the configuration: a [`DirCache`] at
/// `cache_dir`, the configured host policy, and an [`AcmeClient`].
pub struct ManagerBuilder {
    config: AutocertConfig,
    cache: Option<Arc<dyn Cache>>,
    issuer: Option<Arc<dyn CertIssuer>>,
    policy: Option<Arc<dyn HostPolicy>>,
    acme_http: Option<Arc<dyn HttpClient>>,
}

impl ManagerBuilder {
    pub fn new(config: AutocertConfig) -> Self {
        Self {
            config,
            cache: None,
            issuer: None,
            policy: None,
            acme_http: None,
        }
    }

    /// Use `cache` instead of the configured cache directory
    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use `issuer` instead of an ACME client
    pub fn issuer(mut self, issuer: Arc<dyn CertIssuer>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    /// Use `policy` instead of the configured hosts
    pub fn policy(mut self, policy: impl HostPolicy + 'static) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }

    /// Reach the ACME directory through `http` (private CAs, test servers)
    ///
    /// Ignored when an issuer is supplied.
    pub fn acme_http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.acme_http = Some(http);
        self
    }

    pub fn build(self) -> Result<Manager, AutocertError> {
        ensure_crypto_provider();
        let config = self.config;

        let cache: Arc<dyn Cache> = match self.cache {
            Some(cache) => cache,
            None => Arc::new(DirCache::new(&config.cache_dir).map_err(|e| {
                AutocertError::Configuration(format!(
                    "cache directory {}: {}",
                    config.cache_dir.display(),
                    e
                ))
            })?),
        };

        let policy: Arc<dyn HostPolicy> = match self.policy {
            Some(policy) => policy,
            None => Arc::from(policy::from_config(&config.hosts)?),
        };

        let challenges = ChallengeRegistry::new();
        let issuer: Arc<dyn CertIssuer> = match self.issuer {
            Some(issuer) => issuer,
            None => {
                let client =
                    AcmeClient::new(&config.acme, Arc::clone(&cache), challenges.clone())?;
                match self.acme_http {
                    Some(http) => Arc::new(client.with_http_client(http)),
                    None => Arc::new(client),
                }
            }
        };

        let mut settings = StoreSettings::from_config(&config.renewal);
        settings.cache_retry = config.acme.retry;

        let store = Arc::new(CertificateStore::new(
            Arc::clone(&cache),
            issuer,
            policy,
            settings,
        ));

        info!(
            directory = %config.acme.directory(),
            renew_before_days = config.renewal.renew_before_secs / 86400,
            "Certificate manager initialized"
        );

        Ok(Manager {
            config,
            store,
            challenges,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Automatic certificate manager
pub struct Manager {
    config: AutocertConfig,
    store: Arc<CertificateStore>,
    challenges: ChallengeRegistry,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Manager {
    pub fn builder(config: AutocertConfig) -> ManagerBuilder {
        ManagerBuilder::new(config)
    }

    /// Build a manager entirely from configuration
    pub fn from_config(config: AutocertConfig) -> Result<Self, AutocertError> {
        ManagerBuilder::new(config).build()
    }

    pub fn config(&self) -> &AutocertConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CertificateStore> {
        &self.store
    }

    pub fn challenges(&self) -> &ChallengeRegistry {
        &self.challenges
    }

    /// Preload cached certificates and start the renewal scheduler
    pub async fn start(&self) -> Result<(), AutocertError> {
        self.preload().await?;
        self.start_renewal();
        Ok(())
    }

    /// Load valid certificates from the cache into memory
    pub async fn preload(&self) -> Result<usize, AutocertError> {
        self.store.preload().await
    }

    /// Spawn the renewal scheduler; it stops on [`Manager::shutdown`]
    pub fn start_renewal(&self) {
        let scheduler = RenewalScheduler::new(Arc::clone(&self.store))
            .with_interval(self.config.renewal.check_interval());
        let handle = tokio::spawn(scheduler.run(self.shutdown.child_token()));
        self.tasks.lock().push(handle);
    }

    /// Certificate for `name`, issuing it if needed
    pub async fn get_certificate(&self, name: &str) -> Result<Arc<CertBundle>, AutocertError> {
        self.store.get_certificate(name).await
    }

    /// Connection acceptor configured from the listener settings
    pub fn acceptor(&self) -> CertAcceptor {
        CertAcceptor::new(Arc::clone(&self.store), self.challenges.clone())
            .with_config(&self.config.listener)
    }

    /// Bind a TLS listener on `addr`
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> std::io::Result<Listener> {
        Listener::bind(addr, self.acceptor()).await
    }

    /// rustls configuration for servers that run their own accept loop
    ///
    /// The resolver answers from memory only. A name without a certificate
    /// fails its first handshake while issuance starts in the background.
    pub fn tls_config(&self) -> Result<Arc<ServerConfig>, AutocertError> {
        let resolver = Arc::new(StoreResolver::new(
            Arc::clone(&self.store),
            self.challenges.clone(),
        ));
        let config = server_config(resolver, &alpn_with_acme(&self.config.listener.alpn))?;
        Ok(Arc::new(config))
    }

    /// Responder for HTTP-01 validation requests on port 80
    pub fn http_challenge_service(&self) -> HttpChallengeResponder {
        HttpChallengeResponder::new(self.challenges.clone())
    }

    /// Token cancelled when the manager shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop background tasks and drop pending challenges
    pub async fn shutdown(&self) {
        info!("Shutting down certificate manager");
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.challenges.clear();
        debug!("Certificate manager stopped");
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("store", &self.store)
            .field("pending_challenges", &self.challenges.pending_count())
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}
