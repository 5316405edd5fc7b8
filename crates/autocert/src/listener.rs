//! TLS listener with on-demand certificates
//!
//! [`Listener::accept`] hands out a [`TlsConnecting`] per TCP connection with
//! keep-alive already applied. [`TlsConnecting::handshake`] reads the
//! ClientHello first, fetches the certificate for its SNI name through the
//! store (waiting for issuance if needed), then completes the handshake.
//! A failure only affects the connection it happened on.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use autocert_config::ListenerConfig;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::time::Instant;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, trace, warn};

use crate::acme::ChallengeRegistry;
use crate::error::{AutocertError, HandshakeError};
use crate::hostname::normalize_hostname;
use crate::store::CertificateStore;
use crate::tls::{challenge_config, is_acme_validation, server_config, FixedCert};

/// Default TCP keep-alive probe period
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(180);

/// Default bound on one handshake, certificate issuance included
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(120);

/// Everything a connection needs to finish its handshake
#[derive(Clone)]
pub struct CertAcceptor {
    store: Arc<CertificateStore>,
    challenges: ChallengeRegistry,
    alpn: Arc<Vec<Vec<u8>>>,
    keepalive: Duration,
    handshake_timeout: Duration,
}

impl CertAcceptor {
    pub fn new(store: Arc<CertificateStore>, challenges: ChallengeRegistry) -> Self {
        Self {
            store,
            challenges,
            alpn: Arc::new(Vec::new()),
            keepalive: DEFAULT_KEEPALIVE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Apply keep-alive, handshake timeout and ALPN from configuration
    pub fn with_config(self, config: &ListenerConfig) -> Self {
        self.with_keepalive(config.keepalive())
            .with_handshake_timeout(config.handshake_timeout())
            .with_alpn(config.alpn.iter().map(|p| p.as_bytes().to_vec()).collect())
    }

    /// TCP keep-alive probe period; zero disables keep-alive
    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Application protocols offered in ALPN, in preference order
    pub fn with_alpn(mut self, alpn: Vec<Vec<u8>>) -> Self {
        self.alpn = Arc::new(alpn);
        self
    }
}

impl fmt::Debug for CertAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertAcceptor")
            .field("keepalive", &self.keepalive)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("alpn_count", &self.alpn.len())
            .finish()
    }
}

/// TCP listener producing TLS connections
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    acceptor: CertAcceptor,
}

impl Listener {
    /// Bind a new listener
    pub async fn bind(addr: impl ToSocketAddrs, acceptor: CertAcceptor) -> std::io::Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self::from_tcp(inner, acceptor))
    }

    /// Wrap an already bound listener
    pub fn from_tcp(inner: TcpListener, acceptor: CertAcceptor) -> Self {
        if let Ok(addr) = inner.local_addr() {
            info!(address = %addr, "TLS listener ready");
        }
        Self { inner, acceptor }
    }

    /// Accept the next connection
    ///
    /// Keep-alive is enabled before returning; the TLS handshake is left to
    /// [`TlsConnecting::handshake`] so the caller can run it on its own task.
    pub async fn accept(&self) -> std::io::Result<(TlsConnecting, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await?;

        if !self.acceptor.keepalive.is_zero() {
            if let Err(e) = set_keepalive(&stream, self.acceptor.keepalive) {
                warn!(peer = %peer, error = %e, "Failed to enable TCP keep-alive");
            }
        }
        trace!(peer = %peer, "Accepted connection");

        Ok((
            TlsConnecting {
                stream,
                peer,
                acceptor: self.acceptor.clone(),
            },
            peer,
        ))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Stop listening; established connections are unaffected
    ///
    /// The socket is released either way. An error means it had already
    /// failed before the close.
    pub fn close(self) -> std::io::Result<()> {
        let addr = self.inner.local_addr()?;
        info!(address = %addr, "TLS listener closed");
        Ok(())
    }
}

fn set_keepalive(stream: &TcpStream, period: Duration) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(period);
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "windows"
    ))]
    let keepalive = keepalive.with_interval(period);

    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// A TCP connection whose TLS handshake has not run yet
pub struct TlsConnecting {
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: CertAcceptor,
}

impl TlsConnecting {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Run the TLS handshake
    ///
    /// The whole exchange, including any certificate issuance it waits on,
    /// is bounded by the handshake timeout. A tls-alpn-01 validation
    /// handshake is answered with the challenge certificate, closed, and
    /// reported as [`HandshakeError::ChallengeServed`].
    pub async fn handshake(self) -> Result<TlsStream<TcpStream>, HandshakeError> {
        let TlsConnecting {
            stream,
            peer,
            acceptor,
        } = self;
        let limit = acceptor.handshake_timeout;
        let deadline = Instant::now() + limit;

        let start = tokio::time::timeout_at(
            deadline,
            LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream),
        )
        .await
        .map_err(|_| HandshakeError::Timeout(limit))??;

        let (server_name, validation) = {
            let hello = start.client_hello();
            (
                hello.server_name().map(str::to_string),
                is_acme_validation(hello.alpn()),
            )
        };
        let server_name = server_name.ok_or(HandshakeError::MissingServerName)?;

        if validation {
            let host = normalize_hostname(&server_name)?;
            let cert = acceptor.challenges.tls_alpn_certificate(&host).ok_or_else(|| {
                AutocertError::Protocol {
                    host: host.clone(),
                    detail: "no pending tls-alpn-01 challenge".into(),
                }
            })?;

            let config = Arc::new(challenge_config(cert)?);
            let mut tls = tokio::time::timeout_at(deadline, start.into_stream(config))
                .await
                .map_err(|_| HandshakeError::Timeout(limit))??;
            let _ = tls.shutdown().await;

            debug!(host = %host, peer = %peer, "Answered tls-alpn-01 validation handshake");
            return Err(HandshakeError::ChallengeServed { host });
        }

        let bundle = tokio::time::timeout_at(deadline, acceptor.store.get_certificate(&server_name))
            .await
            .map_err(|_| AutocertError::HandshakeTimeout {
                host: server_name.clone(),
                timeout: limit,
            })??;

        let config = Arc::new(server_config(
            Arc::new(FixedCert(bundle.certified_key())),
            &acceptor.alpn,
        )?);

        let tls = tokio::time::timeout_at(deadline, start.into_stream(config))
            .await
            .map_err(|_| HandshakeError::Timeout(limit))??;

        debug!(host = %server_name, peer = %peer, "TLS handshake complete");
        Ok(tls)
    }
}

impl fmt::Debug for TlsConnecting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnecting")
            .field("peer", &self.peer)
            .finish()
    }
}
