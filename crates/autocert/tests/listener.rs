//! End-to-end TLS handshakes against a listener backed by a fake issuer

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use autocert::acme::{tls_alpn_certificate, ACME_TLS_ALPN_PROTOCOL};
use autocert::{
    AutocertError, CertBundle, CertIssuer, HandshakeError, Listener, Manager, MemoryCache,
};
use autocert_config::AutocertConfig;
use chrono::{TimeDelta, Utc};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

const HTTP11: &[u8] = b"http/1.1";

struct FakeIssuer {
    calls: AtomicUsize,
    delay: Duration,
}

#[async_trait]
impl CertIssuer for FakeIssuer {
    async fn issue(&self, hostname: &str) -> Result<CertBundle, AutocertError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let now = Utc::now();
        CertBundle::self_signed(hostname, now - TimeDelta::hours(1), now + TimeDelta::days(90))
    }
}

#[derive(Debug)]
struct AcceptAnything;

impl ServerCertVerifier for AcceptAnything {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

struct Harness {
    manager: Arc<Manager>,
    issuer: Arc<FakeIssuer>,
    addr: std::net::SocketAddr,
    outcomes: mpsc::UnboundedReceiver<Result<(), HandshakeError>>,
}

async fn start(delay: Duration) -> Harness {
    let issuer = Arc::new(FakeIssuer {
        calls: AtomicUsize::new(0),
        delay,
    });
    let manager = Arc::new(
        Manager::builder(AutocertConfig::default())
            .cache(Arc::new(MemoryCache::new()))
            .issuer(issuer.clone())
            .policy(|host: &str| host.ends_with(".example.com"))
            .build()
            .unwrap(),
    );

    let listener = manager.listen("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, outcomes) = mpsc::unbounded_channel();
    tokio::spawn(serve(listener, tx));

    Harness {
        manager,
        issuer,
        addr,
        outcomes,
    }
}

async fn serve(listener: Listener, tx: mpsc::UnboundedSender<Result<(), HandshakeError>>) {
    while let Ok((connecting, _)) = listener.accept().await {
        let tx = tx.clone();
        tokio::spawn(async move {
            match connecting.handshake().await {
                Ok(mut tls) => {
                    let _ = tx.send(Ok(()));
                    // Hold the connection until the client goes away
                    let mut buf = [0u8; 1];
                    let _ = tls.read(&mut buf).await;
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                }
            }
        });
    }
}

fn connector(alpn: &[&[u8]]) -> TlsConnector {
    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnything))
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    TlsConnector::from(Arc::new(config))
}

async fn connect(
    addr: std::net::SocketAddr,
    name: &str,
    alpn: &[&[u8]],
) -> std::io::Result<TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from(name.to_string())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    connector(alpn).connect(server_name, tcp).await
}

fn peer_leaf(stream: &TlsStream<TcpStream>) -> CertificateDer<'static> {
    stream.get_ref().1.peer_certificates().unwrap()[0].clone().into_owned()
}

#[tokio::test]
async fn test_first_handshake_issues_and_second_is_served_from_memory() {
    let mut h = start(Duration::ZERO).await;

    let first = connect(h.addr, "a.example.com", &[HTTP11]).await.unwrap();
    assert!(h.outcomes.recv().await.unwrap().is_ok());
    assert_eq!(h.issuer.calls.load(Ordering::SeqCst), 1);

    let bundle = h.manager.store().lookup_ready("a.example.com").unwrap();
    assert_eq!(peer_leaf(&first), bundle.chain()[0]);

    let second = connect(h.addr, "A.Example.COM", &[HTTP11]).await.unwrap();
    assert!(h.outcomes.recv().await.unwrap().is_ok());
    assert_eq!(h.issuer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(peer_leaf(&second), bundle.chain()[0]);
}

#[tokio::test]
async fn test_denied_name_fails_only_that_handshake() {
    let mut h = start(Duration::ZERO).await;

    assert!(connect(h.addr, "intruder.test", &[]).await.is_err());
    let outcome = h.outcomes.recv().await.unwrap();
    assert!(matches!(
        outcome,
        Err(HandshakeError::Certificate(AutocertError::PolicyRejected { .. }))
    ));
    assert_eq!(h.issuer.calls.load(Ordering::SeqCst), 0);

    // The listener keeps serving other names
    connect(h.addr, "b.example.com", &[]).await.unwrap();
    assert!(h.outcomes.recv().await.unwrap().is_ok());
}

#[tokio::test]
async fn test_concurrent_handshakes_share_one_issuance() {
    let h = start(Duration::from_millis(200)).await;

    let handshakes: Vec<_> = (0..8)
        .map(|_| {
            let addr = h.addr;
            tokio::spawn(async move { connect(addr, "busy.example.com", &[]).await })
        })
        .collect();

    for handshake in handshakes {
        handshake.await.unwrap().unwrap();
    }
    assert_eq!(h.issuer.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_tls_alpn_validation_gets_challenge_certificate() {
    let mut h = start(Duration::ZERO).await;

    let challenge = tls_alpn_certificate("v.example.com", &[7u8; 32]).unwrap();
    let _guard = h
        .manager
        .challenges()
        .register_tls_alpn("v.example.com", Arc::clone(&challenge));

    let stream = connect(h.addr, "v.example.com", &[ACME_TLS_ALPN_PROTOCOL])
        .await
        .unwrap();
    assert_eq!(peer_leaf(&stream), challenge.cert[0]);
    assert_eq!(
        stream.get_ref().1.alpn_protocol(),
        Some(ACME_TLS_ALPN_PROTOCOL)
    );

    let outcome = h.outcomes.recv().await.unwrap();
    assert!(outcome.unwrap_err().is_challenge());
    assert_eq!(h.issuer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_client_without_sni_is_rejected() {
    let mut h = start(Duration::ZERO).await;

    assert!(connect(h.addr, "127.0.0.1", &[]).await.is_err());
    assert!(matches!(
        h.outcomes.recv().await.unwrap(),
        Err(HandshakeError::MissingServerName)
    ));
}

#[tokio::test]
async fn test_silent_client_hits_handshake_timeout() {
    let h = start(Duration::ZERO).await;
    let acceptor = h
        .manager
        .acceptor()
        .with_handshake_timeout(Duration::from_millis(100));
    let listener = Listener::bind("127.0.0.1:0", acceptor).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let _idle = TcpStream::connect(addr).await.unwrap();
    let (connecting, _) = listener.accept().await.unwrap();

    let result = connecting.handshake().await;
    assert!(matches!(result, Err(HandshakeError::Timeout(_))));
}

#[tokio::test]
async fn test_close_releases_the_port() {
    let h = start(Duration::ZERO).await;
    let listener = Listener::bind("127.0.0.1:0", h.manager.acceptor())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    listener.close().unwrap();
    assert!(TcpStream::connect(addr).await.is_err());
}
