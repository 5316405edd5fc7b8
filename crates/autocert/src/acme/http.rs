//! HTTP-01 challenge responder
//!
//! Serves `/.well-known/acme-challenge/<token>` from the [`ChallengeRegistry`]
//! on the plain-HTTP port. Any other GET or HEAD is redirected to the same
//! URL over HTTPS; other methods are refused.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::header::{CONTENT_TYPE, HOST, LOCATION};
use http::{HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::challenge::ChallengeRegistry;

/// Maximum concurrent connections on the challenge port
const MAX_CONCURRENT_CONNECTIONS: usize = 100;

/// Upper bound on one connection's lifetime
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Answers HTTP-01 validation requests
#[derive(Debug, Clone)]
pub struct HttpChallengeResponder {
    registry: ChallengeRegistry,
}

impl HttpChallengeResponder {
    pub fn new(registry: ChallengeRegistry) -> Self {
        Self { registry }
    }

    /// Build the response for one request
    ///
    /// `host` is the request's Host header (or URI authority), used as the
    /// redirect target for non-challenge requests.
    pub fn respond(&self, method: &Method, uri: &Uri, host: Option<&str>) -> Response<Full<Bytes>> {
        let path = uri.path();

        if let Some(token) = ChallengeRegistry::extract_token(path) {
            if token.is_empty() {
                return text(StatusCode::NOT_FOUND, "Missing token");
            }
            return match self.registry.http_response(token) {
                Some(key_authorization) => {
                    info!(token = %token, "Serving ACME challenge response");
                    let mut response = text(StatusCode::OK, key_authorization);
                    if method == Method::HEAD {
                        *response.body_mut() = Full::new(Bytes::new());
                    }
                    response
                }
                None => {
                    warn!(token = %token, "Unknown ACME challenge token");
                    text(StatusCode::NOT_FOUND, "Challenge not found")
                }
            };
        }

        if method != Method::GET && method != Method::HEAD {
            return text(StatusCode::BAD_REQUEST, "Use HTTPS");
        }

        let Some(host) = host.map(strip_port).filter(|h| !h.is_empty()) else {
            return text(StatusCode::BAD_REQUEST, "Missing Host header");
        };

        let target = format!(
            "https://{}{}",
            host,
            uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        );
        match HeaderValue::from_str(&target) {
            Ok(location) => {
                debug!(location = %target, "Redirecting to HTTPS");
                let mut response = Response::new(Full::new(Bytes::new()));
                *response.status_mut() = StatusCode::FOUND;
                response.headers_mut().insert(LOCATION, location);
                response
            }
            Err(_) => text(StatusCode::BAD_REQUEST, "Invalid Host header"),
        }
    }

    async fn handle<B>(&self, req: Request<B>, remote: SocketAddr) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| req.uri().host());

        debug!(method = %req.method(), path = %req.uri().path(), remote = %remote, "HTTP request");
        Ok(self.respond(req.method(), req.uri(), host))
    }
}

/// Serve HTTP-01 challenges on `listener` until `shutdown` is cancelled
pub async fn serve_http_challenges(
    listener: TcpListener,
    responder: HttpChallengeResponder,
    shutdown: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(address = %addr, "HTTP-01 challenge responder listening");
    }

    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_CONNECTIONS));

    loop {
        let (stream, remote) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("HTTP-01 challenge responder shutting down");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Error accepting HTTP connection");
                    continue;
                }
            },
        };

        let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
            warn!(remote = %remote, "Connection limit reached, rejecting");
            continue;
        };

        let responder = responder.clone();
        tokio::spawn(async move {
            let _permit = permit;

            let service = service_fn(move |req| {
                let responder = responder.clone();
                async move { responder.handle(req, remote).await }
            });
            let connection = http1::Builder::new().serve_connection(TokioIo::new(stream), service);

            match tokio::time::timeout(REQUEST_TIMEOUT, connection).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(remote = %remote, error = %e, "Error serving HTTP connection"),
                Err(_) => debug!(remote = %remote, "HTTP connection timed out"),
            }
        });
    }
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Host without a trailing `:port` (IPv6 literals keep their brackets)
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}
