//! ACME certificate issuance
//!
//! # Architecture
//!
//! - [`AcmeClient`] - drives an order against the CA via `instant-acme`
//! - [`ChallengeRegistry`] - pending challenge material shared with the responders
//! - [`account`] - account registration and persistence in the cache
//! - [`http`] - HTTP-01 responder on port 80
//!
//! # Challenge Flow
//!
//! For a single hostname:
//!
//! 1. [`AcmeClient`] creates a new order for the name
//! 2. For each pending authorization a supported challenge is picked, in the
//!    configured preference order
//! 3. The response is placed in the [`ChallengeRegistry`] and the CA is told
//!    the challenge is ready
//! 4. The CA validates through the listener (`acme-tls/1`) or the HTTP-01
//!    responder
//! 5. Once the order is ready a CSR is submitted and the chain downloaded
//! 6. The challenge material is dropped whatever the outcome

pub mod account;
mod challenge;
mod client;
pub mod http;

use async_trait::async_trait;

use crate::bundle::CertBundle;
use crate::error::AutocertError;

pub use challenge::{
    tls_alpn_certificate, ChallengeGuard, ChallengeRegistry, ACME_CHALLENGE_PREFIX,
    ACME_TLS_ALPN_PROTOCOL,
};
pub use account::AcmeTransport;
pub use client::AcmeClient;

/// Source of freshly issued certificates
///
/// The store calls this on a cache miss or when a certificate is due for
/// renewal. [`AcmeClient`] is the production implementation.
#[async_trait]
pub trait CertIssuer: Send + Sync {
    /// Obtain a new certificate covering `hostname`
    ///
    /// `hostname` is already normalized and approved by the host policy.
    async fn issue(&self, hostname: &str) -> Result<CertBundle, AutocertError>;
}

/// Map an `instant-acme` error onto the retriable/terminal split
///
/// Server-side problems (5xx) and stale nonces are retriable, as is anything
/// that never produced an ACME problem document (connect errors, timeouts).
/// Every other problem document is a terminal protocol failure.
pub(crate) fn classify_acme_error(host: &str, stage: &str, e: instant_acme::Error) -> AutocertError {
    classify(stage, e, |detail| AutocertError::Protocol {
        host: host.to_string(),
        detail,
    })
}

/// Same split for account registration and restore, which concern no host
pub(crate) fn classify_account_error(stage: &str, e: instant_acme::Error) -> AutocertError {
    classify(stage, e, AutocertError::Account)
}

fn classify(
    stage: &str,
    e: instant_acme::Error,
    terminal: impl FnOnce(String) -> AutocertError,
) -> AutocertError {
    match e {
        instant_acme::Error::Api(problem) => {
            let server_side = problem.status.is_some_and(|s| s >= 500);
            let bad_nonce = problem
                .r#type
                .as_deref()
                .is_some_and(|t| t.ends_with(":badNonce"));

            if server_side || bad_nonce {
                AutocertError::Transient(format!("{}: {}", stage, problem))
            } else {
                terminal(format!("{}: {}", stage, problem))
            }
        }
        other => AutocertError::Transient(format!("{}: {}", stage, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use instant_acme::Problem;

    fn problem(kind: &str, status: u16) -> instant_acme::Error {
        let problem: Problem = serde_json::from_value(serde_json::json!({
            "type": format!("urn:ietf:params:acme:error:{}", kind),
            "detail": "detail",
            "status": status,
        }))
        .unwrap();
        instant_acme::Error::Api(problem)
    }

    #[test]
    fn test_server_errors_are_transient() {
        let err = classify_acme_error("a.example.com", "new order", problem("serverInternal", 503));
        assert!(err.is_retriable());
    }

    #[test]
    fn test_bad_nonce_is_transient() {
        let err = classify_acme_error("a.example.com", "new order", problem("badNonce", 400));
        assert!(err.is_retriable());
    }

    #[test]
    fn test_validation_problem_is_terminal() {
        let err = classify_acme_error("a.example.com", "challenge", problem("unauthorized", 403));
        match err {
            AutocertError::Protocol { host, detail } => {
                assert_eq!(host, "a.example.com");
                assert!(detail.starts_with("challenge"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_account_problem_names_no_host() {
        let err = classify_account_error("register account", problem("invalidContact", 400));
        assert!(!err.is_retriable());
        assert_eq!(
            err.to_string(),
            "ACME account error: register account: API error: detail \
             (urn:ietf:params:acme:error:invalidContact)"
        );
        assert!(!err.to_string().contains("''"));

        let err = classify_account_error("register account", problem("serverInternal", 500));
        assert!(err.is_retriable());
    }

    #[test]
    fn test_transport_errors_are_transient() {
        let err = classify_acme_error("a.example.com", "directory", instant_acme::Error::Str("eof"));
        assert!(err.is_retriable());
    }
}
