//! ACME account persistence
//!
//! The account is registered once (accepting the CA's terms of service) and
//! stored in the cache under [`ACCOUNT_KEY`](crate::cache::ACCOUNT_KEY). Later
//! runs restore it from there instead of registering again.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use http::Request;
use http_body_util::Full;
use hyper::body::Bytes;
use instant_acme::{Account, AccountCredentials, BytesResponse, HttpClient, NewAccount};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::classify_account_error;
use crate::cache::{Cache, ACCOUNT_KEY};
use crate::error::{AutocertError, CacheError};

/// Persisted account record
#[derive(Serialize, Deserialize)]
pub struct AccountState {
    /// Directory the account was registered with
    pub directory: String,
    /// Account URL assigned by the CA
    pub registration_uri: String,
    /// `mailto:` contacts submitted at registration
    pub contact: Vec<String>,
    pub terms_accepted: bool,
    pub created: DateTime<Utc>,
    /// Signing key and account URL as kept by `instant-acme`
    pub credentials: AccountCredentials,
}

impl fmt::Debug for AccountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountState")
            .field("directory", &self.directory)
            .field("registration_uri", &self.registration_uri)
            .field("contact", &self.contact)
            .field("terms_accepted", &self.terms_accepted)
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

/// Transport used to reach the CA
///
/// `None` selects the `instant-acme` HTTPS client.
pub type AcmeTransport = Option<Arc<dyn HttpClient>>;

/// Hands one shared transport to every `instant-acme` client
struct SharedHttp(Arc<dyn HttpClient>);

impl HttpClient for SharedHttp {
    fn request(
        &self,
        req: Request<Full<Bytes>>,
    ) -> Pin<Box<dyn Future<Output = Result<BytesResponse, instant_acme::Error>> + Send>> {
        self.0.request(req)
    }
}

/// Load the account for `directory` from the cache, registering one if absent
///
/// A stored account registered against a different directory is replaced.
pub async fn load_or_register(
    cache: &dyn Cache,
    directory: &str,
    email: &str,
    transport: &AcmeTransport,
) -> Result<Account, AutocertError> {
    match cache.get(ACCOUNT_KEY).await {
        Ok(data) => match serde_json::from_slice::<AccountState>(&data) {
            Ok(state) if state.directory == directory => {
                let registration_uri = state.registration_uri.clone();
                let restored = match transport {
                    Some(http) => {
                        Account::from_credentials_and_http(
                            state.credentials,
                            Box::new(SharedHttp(Arc::clone(http))),
                        )
                        .await
                    }
                    None => Account::from_credentials(state.credentials).await,
                };
                let account =
                    restored.map_err(|e| classify_account_error("restore account", e))?;
                debug!(account = %registration_uri, "Restored ACME account from cache");
                return Ok(account);
            }
            Ok(state) => {
                warn!(
                    stored = %state.directory,
                    configured = %directory,
                    "Cached ACME account belongs to another directory, registering a new one"
                );
            }
            Err(e) => {
                warn!(error = %e, "Cached ACME account is unreadable, registering a new one");
            }
        },
        Err(CacheError::Miss) => {
            debug!("No cached ACME account");
        }
        Err(e) => return Err(e.into()),
    }

    register(cache, directory, email, transport).await
}

async fn register(
    cache: &dyn Cache,
    directory: &str,
    email: &str,
    transport: &AcmeTransport,
) -> Result<Account, AutocertError> {
    info!(directory = %directory, "Registering new ACME account");

    let contact: Vec<String> = if email.is_empty() {
        Vec::new()
    } else {
        vec![format!("mailto:{}", email)]
    };
    let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();

    let new_account = NewAccount {
        contact: &contact_refs,
        terms_of_service_agreed: true,
        only_return_existing: false,
    };

    let created = match transport {
        Some(http) => {
            Account::create_with_http(
                &new_account,
                directory,
                None,
                Box::new(SharedHttp(Arc::clone(http))),
            )
            .await
        }
        None => Account::create(&new_account, directory, None).await,
    };
    let (account, credentials) =
        created.map_err(|e| classify_account_error("register account", e))?;

    let state = AccountState {
        directory: directory.to_string(),
        registration_uri: account.id().to_string(),
        contact,
        terms_accepted: true,
        created: Utc::now(),
        credentials,
    };

    let data = serde_json::to_vec_pretty(&state)
        .map_err(|e| AutocertError::Cache(format!("failed to encode ACME account: {}", e)))?;
    cache.put(ACCOUNT_KEY, &data).await?;

    info!(account = %state.registration_uri, "ACME account registered and saved");
    Ok(account)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    #[tokio::test]
    async fn test_unreachable_directory_is_transient() {
        crate::tls::ensure_crypto_provider();
        let cache = MemoryCache::new();

        // Nothing listens on port 9 locally; the registration request fails
        let err = match load_or_register(
            &cache,
            "http://127.0.0.1:9/directory",
            "ops@example.com",
            &None,
        )
        .await
        {
            Ok(_) => panic!("registration against a closed port succeeded"),
            Err(e) => e,
        };

        assert!(err.is_retriable(), "unexpected error: {err:?}");
        assert!(!cache.contains(ACCOUNT_KEY));
    }

    #[tokio::test]
    async fn test_corrupt_account_is_replaced_not_fatal() {
        crate::tls::ensure_crypto_provider();
        let cache = MemoryCache::new();
        cache.put(ACCOUNT_KEY, b"{ not json").await.unwrap();

        // Falls through to registration, which fails on the unreachable
        // directory rather than on the corrupt entry
        let err = match load_or_register(&cache, "http://127.0.0.1:9/directory", "", &None).await {
            Ok(_) => panic!("registration against a closed port succeeded"),
            Err(e) => e,
        };
        assert!(err.is_retriable());
    }

    #[test]
    fn test_account_state_debug_hides_credentials() {
        let state: AccountState = serde_json::from_value(serde_json::json!({
            "directory": "https://ca.test/directory",
            "registration_uri": "https://ca.test/acct/1",
            "contact": ["mailto:ops@example.com"],
            "terms_accepted": true,
            "created": "2026-01-01T00:00:00Z",
            "credentials": {
                "id": "https://ca.test/acct/1",
                "key_pkcs8": "c2VjcmV0LWtleQ",
                "directory": "https://ca.test/directory"
            }
        }))
        .unwrap();

        let debug = format!("{state:?}");
        assert!(debug.contains("https://ca.test/acct/1"));
        assert!(!debug.contains("c2VjcmV0LWtleQ"));
    }
}
