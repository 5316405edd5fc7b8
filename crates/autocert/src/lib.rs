//! Automatic TLS certificates over ACME
//!
//! Obtains certificates on demand from Let's Encrypt (or any ACME CA) the
//! first time a client asks for a server name, caches them on disk, and
//! renews them in the background before they expire.
//!
//! # Architecture
//!
//! - [`policy`] - decides which server names may get a certificate
//! - [`cache`] - durable key/value storage for bundles and the ACME account
//! - [`acme`] - ACME orders, challenges, and the HTTP-01 responder
//! - [`store`] - in-memory index with single-flight issuance
//! - [`scheduler`] - periodic renewal and eviction
//! - [`listener`] / [`tls`] - TLS accept path and rustls integration
//! - [`Manager`] - wires all of the above together

pub mod acme;
pub mod bundle;
pub mod cache;
pub mod error;
pub mod hostname;
pub mod listener;
pub mod manager;
pub mod policy;
pub mod scheduler;
pub mod store;
pub mod tls;

pub use acme::{AcmeClient, CertIssuer, ChallengeRegistry};
pub use bundle::CertBundle;
pub use cache::{Cache, DirCache, MemoryCache};
pub use error::{AutocertError, CacheError, HandshakeError};
pub use hostname::normalize_hostname;
pub use listener::{CertAcceptor, Listener, TlsConnecting};
pub use manager::{Manager, ManagerBuilder};
pub use policy::HostPolicy;
pub use scheduler::RenewalScheduler;
pub use store::{CertificateStore, StoreSettings};
