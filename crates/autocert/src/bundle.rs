//! Issued certificate bundles and their cache encoding
//!
//! A [`CertBundle`] is immutable: renewal produces a new bundle that replaces
//! the old one wholesale. Construction validates the material once (leaf
//! parses, covers its hostnames, matches the private key) and pre-builds the
//! rustls [`CertifiedKey`] so handshakes never re-parse key material.
//!
//! # Cache format
//!
//! ```json
//! {
//!   "version": 1,
//!   "hostnames": ["example.com"],
//!   "not_before": "2026-01-01T00:00:00Z",
//!   "not_after": "2026-04-01T00:00:00Z",
//!   "chain": ["<base64 DER>", "..."],
//!   "key": "<base64 PKCS#8 DER>",
//!   "checksum": "<hex SHA-256 over the fields above>"
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, TimeDelta, Utc};
use rcgen::PublicKeyData;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AutocertError;

/// Current cache envelope version
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// A certificate chain with its private key and validity window
#[derive(Clone)]
pub struct CertBundle {
    hostnames: Vec<String>,
    chain: Vec<CertificateDer<'static>>,
    key_der: Vec<u8>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    certified: Arc<CertifiedKey>,
}

impl CertBundle {
    /// Build a bundle from a DER chain (leaf first) and a PKCS#8 DER key
    ///
    /// # Errors
    ///
    /// Returns [`AutocertError::Certificate`] if the chain is empty, the leaf
    /// does not parse, a hostname is missing from the leaf's DNS names, or
    /// the key does not belong to the leaf.
    pub fn new(
        hostnames: Vec<String>,
        chain: Vec<CertificateDer<'static>>,
        key_der: Vec<u8>,
    ) -> Result<Self, AutocertError> {
        if hostnames.is_empty() {
            return Err(AutocertError::Certificate("bundle has no hostnames".into()));
        }
        let leaf = chain
            .first()
            .ok_or_else(|| AutocertError::Certificate("empty certificate chain".into()))?;

        let (not_before, not_after, leaf_names, leaf_spki) = {
            let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
                .map_err(|e| AutocertError::Certificate(format!("invalid leaf certificate: {}", e)))?;

            let validity = cert.validity();
            let not_before = asn1_to_chrono(validity.not_before)?;
            let not_after = asn1_to_chrono(validity.not_after)?;

            let names: Vec<String> = match cert.subject_alternative_name() {
                Ok(Some(san)) => san
                    .value
                    .general_names
                    .iter()
                    .filter_map(|name| match name {
                        x509_parser::extensions::GeneralName::DNSName(dns) => {
                            Some(dns.to_ascii_lowercase())
                        }
                        _ => None,
                    })
                    .collect(),
                Ok(None) => Vec::new(),
                Err(e) => {
                    return Err(AutocertError::Certificate(format!(
                        "invalid subjectAltName: {}",
                        e
                    )))
                }
            };

            (not_before, not_after, names, cert.public_key().raw.to_vec())
        };

        if let Some(missing) = hostnames.iter().find(|h| !leaf_names.contains(*h)) {
            return Err(AutocertError::Certificate(format!(
                "certificate does not cover '{}'",
                missing
            )));
        }

        let key_pair = rcgen::KeyPair::try_from(key_der.as_slice())
            .map_err(|e| AutocertError::Certificate(format!("invalid private key: {}", e)))?;
        if key_pair.subject_public_key_info() != leaf_spki {
            return Err(AutocertError::Certificate(
                "private key does not match certificate".into(),
            ));
        }

        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(
            &PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der.clone())),
        )?;
        let certified = Arc::new(CertifiedKey::new(chain.clone(), signing_key));

        Ok(Self {
            hostnames,
            chain,
            key_der,
            not_before,
            not_after,
            certified,
        })
    }

    /// Generate a self-signed bundle for one hostname
    ///
    /// Used for development servers and by fake issuers in tests.
    pub fn self_signed(
        hostname: &str,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<Self, AutocertError> {
        let mut params = rcgen::CertificateParams::new(vec![hostname.to_string()])?;
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, hostname.to_string());
        params.distinguished_name = dn;
        params.not_before = chrono_to_offset(not_before)?;
        params.not_after = chrono_to_offset(not_after)?;

        let key_pair = rcgen::KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;

        Self::new(
            vec![hostname.to_string()],
            vec![cert.der().clone()],
            key_pair.serialize_der(),
        )
    }

    pub fn hostnames(&self) -> &[String] {
        &self.hostnames
    }

    /// DER certificates, leaf first
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// PKCS#8 DER private key
    pub fn private_key_der(&self) -> &[u8] {
        &self.key_der
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Signing key and chain ready for a rustls handshake
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified)
    }

    pub fn covers(&self, hostname: &str) -> bool {
        self.hostnames.iter().any(|h| h == hostname)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }

    /// Instant from which renewal is due: `not_after - renew_before`
    pub fn renewal_threshold(&self, renew_before: Duration) -> DateTime<Utc> {
        TimeDelta::from_std(renew_before)
            .ok()
            .and_then(|delta| self.not_after.checked_sub_signed(delta))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Whether `now` has reached the renewal threshold
    pub fn is_renewal_due_at(&self, now: DateTime<Utc>, renew_before: Duration) -> bool {
        self.renewal_threshold(renew_before) <= now
    }

    // ========================================================================
    // Cache encoding
    // ========================================================================

    /// Serialise into the versioned, checksummed cache envelope
    pub fn to_cache_bytes(&self) -> Result<Vec<u8>, AutocertError> {
        let chain: Vec<String> = self.chain.iter().map(|c| BASE64.encode(c.as_ref())).collect();
        let key = BASE64.encode(&self.key_der);
        let checksum = payload_checksum(
            &self.hostnames,
            self.not_before,
            self.not_after,
            &chain,
            &key,
        );

        let envelope = CacheEnvelope {
            version: CACHE_FORMAT_VERSION,
            hostnames: self.hostnames.clone(),
            not_before: self.not_before,
            not_after: self.not_after,
            chain,
            key,
            checksum,
        };

        serde_json::to_vec_pretty(&envelope)
            .map_err(|e| AutocertError::Cache(format!("failed to encode bundle: {}", e)))
    }

    /// Decode a cache envelope
    ///
    /// # Errors
    ///
    /// Unknown versions, checksum mismatches, undecodable fields and material
    /// that fails [`CertBundle::new`] all return [`AutocertError::Cache`].
    pub fn from_cache_bytes(data: &[u8]) -> Result<Self, AutocertError> {
        let envelope: CacheEnvelope = serde_json::from_slice(data)
            .map_err(|e| AutocertError::Cache(format!("unreadable cache entry: {}", e)))?;

        if envelope.version != CACHE_FORMAT_VERSION {
            return Err(AutocertError::Cache(format!(
                "unsupported cache entry version {}",
                envelope.version
            )));
        }

        let expected = payload_checksum(
            &envelope.hostnames,
            envelope.not_before,
            envelope.not_after,
            &envelope.chain,
            &envelope.key,
        );
        if expected != envelope.checksum {
            return Err(AutocertError::Cache("cache entry checksum mismatch".into()));
        }

        let chain = envelope
            .chain
            .iter()
            .map(|c| BASE64.decode(c).map(CertificateDer::from))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AutocertError::Cache(format!("invalid chain encoding: {}", e)))?;
        let key = BASE64
            .decode(&envelope.key)
            .map_err(|e| AutocertError::Cache(format!("invalid key encoding: {}", e)))?;

        let bundle = Self::new(envelope.hostnames, chain, key)
            .map_err(|e| AutocertError::Cache(format!("invalid cached bundle: {}", e)))?;

        if bundle.not_before != envelope.not_before || bundle.not_after != envelope.not_after {
            return Err(AutocertError::Cache(
                "cache entry validity does not match certificate".into(),
            ));
        }

        Ok(bundle)
    }
}

impl PartialEq for CertBundle {
    fn eq(&self, other: &Self) -> bool {
        self.hostnames == other.hostnames
            && self.chain == other.chain
            && self.key_der == other.key_der
            && self.not_before == other.not_before
            && self.not_after == other.not_after
    }
}

impl Eq for CertBundle {}

impl fmt::Debug for CertBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertBundle")
            .field("hostnames", &self.hostnames)
            .field("chain_len", &self.chain.len())
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
struct CacheEnvelope {
    version: u32,
    hostnames: Vec<String>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    chain: Vec<String>,
    key: String,
    checksum: String,
}

fn payload_checksum(
    hostnames: &[String],
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    chain: &[String],
    key: &str,
) -> String {
    let mut hasher = Sha256::new();
    for name in hostnames {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(not_before.timestamp().to_be_bytes());
    hasher.update(not_after.timestamp().to_be_bytes());
    for cert in chain {
        hasher.update(cert.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

fn asn1_to_chrono(t: x509_parser::time::ASN1Time) -> Result<DateTime<Utc>, AutocertError> {
    DateTime::from_timestamp(t.timestamp(), 0)
        .ok_or_else(|| AutocertError::Certificate(format!("validity time out of range: {}", t)))
}

fn chrono_to_offset(t: DateTime<Utc>) -> Result<time::OffsetDateTime, AutocertError> {
    time::OffsetDateTime::from_unix_timestamp(t.timestamp())
        .map_err(|e| AutocertError::Certificate(format!("validity time out of range: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle_for(host: &str, days: i64) -> CertBundle {
        let now = Utc::now();
        CertBundle::self_signed(host, now - TimeDelta::days(1), now + TimeDelta::days(days)).unwrap()
    }

    #[test]
    fn test_self_signed_bundle() {
        let bundle = bundle_for("example.com", 90);

        assert_eq!(bundle.hostnames(), ["example.com".to_string()]);
        assert_eq!(bundle.chain().len(), 1);
        assert!(bundle.covers("example.com"));
        assert!(!bundle.covers("www.example.com"));
        assert!(!bundle.is_expired_at(Utc::now()));
        assert!(bundle.not_after() > Utc::now() + TimeDelta::days(89));
    }

    #[test]
    fn test_cache_round_trip_is_byte_identical() {
        let bundle = bundle_for("example.com", 90);

        let encoded = bundle.to_cache_bytes().unwrap();
        let decoded = CertBundle::from_cache_bytes(&encoded).unwrap();

        assert_eq!(decoded, bundle);
        assert_eq!(decoded.chain(), bundle.chain());
        assert_eq!(decoded.not_after(), bundle.not_after());
        assert_eq!(decoded.to_cache_bytes().unwrap(), encoded);
    }

    #[test]
    fn test_tampered_entry_detected() {
        let bundle = bundle_for("example.com", 90);
        let encoded = bundle.to_cache_bytes().unwrap();

        let mut value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        value["hostnames"] = serde_json::json!(["evil.example.com"]);
        let tampered = serde_json::to_vec(&value).unwrap();

        let err = CertBundle::from_cache_bytes(&tampered).unwrap_err();
        assert!(matches!(err, AutocertError::Cache(ref m) if m.contains("checksum")));
    }

    #[test]
    fn test_truncated_entry_detected() {
        let encoded = bundle_for("example.com", 90).to_cache_bytes().unwrap();
        let truncated = &encoded[..encoded.len() / 2];

        assert!(matches!(
            CertBundle::from_cache_bytes(truncated),
            Err(AutocertError::Cache(_))
        ));
        assert!(CertBundle::from_cache_bytes(b"not json").is_err());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let encoded = bundle_for("example.com", 90).to_cache_bytes().unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        value["version"] = serde_json::json!(99);

        let err = CertBundle::from_cache_bytes(&serde_json::to_vec(&value).unwrap()).unwrap_err();
        assert!(err.to_string().contains("version 99"));
    }

    #[test]
    fn test_mismatched_key_rejected() {
        let a = bundle_for("example.com", 90);
        let b = bundle_for("example.com", 90);

        let err = CertBundle::new(
            a.hostnames().to_vec(),
            a.chain().to_vec(),
            b.private_key_der().to_vec(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_uncovered_hostname_rejected() {
        let a = bundle_for("example.com", 90);

        let err = CertBundle::new(
            vec!["other.example.com".to_string()],
            a.chain().to_vec(),
            a.private_key_der().to_vec(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("does not cover"));
    }

    #[test]
    fn test_renewal_boundary() {
        let bundle = bundle_for("example.com", 60);
        let renew_before = Duration::from_secs(30 * 86_400);
        let threshold = bundle.not_after() - TimeDelta::days(30);

        assert_eq!(bundle.renewal_threshold(renew_before), threshold);
        assert!(bundle.is_renewal_due_at(threshold, renew_before));
        assert!(!bundle.is_renewal_due_at(threshold - TimeDelta::seconds(1), renew_before));
    }

    #[test]
    fn test_expiry() {
        let bundle = bundle_for("example.com", 10);
        assert!(!bundle.is_expired_at(bundle.not_after() - TimeDelta::seconds(1)));
        assert!(bundle.is_expired_at(bundle.not_after()));
    }
}
