//! Durable certificate cache
//!
//! A [`Cache`] maps string keys to opaque bytes. The store keeps one entry per
//! normalised hostname and the ACME coordinator keeps its account under
//! [`ACCOUNT_KEY`]. Backends must replace entries atomically: a reader sees
//! either the old bytes or the new bytes, never a mix.
//!
//! - [`DirCache`] - one file per key in a private directory
//! - [`MemoryCache`] - process-local map for embedding and tests

mod dir;
mod memory;

use async_trait::async_trait;

use crate::error::CacheError;

pub use dir::DirCache;
pub use memory::MemoryCache;

/// Cache key holding the ACME account
pub const ACCOUNT_KEY: &str = "acme_account+key";

/// Key/value storage for certificates and account data
#[async_trait]
pub trait Cache: Send + Sync {
    /// Read an entry, returning [`CacheError::Miss`] if absent
    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError>;

    /// Atomically create or replace an entry
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), CacheError>;

    /// Remove an entry; removing a missing entry succeeds
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// List stored keys
    async fn keys(&self) -> Result<Vec<String>, CacheError>;
}

/// Reject keys that cannot name a single file
pub(crate) fn check_key(key: &str) -> Result<(), CacheError> {
    let bad = key.is_empty()
        || key.starts_with('.')
        || key.contains(['/', '\\', '\0'])
        || key.chars().any(char::is_whitespace);

    if bad {
        Err(CacheError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_key() {
        assert!(check_key("example.com").is_ok());
        assert!(check_key(ACCOUNT_KEY).is_ok());

        for bad in ["", ".hidden", "..", "a/b", "a\\b", "a b", "a\0b"] {
            assert!(
                matches!(check_key(bad), Err(CacheError::InvalidKey(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
