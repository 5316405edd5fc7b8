//! In-memory cache backend.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{check_key, Cache};
use crate::error::CacheError;

/// Process-local cache; contents are lost on exit
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        self.entries.read().get(key).cloned().ok_or(CacheError::Miss)
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        check_key(key)?;
        self.entries.write().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let cache = MemoryCache::new();

        assert!(matches!(cache.get("a.example.com").await, Err(CacheError::Miss)));

        cache.put("a.example.com", b"one").await.unwrap();
        cache.put("a.example.com", b"two").await.unwrap();
        assert_eq!(cache.get("a.example.com").await.unwrap(), b"two");
        assert_eq!(cache.len(), 1);

        cache.delete("a.example.com").await.unwrap();
        cache.delete("a.example.com").await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_keys_sorted() {
        let cache = MemoryCache::new();
        cache.put("b.example.com", b"b").await.unwrap();
        cache.put("a.example.com", b"a").await.unwrap();

        assert_eq!(
            cache.keys().await.unwrap(),
            vec!["a.example.com".to_string(), "b.example.com".to_string()]
        );
    }
}
