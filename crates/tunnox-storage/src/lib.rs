//! Shared key-value store seam
//!
//! Cluster nodes coordinate through a KV store with per-key TTLs. The
//! production deployment plugs in an external store; [`MemoryStorage`]
//! backs single-node operation and tests. Expiry is the store's job:
//! callers never scan for stale keys.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Key expired: {0}")]
    Expired(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Key-value store with per-key TTLs
#[async_trait]
pub trait Storage: Send + Sync {
    /// Set a key, optionally expiring after `ttl`
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>)
        -> Result<(), StorageError>;

    /// Get a live value; expired keys fail with [`StorageError::Expired`]
    async fn get(&self, key: &str) -> Result<String, StorageError>;

    /// Delete a key; deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process store for single-node mode and tests
#[derive(Default)]
pub struct MemoryStorage {
    entries: DashMap<String, Entry>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry; the periodic sweep calls this so the
    /// map does not grow unboundedly between reads
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let purged = before - self.entries.len();
        if purged > 0 {
            tracing::debug!(purged, "Evicted expired keys");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<String, StorageError> {
        match self.entries.get(key) {
            Some(entry) if entry.is_expired() => {
                drop(entry);
                self.entries
                    .remove_if(key, |_, e| e.is_expired());
                Err(StorageError::Expired(key.to_string()))
            }
            Some(entry) => Ok(entry.value.clone()),
            None => Err(StorageError::NotFound(key.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let storage = MemoryStorage::new();

        storage.set("k1", "v1".to_string(), None).await.unwrap();
        assert_eq!(storage.get("k1").await.unwrap(), "v1");

        storage.delete("k1").await.unwrap();
        assert!(matches!(
            storage.get("k1").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_get_missing() {
        let storage = MemoryStorage::new();
        assert!(matches!(
            storage.get("nope").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_overwrite_resets_ttl() {
        let storage = MemoryStorage::new();
        storage
            .set("k1", "old".to_string(), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        storage.set("k1", "new".to_string(), None).await.unwrap();
        assert_eq!(storage.get("k1").await.unwrap(), "new");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let storage = MemoryStorage::new();
        storage
            .set("k1", "v1".to_string(), Some(Duration::from_secs(30)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(storage.get("k1").await.unwrap(), "v1");

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(
            storage.get("k1").await,
            Err(StorageError::Expired(_))
        ));

        // A second read sees plain not-found: expiry evicted the entry
        assert!(matches!(
            storage.get("k1").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let storage = MemoryStorage::new();
        storage
            .set("short", "v".to_string(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        storage.set("keep", "v".to_string(), None).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        let purged = storage.purge_expired();

        assert_eq!(purged, 1);
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.get("keep").await.unwrap(), "v");
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let storage = MemoryStorage::new();
        storage.delete("nope").await.unwrap();
    }
}
