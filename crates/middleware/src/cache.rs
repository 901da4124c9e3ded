//! Key-value cache seam
//!
//! Holds the latest-quote and current-bar entries. Writes are
//! last-writer-wins, so concurrent writers to one key need no
//! coordination.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::error::CacheError;

/// Byte-valued cache with per-key expiry, shared as `Arc<dyn Cache>`.
#[async_trait]
pub trait Cache: Send + Sync {
    /// `None` when the key is absent or its TTL has elapsed
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    /// Overwrite `key`. With `ttl` of `None` the entry lives until deleted.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCache;
    use std::sync::Arc;

    const KEY: &str = "quote:latest:NASDAQ:AAPL";

    #[tokio::test]
    async fn test_shared_across_tasks() {
        let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::new());

        let writer = Arc::clone(&cache);
        tokio::spawn(async move { writer.set(KEY, Bytes::from_static(b"{}"), None).await })
            .await
            .unwrap()
            .unwrap();
        assert!(cache.exists(KEY).await.unwrap());

        cache.delete(KEY).await.unwrap();
        cache.delete(KEY).await.unwrap();
        assert_eq!(cache.get(KEY).await.unwrap(), None);
    }
}
