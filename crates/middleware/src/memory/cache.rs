use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::cache::Cache;
use crate::error::CacheError;

struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> Option<&Bytes> {
        match self.expires_at {
            Some(deadline) if now >= deadline => None,
            _ => Some(&self.value),
        }
    }
}

/// TTL-aware map on tokio's clock, so paused-time tests can expire
/// entries. Expired entries are hidden on read and swept on write.
#[derive(Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live (unexpired) entries
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries.values().filter(|e| e.live(now).is_some()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries.get(key).and_then(|e| e.live(now)).cloned())
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.live(now).is_some());
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.get(key).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_overwrite_keeps_last_value() {
        let cache = InMemoryCache::new();
        cache.set("bar:current:NYSE:IBM:1m", Bytes::from("v1"), None).await.unwrap();
        cache.set("bar:current:NYSE:IBM:1m", Bytes::from("v2"), None).await.unwrap();
        assert_eq!(
            cache.get("bar:current:NYSE:IBM:1m").await.unwrap(),
            Some(Bytes::from("v2"))
        );
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_at_ttl() {
        let cache = InMemoryCache::new();
        cache
            .set("quote:latest:NYSE:IBM", Bytes::from("q"), Some(Duration::from_secs(60)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.exists("quote:latest:NYSE:IBM").await.unwrap());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get("quote:latest:NYSE:IBM").await.unwrap().is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_sweeps_expired_entries() {
        let cache = InMemoryCache::new();
        cache.set("short", Bytes::from("a"), Some(Duration::from_secs(1))).await.unwrap();
        cache.set("pinned", Bytes::from("b"), None).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        cache.set("fresh", Bytes::from("c"), None).await.unwrap();
        assert_eq!(cache.entries.read().await.len(), 2);
    }

    #[tokio::test]
    async fn test_delete() {
        let cache = InMemoryCache::new();
        cache.set("key", Bytes::from("value"), None).await.unwrap();
        cache.delete("key").await.unwrap();
        assert!(!cache.exists("key").await.unwrap());
    }
}
