//! In-memory exact cache implementation using moka

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache as MokaCache;

use crate::domain::cache::{CacheEntry, ExactCache, Tag};
use crate::domain::fingerprint::CacheKey;
use crate::domain::DomainError;

/// Configuration for the in-memory exact cache
#[derive(Debug, Clone)]
pub struct InMemoryExactCacheConfig {
    /// Maximum number of entries before TinyLFU eviction kicks in
    pub max_capacity: u64,
    /// Upper bound TTL enforced by moka regardless of per-entry expiry
    pub max_ttl: Duration,
}

impl Default for InMemoryExactCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            max_ttl: Duration::from_secs(3600),
        }
    }
}

impl InMemoryExactCacheConfig {
    pub fn with_max_capacity(mut self, capacity: u64) -> Self {
        self.max_capacity = capacity;
        self
    }

    pub fn with_max_ttl(mut self, ttl: Duration) -> Self {
        self.max_ttl = ttl;
        self
    }
}

/// Thread-safe exact cache backed by moka, with a tag index for invalidation
///
/// Per-entry expiry is checked logically on read since moka's TTL is uniform.
/// The tag index is advisory: a tag may reference keys moka has already
/// evicted, which `remove_tagged` tolerates.
#[derive(Debug)]
pub struct InMemoryExactCache {
    cache: MokaCache<String, CacheEntry>,
    tag_index: RwLock<HashMap<Tag, HashSet<CacheKey>>>,
}

impl InMemoryExactCache {
    pub fn new() -> Self {
        Self::with_config(InMemoryExactCacheConfig::default())
    }

    pub fn with_config(config: InMemoryExactCacheConfig) -> Self {
        let cache = MokaCache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(config.max_ttl)
            .build();

        Self {
            cache,
            tag_index: RwLock::new(HashMap::new()),
        }
    }

    fn index_tags(&self, entry: &CacheEntry) {
        if entry.tags().is_empty() {
            return;
        }

        let mut index = self
            .tag_index
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for tag in entry.tags() {
            index
                .entry(tag.clone())
                .or_default()
                .insert(entry.key().clone());
        }
    }

    fn unindex_key(&self, key: &CacheKey) {
        let mut index = self
            .tag_index
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        index.retain(|_, keys| {
            keys.remove(key);
            !keys.is_empty()
        });
    }

    async fn all_keys(&self) -> Result<Vec<String>, DomainError> {
        self.cache.run_pending_tasks().await;

        let cache_clone = self.cache.clone();
        tokio::task::spawn_blocking(move || {
            cache_clone
                .iter()
                .map(|(k, _)| k.as_ref().to_string())
                .collect()
        })
        .await
        .map_err(|e| DomainError::cache(format!("Failed to iterate cache: {}", e)))
    }
}

impl Default for InMemoryExactCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExactCache for InMemoryExactCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, DomainError> {
        match self.cache.get(key.as_str()).await {
            Some(entry) => {
                if entry.is_expired() {
                    self.cache.remove(key.as_str()).await;
                    self.unindex_key(key);
                    return Ok(None);
                }

                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), DomainError> {
        self.index_tags(&entry);
        self.cache
            .insert(entry.key().as_str().to_string(), entry)
            .await;
        Ok(())
    }

    async fn touch(&self, key: &CacheKey, ttl: Duration) -> Result<bool, DomainError> {
        match self.cache.get(key.as_str()).await {
            Some(mut entry) => {
                if entry.is_expired() {
                    self.cache.remove(key.as_str()).await;
                    self.unindex_key(key);
                    return Ok(false);
                }

                entry.refresh_expiry(ttl);
                entry.increment_hits();
                self.cache.insert(key.as_str().to_string(), entry).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool, DomainError> {
        let existed = self.cache.get(key.as_str()).await.is_some();
        self.cache.remove(key.as_str()).await;
        self.unindex_key(key);
        Ok(existed)
    }

    async fn remove_tagged(&self, tag: &Tag) -> Result<Vec<CacheKey>, DomainError> {
        let keys: Vec<CacheKey> = {
            let mut index = self
                .tag_index
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            index
                .remove(tag)
                .map(|keys| keys.into_iter().collect())
                .unwrap_or_default()
        };

        for key in &keys {
            self.cache.remove(key.as_str()).await;
            self.unindex_key(key);
        }

        Ok(keys)
    }

    async fn evict_expired(&self) -> Result<usize, DomainError> {
        let mut evicted = 0;

        for key in self.all_keys().await? {
            if let Some(entry) = self.cache.get(&key).await {
                if entry.is_expired() {
                    self.cache.remove(&key).await;
                    self.unindex_key(entry.key());
                    evicted += 1;
                }
            }
        }

        Ok(evicted)
    }

    async fn len(&self) -> usize {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count() as usize
    }

    async fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        self.tag_index
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}
