//! In-memory semantic index with linear cosine scan per bucket

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::domain::embedding::cosine_similarity;
use crate::domain::fingerprint::{BucketId, CacheKey};
use crate::domain::semantic_cache::{SemanticCache, SemanticIndexEntry, SemanticMatch};
use crate::domain::DomainError;

#[derive(Debug, Clone)]
pub struct InMemorySemanticCacheConfig {
    /// Per-bucket entry cap; oldest entries are dropped first when exceeded
    pub max_entries_per_bucket: usize,
}

impl Default for InMemorySemanticCacheConfig {
    fn default() -> Self {
        Self {
            max_entries_per_bucket: 1024,
        }
    }
}

impl InMemorySemanticCacheConfig {
    pub fn with_max_entries_per_bucket(mut self, max: usize) -> Self {
        self.max_entries_per_bucket = max;
        self
    }
}

/// Brute-force similarity index
///
/// Buckets are small by construction (they already carry model, template
/// version, tenant and date), so a linear scan per query is acceptable at
/// this scale.
#[derive(Debug)]
pub struct InMemorySemanticCache {
    buckets: RwLock<HashMap<BucketId, Vec<SemanticIndexEntry>>>,
    config: InMemorySemanticCacheConfig,
}

impl InMemorySemanticCache {
    pub fn new() -> Self {
        Self::with_config(InMemorySemanticCacheConfig::default())
    }

    pub fn with_config(config: InMemorySemanticCacheConfig) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            config,
        }
    }
}

impl Default for InMemorySemanticCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SemanticCache for InMemorySemanticCache {
    async fn query(
        &self,
        bucket: &BucketId,
        vector: &[f32],
        threshold: f32,
    ) -> Result<Option<SemanticMatch>, DomainError> {
        let buckets = self
            .buckets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let Some(entries) = buckets.get(bucket) else {
            return Ok(None);
        };

        let mut best: Option<(&SemanticIndexEntry, f32)> = None;
        for entry in entries {
            if entry.is_expired() {
                continue;
            }

            let similarity = cosine_similarity(vector, &entry.vector);
            if similarity < threshold {
                continue;
            }

            // Ties break toward the most recent insert
            let better = match best {
                None => true,
                Some((current, score)) => {
                    similarity > score
                        || (similarity == score && entry.inserted_at > current.inserted_at)
                }
            };
            if better {
                best = Some((entry, similarity));
            }
        }

        Ok(best.map(|(entry, similarity)| SemanticMatch {
            entry_key: entry.entry_key.clone(),
            similarity,
        }))
    }

    async fn insert(&self, entry: SemanticIndexEntry) -> Result<(), DomainError> {
        let mut buckets = self
            .buckets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let entries = buckets.entry(entry.bucket.clone()).or_default();
        entries.retain(|existing| existing.entry_key != entry.entry_key);
        entries.push(entry);

        if entries.len() > self.config.max_entries_per_bucket {
            let overflow = entries.len() - self.config.max_entries_per_bucket;
            entries.drain(..overflow);
        }

        Ok(())
    }

    async fn remove_keys(&self, keys: &[CacheKey]) -> Result<usize, DomainError> {
        let mut buckets = self
            .buckets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut removed = 0;
        buckets.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|entry| !keys.contains(&entry.entry_key));
            removed += before - entries.len();
            !entries.is_empty()
        });

        Ok(removed)
    }

    async fn evict_expired(&self) -> Result<usize, DomainError> {
        let mut buckets = self
            .buckets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut evicted = 0;
        buckets.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|entry| !entry.is_expired());
            evicted += before - entries.len();
            !entries.is_empty()
        });

        Ok(evicted)
    }

    async fn len(&self) -> usize {
        self.buckets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(|entries| entries.len())
            .sum()
    }

    async fn clear(&self) {
        self.buckets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}
