use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::cache::current_time_millis;
use crate::domain::error::DomainError;
use crate::domain::fingerprint::{BucketId, CacheKey};

/// Index record mapping an embedding to the exact-cache entry it describes
///
/// The index stores references, not values. The exact cache remains the single
/// owner of response payloads, so an invalidated entry can never be served
/// through a stale semantic match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticIndexEntry {
    pub bucket: BucketId,
    pub vector: Vec<f32>,
    pub entry_key: CacheKey,
    pub inserted_at: u64,
    pub expires_at: u64,
}

impl SemanticIndexEntry {
    pub fn new(
        bucket: BucketId,
        vector: Vec<f32>,
        entry_key: CacheKey,
        ttl: std::time::Duration,
    ) -> Self {
        let now = current_time_millis();
        Self {
            bucket,
            vector,
            entry_key,
            inserted_at: now,
            expires_at: now + ttl.as_millis() as u64,
        }
    }

    pub fn is_expired(&self) -> bool {
        current_time_millis() >= self.expires_at
    }
}

/// Best candidate returned by a similarity query
#[derive(Debug, Clone)]
pub struct SemanticMatch {
    pub entry_key: CacheKey,
    pub similarity: f32,
}

/// Similarity index over cached entries
///
/// Matching never crosses bucket boundaries; the bucket carries the same
/// boundary fields as the exact key, so model, template version, tenant and
/// date are all hard walls.
#[async_trait]
pub trait SemanticCache: Send + Sync + Debug {
    /// Returns the highest-similarity entry at or above the threshold, or
    /// `None`. Ties break toward the most recently inserted entry.
    async fn query(
        &self,
        bucket: &BucketId,
        vector: &[f32],
        threshold: f32,
    ) -> Result<Option<SemanticMatch>, DomainError>;

    async fn insert(&self, entry: SemanticIndexEntry) -> Result<(), DomainError>;

    /// Drops every index record pointing at one of the given keys, returning
    /// how many were removed. Called after exact-cache invalidation.
    async fn remove_keys(&self, keys: &[CacheKey]) -> Result<usize, DomainError>;

    async fn evict_expired(&self) -> Result<usize, DomainError>;

    async fn len(&self) -> usize;

    async fn clear(&self);
}
