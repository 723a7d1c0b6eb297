use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

use super::entry::{CacheEntry, Tag};
use crate::domain::error::DomainError;
use crate::domain::fingerprint::CacheKey;

/// Exact-match cache store
///
/// Keyed by the deterministic cache key. Implementations own eviction; callers
/// treat `get` returning `None` for both absence and expiry.
#[async_trait]
pub trait ExactCache: Send + Sync + Debug {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, DomainError>;

    async fn put(&self, entry: CacheEntry) -> Result<(), DomainError>;

    /// Extends the expiry of an existing entry. Returns false when the key is
    /// absent or already expired.
    async fn touch(&self, key: &CacheKey, ttl: Duration) -> Result<bool, DomainError>;

    async fn remove(&self, key: &CacheKey) -> Result<bool, DomainError>;

    /// Removes every entry carrying the tag, returning the removed keys so
    /// dependent indexes can be pruned alongside.
    async fn remove_tagged(&self, tag: &Tag) -> Result<Vec<CacheKey>, DomainError>;

    /// Purges logically expired entries, returning how many were dropped
    async fn evict_expired(&self) -> Result<usize, DomainError>;

    async fn len(&self) -> usize;

    async fn clear(&self);
}
