//! Cache entry model

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::domain::fingerprint::CacheKey;
use crate::domain::llm::ProviderResponse;

/// Invalidation label attached to entries at write time (e.g. `character:42`).
/// Used only for invalidation lookup, never for reuse decisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(String);

impl Tag {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A cached provider response
///
/// Owned exclusively by the cache that stores it. Immutable after creation
/// except for expiry refresh on explicit touch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    key: CacheKey,
    value: ProviderResponse,
    created_at: u64,
    expires_at: u64,
    tags: BTreeSet<Tag>,
    size_bytes: usize,
    hit_count: u32,
}

impl CacheEntry {
    pub fn new(key: CacheKey, value: ProviderResponse, ttl: Duration, tags: Vec<Tag>) -> Self {
        let now = current_time_millis();
        let size_bytes = value.size_bytes();

        Self {
            key,
            value,
            created_at: now,
            expires_at: now + ttl.as_millis() as u64,
            tags: tags.into_iter().collect(),
            size_bytes,
            hit_count: 0,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn value(&self) -> &ProviderResponse {
        &self.value
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    pub fn tags(&self) -> &BTreeSet<Tag> {
        &self.tags
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn hit_count(&self) -> u32 {
        self.hit_count
    }

    /// Entries past their expiry are logically dead even if not yet purged
    pub fn is_expired(&self) -> bool {
        current_time_millis() >= self.expires_at
    }

    pub fn refresh_expiry(&mut self, ttl: Duration) {
        self.expires_at = current_time_millis() + ttl.as_millis() as u64;
    }

    pub fn increment_hits(&mut self) {
        self.hit_count += 1;
    }
}
