//! Negative cache for recently failed requests
//!
//! Keyed by the exact fingerprint hash, never by semantic similarity, so a
//! failure for one request can only suppress retries of that same request.

use std::time::Duration;

use moka::future::Cache as MokaCache;
use serde::{Deserialize, Serialize};

use crate::domain::cache::current_time_millis;
use crate::domain::fingerprint::FingerprintHash;
use crate::domain::DomainError;

#[derive(Debug, Clone)]
pub struct NegativeCacheConfig {
    pub max_capacity: u64,
    /// Deliberately short; a negative entry only suppresses the immediate
    /// thundering herd after a failure
    pub ttl: Duration,
}

impl Default for NegativeCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            ttl: Duration::from_secs(30),
        }
    }
}

impl NegativeCacheConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Recorded failure for a specific request fingerprint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegativeCacheEntry {
    pub error_class: String,
    pub provider: Option<String>,
    pub message: String,
    pub expires_at: u64,
}

impl NegativeCacheEntry {
    fn from_error(error: &DomainError, ttl: Duration) -> Self {
        Self {
            error_class: error.error_class().to_string(),
            provider: error.provider().map(|p| p.to_string()),
            message: error.to_string(),
            expires_at: current_time_millis() + ttl.as_millis() as u64,
        }
    }

    fn is_expired(&self) -> bool {
        current_time_millis() >= self.expires_at
    }

    /// Reconstructs the error served to suppressed callers
    pub fn to_error(&self) -> DomainError {
        let provider = self.provider.clone().unwrap_or_else(|| "unknown".to_string());
        match self.error_class.as_str() {
            "provider_transient" => DomainError::provider_transient(provider, &self.message),
            "provider_terminal" => DomainError::provider_terminal(provider, &self.message),
            "configuration" => DomainError::configuration(&self.message),
            "cache" => DomainError::cache(&self.message),
            _ => DomainError::internal(&self.message),
        }
    }
}

/// Short-TTL store of recent provider failures
#[derive(Debug)]
pub struct NegativeCache {
    cache: MokaCache<String, NegativeCacheEntry>,
    config: NegativeCacheConfig,
}

impl NegativeCache {
    pub fn new() -> Self {
        Self::with_config(NegativeCacheConfig::default())
    }

    pub fn with_config(config: NegativeCacheConfig) -> Self {
        let cache = MokaCache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(config.ttl)
            .build();

        Self { cache, config }
    }

    pub async fn get(&self, hash: &FingerprintHash) -> Option<NegativeCacheEntry> {
        match self.cache.get(hash.as_str()).await {
            Some(entry) if entry.is_expired() => {
                self.cache.remove(hash.as_str()).await;
                None
            }
            other => other,
        }
    }

    pub async fn put_failure(&self, hash: &FingerprintHash, error: &DomainError) {
        let entry = NegativeCacheEntry::from_error(error, self.config.ttl);
        self.cache.insert(hash.as_str().to_string(), entry).await;
    }

    pub async fn remove(&self, hash: &FingerprintHash) -> bool {
        let existed = self.cache.get(hash.as_str()).await.is_some();
        self.cache.remove(hash.as_str()).await;
        existed
    }

    pub async fn len(&self) -> usize {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count() as usize
    }

    pub async fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }
}

impl Default for NegativeCache {
    fn default() -> Self {
        Self::new()
    }
}
