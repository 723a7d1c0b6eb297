//! LLM Cache Gateway
//!
//! A semantic request-caching and coordination layer in front of LLM
//! providers:
//! - Exact-match caching keyed by deterministic request fingerprints
//! - Semantic caching via embedding similarity within strict buckets
//! - Negative caching of recent provider failures
//! - Single-flight coordination, retries with backoff, and micro-batching
//! - Tag-based invalidation and cache effectiveness metrics

pub mod api;
pub mod cli;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use config::AppConfig;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use api::AppState;
use domain::fingerprint::KeyBuilder;
use infrastructure::cache::{
    InMemoryExactCache, InMemoryExactCacheConfig, NegativeCache, NegativeCacheConfig,
};
use infrastructure::coordinator::{BackoffPolicy, Coordinator, CoordinatorConfig};
use infrastructure::embedding::OpenAiEmbeddingClient;
use infrastructure::invalidation::{
    spawn_invalidation_handler, spawn_maintenance, InvalidationBus,
};
use infrastructure::llm::{HttpClient, OpenAiProviderClient};
use infrastructure::observability::MetricsPublisher;
use infrastructure::semantic_cache::{InMemorySemanticCache, InMemorySemanticCacheConfig};

/// Create the application state with all components wired up
pub async fn create_app_state(config: &AppConfig) -> anyhow::Result<AppState> {
    let api_key = std::env::var("OPENAI_API_KEY")
        .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable is required"))?;

    let timeout = Duration::from_secs(config.provider.request_timeout_secs);
    let provider = Arc::new(OpenAiProviderClient::with_base_url(
        HttpClient::with_timeout(timeout)?,
        api_key.clone(),
        config.provider.base_url.clone(),
    ));
    let embedder = Arc::new(
        OpenAiEmbeddingClient::new(HttpClient::with_timeout(timeout)?, api_key)
            .with_base_url(config.provider.base_url.clone())
            .with_model(
                config.provider.embedding_model.clone(),
                config.provider.embedding_dimensions,
            ),
    );

    let exact = Arc::new(InMemoryExactCache::with_config(
        InMemoryExactCacheConfig::default()
            .with_max_capacity(config.cache.exact_capacity)
            .with_max_ttl(Duration::from_secs(config.cache.exact_ttl_secs)),
    ));
    let semantic = Arc::new(InMemorySemanticCache::with_config(
        InMemorySemanticCacheConfig::default()
            .with_max_entries_per_bucket(config.cache.semantic_max_per_bucket),
    ));
    let negative = Arc::new(NegativeCache::with_config(
        NegativeCacheConfig::default()
            .with_ttl(Duration::from_secs(config.cache.negative_ttl_secs)),
    ));
    let metrics = Arc::new(MetricsPublisher::new());

    let coordinator_config = CoordinatorConfig {
        exact_ttl: Duration::from_secs(config.cache.exact_ttl_secs),
        semantic_ttl: Duration::from_secs(config.cache.semantic_ttl_secs),
        similarity_threshold: config.cache.similarity_threshold,
        touch_on_hit: config.cache.touch_on_hit,
        cost_per_1k_tokens_usd: config.cache.cost_per_1k_tokens_usd,
        batch_window: Duration::from_millis(config.cache.batch_window_ms),
        max_concurrent_calls: config.provider.max_concurrent_calls,
        max_queued: config.provider.max_queued,
        backoff: BackoffPolicy {
            base: Duration::from_millis(config.provider.backoff.base_ms),
            multiplier: config.provider.backoff.multiplier,
            cap: Duration::from_millis(config.provider.backoff.cap_ms),
            max_attempts: config.provider.backoff.max_attempts,
            jitter: config.provider.backoff.jitter,
        },
    };

    let coordinator = Coordinator::new(
        KeyBuilder::new(config.cache.date_bucket),
        exact.clone(),
        semantic.clone(),
        negative.clone(),
        provider,
        embedder,
        metrics.clone(),
        coordinator_config,
    );

    let invalidation = InvalidationBus::default();
    spawn_invalidation_handler(&invalidation, exact.clone(), semantic.clone(), metrics.clone());
    spawn_maintenance(
        exact.clone(),
        semantic.clone(),
        Duration::from_secs(config.cache.maintenance_interval_secs),
    );

    info!(
        similarity_threshold = config.cache.similarity_threshold,
        date_bucket = ?config.cache.date_bucket,
        "Cache gateway initialized"
    );

    Ok(AppState {
        coordinator,
        invalidation,
        metrics,
        exact,
        semantic,
        negative,
    })
}
