use serde::Deserialize;

use crate::domain::fingerprint::DateBucketGranularity;

/// Application configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub cache: CacheConfig,
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub path: String,
}

/// Cache behavior knobs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub similarity_threshold: f32,
    pub exact_ttl_secs: u64,
    pub exact_capacity: u64,
    pub semantic_ttl_secs: u64,
    pub semantic_max_per_bucket: usize,
    pub negative_ttl_secs: u64,
    pub date_bucket: DateBucketGranularity,
    /// Zero disables micro-batching of concurrent misses
    pub batch_window_ms: u64,
    pub touch_on_hit: bool,
    pub maintenance_interval_secs: u64,
    pub cost_per_1k_tokens_usd: f64,
}

/// Upstream provider dispatch knobs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub request_timeout_secs: u64,
    pub max_concurrent_calls: usize,
    pub max_queued: usize,
    pub backoff: BackoffConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub multiplier: f64,
    pub cap_ms: u64,
    pub max_attempts: u32,
    pub jitter: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/metrics".to_string(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.92,
            exact_ttl_secs: 3600,
            exact_capacity: 10_000,
            semantic_ttl_secs: 3600,
            semantic_max_per_bucket: 1024,
            negative_ttl_secs: 30,
            date_bucket: DateBucketGranularity::Daily,
            batch_window_ms: 0,
            touch_on_hit: false,
            maintenance_interval_secs: 60,
            cost_per_1k_tokens_usd: 0.002,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimensions: 1536,
            request_timeout_secs: 30,
            max_concurrent_calls: 32,
            max_queued: 256,
            backoff: BackoffConfig::default(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 100,
            multiplier: 2.0,
            cap_ms: 5000,
            max_attempts: 3,
            jitter: 0.2,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();

        assert_eq!(config.server.port, 8080);
        assert!((config.cache.similarity_threshold - 0.92).abs() < f32::EPSILON);
        assert_eq!(config.cache.batch_window_ms, 0);
        assert_eq!(config.provider.backoff.max_attempts, 3);
        assert_eq!(config.cache.date_bucket, DateBucketGranularity::Daily);
    }
}
