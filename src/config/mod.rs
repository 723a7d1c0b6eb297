//! Application configuration

mod app_config;

pub use app_config::{
    AppConfig, BackoffConfig, CacheConfig, LogFormat, LoggingConfig, MetricsConfig,
    ProviderConfig, ServerConfig,
};
