//! Prometheus metrics and cache effectiveness counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, response::IntoResponse, routing::get, Router};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

use crate::config::MetricsConfig;

/// Prometheus metrics handle for serving the metrics endpoint
#[derive(Clone)]
pub struct PrometheusMetrics {
    handle: Arc<PrometheusHandle>,
}

impl PrometheusMetrics {
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Initialize Prometheus metrics
pub fn init_metrics(config: &MetricsConfig) -> Option<PrometheusMetrics> {
    if !config.enabled {
        tracing::info!("Prometheus metrics disabled");
        return None;
    }

    let builder = PrometheusBuilder::new();

    match builder.install_recorder() {
        Ok(handle) => {
            gauge!("llm_cache_gateway_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
            tracing::info!("Prometheus metrics initialized at {}", config.path);

            Some(PrometheusMetrics {
                handle: Arc::new(handle),
            })
        }
        Err(e) => {
            tracing::error!("Failed to initialize Prometheus metrics: {}", e);
            None
        }
    }
}

/// Create the metrics router
pub fn create_metrics_router(metrics: PrometheusMetrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

async fn metrics_handler(State(metrics): State<PrometheusMetrics>) -> impl IntoResponse {
    metrics.render()
}

/// Where a served response came from
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HitKind {
    Exact,
    Semantic,
}

impl HitKind {
    fn label(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Semantic => "semantic",
        }
    }
}

/// Snapshot of cache effectiveness counters, served as JSON
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub exact_hits: u64,
    pub semantic_hits: u64,
    pub misses: u64,
    pub negative_hits: u64,
    pub saved_tokens: u64,
    pub saved_cost_usd: f64,
}

/// Aggregates cache hit/miss counters and estimated savings
///
/// Recording never fails and never blocks a request. The `metrics` crate
/// counters feed Prometheus; the atomics back the JSON snapshot endpoint.
#[derive(Debug, Default)]
pub struct MetricsPublisher {
    exact_hits: AtomicU64,
    semantic_hits: AtomicU64,
    misses: AtomicU64,
    negative_hits: AtomicU64,
    saved_tokens: AtomicU64,
    saved_cost_micros: AtomicU64,
}

impl MetricsPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, kind: HitKind, model: &str, saved_tokens: u64, cost_per_1k_usd: f64) {
        match kind {
            HitKind::Exact => self.exact_hits.fetch_add(1, Ordering::Relaxed),
            HitKind::Semantic => self.semantic_hits.fetch_add(1, Ordering::Relaxed),
        };

        let saved_micros = (saved_tokens as f64 * cost_per_1k_usd / 1000.0 * 1_000_000.0) as u64;
        self.saved_tokens.fetch_add(saved_tokens, Ordering::Relaxed);
        self.saved_cost_micros.fetch_add(saved_micros, Ordering::Relaxed);

        let labels = [
            ("source", kind.label().to_string()),
            ("model", model.to_string()),
        ];
        counter!("cache_hits_total", &labels).increment(1);
        counter!("cache_saved_tokens_total", &labels).increment(saved_tokens);
    }

    pub fn record_miss(&self, model: &str) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!("cache_misses_total", "model" => model.to_string()).increment(1);
    }

    pub fn record_negative_hit(&self, model: &str) {
        self.negative_hits.fetch_add(1, Ordering::Relaxed);
        counter!("cache_negative_hits_total", "model" => model.to_string()).increment(1);
    }

    pub fn record_provider_call(&self, provider: &str, model: &str, duration: Duration, success: bool) {
        let labels = [
            ("provider", provider.to_string()),
            ("model", model.to_string()),
            ("status", if success { "success" } else { "error" }.to_string()),
        ];
        counter!("provider_requests_total", &labels).increment(1);
        histogram!("provider_request_duration_seconds", &labels).record(duration.as_secs_f64());
    }

    pub fn record_invalidation(&self, removed: usize) {
        counter!("cache_invalidated_entries_total").increment(removed as u64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            exact_hits: self.exact_hits.load(Ordering::Relaxed),
            semantic_hits: self.semantic_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            saved_tokens: self.saved_tokens.load(Ordering::Relaxed),
            saved_cost_usd: self.saved_cost_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}
