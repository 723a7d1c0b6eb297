use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;

use super::cache;
use super::health;
use super::state::AppState;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/cache/lookup", post(cache::lookup))
        .route("/cache/invalidate", post(cache::invalidate))
        .route("/cache/metrics", get(cache::metrics))
        .route("/cache/threshold", put(cache::set_threshold))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
