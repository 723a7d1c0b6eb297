//! Application state shared across handlers

use std::sync::Arc;

use crate::domain::cache::ExactCache;
use crate::domain::semantic_cache::SemanticCache;
use crate::infrastructure::cache::NegativeCache;
use crate::infrastructure::coordinator::Coordinator;
use crate::infrastructure::invalidation::InvalidationBus;
use crate::infrastructure::observability::MetricsPublisher;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub invalidation: InvalidationBus,
    pub metrics: Arc<MetricsPublisher>,
    pub exact: Arc<dyn ExactCache>,
    pub semantic: Arc<dyn SemanticCache>,
    pub negative: Arc<NegativeCache>,
}
