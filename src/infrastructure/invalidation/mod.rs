//! Tag-based invalidation bus
//!
//! Publishers announce that a tag's entries are stale; a background handler
//! removes them from the exact cache and prunes the semantic index. Delivery
//! is best-effort within the process; a lagging handler falls back to a full
//! expiry sweep rather than dropping invalidations silently.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::cache::{ExactCache, Tag};
use crate::domain::semantic_cache::SemanticCache;
use crate::infrastructure::observability::MetricsPublisher;

/// A tag whose cached entries must no longer be served
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub tag: Tag,
    pub reason: Option<String>,
    pub emitted_at: DateTime<Utc>,
}

impl InvalidationEvent {
    pub fn new(tag: Tag, reason: Option<String>) -> Self {
        Self {
            tag,
            reason,
            emitted_at: Utc::now(),
        }
    }
}

/// In-process broadcast channel for invalidation events
#[derive(Debug, Clone)]
pub struct InvalidationBus {
    tx: broadcast::Sender<InvalidationEvent>,
}

impl InvalidationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event, returning how many subscribers received it
    pub fn publish(&self, event: InvalidationEvent) -> usize {
        debug!(tag = %event.tag, "Publishing invalidation event");
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.tx.subscribe()
    }
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Spawns the handler applying invalidation events to both stores
pub fn spawn_invalidation_handler(
    bus: &InvalidationBus,
    exact: Arc<dyn ExactCache>,
    semantic: Arc<dyn SemanticCache>,
    metrics: Arc<MetricsPublisher>,
) -> JoinHandle<()> {
    let mut rx = bus.subscribe();

    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    apply_invalidation(&event, exact.as_ref(), semantic.as_ref(), &metrics).await;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Missed events cannot be replayed; sweep everything
                    // expired so stale entries do not outlive the lag
                    warn!(missed, "Invalidation handler lagged, running full sweep");
                    if let Err(e) = exact.evict_expired().await {
                        warn!("Expiry sweep after lag failed: {}", e);
                    }
                    if let Err(e) = semantic.evict_expired().await {
                        warn!("Semantic expiry sweep after lag failed: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Invalidation bus closed, handler exiting");
                    break;
                }
            }
        }
    })
}

async fn apply_invalidation(
    event: &InvalidationEvent,
    exact: &dyn ExactCache,
    semantic: &dyn SemanticCache,
    metrics: &MetricsPublisher,
) {
    match exact.remove_tagged(&event.tag).await {
        Ok(removed_keys) => {
            let pruned = match semantic.remove_keys(&removed_keys).await {
                Ok(pruned) => pruned,
                Err(e) => {
                    warn!(tag = %event.tag, "Semantic index prune failed: {}", e);
                    0
                }
            };

            metrics.record_invalidation(removed_keys.len());
            info!(
                tag = %event.tag,
                removed = removed_keys.len(),
                pruned,
                reason = event.reason.as_deref().unwrap_or("unspecified"),
                "Applied invalidation"
            );
        }
        Err(e) => {
            warn!(tag = %event.tag, "Invalidation failed: {}", e);
        }
    }
}

/// Spawns the periodic expiry sweep over both stores
pub fn spawn_maintenance(
    exact: Arc<dyn ExactCache>,
    semantic: Arc<dyn SemanticCache>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            let exact_evicted = match exact.evict_expired().await {
                Ok(n) => n,
                Err(e) => {
                    warn!("Exact cache sweep failed: {}", e);
                    0
                }
            };
            let semantic_evicted = match semantic.evict_expired().await {
                Ok(n) => n,
                Err(e) => {
                    warn!("Semantic index sweep failed: {}", e);
                    0
                }
            };

            if exact_evicted > 0 || semantic_evicted > 0 {
                debug!(exact_evicted, semantic_evicted, "Maintenance sweep evicted entries");
            }
        }
    })
}
