//! Cache lookup, invalidation and metrics handlers

use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use tracing::info;

use super::state::AppState;
use super::types::{
    ApiError, CacheMetricsResponse, InvalidateAccepted, InvalidateRequest, LookupResponse,
    ThresholdRequest,
};
use crate::domain::cache::Tag;
use crate::domain::fingerprint::RequestFingerprint;
use crate::infrastructure::invalidation::InvalidationEvent;

/// POST /cache/lookup
///
/// Serves the request from cache or coordinates a provider call. Fingerprints
/// with `stream: true` receive the response as server-sent events.
pub async fn lookup(
    State(state): State<AppState>,
    Json(fingerprint): Json<RequestFingerprint>,
) -> Result<Response, ApiError> {
    if fingerprint.stream {
        let lookup = state.coordinator.lookup_stream(fingerprint).await?;

        let events = lookup.stream.map(|item| match item {
            Ok(chunk) => Event::default().json_data(&chunk),
            Err(e) => Event::default()
                .event("error")
                .json_data(&ApiError::from(e).response),
        });

        return Ok(Sse::new(events)
            .keep_alive(KeepAlive::default())
            .into_response());
    }

    let outcome = state.coordinator.lookup(fingerprint).await?;

    Ok(Json(LookupResponse {
        source: outcome.source.label().to_string(),
        similarity: outcome.source.similarity(),
        response: outcome.response,
    })
    .into_response())
}

/// POST /cache/invalidate
///
/// Publishes an invalidation event for the tag; processing is asynchronous
pub async fn invalidate(
    State(state): State<AppState>,
    Json(request): Json<InvalidateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let tag = request.tag.trim();
    if tag.is_empty() {
        return Err(ApiError::bad_request("tag must not be empty"));
    }

    let event = InvalidationEvent::new(Tag::new(tag), request.reason);
    let subscribers = state.invalidation.publish(event);

    info!(tag, subscribers, "Invalidation accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(InvalidateAccepted {
            tag: tag.to_string(),
            subscribers,
        }),
    ))
}

/// GET /cache/metrics
pub async fn metrics(State(state): State<AppState>) -> Json<CacheMetricsResponse> {
    Json(CacheMetricsResponse {
        counters: state.metrics.snapshot(),
        exact_entries: state.exact.len().await,
        semantic_entries: state.semantic.len().await,
        negative_entries: state.negative.len().await,
        similarity_threshold: state.coordinator.similarity_threshold(),
    })
}

/// PUT /cache/threshold
pub async fn set_threshold(
    State(state): State<AppState>,
    Json(request): Json<ThresholdRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !(0.0..=1.0).contains(&request.threshold) {
        return Err(ApiError::bad_request(
            "threshold must be between 0.0 and 1.0",
        ));
    }

    state.coordinator.set_similarity_threshold(request.threshold);
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::domain::embedding::mock::MockEmbeddingClient;
    use crate::domain::fingerprint::{KeyBuilder, RequestPayload};
    use crate::domain::llm::{mock::MockProviderClient, Message};
    use crate::infrastructure::cache::{InMemoryExactCache, NegativeCache};
    use crate::infrastructure::coordinator::{Coordinator, CoordinatorConfig};
    use crate::infrastructure::invalidation::{spawn_invalidation_handler, InvalidationBus};
    use crate::infrastructure::observability::MetricsPublisher;
    use crate::infrastructure::semantic_cache::InMemorySemanticCache;

    fn test_state() -> AppState {
        let exact: Arc<InMemoryExactCache> = Arc::new(InMemoryExactCache::new());
        let semantic: Arc<InMemorySemanticCache> = Arc::new(InMemorySemanticCache::new());
        let negative = Arc::new(NegativeCache::new());
        let metrics = Arc::new(MetricsPublisher::new());

        let coordinator = Coordinator::new(
            KeyBuilder::default(),
            exact.clone(),
            semantic.clone(),
            negative.clone(),
            Arc::new(MockProviderClient::new()),
            Arc::new(MockEmbeddingClient::new()),
            metrics.clone(),
            CoordinatorConfig::default(),
        );

        let invalidation = InvalidationBus::default();
        spawn_invalidation_handler(
            &invalidation,
            exact.clone(),
            semantic.clone(),
            metrics.clone(),
        );

        AppState {
            coordinator,
            invalidation,
            metrics,
            exact,
            semantic,
            negative,
        }
    }

    fn fingerprint(user: &str, tags: Vec<Tag>) -> RequestFingerprint {
        RequestFingerprint {
            model_id: "gpt-4".into(),
            template_id: "story".into(),
            template_version: "v1".into(),
            tenant_id: "tenant-1".into(),
            payload: RequestPayload::Chat {
                messages: vec![Message::user(user)],
            },
            params: Default::default(),
            tags,
            stream: false,
        }
    }

    #[tokio::test]
    async fn test_lookup_miss_then_hit() {
        let state = test_state();

        lookup(State(state.clone()), Json(fingerprint("hello", vec![])))
            .await
            .unwrap();

        let outcome = state
            .coordinator
            .lookup(fingerprint("hello", vec![]))
            .await
            .unwrap();
        assert_eq!(outcome.source.label(), "exact");
    }

    #[tokio::test]
    async fn test_invalidate_rejects_empty_tag() {
        let state = test_state();

        let result = invalidate(
            State(state),
            Json(InvalidateRequest {
                tag: "  ".into(),
                reason: None,
            }),
        )
        .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_invalidate_removes_tagged_entry() {
        let state = test_state();
        let tag = Tag::new("character:42");

        lookup(
            State(state.clone()),
            Json(fingerprint("hello", vec![tag.clone()])),
        )
        .await
        .unwrap();
        assert_eq!(state.exact.len().await, 1);

        invalidate(
            State(state.clone()),
            Json(InvalidateRequest {
                tag: "character:42".into(),
                reason: Some("profile updated".into()),
            }),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.exact.len().await, 0);
    }

    #[tokio::test]
    async fn test_metrics_reports_counters_and_sizes() {
        let state = test_state();

        lookup(State(state.clone()), Json(fingerprint("hello", vec![])))
            .await
            .unwrap();
        lookup(State(state.clone()), Json(fingerprint("hello", vec![])))
            .await
            .unwrap();

        let Json(report) = metrics(State(state)).await;
        assert_eq!(report.counters.misses, 1);
        assert_eq!(report.counters.exact_hits, 1);
        assert_eq!(report.exact_entries, 1);
        assert!((report.similarity_threshold - 0.92).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_set_threshold_validation() {
        let state = test_state();

        assert!(set_threshold(
            State(state.clone()),
            Json(ThresholdRequest { threshold: 1.5 })
        )
        .await
        .is_err());

        set_threshold(State(state.clone()), Json(ThresholdRequest { threshold: 0.8 }))
            .await
            .unwrap();
        assert!((state.coordinator.similarity_threshold() - 0.8).abs() < f32::EPSILON);
    }
}
