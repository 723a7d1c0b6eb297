//! Request coordinator
//!
//! Front door for all provider traffic. Consults the exact cache, the
//! semantic index and the negative cache in that order, deduplicates
//! concurrent identical misses into a single provider flight, and writes
//! completed responses back through both caches.

mod backoff;
mod batch;

pub use backoff::BackoffPolicy;
pub use batch::Batcher;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use futures::{stream, StreamExt};
use tokio::sync::{broadcast, Mutex, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use crate::domain::cache::{CacheEntry, ExactCache};
use crate::domain::embedding::EmbeddingClient;
use crate::domain::fingerprint::{
    BucketId, CacheKey, FingerprintHash, KeyBuilder, RequestFingerprint,
};
use crate::domain::llm::{
    ChatResponse, ChunkStream, FinishReason, Message, ProviderClient, ProviderResponse,
    StreamChunk, Usage,
};
use crate::domain::semantic_cache::{SemanticCache, SemanticIndexEntry};
use crate::domain::DomainError;
use crate::infrastructure::cache::NegativeCache;
use crate::infrastructure::observability::{HitKind, MetricsPublisher};

/// Where a served response came from
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResponseSource {
    Exact,
    Semantic { similarity: f32 },
    Provider,
}

impl ResponseSource {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Semantic { .. } => "semantic",
            Self::Provider => "provider",
        }
    }

    pub fn similarity(&self) -> Option<f32> {
        match self {
            Self::Semantic { similarity } => Some(*similarity),
            _ => None,
        }
    }
}

/// Result of a coordinated lookup
#[derive(Debug, Clone)]
pub struct LookupOutcome {
    pub response: ProviderResponse,
    pub source: ResponseSource,
}

/// Result of a coordinated streaming lookup
pub struct StreamLookup {
    pub stream: ChunkStream,
    pub source: ResponseSource,
}

impl std::fmt::Debug for StreamLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamLookup")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub exact_ttl: Duration,
    pub semantic_ttl: Duration,
    pub similarity_threshold: f32,
    pub touch_on_hit: bool,
    pub cost_per_1k_tokens_usd: f64,
    /// Zero disables micro-batching
    pub batch_window: Duration,
    pub max_concurrent_calls: usize,
    pub max_queued: usize,
    pub backoff: BackoffPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            exact_ttl: Duration::from_secs(3600),
            semantic_ttl: Duration::from_secs(3600),
            similarity_threshold: 0.92,
            touch_on_hit: false,
            cost_per_1k_tokens_usd: 0.002,
            batch_window: Duration::ZERO,
            max_concurrent_calls: 32,
            max_queued: 256,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Replays an in-progress stream to late joiners
///
/// The buffer and the live channel are updated under one lock, so a joiner
/// that snapshots the buffer and subscribes atomically sees every chunk
/// exactly once.
#[derive(Debug)]
struct ChunkRelay {
    live_tx: broadcast::Sender<Result<StreamChunk, DomainError>>,
    buffer: StdMutex<RelayBuffer>,
}

#[derive(Debug, Default)]
struct RelayBuffer {
    chunks: Vec<StreamChunk>,
    error: Option<DomainError>,
}

impl ChunkRelay {
    fn new() -> Self {
        let (live_tx, _) = broadcast::channel(256);
        Self {
            live_tx,
            buffer: StdMutex::new(RelayBuffer::default()),
        }
    }

    fn push(&self, chunk: StreamChunk) {
        let mut buffer = self
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        buffer.chunks.push(chunk.clone());
        let _ = self.live_tx.send(Ok(chunk));
    }

    /// Failures are buffered like chunks, so a joiner arriving after the
    /// flight failed still replays the error instead of a clean stream end
    fn push_error(&self, error: &DomainError) {
        let mut buffer = self
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        buffer.error = Some(error.clone());
        let _ = self.live_tx.send(Err(error.clone()));
    }

    fn subscribe(&self) -> ChunkStream {
        let (snapshot, error, rx) = {
            let buffer = self
                .buffer
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            (
                buffer.chunks.clone(),
                buffer.error.clone(),
                self.live_tx.subscribe(),
            )
        };

        let replay = stream::iter(snapshot.into_iter().map(Ok));
        if let Some(error) = error {
            return Box::pin(replay.chain(stream::iter([Err(error)])));
        }

        let live = BroadcastStream::new(rx).map(|item| match item {
            Ok(chunk) => chunk,
            Err(BroadcastStreamRecvError::Lagged(_)) => {
                Err(DomainError::internal("stream replay fell behind"))
            }
        });

        Box::pin(replay.chain(live))
    }
}

#[derive(Debug)]
struct InFlight {
    done_tx: broadcast::Sender<Result<ProviderResponse, DomainError>>,
    relay: Option<Arc<ChunkRelay>>,
}

/// Cache-aware request coordinator; cheap to clone, all state is shared
#[derive(Debug, Clone)]
pub struct Coordinator {
    key_builder: KeyBuilder,
    exact: Arc<dyn ExactCache>,
    semantic: Arc<dyn SemanticCache>,
    negative: Arc<NegativeCache>,
    provider: Arc<dyn ProviderClient>,
    embedder: Arc<dyn EmbeddingClient>,
    metrics: Arc<MetricsPublisher>,
    in_flight: Arc<Mutex<HashMap<CacheKey, InFlight>>>,
    threshold: Arc<RwLock<f32>>,
    semaphore: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    batcher: Option<Batcher>,
    config: Arc<CoordinatorConfig>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key_builder: KeyBuilder,
        exact: Arc<dyn ExactCache>,
        semantic: Arc<dyn SemanticCache>,
        negative: Arc<NegativeCache>,
        provider: Arc<dyn ProviderClient>,
        embedder: Arc<dyn EmbeddingClient>,
        metrics: Arc<MetricsPublisher>,
        config: CoordinatorConfig,
    ) -> Self {
        let batcher = if config.batch_window > Duration::ZERO {
            Some(Batcher::spawn(provider.clone(), config.batch_window))
        } else {
            None
        };

        Self {
            key_builder,
            exact,
            semantic,
            negative,
            provider,
            embedder,
            metrics,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            threshold: Arc::new(RwLock::new(config.similarity_threshold)),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_calls)),
            queued: Arc::new(AtomicUsize::new(0)),
            batcher,
            config: Arc::new(config),
        }
    }

    pub fn similarity_threshold(&self) -> f32 {
        *self
            .threshold
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adjusts the semantic match threshold without a restart
    pub fn set_similarity_threshold(&self, threshold: f32) {
        let clamped = threshold.clamp(0.0, 1.0);
        *self
            .threshold
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = clamped;
        debug!(threshold = clamped, "Similarity threshold updated");
    }

    /// Serves a request from cache or dispatches it to the provider
    pub async fn lookup(
        &self,
        fingerprint: RequestFingerprint,
    ) -> Result<LookupOutcome, DomainError> {
        let key = self.key_builder.build_key(&fingerprint)?;
        let bucket = self.key_builder.build_bucket(&fingerprint)?;
        let hash = self.key_builder.fingerprint_hash(&fingerprint)?;

        if let Some(entry) = self.exact.get(&key).await? {
            return Ok(self.serve_hit(entry, &key, ResponseSource::Exact));
        }

        let embedding = self.embed_query(&fingerprint).await;
        if let Some(outcome) = self.semantic_lookup(&bucket, embedding.as_deref()).await? {
            return Ok(outcome);
        }

        if let Some(failure) = self.negative.get(&hash).await {
            self.metrics.record_negative_hit(&fingerprint.model_id);
            debug!(key = %key, "Suppressed by negative cache");
            return Err(failure.to_error());
        }

        self.metrics.record_miss(&fingerprint.model_id);
        let mut done_rx = self.join_or_start_flight(fingerprint, key, bucket, hash, embedding).await;

        let response = done_rx
            .recv()
            .await
            .map_err(|_| DomainError::internal("provider flight ended without a result"))??;

        Ok(LookupOutcome {
            response,
            source: ResponseSource::Provider,
        })
    }

    /// Streaming variant of [`lookup`](Self::lookup). Cache hits are replayed
    /// as a single chunk; joiners of an in-progress stream receive the full
    /// chunk sequence from the beginning.
    pub async fn lookup_stream(
        &self,
        fingerprint: RequestFingerprint,
    ) -> Result<StreamLookup, DomainError> {
        if !fingerprint.is_chat() {
            return Err(DomainError::configuration(
                "streaming is only supported for chat payloads",
            ));
        }

        let key = self.key_builder.build_key(&fingerprint)?;
        let bucket = self.key_builder.build_bucket(&fingerprint)?;
        let hash = self.key_builder.fingerprint_hash(&fingerprint)?;

        if let Some(entry) = self.exact.get(&key).await? {
            let outcome = self.serve_hit(entry, &key, ResponseSource::Exact);
            return Ok(StreamLookup {
                stream: synthesized_stream(&outcome.response)?,
                source: outcome.source,
            });
        }

        let embedding = self.embed_query(&fingerprint).await;
        if let Some(outcome) = self.semantic_lookup(&bucket, embedding.as_deref()).await? {
            return Ok(StreamLookup {
                stream: synthesized_stream(&outcome.response)?,
                source: outcome.source,
            });
        }

        if let Some(failure) = self.negative.get(&hash).await {
            self.metrics.record_negative_hit(&fingerprint.model_id);
            return Err(failure.to_error());
        }

        self.metrics.record_miss(&fingerprint.model_id);

        let mut flights = self.in_flight.lock().await;
        if let Some(flight) = flights.get(&key) {
            if let Some(relay) = &flight.relay {
                let stream = relay.subscribe();
                return Ok(StreamLookup {
                    stream,
                    source: ResponseSource::Provider,
                });
            }

            // A non-streaming flight is already running; wait for its result
            // and replay it as one chunk
            let mut done_rx = flight.done_tx.subscribe();
            drop(flights);

            let response = done_rx
                .recv()
                .await
                .map_err(|_| DomainError::internal("provider flight ended without a result"))??;
            return Ok(StreamLookup {
                stream: synthesized_stream(&response)?,
                source: ResponseSource::Provider,
            });
        }

        let relay = Arc::new(ChunkRelay::new());
        let (done_tx, _) = broadcast::channel(4);
        flights.insert(
            key.clone(),
            InFlight {
                done_tx: done_tx.clone(),
                relay: Some(relay.clone()),
            },
        );
        let stream = relay.subscribe();
        drop(flights);

        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator
                .run_streaming_flight(fingerprint, key, bucket, hash, embedding, relay)
                .await;
        });

        Ok(StreamLookup {
            stream,
            source: ResponseSource::Provider,
        })
    }

    fn serve_hit(&self, entry: CacheEntry, key: &CacheKey, source: ResponseSource) -> LookupOutcome {
        let saved_tokens = entry
            .value()
            .usage()
            .map(|usage| usage.total_tokens as u64)
            .unwrap_or(0);

        let kind = match source {
            ResponseSource::Semantic { .. } => HitKind::Semantic,
            _ => HitKind::Exact,
        };
        let model = match entry.value() {
            ProviderResponse::Chat(chat) => chat.model.clone(),
            ProviderResponse::Embedding(embedding) => embedding.model.clone(),
        };
        self.metrics
            .record_hit(kind, &model, saved_tokens, self.config.cost_per_1k_tokens_usd);

        if self.config.touch_on_hit && kind == HitKind::Exact {
            let exact = self.exact.clone();
            let key = key.clone();
            let ttl = self.config.exact_ttl;
            tokio::spawn(async move {
                if let Err(e) = exact.touch(&key, ttl).await {
                    warn!(key = %key, "Touch on hit failed: {}", e);
                }
            });
        }

        LookupOutcome {
            response: entry.value().clone(),
            source,
        }
    }

    /// Embeds the query text, returning `None` for non-chat payloads, empty
    /// queries, or embedding failures. An unavailable embedder degrades the
    /// lookup to exact-only rather than failing it.
    async fn embed_query(&self, fingerprint: &RequestFingerprint) -> Option<Vec<f32>> {
        if !fingerprint.is_chat() {
            return None;
        }

        let query = fingerprint.query_text();
        if query.is_empty() {
            return None;
        }

        match self.embedder.embed(&query).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!("Embedding failed, skipping semantic lookup: {}", e);
                None
            }
        }
    }

    async fn semantic_lookup(
        &self,
        bucket: &BucketId,
        embedding: Option<&[f32]>,
    ) -> Result<Option<LookupOutcome>, DomainError> {
        let Some(vector) = embedding else {
            return Ok(None);
        };

        let threshold = self.similarity_threshold();
        let Some(found) = self.semantic.query(bucket, vector, threshold).await? else {
            return Ok(None);
        };

        match self.exact.get(&found.entry_key).await? {
            Some(entry) => Ok(Some(self.serve_hit(
                entry,
                &found.entry_key,
                ResponseSource::Semantic {
                    similarity: found.similarity,
                },
            ))),
            None => {
                // The index outlived the entry it points at; prune and miss
                warn!(key = %found.entry_key, "Pruning dangling semantic index record");
                self.semantic.remove_keys(&[found.entry_key]).await?;
                Ok(None)
            }
        }
    }

    async fn join_or_start_flight(
        &self,
        fingerprint: RequestFingerprint,
        key: CacheKey,
        bucket: BucketId,
        hash: FingerprintHash,
        embedding: Option<Vec<f32>>,
    ) -> broadcast::Receiver<Result<ProviderResponse, DomainError>> {
        let mut flights = self.in_flight.lock().await;

        if let Some(flight) = flights.get(&key) {
            debug!(key = %key, "Joining in-flight request");
            return flight.done_tx.subscribe();
        }

        let (done_tx, done_rx) = broadcast::channel(4);
        flights.insert(
            key.clone(),
            InFlight {
                done_tx: done_tx.clone(),
                relay: None,
            },
        );
        drop(flights);

        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator
                .run_flight(fingerprint, key, bucket, hash, embedding)
                .await;
        });

        done_rx
    }

    async fn run_flight(
        self,
        fingerprint: RequestFingerprint,
        key: CacheKey,
        bucket: BucketId,
        hash: FingerprintHash,
        embedding: Option<Vec<f32>>,
    ) {
        let result = self.call_provider(&fingerprint).await;

        match &result {
            Ok(response) => {
                self.write_through(&key, &bucket, &fingerprint, response.clone(), embedding)
                    .await;
            }
            Err(error) => self.record_failure(&hash, error).await,
        }

        self.complete_flight(&key, result).await;
    }

    async fn run_streaming_flight(
        self,
        fingerprint: RequestFingerprint,
        key: CacheKey,
        bucket: BucketId,
        hash: FingerprintHash,
        embedding: Option<Vec<f32>>,
        relay: Arc<ChunkRelay>,
    ) {
        let result = self.stream_from_provider(&fingerprint, &relay).await;

        match &result {
            Ok(response) => {
                self.write_through(&key, &bucket, &fingerprint, response.clone(), embedding)
                    .await;
            }
            Err(error) => self.record_failure(&hash, error).await,
        }

        self.complete_flight(&key, result).await;
    }

    /// Consumes the upstream chunk stream, relaying each chunk to subscribers
    /// and accumulating the full response for write-through
    async fn stream_from_provider(
        &self,
        fingerprint: &RequestFingerprint,
        relay: &ChunkRelay,
    ) -> Result<ProviderResponse, DomainError> {
        let mut attempt = 0;
        let (_permit, mut upstream) = loop {
            // The slot is released across backoff waits and held again for
            // the whole stream consumption once established
            let permit = match self.acquire_slot().await {
                Ok(permit) => permit,
                Err(e) => {
                    relay.push_error(&e);
                    return Err(e);
                }
            };

            let started = Instant::now();
            match self.provider.invoke_stream(fingerprint).await {
                Ok(stream) => {
                    self.metrics.record_provider_call(
                        self.provider.provider_name(),
                        &fingerprint.model_id,
                        started.elapsed(),
                        true,
                    );
                    break (permit, stream);
                }
                Err(e) => {
                    self.metrics.record_provider_call(
                        self.provider.provider_name(),
                        &fingerprint.model_id,
                        started.elapsed(),
                        false,
                    );
                    drop(permit);

                    if e.is_retryable() && attempt + 1 < self.config.backoff.max_attempts {
                        let delay = self.config.backoff.delay_for(attempt);
                        debug!(attempt, ?delay, "Retrying stream establishment: {}", e);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    relay.push_error(&e);
                    return Err(e);
                }
            }
        };

        let mut id = String::new();
        let mut content = String::new();
        let mut finish_reason: Option<FinishReason> = None;
        let mut usage: Option<Usage> = None;

        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => {
                    if id.is_empty() {
                        id = chunk.id.clone();
                    }
                    if let Some(delta) = &chunk.delta {
                        content.push_str(delta);
                    }
                    if chunk.finish_reason.is_some() {
                        finish_reason = chunk.finish_reason.clone();
                    }
                    if chunk.usage.is_some() {
                        usage = chunk.usage.clone();
                    }

                    relay.push(chunk);
                }
                Err(e) => {
                    relay.push_error(&e);
                    return Err(e);
                }
            }
        }

        let mut response = ChatResponse::new(
            id,
            fingerprint.model_id.clone(),
            Message::assistant(content),
        );
        if let Some(reason) = finish_reason {
            response = response.with_finish_reason(reason);
        }
        if let Some(usage) = usage {
            response = response.with_usage(usage);
        }

        Ok(ProviderResponse::Chat(response))
    }

    async fn call_provider(
        &self,
        fingerprint: &RequestFingerprint,
    ) -> Result<ProviderResponse, DomainError> {
        let mut attempt = 0;
        loop {
            // A dispatch slot is held for the call only, never across a
            // backoff wait
            let permit = self.acquire_slot().await?;

            let started = Instant::now();
            let result = match &self.batcher {
                Some(batcher) => batcher.submit(fingerprint.clone()).await,
                None => self.provider.invoke(fingerprint).await,
            };
            self.metrics.record_provider_call(
                self.provider.provider_name(),
                &fingerprint.model_id,
                started.elapsed(),
                result.is_ok(),
            );
            drop(permit);

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt + 1 < self.config.backoff.max_attempts => {
                    let delay = self.config.backoff.delay_for(attempt);
                    debug!(attempt, ?delay, "Retrying provider call: {}", e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Admission control for provider dispatch. A full queue fails fast with
    /// a retryable error instead of letting waiters pile up unbounded.
    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, DomainError> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::NoPermits) => {
                let queued = self.queued.fetch_add(1, Ordering::SeqCst);
                if queued >= self.config.max_queued {
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    return Err(DomainError::provider_transient(
                        self.provider.provider_name(),
                        "provider dispatch queue is saturated",
                    ));
                }

                let permit = self
                    .semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| DomainError::internal("dispatch semaphore closed"));
                self.queued.fetch_sub(1, Ordering::SeqCst);
                permit
            }
            Err(TryAcquireError::Closed) => {
                Err(DomainError::internal("dispatch semaphore closed"))
            }
        }
    }

    async fn write_through(
        &self,
        key: &CacheKey,
        bucket: &BucketId,
        fingerprint: &RequestFingerprint,
        response: ProviderResponse,
        embedding: Option<Vec<f32>>,
    ) {
        let entry = CacheEntry::new(
            key.clone(),
            response,
            self.config.exact_ttl,
            fingerprint.tags.clone(),
        );

        if let Err(e) = self.exact.put(entry).await {
            warn!(key = %key, "Cache write failed: {}", e);
            return;
        }

        if let Some(vector) = embedding {
            let index_entry = SemanticIndexEntry::new(
                bucket.clone(),
                vector,
                key.clone(),
                self.config.semantic_ttl,
            );
            if let Err(e) = self.semantic.insert(index_entry).await {
                warn!(key = %key, "Semantic index write failed: {}", e);
            }
        }
    }

    /// Provider failures are negative-cached; local errors are not, they say
    /// nothing about the upstream request
    async fn record_failure(&self, hash: &FingerprintHash, error: &DomainError) {
        if matches!(
            error,
            DomainError::ProviderTransient { .. } | DomainError::ProviderTerminal { .. }
        ) {
            self.negative.put_failure(hash, error).await;
        }
    }

    /// Removing the flight and broadcasting its result happen under the map
    /// lock, so a joiner can never subscribe after the result was sent
    async fn complete_flight(&self, key: &CacheKey, result: Result<ProviderResponse, DomainError>) {
        let mut flights = self.in_flight.lock().await;
        if let Some(flight) = flights.remove(key) {
            let _ = flight.done_tx.send(result);
        }
    }
}

/// Replays a completed response as a single final chunk
fn synthesized_stream(response: &ProviderResponse) -> Result<ChunkStream, DomainError> {
    let ProviderResponse::Chat(chat) = response else {
        return Err(DomainError::configuration(
            "streaming is only supported for chat payloads",
        ));
    };

    let mut chunk = StreamChunk::new(chat.id.clone(), chat.model.clone())
        .with_delta(chat.content())
        .with_finish_reason(chat.finish_reason.clone().unwrap_or(FinishReason::Stop));
    if let Some(usage) = &chat.usage {
        chunk = chunk.with_usage(usage.clone());
    }

    Ok(Box::pin(stream::iter(vec![Ok(chunk)])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::embedding::mock::MockEmbeddingClient;
    use crate::domain::fingerprint::RequestPayload;
    use crate::domain::llm::mock::MockProviderClient;
    use crate::infrastructure::cache::{InMemoryExactCache, NegativeCache, NegativeCacheConfig};
    use crate::infrastructure::semantic_cache::InMemorySemanticCache;

    fn fingerprint(user: &str) -> RequestFingerprint {
        RequestFingerprint {
            model_id: "gpt-4".into(),
            template_id: "story".into(),
            template_version: "v1".into(),
            tenant_id: "tenant-1".into(),
            payload: RequestPayload::Chat {
                messages: vec![Message::user(user)],
            },
            params: Default::default(),
            tags: vec![],
            stream: false,
        }
    }

    struct Harness {
        coordinator: Coordinator,
        provider: Arc<MockProviderClient>,
    }

    fn harness(provider: MockProviderClient, config: CoordinatorConfig) -> Harness {
        harness_with_embedder(provider, MockEmbeddingClient::new(), config)
    }

    fn harness_with_embedder(
        provider: MockProviderClient,
        embedder: MockEmbeddingClient,
        config: CoordinatorConfig,
    ) -> Harness {
        let provider = Arc::new(provider);
        let coordinator = Coordinator::new(
            KeyBuilder::default(),
            Arc::new(InMemoryExactCache::new()),
            Arc::new(InMemorySemanticCache::new()),
            Arc::new(NegativeCache::new()),
            provider.clone(),
            Arc::new(embedder),
            Arc::new(MetricsPublisher::new()),
            config,
        );

        Harness {
            coordinator,
            provider,
        }
    }

    fn content_of(outcome: &LookupOutcome) -> String {
        match &outcome.response {
            ProviderResponse::Chat(chat) => chat.content().to_string(),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    async fn collect_content(mut stream: ChunkStream) -> String {
        let mut content = String::new();
        while let Some(item) = stream.next().await {
            if let Some(delta) = item.unwrap().delta {
                content.push_str(&delta);
            }
        }
        content
    }

    #[tokio::test]
    async fn test_miss_then_exact_hit() {
        let h = harness(MockProviderClient::new(), CoordinatorConfig::default());

        let first = h.coordinator.lookup(fingerprint("hello")).await.unwrap();
        assert_eq!(first.source, ResponseSource::Provider);

        let second = h.coordinator.lookup(fingerprint("hello")).await.unwrap();
        assert_eq!(second.source, ResponseSource::Exact);
        assert_eq!(content_of(&first), content_of(&second));
        assert_eq!(h.provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_identical_requests_share_one_flight() {
        let h = harness(
            MockProviderClient::new().with_delay(Duration::from_millis(50)),
            CoordinatorConfig::default(),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = h.coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.lookup(fingerprint("same prompt")).await
            }));
        }

        let mut contents = Vec::new();
        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            contents.push(content_of(&outcome));
        }

        assert_eq!(h.provider.calls(), 1);
        assert!(contents.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_cancel_flight() {
        let h = harness(
            MockProviderClient::new().with_delay(Duration::from_millis(50)),
            CoordinatorConfig::default(),
        );

        let c1 = h.coordinator.clone();
        let doomed = tokio::spawn(async move { c1.lookup(fingerprint("prompt")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let c2 = h.coordinator.clone();
        let survivor = tokio::spawn(async move { c2.lookup(fingerprint("prompt")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        doomed.abort();

        let outcome = survivor.await.unwrap().unwrap();
        assert_eq!(content_of(&outcome), "mock response");
        assert_eq!(h.provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_semantic_hit_within_bucket() {
        let embedder = MockEmbeddingClient::new()
            .with_vector("tell me a story", vec![1.0, 0.0, 0.0])
            .with_vector("tell me one story", vec![0.96, 0.28, 0.0]);
        let h = harness_with_embedder(
            MockProviderClient::new(),
            embedder,
            CoordinatorConfig::default(),
        );

        h.coordinator
            .lookup(fingerprint("tell me a story"))
            .await
            .unwrap();

        let second = h
            .coordinator
            .lookup(fingerprint("tell me one story"))
            .await
            .unwrap();

        assert_eq!(h.provider.calls(), 1);
        match second.source {
            ResponseSource::Semantic { similarity } => assert!(similarity >= 0.92),
            other => panic!("expected semantic hit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_semantic_miss_below_threshold() {
        let embedder = MockEmbeddingClient::new()
            .with_vector("tell me a story", vec![1.0, 0.0, 0.0])
            .with_vector("what is the weather", vec![0.0, 1.0, 0.0]);
        let h = harness_with_embedder(
            MockProviderClient::new(),
            embedder,
            CoordinatorConfig::default(),
        );

        h.coordinator
            .lookup(fingerprint("tell me a story"))
            .await
            .unwrap();
        let second = h
            .coordinator
            .lookup(fingerprint("what is the weather"))
            .await
            .unwrap();

        assert_eq!(second.source, ResponseSource::Provider);
        assert_eq!(h.provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_threshold_is_live_tunable() {
        let embedder = MockEmbeddingClient::new()
            .with_vector("prompt a", vec![1.0, 0.0, 0.0])
            .with_vector("prompt b", vec![0.8, 0.6, 0.0]);
        let h = harness_with_embedder(
            MockProviderClient::new(),
            embedder,
            CoordinatorConfig::default(),
        );

        h.coordinator.lookup(fingerprint("prompt a")).await.unwrap();

        // Similarity 0.8 misses at 0.92 but hits once the threshold drops
        h.coordinator.set_similarity_threshold(0.75);
        let second = h.coordinator.lookup(fingerprint("prompt b")).await.unwrap();
        assert!(matches!(second.source, ResponseSource::Semantic { .. }));
        assert_eq!(h.provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_embedding_failure_degrades_to_exact_only() {
        let embedder = MockEmbeddingClient::new();
        embedder.set_failing(true);
        let h = harness_with_embedder(
            MockProviderClient::new(),
            embedder,
            CoordinatorConfig::default(),
        );

        let outcome = h.coordinator.lookup(fingerprint("hello")).await.unwrap();
        assert_eq!(outcome.source, ResponseSource::Provider);

        let second = h.coordinator.lookup(fingerprint("hello")).await.unwrap();
        assert_eq!(second.source, ResponseSource::Exact);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let provider = MockProviderClient::new();
        provider.push_result(Err(DomainError::provider_transient("mock", "timeout")));
        provider.push_result(Err(DomainError::provider_transient("mock", "timeout")));

        let config = CoordinatorConfig {
            backoff: BackoffPolicy::default()
                .with_base(Duration::from_millis(1))
                .with_jitter(0.0),
            ..CoordinatorConfig::default()
        };
        let h = harness(provider, config);

        let outcome = h.coordinator.lookup(fingerprint("hello")).await.unwrap();
        assert_eq!(content_of(&outcome), "mock response");
        assert_eq!(h.provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_terminal_failure_is_not_retried_and_negative_cached() {
        let provider = MockProviderClient::new();
        provider.push_result(Err(DomainError::provider_terminal("mock", "bad request")));
        let h = harness(provider, CoordinatorConfig::default());

        let first = h.coordinator.lookup(fingerprint("hello")).await;
        assert!(first.is_err());
        assert_eq!(h.provider.calls(), 1);

        // Second attempt is suppressed by the negative cache
        let second = h.coordinator.lookup(fingerprint("hello")).await;
        assert!(second.is_err());
        assert_eq!(h.provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_negative_entry_expires_and_allows_retry() {
        let provider = Arc::new(MockProviderClient::new());
        provider.push_result(Err(DomainError::provider_terminal("mock", "bad request")));

        let coordinator = Coordinator::new(
            KeyBuilder::default(),
            Arc::new(InMemoryExactCache::new()),
            Arc::new(InMemorySemanticCache::new()),
            Arc::new(NegativeCache::with_config(
                NegativeCacheConfig::default().with_ttl(Duration::from_millis(20)),
            )),
            provider.clone(),
            Arc::new(MockEmbeddingClient::new()),
            Arc::new(MetricsPublisher::new()),
            CoordinatorConfig::default(),
        );

        assert!(coordinator.lookup(fingerprint("hello")).await.is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let outcome = coordinator.lookup(fingerprint("hello")).await.unwrap();
        assert_eq!(outcome.source, ResponseSource::Provider);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_negative_caches_transient_failure() {
        let provider = MockProviderClient::new();
        for _ in 0..3 {
            provider.push_result(Err(DomainError::provider_transient("mock", "timeout")));
        }

        let config = CoordinatorConfig {
            backoff: BackoffPolicy::default()
                .with_base(Duration::from_millis(1))
                .with_jitter(0.0),
            ..CoordinatorConfig::default()
        };
        let h = harness(provider, config);

        assert!(h.coordinator.lookup(fingerprint("hello")).await.is_err());
        assert_eq!(h.provider.calls(), 3);

        assert!(h.coordinator.lookup(fingerprint("hello")).await.is_err());
        assert_eq!(h.provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_saturated_queue_fails_fast() {
        let config = CoordinatorConfig {
            max_concurrent_calls: 1,
            max_queued: 0,
            ..CoordinatorConfig::default()
        };
        let h = harness(
            MockProviderClient::new().with_delay(Duration::from_millis(100)),
            config,
        );

        let c1 = h.coordinator.clone();
        let slow = tokio::spawn(async move { c1.lookup(fingerprint("first")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = h
            .coordinator
            .lookup(fingerprint("second"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("saturated"));

        assert!(slow.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_streaming_miss_writes_through() {
        let h = harness(
            MockProviderClient::new().with_content("streamed reply"),
            CoordinatorConfig::default(),
        );

        let mut fp = fingerprint("hello");
        fp.stream = true;

        let lookup = h.coordinator.lookup_stream(fp).await.unwrap();
        assert_eq!(lookup.source, ResponseSource::Provider);
        assert_eq!(collect_content(lookup.stream).await, "streamed reply");

        // The accumulated response is now served from the exact cache
        let cached = h.coordinator.lookup(fingerprint("hello")).await.unwrap();
        assert_eq!(cached.source, ResponseSource::Exact);
        assert_eq!(content_of(&cached), "streamed reply");
        assert_eq!(h.provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_streaming_hit_replays_as_single_chunk() {
        let h = harness(
            MockProviderClient::new().with_content("cached reply"),
            CoordinatorConfig::default(),
        );

        h.coordinator.lookup(fingerprint("hello")).await.unwrap();

        let mut fp = fingerprint("hello");
        fp.stream = true;
        let lookup = h.coordinator.lookup_stream(fp).await.unwrap();
        assert_eq!(lookup.source, ResponseSource::Exact);
        assert_eq!(collect_content(lookup.stream).await, "cached reply");
        assert_eq!(h.provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_stream_lookups_replay_identically() {
        let h = harness(
            MockProviderClient::new()
                .with_content("shared stream")
                .with_delay(Duration::from_millis(30)),
            CoordinatorConfig::default(),
        );

        let mut fp = fingerprint("hello");
        fp.stream = true;

        let c1 = h.coordinator.clone();
        let fp1 = fp.clone();
        let first = tokio::spawn(async move {
            let lookup = c1.lookup_stream(fp1).await.unwrap();
            collect_content(lookup.stream).await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let second_lookup = h.coordinator.lookup_stream(fp).await.unwrap();
        let second = collect_content(second_lookup.stream).await;

        assert_eq!(first.await.unwrap(), "shared stream");
        assert_eq!(second, "shared stream");
        assert_eq!(h.provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_late_stream_joiner_replays_buffered_failure() {
        let relay = ChunkRelay::new();
        relay.push(StreamChunk::new("c1".to_string(), "gpt-4".to_string()).with_delta("par"));
        relay.push_error(&DomainError::provider_transient("mock", "connection reset"));

        // Subscribing after the failure replays the chunks and then the error
        let mut stream = relay.subscribe();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.delta.as_deref(), Some("par"));

        let last = stream.next().await.unwrap();
        assert!(last.is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_backoff_wait_does_not_hold_dispatch_slot() {
        let provider = MockProviderClient::new();
        provider.push_result(Err(DomainError::provider_transient("mock", "timeout")));

        let config = CoordinatorConfig {
            max_concurrent_calls: 1,
            max_queued: 0,
            backoff: BackoffPolicy::default()
                .with_base(Duration::from_millis(100))
                .with_jitter(0.0),
            ..CoordinatorConfig::default()
        };
        let h = harness(provider, config);

        let c1 = h.coordinator.clone();
        let retrying = tokio::spawn(async move { c1.lookup(fingerprint("first")).await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The first call is sleeping out its backoff; the single slot must
        // be free for an unrelated request
        let second = h.coordinator.lookup(fingerprint("second")).await;
        assert!(second.is_ok());

        assert!(retrying.await.unwrap().is_ok());
        assert_eq!(h.provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_stream_rejects_non_chat_payloads() {
        let h = harness(MockProviderClient::new(), CoordinatorConfig::default());

        let fp = RequestFingerprint {
            payload: RequestPayload::Embedding {
                input: "some text".into(),
            },
            ..fingerprint("unused")
        };

        let err = h.coordinator.lookup_stream(fp).await.unwrap_err();
        assert_eq!(err.error_class(), "configuration");
    }

    #[tokio::test]
    async fn test_batched_misses_resolve_individually() {
        let config = CoordinatorConfig {
            batch_window: Duration::from_millis(10),
            ..CoordinatorConfig::default()
        };
        let h = harness(MockProviderClient::new(), config);

        let mut handles = Vec::new();
        for i in 0..4 {
            let coordinator = h.coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.lookup(fingerprint(&format!("prompt {}", i))).await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(h.provider.calls(), 4);
    }
}
