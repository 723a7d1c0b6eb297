use std::fmt::Debug;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use super::{ProviderResponse, StreamChunk};
use crate::domain::error::DomainError;
use crate::domain::fingerprint::RequestFingerprint;

/// Stream of incremental chunks from a provider call
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, DomainError>> + Send>>;

/// Client for dispatching requests to an upstream LLM provider
#[async_trait]
pub trait ProviderClient: Send + Sync + Debug {
    async fn invoke(
        &self,
        fingerprint: &RequestFingerprint,
    ) -> Result<ProviderResponse, DomainError>;

    async fn invoke_stream(
        &self,
        fingerprint: &RequestFingerprint,
    ) -> Result<ChunkStream, DomainError>;

    /// Dispatches a group of compatible requests together. Providers without
    /// a native batch endpoint fall back to sequential dispatch.
    async fn invoke_many(
        &self,
        fingerprints: &[RequestFingerprint],
    ) -> Vec<Result<ProviderResponse, DomainError>> {
        let mut results = Vec::with_capacity(fingerprints.len());
        for fingerprint in fingerprints {
            results.push(self.invoke(fingerprint).await);
        }
        results
    }

    fn provider_name(&self) -> &str;
}

#[cfg(test)]
pub mod mock {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use futures::stream;

    use super::*;
    use crate::domain::llm::{ChatResponse, FinishReason, Message, Usage};

    /// Scripted provider for tests. Pops queued results first, then falls back
    /// to echoing a canned chat response. Counts invocations.
    #[derive(Debug)]
    pub struct MockProviderClient {
        calls: AtomicUsize,
        delay: Option<Duration>,
        script: Mutex<VecDeque<Result<ProviderResponse, DomainError>>>,
        default_content: String,
    }

    impl MockProviderClient {
        pub fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: None,
                script: Mutex::new(VecDeque::new()),
                default_content: "mock response".to_string(),
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn with_content(mut self, content: impl Into<String>) -> Self {
            self.default_content = content.into();
            self
        }

        pub fn push_result(&self, result: Result<ProviderResponse, DomainError>) {
            self.script.lock().unwrap().push_back(result);
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn default_response(&self, fingerprint: &RequestFingerprint) -> ProviderResponse {
            ProviderResponse::Chat(
                ChatResponse::new(
                    format!("mock-{}", self.calls()),
                    fingerprint.model_id.clone(),
                    Message::assistant(&self.default_content),
                )
                .with_finish_reason(FinishReason::Stop)
                .with_usage(Usage::new(10, 20)),
            )
        }
    }

    impl Default for MockProviderClient {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ProviderClient for MockProviderClient {
        async fn invoke(
            &self,
            fingerprint: &RequestFingerprint,
        ) -> Result<ProviderResponse, DomainError> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            if let Some(scripted) = self.script.lock().unwrap().pop_front() {
                return scripted;
            }
            Ok(self.default_response(fingerprint))
        }

        async fn invoke_stream(
            &self,
            fingerprint: &RequestFingerprint,
        ) -> Result<ChunkStream, DomainError> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            if let Some(scripted) = self.script.lock().unwrap().pop_front() {
                scripted?;
            }

            let id = format!("mock-{}", self.calls());
            let model = fingerprint.model_id.clone();
            let mut chunks: Vec<Result<StreamChunk, DomainError>> = self
                .default_content
                .chars()
                .map(|c| Ok(StreamChunk::new(id.clone(), model.clone()).with_delta(c.to_string())))
                .collect();
            chunks.push(Ok(StreamChunk::new(id, model)
                .with_finish_reason(FinishReason::Stop)
                .with_usage(Usage::new(10, 20))));

            Ok(Box::pin(stream::iter(chunks)))
        }

        fn provider_name(&self) -> &str {
            "mock-provider"
        }
    }
}
