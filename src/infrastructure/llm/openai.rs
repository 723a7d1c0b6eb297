use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, stream, StreamExt};
use serde::{Deserialize, Serialize};

use super::http_client::HttpClientTrait;
use crate::domain::fingerprint::{RequestFingerprint, RequestPayload};
use crate::domain::llm::{
    ChatResponse, ChunkStream, EmbeddingResult, FinishReason, Message, MessageRole,
    ProviderClient, ProviderResponse, StreamChunk, Usage,
};
use crate::domain::DomainError;

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";

/// OpenAI-backed provider client
#[derive(Debug)]
pub struct OpenAiProviderClient<C: HttpClientTrait> {
    client: C,
    auth_header: String,
    base_url: String,
}

impl<C: HttpClientTrait> OpenAiProviderClient<C> {
    pub fn new(client: C, api_key: impl Into<String>) -> Self {
        Self::with_base_url(client, api_key, DEFAULT_OPENAI_BASE_URL)
    }

    pub fn with_base_url(
        client: C,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let auth_header = format!("Bearer {}", api_key.into());
        let base_url = base_url.into().trim_end_matches('/').to_string();

        Self {
            client,
            auth_header,
            base_url,
        }
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn embeddings_url(&self) -> String {
        format!("{}/v1/embeddings", self.base_url)
    }

    fn headers(&self) -> Vec<(&str, &str)> {
        vec![
            ("Authorization", self.auth_header.as_str()),
            ("Content-Type", "application/json"),
        ]
    }

    fn build_chat_request(
        &self,
        fingerprint: &RequestFingerprint,
        messages: &[Message],
        stream: bool,
    ) -> serde_json::Value {
        let messages: Vec<OpenAiMessage> = messages.iter().map(OpenAiMessage::from_domain).collect();

        let mut body = serde_json::json!({
            "model": fingerprint.model_id,
            "messages": messages,
            "stream": stream,
        });

        if let Some(temperature) = fingerprint.params.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max_tokens) = fingerprint.params.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if let Some(top_p) = fingerprint.params.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        if let Some(ref stop) = fingerprint.params.stop {
            body["stop"] = serde_json::json!(stop);
        }

        body
    }

    async fn chat(
        &self,
        fingerprint: &RequestFingerprint,
        messages: &[Message],
    ) -> Result<ProviderResponse, DomainError> {
        let body = self.build_chat_request(fingerprint, messages, false);
        let response = self
            .client
            .post_json(&self.chat_completions_url(), self.headers(), &body)
            .await?;

        parse_chat_response(response).map(ProviderResponse::Chat)
    }

    async fn embed(
        &self,
        fingerprint: &RequestFingerprint,
        input: &str,
    ) -> Result<ProviderResponse, DomainError> {
        let body = serde_json::json!({
            "model": fingerprint.model_id,
            "input": input,
        });
        let response = self
            .client
            .post_json(&self.embeddings_url(), self.headers(), &body)
            .await?;

        let parsed: OpenAiEmbeddingResponse = serde_json::from_value(response).map_err(|e| {
            DomainError::provider_terminal("openai", format!("Failed to parse response: {}", e))
        })?;

        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|item| item.embedding)
            .ok_or_else(|| DomainError::provider_terminal("openai", "No embedding in response"))?;

        Ok(ProviderResponse::Embedding(EmbeddingResult {
            model: parsed.model,
            vector,
            usage: parsed
                .usage
                .map(|usage| Usage::new(usage.prompt_tokens, 0)),
        }))
    }
}

#[async_trait]
impl<C: HttpClientTrait> ProviderClient for OpenAiProviderClient<C> {
    async fn invoke(
        &self,
        fingerprint: &RequestFingerprint,
    ) -> Result<ProviderResponse, DomainError> {
        match &fingerprint.payload {
            RequestPayload::Chat { messages } => self.chat(fingerprint, messages).await,
            RequestPayload::Embedding { input } => self.embed(fingerprint, input).await,
        }
    }

    async fn invoke_stream(
        &self,
        fingerprint: &RequestFingerprint,
    ) -> Result<ChunkStream, DomainError> {
        let RequestPayload::Chat { messages } = &fingerprint.payload else {
            return Err(DomainError::configuration(
                "streaming is only supported for chat payloads",
            ));
        };

        let body = self.build_chat_request(fingerprint, messages, true);
        let byte_stream = self
            .client
            .post_json_stream(&self.chat_completions_url(), self.headers(), &body)
            .await?;

        let model = fingerprint.model_id.clone();
        let stream = byte_stream
            .scan(
                String::new(),
                move |buffer, result: Result<Bytes, DomainError>| {
                    let events = match result {
                        Ok(bytes) => {
                            buffer.push_str(&String::from_utf8_lossy(&bytes));
                            drain_sse_events(buffer, &model)
                        }
                        Err(e) => vec![Err(e)],
                    };
                    future::ready(Some(events))
                },
            )
            .flat_map(stream::iter);

        Ok(Box::pin(stream))
    }

    fn provider_name(&self) -> &str {
        "openai"
    }
}

fn parse_chat_response(json: serde_json::Value) -> Result<ChatResponse, DomainError> {
    let response: OpenAiResponse = serde_json::from_value(json).map_err(|e| {
        DomainError::provider_terminal("openai", format!("Failed to parse response: {}", e))
    })?;

    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| DomainError::provider_terminal("openai", "No choices in response"))?;

    let message = Message::assistant(choice.message.content.unwrap_or_default());
    let mut chat = ChatResponse::new(response.id, response.model, message);

    if let Some(reason) = choice.finish_reason {
        chat = chat.with_finish_reason(parse_finish_reason(&reason));
    }
    if let Some(usage) = response.usage {
        chat = chat.with_usage(Usage::new(usage.prompt_tokens, usage.completion_tokens));
    }

    Ok(chat)
}

/// Drains every complete line from the read buffer. A network read may carry
/// several events, or end mid-event; the partial tail stays buffered for the
/// next read.
fn drain_sse_events(buffer: &mut String, model: &str) -> Vec<Result<StreamChunk, DomainError>> {
    let mut events = Vec::new();
    while let Some(newline) = buffer.find('\n') {
        let line: String = buffer.drain(..=newline).collect();
        if let Some(event) = parse_sse_line(line.trim_end(), model) {
            events.push(event);
        }
    }
    events
}

fn parse_sse_line(line: &str, model: &str) -> Option<Result<StreamChunk, DomainError>> {
    let data = line.strip_prefix("data: ")?;
    if data.trim() == "[DONE]" {
        return Some(Ok(StreamChunk::new(String::new(), model.to_string())
            .with_finish_reason(FinishReason::Stop)));
    }

    let chunk = serde_json::from_str::<OpenAiStreamChunk>(data).ok()?;
    let choice = chunk.choices.into_iter().next()?;

    let mut stream_chunk = StreamChunk::new(chunk.id, chunk.model.unwrap_or_default());
    if let Some(delta) = choice.delta.content {
        stream_chunk = stream_chunk.with_delta(delta);
    }
    if let Some(reason) = choice.finish_reason {
        stream_chunk = stream_chunk.with_finish_reason(parse_finish_reason(&reason));
    }

    Some(Ok(stream_chunk))
}

fn parse_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "length" => FinishReason::Length,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

// OpenAI API types

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

impl OpenAiMessage {
    fn from_domain(message: &Message) -> Self {
        let role = match message.role {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        };

        Self {
            role: role.to_string(),
            content: message.content.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    id: String,
    model: String,
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    id: String,
    model: Option<String>,
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    model: String,
    data: Vec<OpenAiEmbeddingItem>,
    usage: Option<OpenAiEmbeddingUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingItem {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingUsage {
    prompt_tokens: u32,
}
