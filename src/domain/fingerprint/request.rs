//! Normalized request fingerprints

use serde::{Deserialize, Serialize};

use crate::domain::cache::Tag;
use crate::domain::llm::Message;

/// Sampling parameters relevant to reuse eligibility
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

/// Typed request payload
///
/// Closed set of variants parsed at the boundary; streaming is the `stream`
/// flag on the fingerprint, not a separate payload shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestPayload {
    Chat { messages: Vec<Message> },
    Embedding { input: String },
}

/// The normalized request before hashing
///
/// Carries the boundary fields (model, template version, tenant) plus the
/// payload and sampling parameters. Input to both cache-key derivation and
/// `embed()`. Tags and the stream flag never influence reuse decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFingerprint {
    pub model_id: String,
    pub template_id: String,
    pub template_version: String,
    pub tenant_id: String,
    pub payload: RequestPayload,
    #[serde(default)]
    pub params: GenerationParams,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub stream: bool,
}

impl RequestFingerprint {
    /// Text used for embedding: concatenated user messages for chat,
    /// the raw input for embedding payloads. Whitespace-normalized.
    pub fn query_text(&self) -> String {
        match &self.payload {
            RequestPayload::Chat { messages } => messages
                .iter()
                .filter(|m| m.role == crate::domain::llm::MessageRole::User)
                .map(|m| normalize_whitespace(&m.content))
                .collect::<Vec<_>>()
                .join("\n"),
            RequestPayload::Embedding { input } => normalize_whitespace(input),
        }
    }

    /// Canonical payload text for hashing: role-prefixed, whitespace-collapsed
    pub(crate) fn normalized_payload(&self) -> String {
        match &self.payload {
            RequestPayload::Chat { messages } => messages
                .iter()
                .map(|m| format!("{}:{}", m.role_str(), normalize_whitespace(&m.content)))
                .collect::<Vec<_>>()
                .join("\x1f"),
            RequestPayload::Embedding { input } => {
                format!("embedding:{}", normalize_whitespace(input))
            }
        }
    }

    pub fn is_chat(&self) -> bool {
        matches!(self.payload, RequestPayload::Chat { .. })
    }
}

/// Collapse runs of whitespace to single spaces and trim the ends
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_fingerprint(user: &str) -> RequestFingerprint {
        RequestFingerprint {
            model_id: "gpt-4".into(),
            template_id: "story".into(),
            template_version: "v3".into(),
            tenant_id: "tenant-1".into(),
            payload: RequestPayload::Chat {
                messages: vec![Message::system("You narrate."), Message::user(user)],
            },
            params: GenerationParams::default(),
            tags: vec![],
            stream: false,
        }
    }

    #[test]
    fn test_normalize_whitespace() {
        assert_eq!(normalize_whitespace("  hello\t \nworld  "), "hello world");
    }

    #[test]
    fn test_query_text_user_messages_only() {
        let fp = chat_fingerprint("Tell me   a story");
        assert_eq!(fp.query_text(), "Tell me a story");
    }

    #[test]
    fn test_query_text_embedding_payload() {
        let mut fp = chat_fingerprint("x");
        fp.payload = RequestPayload::Embedding {
            input: "  some   text ".into(),
        };
        assert_eq!(fp.query_text(), "some text");
        assert!(!fp.is_chat());
    }

    #[test]
    fn test_normalized_payload_is_whitespace_insensitive() {
        let a = chat_fingerprint("Tell me a story");
        let b = chat_fingerprint("Tell  me\na story ");
        assert_eq!(a.normalized_payload(), b.normalized_payload());
    }

    #[test]
    fn test_normalized_payload_differs_by_content() {
        let a = chat_fingerprint("Tell me a story");
        let b = chat_fingerprint("Tell me a poem");
        assert_ne!(a.normalized_payload(), b.normalized_payload());
    }
}
