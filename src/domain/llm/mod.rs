//! LLM request and response types plus the provider client trait

mod message;
mod provider;
mod response;

pub use message::{Message, MessageRole};
#[cfg(test)]
pub use provider::mock;
pub use provider::{ChunkStream, ProviderClient};
pub use response::{ChatResponse, EmbeddingResult, FinishReason, ProviderResponse, StreamChunk, Usage};
