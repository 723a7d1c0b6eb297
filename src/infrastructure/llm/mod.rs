//! LLM provider client implementations

pub mod http_client;
mod openai;

pub use http_client::{ByteStream, HttpClient, HttpClientTrait};
pub use openai::OpenAiProviderClient;
