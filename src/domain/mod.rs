//! Domain layer: core types and trait seams, no IO concerns

pub mod cache;
pub mod embedding;
pub mod error;
pub mod fingerprint;
pub mod llm;
pub mod semantic_cache;

pub use error::DomainError;
