//! Infrastructure layer: concrete implementations of the domain seams

pub mod cache;
pub mod coordinator;
pub mod embedding;
pub mod invalidation;
pub mod llm;
pub mod logging;
pub mod observability;
pub mod semantic_cache;
