//! Semantic similarity index domain model

mod repository;

pub use repository::{SemanticCache, SemanticIndexEntry, SemanticMatch};
