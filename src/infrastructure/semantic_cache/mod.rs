//! Semantic index implementations

mod in_memory;

pub use in_memory::{InMemorySemanticCache, InMemorySemanticCacheConfig};
