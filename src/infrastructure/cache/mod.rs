//! Cache store implementations

mod in_memory;
mod negative;

pub use in_memory::{InMemoryExactCache, InMemoryExactCacheConfig};
pub use negative::{NegativeCache, NegativeCacheConfig, NegativeCacheEntry};
