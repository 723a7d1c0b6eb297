//! Exact-match cache domain model

mod entry;
mod repository;

pub(crate) use entry::current_time_millis;
pub use entry::{CacheEntry, Tag};
pub use repository::ExactCache;
