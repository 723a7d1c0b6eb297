//! Request fingerprints, cache keys and semantic buckets

mod key;
mod request;

pub use key::{BucketId, CacheKey, DateBucketGranularity, FingerprintHash, KeyBuilder};
pub use request::{normalize_whitespace, GenerationParams, RequestFingerprint, RequestPayload};
