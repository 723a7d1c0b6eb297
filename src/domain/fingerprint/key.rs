//! Cache key and bucket derivation
//!
//! Pure functions from a normalized fingerprint to a deterministic cache key
//! and a semantic bucket. The boundary fields (model, template version,
//! tenant, date bucket) are strict: a missing field fails key construction
//! rather than silently defaulting, since a wrong default would leak entries
//! across tenants.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::request::RequestFingerprint;
use crate::domain::DomainError;

/// Opaque deterministic cache key. Equality implies reuse eligibility.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Boundary-field partition within which semantic matching is permitted
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketId(String);

impl BucketId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Exact-match fingerprint hash, keys the negative cache
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FingerprintHash(String);

impl FingerprintHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Date bucketing bounds the cache's drift tolerance for time-sensitive prompts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateBucketGranularity {
    #[default]
    Daily,
    Hourly,
    None,
}

impl DateBucketGranularity {
    fn bucket_for(&self, now: DateTime<Utc>) -> String {
        match self {
            Self::Daily => now.format("%Y-%m-%d").to_string(),
            Self::Hourly => now.format("%Y-%m-%dT%H").to_string(),
            Self::None => "static".to_string(),
        }
    }
}

/// Derives cache keys and semantic buckets from request fingerprints
#[derive(Debug, Clone, Default)]
pub struct KeyBuilder {
    granularity: DateBucketGranularity,
}

impl KeyBuilder {
    pub fn new(granularity: DateBucketGranularity) -> Self {
        Self { granularity }
    }

    /// Derives the deterministic cache key for a fingerprint
    pub fn build_key(&self, fingerprint: &RequestFingerprint) -> Result<CacheKey, DomainError> {
        self.build_key_at(fingerprint, Utc::now())
    }

    pub(crate) fn build_key_at(
        &self,
        fingerprint: &RequestFingerprint,
        now: DateTime<Utc>,
    ) -> Result<CacheKey, DomainError> {
        let canonical = self.canonical_string(fingerprint, now)?;
        Ok(CacheKey(hash_with_domain("key", &canonical)))
    }

    /// Derives the semantic bucket: same boundary fields as the key, so a
    /// semantic match can never cross model/template/tenant/date boundaries
    pub fn build_bucket(&self, fingerprint: &RequestFingerprint) -> Result<BucketId, DomainError> {
        self.build_bucket_at(fingerprint, Utc::now())
    }

    pub(crate) fn build_bucket_at(
        &self,
        fingerprint: &RequestFingerprint,
        now: DateTime<Utc>,
    ) -> Result<BucketId, DomainError> {
        let boundary = self.boundary_components(fingerprint, now)?;
        let joined = boundary
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(":");

        Ok(BucketId(joined))
    }

    /// Exact-match hash for negative caching, derived from the same canonical
    /// string under a separate hash domain
    pub fn fingerprint_hash(
        &self,
        fingerprint: &RequestFingerprint,
    ) -> Result<FingerprintHash, DomainError> {
        let canonical = self.canonical_string(fingerprint, Utc::now())?;
        Ok(FingerprintHash(hash_with_domain("fp", &canonical)))
    }

    fn boundary_components(
        &self,
        fingerprint: &RequestFingerprint,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<&'static str, String>, DomainError> {
        let mut components = BTreeMap::new();
        components.insert("model", required(&fingerprint.model_id, "model_id")?);
        components.insert("template", required(&fingerprint.template_id, "template_id")?);
        components.insert(
            "template_version",
            required(&fingerprint.template_version, "template_version")?,
        );
        components.insert("tenant", required(&fingerprint.tenant_id, "tenant_id")?);
        components.insert("date", self.granularity.bucket_for(now));
        Ok(components)
    }

    fn canonical_string(
        &self,
        fingerprint: &RequestFingerprint,
        now: DateTime<Utc>,
    ) -> Result<String, DomainError> {
        let mut components = self.boundary_components(fingerprint, now)?;

        if let Some(temp) = fingerprint.params.temperature {
            components.insert("temperature", format!("{:.2}", temp));
        }
        if let Some(tokens) = fingerprint.params.max_tokens {
            components.insert("max_tokens", tokens.to_string());
        }
        if let Some(top_p) = fingerprint.params.top_p {
            components.insert("top_p", format!("{:.2}", top_p));
        }
        if let Some(ref stop) = fingerprint.params.stop {
            components.insert("stop", stop.join(","));
        }

        let mut parts: Vec<String> = components
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        parts.push(fingerprint.normalized_payload());

        Ok(parts.join(":"))
    }
}

fn required(value: &str, field: &str) -> Result<String, DomainError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DomainError::configuration(format!(
            "boundary field '{}' is required for cache key construction",
            field
        )));
    }
    Ok(trimmed.to_string())
}

fn hash_with_domain(domain: &str, canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    hasher.update(b"\x00");
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}
