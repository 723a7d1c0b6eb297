//! Embedding provider abstraction

use std::fmt::Debug;

use async_trait::async_trait;

use crate::domain::error::DomainError;

/// Client for turning query text into embedding vectors
#[async_trait]
pub trait EmbeddingClient: Send + Sync + Debug {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, DomainError>;

    fn dimensions(&self) -> usize;

    fn provider_name(&self) -> &str;
}

/// Cosine similarity between two vectors, zero when either has zero magnitude
/// or the dimensions disagree
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical_vectors() {
        let v = vec![0.5, 0.1, 0.8];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_vectors() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn test_mock_embedder_is_deterministic() {
        let embedder = mock::MockEmbeddingClient::new();
        let a = embedder.embed("hello").await.unwrap();
        let b = embedder.embed("hello").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), embedder.dimensions());
    }

    #[tokio::test]
    async fn test_mock_embedder_fixed_vectors() {
        let embedder =
            mock::MockEmbeddingClient::new().with_vector("pinned", vec![1.0, 0.0, 0.0]);
        assert_eq!(embedder.embed("pinned").await.unwrap(), vec![1.0, 0.0, 0.0]);
    }
}
