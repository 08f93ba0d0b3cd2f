//! Text/embedding capability - the one opaque external collaborator this
//! engine depends on. `MockCapability` is the deterministic stand-in
//! used by tests and by callers with no real provider wired up yet: a
//! small, synchronous-feeling façade over whatever model backs it.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use async_trait::async_trait;
use lru::LruCache;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::model::{EntityType, ExtractedEntity};

/// Fixed embedding dimensionality for the mock provider. A real provider
/// would report its own; the engine treats embeddings as opaque
/// fixed-length vectors and never hard-codes this elsewhere.
pub const MOCK_EMBEDDING_DIMENSIONS: usize = 64;

/// Sentiment analysis result: polarity in `[-1, 1]` plus a coarse label.
#[derive(Debug, Clone, PartialEq)]
pub struct Sentiment {
    pub score: f32,
    pub label: String,
}

/// External text/embedding/LLM provider. Every method takes a
/// cancellation token, honored the way tier adapters honor theirs: check
/// before starting I/O, and short-circuit with `EngineError::Cancelled` if
/// already cancelled.
#[async_trait]
pub trait Capability: Send + Sync {
    async fn embed(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<f32>>;

    async fn extract_entities(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExtractedEntity>>;

    /// Advisory classification, consulted only when the built-in
    /// classifier's confidence is very low.
    async fn classify_query(&self, text: &str, cancel: &CancellationToken) -> Result<String>;

    async fn complete(
        &self,
        prompt: &str,
        max_tokens: u32,
        cancel: &CancellationToken,
    ) -> Result<String>;

    async fn answer_with_context(
        &self,
        query: &str,
        context_render: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let prompt = format!("{context_render}\n{query}");
        self.complete(&prompt, 1024, cancel).await
    }

    async fn analyze_sentiment(&self, text: &str, cancel: &CancellationToken) -> Result<Sentiment>;
}

/// Below this magnitude a vector is treated as zero, avoiding a
/// division that would otherwise produce NaN or Inf.
const COSINE_EPSILON: f32 = 1e-10;

/// Cosine similarity with a magnitude guard: near-zero vectors compare
/// as dissimilar (0.0) rather than blowing up the division.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let mag_a = norm_a.sqrt();
    let mag_b = norm_b.sqrt();
    if mag_a < COSINE_EPSILON || mag_b < COSINE_EPSILON {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(-1.0, 1.0)
}

/// Deterministic hash-based embeddings, rule-based classification and
/// entity extraction. Fine for tests and for running without a real
/// provider wired up; never represents real semantic relationships,
/// only stable given identical input.
#[derive(Debug, Default)]
pub struct MockCapability;

impl MockCapability {
    pub fn new() -> Self {
        Self
    }

    fn hash_embed(text: &str) -> Vec<f32> {
        let mut vector = Vec::with_capacity(MOCK_EMBEDDING_DIMENSIONS);
        let normalized = text.to_lowercase();
        for i in 0..MOCK_EMBEDDING_DIMENSIONS {
            let mut hasher = DefaultHasher::new();
            normalized.hash(&mut hasher);
            i.hash(&mut hasher);
            let bucket = (hasher.finish() % 2003) as f32 / 2003.0;
            vector.push(bucket - 0.5);
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Capability for MockCapability {
    async fn embed(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<f32>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if text.trim().is_empty() {
            return Err(EngineError::Capability("cannot embed empty text".into()));
        }
        Ok(Self::hash_embed(text))
    }

    async fn extract_entities(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExtractedEntity>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        // Rule-based: "X is Y" / "X: Y" yields one entity, typed `Other`.
        let mut entities = Vec::new();
        for line in text.split(['.', '\n']) {
            let line = line.trim();
            if let Some((key, value)) = line.split_once(" is ").or_else(|| line.split_once(": ")) {
                let key = key.trim();
                let value = value.trim();
                if !key.is_empty() && !value.is_empty() && key.len() < 64 {
                    entities.push(ExtractedEntity {
                        key: key.to_string(),
                        value: value.to_string(),
                        entity_type: EntityType::Other,
                        importance: 0.5,
                        is_novel: true,
                        embedding: None,
                    });
                }
            }
        }
        Ok(entities)
    }

    async fn classify_query(&self, text: &str, cancel: &CancellationToken) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let lower = text.to_lowercase();
        let label = if lower.contains('?') {
            "fact_retrieval"
        } else if lower.contains("code") || lower.contains("build") {
            "procedural"
        } else {
            "complex"
        };
        Ok(label.to_string())
    }

    async fn complete(
        &self,
        prompt: &str,
        max_tokens: u32,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let cap = (max_tokens as usize) * 4;
        Ok(prompt.chars().take(cap).collect())
    }

    async fn analyze_sentiment(&self, text: &str, cancel: &CancellationToken) -> Result<Sentiment> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let lower = text.to_lowercase();
        const NEGATIVE: &[&str] = &["hate", "angry", "frustrated", "broken", "terrible"];
        const POSITIVE: &[&str] = &["love", "great", "happy", "excellent", "thanks"];
        let neg = NEGATIVE.iter().filter(|w| lower.contains(**w)).count();
        let pos = POSITIVE.iter().filter(|w| lower.contains(**w)).count();
        let score = ((pos as f32 - neg as f32) / 3.0).clamp(-1.0, 1.0);
        let label = if score > 0.2 {
            "positive"
        } else if score < -0.2 {
            "negative"
        } else {
            "neutral"
        };
        Ok(Sentiment {
            score,
            label: label.to_string(),
        })
    }
}

/// Wraps any [`Capability`] with an LRU cache of query embeddings, to
/// avoid re-embedding repeated queries within a session.
pub struct CachingCapability<C: Capability> {
    inner: C,
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl<C: Capability> CachingCapability<C> {
    pub fn new(inner: C, capacity: std::num::NonZeroUsize) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl<C: Capability> Capability for CachingCapability<C> {
    async fn embed(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<f32>> {
        if let Some(hit) = self.cache.lock().expect("cache lock poisoned").get(text).cloned() {
            return Ok(hit);
        }
        let embedding = self.inner.embed(text, cancel).await?;
        self.cache
            .lock()
            .expect("cache lock poisoned")
            .put(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    async fn extract_entities(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExtractedEntity>> {
        self.inner.extract_entities(text, cancel).await
    }

    async fn classify_query(&self, text: &str, cancel: &CancellationToken) -> Result<String> {
        self.inner.classify_query(text, cancel).await
    }

    async fn complete(
        &self,
        prompt: &str,
        max_tokens: u32,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.inner.complete(prompt, max_tokens, cancel).await
    }

    async fn analyze_sentiment(&self, text: &str, cancel: &CancellationToken) -> Result<Sentiment> {
        self.inner.analyze_sentiment(text, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_guards_near_zero_vectors() {
        let zero = vec![0.0_f32; 8];
        let other = vec![1.0_f32; 8];
        let sim = cosine_similarity(&zero, &other);
        assert_eq!(sim, 0.0);
        assert!(!sim.is_nan());
        assert!(sim.is_finite());
    }

    #[test]
    fn cosine_similarity_identical_is_one() {
        let a = vec![1.0_f32, 2.0, 3.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn mock_embed_is_deterministic() {
        let cap = MockCapability::new();
        let cancel = CancellationToken::new();
        let a = cap.embed("hello world", &cancel).await.unwrap();
        let b = cap.embed("hello world", &cancel).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), MOCK_EMBEDDING_DIMENSIONS);
    }

    #[tokio::test]
    async fn mock_embed_rejects_empty() {
        let cap = MockCapability::new();
        let cancel = CancellationToken::new();
        assert!(cap.embed("", &cancel).await.is_err());
    }

    #[tokio::test]
    async fn caching_capability_returns_same_result_without_recompute() {
        let cap = CachingCapability::new(MockCapability::new(), std::num::NonZeroUsize::new(8).unwrap());
        let cancel = CancellationToken::new();
        let a = cap.embed("repeated query", &cancel).await.unwrap();
        let b = cap.embed("repeated query", &cancel).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn sentiment_detects_negative_and_positive() {
        let cap = MockCapability::new();
        let cancel = CancellationToken::new();
        let neg = cap.analyze_sentiment("this is broken and terrible", &cancel).await.unwrap();
        assert_eq!(neg.label, "negative");
        let pos = cap.analyze_sentiment("I love this, great work", &cancel).await.unwrap();
        assert_eq!(pos.label, "positive");
    }
}
