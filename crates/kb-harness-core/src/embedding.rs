//! Embedding provider trait and vector utilities.
//!
//! Defines the async [`EmbeddingProvider`] trait that all embedding backends
//! implement, the deterministic [`HashEmbedder`], plus pure helper functions
//! for vector serialization and similarity computation.
//!
//! Remote providers (Voyage, OpenAI, Ollama) and the local fastembed model
//! live in the `kb-harness` app crate.

use async_trait::async_trait;

use crate::error::EmbeddingError;
use crate::keyword;

/// Whether a text is being embedded for storage or as a search query.
///
/// Some providers (Voyage) produce better vectors when told the difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedPurpose {
    Document,
    Query,
}

impl EmbedPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbedPurpose::Document => "document",
            EmbedPurpose::Query => "query",
        }
    }
}

/// Trait for embedding providers.
///
/// A provider with `dims() == 0` is disabled: callers fall back to keyword
/// scoring and refuse to write chunks.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"voyage-2"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1024`).
    fn dims(&self) -> usize;

    fn is_enabled(&self) -> bool {
        self.dims() > 0
    }

    /// Embeds a batch of texts, returning one vector per input in order.
    async fn embed_batch(
        &self,
        texts: &[String],
        purpose: EmbedPurpose,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Embeds a single text.
    async fn embed(&self, text: &str, purpose: EmbedPurpose) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed_batch(&[text.to_string()], purpose).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::Fatal("provider returned no vector".to_string()))
    }
}

/// Checks that a provider answered with exactly `expected_count` vectors of
/// `dims` components each.
pub fn check_vectors(
    vectors: &[Vec<f32>],
    expected_count: usize,
    dims: usize,
) -> Result<(), EmbeddingError> {
    if vectors.len() != expected_count {
        return Err(EmbeddingError::Fatal(format!(
            "provider returned {} vectors for {} inputs",
            vectors.len(),
            expected_count
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(EmbeddingError::DimensionMismatch {
            expected: dims,
            got: bad.len(),
        });
    }
    Ok(())
}

/// Deterministic feature-hashing embedder.
///
/// Unigrams and bigrams of the keyword tokenizer's output are hashed with
/// FNV-1a into `dims` buckets with a hash-derived sign, then L2-normalized.
/// Needs no network or model files. Texts sharing vocabulary land close
/// together, which is enough for offline use and tests.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
    model: String,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            model: format!("fnv1a-{dims}"),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        if self.dims == 0 {
            return vector;
        }
        let tokens = keyword::tokenize(text);
        let mut add = |feature: &str, weight: f32| {
            let h = fnv1a(feature.as_bytes());
            let bucket = (h % self.dims as u64) as usize;
            let sign = if (h >> 63) & 1 == 1 { -1.0 } else { 1.0 };
            vector[bucket] += sign * weight;
        };
        for token in &tokens {
            add(token, 1.0);
        }
        for pair in tokens.windows(2) {
            add(&format!("{} {}", pair[0], pair[1]), 0.5);
        }
        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        _purpose: EmbedPurpose,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }
}

/// A provider that embeds nothing. Search degrades to keyword scoring.
#[derive(Debug, Clone, Default)]
pub struct DisabledEmbedder;

#[async_trait]
impl EmbeddingProvider for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed_batch(
        &self,
        _texts: &[String],
        _purpose: EmbedPurpose,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Disabled)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use kb_harness_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or vectors
/// of different lengths.
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

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
