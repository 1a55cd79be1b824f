//! Text embeddings for the semantic cache tier.
//!
//! The cache only needs a *fixed* embedding: the same text must embed to
//! the same vector across runs, and cosine similarity must behave sanely
//! on near-duplicate technical prose. The bundled
//! [`HashedBowEmbedder`] hashes tokens into a fixed-width bag-of-words
//! vector and L2-normalises it — deterministic, dependency-free, and good
//! enough for near-duplicate detection. A real sentence-embedding model
//! implements the same one-method trait and plugs in via configuration.

use std::sync::Arc;

/// A fixed text-embedding model.
pub trait Embedder: Send + Sync {
    /// Identifier recorded in cache entries; entries embed-compatibly only
    /// within the same id.
    fn id(&self) -> &str;

    /// Embed to an L2-normalised vector of `dims()` floats.
    fn embed(&self, text: &str) -> Vec<f32>;

    fn dims(&self) -> usize;
}

/// Deterministic hashed bag-of-words embedder.
#[derive(Debug, Clone)]
pub struct HashedBowEmbedder {
    dims: usize,
    id: String,
}

impl HashedBowEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            id: format!("hashed-bow-{dims}"),
        }
    }
}

impl Default for HashedBowEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Embedder for HashedBowEmbedder {
    fn id(&self) -> &str {
        &self.id
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let h = fnv1a(token.to_lowercase().as_bytes());
            let bucket = (h % self.dims as u64) as usize;
            // Sign from a second hash bit decorrelates colliding tokens.
            let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        normalize(&mut vector);
        vector
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

/// Cosine similarity of two (expected normalised) vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// FNV-1a, used both for token hashing and for stable cache fingerprints.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x1000_0000_01b3);
    }
    hash
}

/// The default embedder for a configured model id. Unknown ids fall back
/// to the bundled embedder (the id mismatch keeps old entries from being
/// compared against incompatible vectors).
pub fn embedder_for(model_id: &str) -> Arc<dyn Embedder> {
    if let Some(dims) = model_id.strip_prefix("hashed-bow-") {
        if let Ok(d) = dims.parse::<usize>() {
            return Arc::new(HashedBowEmbedder::new(d.clamp(16, 4096)));
        }
    }
    Arc::new(HashedBowEmbedder::default())
}
