//! The two-tier semantic translation cache.
//!
//! Tier 1 is an in-memory exact-match LRU; tier 2 is a persistent sharded
//! store with exact *and* semantic (embedding cosine) lookup. Both tiers
//! are optional and independently configured; a handle is passed into the
//! pipeline components rather than living in a global, so tests inject
//! memory-only caches freely.
//!
//! Lookup order: memory exact → persistent exact → persistent semantic.
//! A successful, validated translation is written to both tiers with its
//! embedding, timestamp, and quality score.
//!
//! Key normalisation: whitespace is collapsed and trimmed; case is
//! **kept** (headings are case-significant). Transport placeholder tokens
//! are stripped from the text that gets *embedded* but retained in the
//! text stored for reconstruction.

pub mod embedding;
pub mod memory;
pub mod persistent;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::translate::transport::{ITEM_BREAK, PARAGRAPH_BREAK};
use embedding::{embedder_for, fnv1a, Embedder};
use memory::MemoryCache;
use persistent::{PersistentCache, PersistentEntry};

static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// A normalised lookup key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    /// Whitespace-collapsed, trimmed text (case preserved).
    pub text: String,
    pub target_language: String,
    pub model_identifier: String,
}

impl CacheKey {
    pub fn new(raw_text: &str, target_language: &str, model_identifier: &str) -> Self {
        let text = RE_WHITESPACE
            .replace_all(raw_text.trim(), " ")
            .into_owned();
        Self {
            text,
            target_language: target_language.to_string(),
            model_identifier: model_identifier.to_string(),
        }
    }

    /// Stable hex fingerprint for exact matching and shard naming.
    pub fn fingerprint(&self) -> String {
        let composite = format!(
            "{}|{}|{}",
            self.text, self.target_language, self.model_identifier
        );
        format!("{:016x}", fnv1a(composite.as_bytes()))
    }

    /// The text used for embedding: placeholder tokens stripped.
    pub fn embedding_text(&self) -> String {
        self.text
            .replace(PARAGRAPH_BREAK, " ")
            .replace(ITEM_BREAK, " ")
    }
}

/// How a lookup was satisfied.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheHit {
    Exact(String),
    Semantic { translation: String, similarity: f32 },
}

impl CacheHit {
    pub fn translation(&self) -> &str {
        match self {
            CacheHit::Exact(t) => t,
            CacheHit::Semantic { translation, .. } => translation,
        }
    }
}

/// Counters exposed in the trace summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub queries: u64,
    pub exact_hits: u64,
    pub semantic_hits: u64,
    pub misses: u64,
    pub writes: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.queries == 0 {
            0.0
        } else {
            (self.exact_hits + self.semantic_hits) as f64 / self.queries as f64
        }
    }
}

#[derive(Default)]
struct StatCounters {
    queries: AtomicU64,
    exact_hits: AtomicU64,
    semantic_hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

/// The two-tier cache handle shared across workers.
pub struct TranslationCache {
    memory: Option<Mutex<MemoryCache>>,
    persistent: Option<PersistentCache>,
    embedder: Arc<dyn Embedder>,
    similarity_threshold: f32,
    stats: StatCounters,
}

impl TranslationCache {
    /// Build from configuration. A persistent tier that fails to open
    /// degrades gracefully (tier skipped, warning logged) rather than
    /// failing the run.
    pub fn new(config: &CacheConfig) -> Self {
        let memory = config
            .enable_memory
            .then(|| Mutex::new(MemoryCache::new(config.memory_capacity)));

        let persistent = if config.enable_persistent {
            match PersistentCache::open(&config.persistent_path, config.persistent_capacity) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!("persistent cache disabled: {e}");
                    None
                }
            }
        } else {
            None
        };

        Self {
            memory,
            persistent,
            embedder: embedder_for(&config.embedding_model),
            similarity_threshold: config.similarity_threshold,
            stats: StatCounters::default(),
        }
    }

    /// An in-memory-only cache, the shape tests inject.
    pub fn memory_only(capacity: usize) -> Self {
        Self {
            memory: Some(Mutex::new(MemoryCache::new(capacity))),
            persistent: None,
            embedder: Arc::new(embedding::HashedBowEmbedder::default()),
            similarity_threshold: 0.85,
            stats: StatCounters::default(),
        }
    }

    /// A disabled cache (every lookup misses, writes are dropped).
    pub fn disabled() -> Self {
        Self {
            memory: None,
            persistent: None,
            embedder: Arc::new(embedding::HashedBowEmbedder::default()),
            similarity_threshold: 0.85,
            stats: StatCounters::default(),
        }
    }

    /// Exact → exact-persistent → semantic-persistent.
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheHit> {
        self.stats.queries.fetch_add(1, Ordering::Relaxed);
        let fingerprint = key.fingerprint();

        if let Some(memory) = &self.memory {
            if let Some(translation) = memory.lock().unwrap().get(&fingerprint) {
                self.stats.exact_hits.fetch_add(1, Ordering::Relaxed);
                return Some(CacheHit::Exact(translation));
            }
        }

        if let Some(persistent) = &self.persistent {
            if let Some(translation) = persistent.get_exact(&fingerprint) {
                self.stats.exact_hits.fetch_add(1, Ordering::Relaxed);
                // Promote to the memory tier for the next lookup.
                if let Some(memory) = &self.memory {
                    memory
                        .lock()
                        .unwrap()
                        .insert(fingerprint, translation.clone());
                }
                return Some(CacheHit::Exact(translation));
            }

            let query = self.embedder.embed(&key.embedding_text());
            if let Some((translation, similarity)) = persistent.get_semantic(
                &query,
                &key.target_language,
                &key.model_identifier,
                self.embedder.id(),
                self.similarity_threshold,
            ) {
                self.stats.semantic_hits.fetch_add(1, Ordering::Relaxed);
                debug!(similarity, "semantic cache hit");
                return Some(CacheHit::Semantic {
                    translation,
                    similarity,
                });
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Write a validated translation to both tiers.
    pub fn store(&self, key: &CacheKey, translation: &str, quality_score: f32) {
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        let fingerprint = key.fingerprint();

        if let Some(memory) = &self.memory {
            memory
                .lock()
                .unwrap()
                .insert(fingerprint.clone(), translation.to_string());
        }

        if let Some(persistent) = &self.persistent {
            let entry = PersistentEntry {
                fingerprint,
                text: key.text.clone(),
                translation: translation.to_string(),
                target_language: key.target_language.clone(),
                model_identifier: key.model_identifier.clone(),
                embedder_id: self.embedder.id().to_string(),
                embedding: self.embedder.embed(&key.embedding_text()),
                timestamp: Utc::now(),
                quality_score,
            };
            if let Err(e) = persistent.insert(entry) {
                // Degrade gracefully: the memory tier still has the entry.
                warn!("persistent cache write failed: {e}");
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            queries: self.stats.queries.load(Ordering::Relaxed),
            exact_hits: self.stats.exact_hits.load(Ordering::Relaxed),
            semantic_hits: self.stats.semantic_hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            writes: self.stats.writes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_normalises_whitespace_but_keeps_case() {
        let a = CacheKey::new("  Hello   World \n", "Greek", "m");
        let b = CacheKey::new("Hello World", "Greek", "m");
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());

        let lower = CacheKey::new("hello world", "Greek", "m");
        assert_ne!(a.fingerprint(), lower.fingerprint());
    }

    #[test]
    fn key_separates_languages_and_models() {
        let a = CacheKey::new("text", "Greek", "m1");
        let b = CacheKey::new("text", "French", "m1");
        let c = CacheKey::new("text", "Greek", "m2");
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn embedding_text_strips_transport_tokens() {
        let key = CacheKey::new(
            "part one[[PARAGRAPH_BREAK]]part two %%%%ITEM_BREAK%%%% three",
            "Greek",
            "m",
        );
        let e = key.embedding_text();
        assert!(!e.contains("PARAGRAPH_BREAK"));
        assert!(!e.contains("ITEM_BREAK"));
        // But the stored text keeps them for reconstruction.
        assert!(key.text.contains("[[PARAGRAPH_BREAK]]"));
    }

    #[test]
    fn memory_only_round_trip() {
        let cache = TranslationCache::memory_only(16);
        let key = CacheKey::new("The quick brown fox.", "Greek", "m");

        assert!(cache.lookup(&key).is_none());
        cache.store(&key, "Η γρήγορη καφέ αλεπού.", 1.0);
        match cache.lookup(&key) {
            Some(CacheHit::Exact(t)) => assert_eq!(t, "Η γρήγορη καφέ αλεπού."),
            other => panic!("expected exact hit, got {other:?}"),
        }

        let stats = cache.stats();
        assert_eq!(stats.queries, 2);
        assert_eq!(stats.exact_hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.writes, 1);
    }

    #[test]
    fn persistent_tier_serves_semantic_hits() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            enable_memory: true,
            memory_capacity: 16,
            enable_persistent: true,
            persistent_path: dir.path().to_path_buf(),
            persistent_capacity: 100,
            similarity_threshold: 0.85,
            embedding_model: "hashed-bow-256".into(),
        };
        let cache = TranslationCache::new(&config);

        let key = CacheKey::new(
            "the experiment measured the decay rate of the isotope sample",
            "Greek",
            "m",
        );
        cache.store(&key, "μετάφραση", 1.0);

        // One word differs; exact misses, semantic should hit.
        let near = CacheKey::new(
            "the experiment measured the decay rate of the isotope specimen",
            "Greek",
            "m",
        );
        match cache.lookup(&near) {
            Some(CacheHit::Semantic { similarity, .. }) => {
                assert!(similarity >= 0.85, "similarity {similarity}");
            }
            other => panic!("expected semantic hit, got {other:?}"),
        }

        // Unrelated text misses.
        let far = CacheKey::new("cooking pasta at home tonight", "Greek", "m");
        assert!(cache.lookup(&far).is_none());
    }

    #[test]
    fn disabled_cache_always_misses() {
        let cache = TranslationCache::disabled();
        let key = CacheKey::new("text", "Greek", "m");
        cache.store(&key, "t", 1.0);
        assert!(cache.lookup(&key).is_none());
    }
}
