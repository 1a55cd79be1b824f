//! The persistent disk tier: exact + semantic lookup, sharded files,
//! atomic writes.
//!
//! Entries are bucketed into 256 shard files by fingerprint prefix
//! (`persistent/ab.json`). A write rewrites only the affected shard,
//! through a temp file and an atomic rename, so concurrent readers see
//! either the old shard or the new one, never a torn file.
//!
//! Eviction over capacity removes the lowest `quality_score` first, ties
//! broken by oldest `timestamp` — a low-confidence fallback-split recovery
//! is always sacrificed before a clean validated translation.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::embedding::cosine_similarity;
use crate::error::BlockError;

/// One persisted cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentEntry {
    pub fingerprint: String,
    pub text: String,
    pub translation: String,
    pub target_language: String,
    pub model_identifier: String,
    pub embedder_id: String,
    pub embedding: Vec<f32>,
    pub timestamp: DateTime<Utc>,
    pub quality_score: f32,
}

#[derive(Debug, Default)]
struct Shards {
    /// Shard prefix → entries. Kept fully in memory; shards are the unit
    /// of rewrite, not of loading.
    by_shard: BTreeMap<String, Vec<PersistentEntry>>,
    len: usize,
}

/// The disk tier.
pub struct PersistentCache {
    dir: PathBuf,
    capacity: usize,
    shards: RwLock<Shards>,
}

impl PersistentCache {
    /// Open (or create) the cache directory and load all shards.
    pub fn open(dir: &Path, capacity: usize) -> Result<Self, BlockError> {
        std::fs::create_dir_all(dir).map_err(|e| BlockError::CacheIo {
            detail: format!("create {}: {e}", dir.display()),
        })?;

        let mut shards = Shards::default();
        let read_dir = std::fs::read_dir(dir).map_err(|e| BlockError::CacheIo {
            detail: format!("read {}: {e}", dir.display()),
        })?;
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<Vec<PersistentEntry>>(&raw).ok())
            {
                Some(entries) => {
                    let prefix = path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or_default()
                        .to_string();
                    shards.len += entries.len();
                    shards.by_shard.insert(prefix, entries);
                }
                None => warn!(path = %path.display(), "skipping unreadable cache shard"),
            }
        }

        debug!(entries = shards.len, dir = %dir.display(), "persistent cache loaded");
        Ok(Self {
            dir: dir.to_path_buf(),
            capacity: capacity.max(1),
            shards: RwLock::new(shards),
        })
    }

    pub fn len(&self) -> usize {
        self.shards.read().unwrap().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exact lookup by fingerprint.
    pub fn get_exact(&self, fingerprint: &str) -> Option<String> {
        let shards = self.shards.read().unwrap();
        shards
            .by_shard
            .get(shard_prefix(fingerprint))
            .and_then(|entries| entries.iter().find(|e| e.fingerprint == fingerprint))
            .map(|e| e.translation.clone())
    }

    /// Semantic lookup: best cosine match among entries with the same
    /// language, model, and embedder. Returns `(translation, similarity)`
    /// of the top-1 candidate at or above the threshold.
    pub fn get_semantic(
        &self,
        query_embedding: &[f32],
        target_language: &str,
        model_identifier: &str,
        embedder_id: &str,
        threshold: f32,
    ) -> Option<(String, f32)> {
        let shards = self.shards.read().unwrap();
        let mut best: Option<(&PersistentEntry, f32)> = None;

        for entries in shards.by_shard.values() {
            for entry in entries {
                if entry.target_language != target_language
                    || entry.model_identifier != model_identifier
                    || entry.embedder_id != embedder_id
                {
                    continue;
                }
                let similarity = cosine_similarity(query_embedding, &entry.embedding);
                if similarity >= threshold
                    && best.map(|(_, s)| similarity > s).unwrap_or(true)
                {
                    best = Some((entry, similarity));
                }
            }
        }

        best.map(|(e, s)| (e.translation.clone(), s))
    }

    /// Insert an entry, evict over capacity, and rewrite affected shards
    /// atomically.
    pub fn insert(&self, entry: PersistentEntry) -> Result<(), BlockError> {
        let mut dirty: Vec<String> = Vec::new();
        {
            let mut guard = self.shards.write().unwrap();
            let shards = &mut *guard;
            let prefix = shard_prefix(&entry.fingerprint).to_string();
            let bucket = shards.by_shard.entry(prefix.clone()).or_default();

            match bucket.iter_mut().find(|e| e.fingerprint == entry.fingerprint) {
                Some(existing) => *existing = entry,
                None => {
                    bucket.push(entry);
                    shards.len += 1;
                }
            }
            dirty.push(prefix);

            // Evict by lowest quality score, ties broken by oldest
            // timestamp.
            while shards.len > self.capacity {
                let victim = shards
                    .by_shard
                    .iter()
                    .flat_map(|(prefix, entries)| {
                        entries.iter().map(move |e| {
                            (prefix.clone(), e.fingerprint.clone(), e.quality_score, e.timestamp)
                        })
                    })
                    .min_by(|a, b| {
                        a.2.partial_cmp(&b.2)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then(a.3.cmp(&b.3))
                    });

                match victim {
                    Some((prefix, fingerprint, _, _)) => {
                        if let Some(entries) = shards.by_shard.get_mut(&prefix) {
                            entries.retain(|e| e.fingerprint != fingerprint);
                            shards.len -= 1;
                        }
                        if !dirty.contains(&prefix) {
                            dirty.push(prefix);
                        }
                    }
                    None => break,
                }
            }
        }

        for prefix in dirty {
            self.write_shard(&prefix)?;
        }
        Ok(())
    }

    /// Serialize one shard through a temp file and rename into place.
    fn write_shard(&self, prefix: &str) -> Result<(), BlockError> {
        let entries = {
            let shards = self.shards.read().unwrap();
            shards.by_shard.get(prefix).cloned().unwrap_or_default()
        };
        let payload = serde_json::to_vec(&entries).map_err(|e| BlockError::CacheIo {
            detail: format!("serialize shard {prefix}: {e}"),
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| {
            BlockError::CacheIo {
                detail: format!("temp file in {}: {e}", self.dir.display()),
            }
        })?;
        tmp.write_all(&payload).map_err(|e| BlockError::CacheIo {
            detail: format!("write shard {prefix}: {e}"),
        })?;
        tmp.persist(self.dir.join(format!("{prefix}.json")))
            .map_err(|e| BlockError::CacheIo {
                detail: format!("rename shard {prefix}: {e}"),
            })?;
        Ok(())
    }
}

fn shard_prefix(fingerprint: &str) -> &str {
    fingerprint.get(..2).unwrap_or("00")
}
