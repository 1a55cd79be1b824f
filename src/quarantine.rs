//! The quarantine store: a durable record of terminally failed blocks.
//!
//! Append-only JSON-lines, one file per document, guarded by a mutex on
//! the append path. The main pipeline continues after quarantining by
//! substituting the block's original text and setting the
//! `TRANSLATION_FAILED` marker; the store exists so a post-run report (or
//! a retry tool) can see exactly what failed and why, with the
//! surrounding context.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{BlockError, PipelineError};

/// One quarantined block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub document_id: String,
    pub block_id: String,
    pub block_type: String,
    pub original_text: String,
    pub last_error: BlockError,
    pub attempt_count: u32,
    pub timestamp: DateTime<Utc>,
    /// Effective text of the blocks immediately before and after, for
    /// human triage.
    pub context_neighbors: Vec<String>,
}

/// Append-only store rooted at a directory; entries land in
/// `<dir>/<document_id>.jsonl`.
pub struct QuarantineStore {
    directory: PathBuf,
    retention_days: u32,
    append_lock: Mutex<()>,
    appended: Mutex<usize>,
}

impl QuarantineStore {
    pub fn open(directory: &Path, retention_days: u32) -> Result<Self, PipelineError> {
        std::fs::create_dir_all(directory).map_err(|e| PipelineError::OutputWriteFailed {
            path: directory.to_path_buf(),
            source: e,
        })?;
        Ok(Self {
            directory: directory.to_path_buf(),
            retention_days,
            append_lock: Mutex::new(()),
            appended: Mutex::new(0),
        })
    }

    /// Append one entry. Failures here must never take the pipeline down;
    /// they degrade to a logged warning.
    pub fn append(&self, entry: &QuarantineEntry) {
        let _guard = self.append_lock.lock().unwrap();
        let path = self.directory.join(format!("{}.jsonl", entry.document_id));

        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            let line = serde_json::to_string(entry)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
            Ok(())
        };

        match write() {
            Ok(()) => {
                *self.appended.lock().unwrap() += 1;
                info!(
                    block = entry.block_id,
                    kind = entry.block_type,
                    "block quarantined: {}",
                    entry.last_error
                );
            }
            Err(e) => warn!("failed to write quarantine entry: {e}"),
        }
    }

    /// Number of entries appended by this handle.
    pub fn appended_count(&self) -> usize {
        *self.appended.lock().unwrap()
    }

    /// Read back a document's entries (triage tooling, tests).
    pub fn entries_for(&self, document_id: &str) -> Vec<QuarantineEntry> {
        let path = self.directory.join(format!("{document_id}.jsonl"));
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return Vec::new();
        };
        raw.lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Delete quarantine files older than the retention window. Returns
    /// the number of files removed.
    pub fn sweep_expired(&self) -> usize {
        let cutoff = Utc::now() - Duration::days(self.retention_days as i64);
        let mut removed = 0usize;

        let Ok(read_dir) = std::fs::read_dir(&self.directory) else {
            return 0;
        };
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|modified| DateTime::<Utc>::from(modified) < cutoff)
                .unwrap_or(false);
            if expired && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "swept expired quarantine files");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(document_id: &str, block_id: &str) -> QuarantineEntry {
        QuarantineEntry {
            document_id: document_id.to_string(),
            block_id: block_id.to_string(),
            block_type: "table".to_string(),
            original_text: "| a | b |".to_string(),
            last_error: BlockError::ValidationFailed {
                attempts: 2,
                issues: "row count mismatch".to_string(),
            },
            attempt_count: 3,
            timestamp: Utc::now(),
            context_neighbors: vec!["before text".into(), "after text".into()],
        }
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = QuarantineStore::open(dir.path(), 30).unwrap();

        store.append(&entry("doc-1", "b1"));
        store.append(&entry("doc-1", "b2"));
        store.append(&entry("doc-2", "b3"));

        let doc1 = store.entries_for("doc-1");
        assert_eq!(doc1.len(), 2);
        assert_eq!(doc1[0].block_id, "b1");
        assert_eq!(doc1[1].block_id, "b2");
        assert_eq!(doc1[0].context_neighbors.len(), 2);

        assert_eq!(store.entries_for("doc-2").len(), 1);
        assert_eq!(store.appended_count(), 3);
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = QuarantineStore::open(dir.path(), 30).unwrap();
            store.append(&entry("doc-1", "b1"));
        }
        let store = QuarantineStore::open(dir.path(), 30).unwrap();
        assert_eq!(store.entries_for("doc-1").len(), 1);
    }

    #[test]
    fn sweep_keeps_fresh_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = QuarantineStore::open(dir.path(), 30).unwrap();
        store.append(&entry("doc-1", "b1"));
        // Freshly written: nothing to sweep.
        assert_eq!(store.sweep_expired(), 0);
        assert_eq!(store.entries_for("doc-1").len(), 1);
    }
}
