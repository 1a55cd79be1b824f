//! Per-document tracing, stage audits, and the hard preservation
//! assertions.
//!
//! Each document gets one [`Tracer`]: spans per pipeline stage with
//! stage-specific metadata, a census audit at every stage boundary, and a
//! summary written to `trace.json`. Audits are not passive — a decrease in
//! the image-block count between consecutive stages is promoted to the
//! fatal [`PipelineError::ImagePreservationViolation`], naming the exact
//! stage where the count dropped.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::model::BlockCensus;

/// Pipeline stages, in order. Audit boundaries sit between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    Extraction,
    Reconciliation,
    Routing,
    Translation,
    Assembly,
}

/// One finished span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanRecord {
    pub name: String,
    pub processing_ms: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// One stage-boundary audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub stage: Stage,
    pub census: BlockCensus,
}

/// The serialisable trace summary (`trace.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSummary {
    pub trace_id: String,
    pub document_id: String,
    pub started_at: DateTime<Utc>,
    pub spans: Vec<SpanRecord>,
    pub audits: Vec<AuditRecord>,
    /// Issues flagged during the run (preservation below 100%, visual
    /// extractor loss, failed splits).
    pub issues: Vec<String>,
    pub image_preservation_rate: f64,
}

/// An open span handle; finish it with [`Tracer::end_span`].
pub struct SpanHandle {
    name: String,
    started: Instant,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl SpanHandle {
    pub fn set<T: Serialize>(&mut self, key: &str, value: T) {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.insert(key.to_string(), v);
        }
    }
}

/// Observability state for one document's traversal of the pipeline.
pub struct Tracer {
    trace_id: String,
    document_id: String,
    started_at: DateTime<Utc>,
    spans: Vec<SpanRecord>,
    audits: Vec<AuditRecord>,
    issues: Vec<String>,
}

impl Tracer {
    pub fn new(document_id: &str) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            started_at: Utc::now(),
            spans: Vec::new(),
            audits: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn begin_span(&self, name: &str) -> SpanHandle {
        SpanHandle {
            name: name.to_string(),
            started: Instant::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn end_span(&mut self, span: SpanHandle) {
        self.spans.push(SpanRecord {
            name: span.name,
            processing_ms: span.started.elapsed().as_millis() as u64,
            metadata: span.metadata,
        });
    }

    /// Record a stage-boundary census and enforce image preservation
    /// against the previous audit.
    pub fn audit(&mut self, stage: Stage, census: BlockCensus) -> Result<(), PipelineError> {
        info!(
            ?stage,
            total = census.total_blocks,
            images = census.image_blocks,
            text = census.text_blocks,
            math = census.math_blocks,
            tables = census.table_blocks,
            "stage audit"
        );

        if let Some(prev) = self.audits.last() {
            if census.image_blocks < prev.census.image_blocks {
                error!(
                    ?stage,
                    before = prev.census.image_blocks,
                    after = census.image_blocks,
                    "image count decreased between stages"
                );
                let violation = PipelineError::ImagePreservationViolation {
                    stage,
                    before: prev.census.image_blocks,
                    after: census.image_blocks,
                };
                self.audits.push(AuditRecord { stage, census });
                return Err(violation);
            }
        }

        self.audits.push(AuditRecord { stage, census });
        Ok(())
    }

    /// Flag a non-fatal issue for the summary.
    pub fn flag(&mut self, issue: impl Into<String>) {
        self.issues.push(issue.into());
    }

    pub fn issues(&self) -> &[String] {
        &self.issues
    }

    /// Build the summary. The preservation rate compares the first and
    /// last audited image counts; anything under 100% is flagged.
    pub fn summary(&self) -> TraceSummary {
        let first_images = self.audits.first().map(|a| a.census.image_blocks);
        let last_images = self.audits.last().map(|a| a.census.image_blocks);
        let rate = match (first_images, last_images) {
            (Some(0), _) | (None, _) => 1.0,
            (Some(first), Some(last)) => (last.min(first)) as f64 / first as f64,
            _ => 1.0,
        };

        let mut issues = self.issues.clone();
        if rate < 1.0 {
            issues.push(format!(
                "image preservation rate {:.1}% (below 100%)",
                rate * 100.0
            ));
        }

        TraceSummary {
            trace_id: self.trace_id.clone(),
            document_id: self.document_id.clone(),
            started_at: self.started_at,
            spans: self.spans.clone(),
            audits: self.audits.clone(),
            issues,
            image_preservation_rate: rate,
        }
    }

    /// Write `trace.json` atomically (temp file + rename).
    pub fn write_summary(&self, path: &Path) -> Result<(), PipelineError> {
        let summary = self.summary();
        let payload = serde_json::to_vec_pretty(&summary)
            .map_err(|e| PipelineError::Internal(format!("serialize trace: {e}")))?;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(|e| PipelineError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut tmp =
            tempfile::NamedTempFile::new_in(dir).map_err(|e| PipelineError::OutputWriteFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
        tmp.write_all(&payload)
            .map_err(|e| PipelineError::OutputWriteFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
        tmp.persist(path)
            .map_err(|e| PipelineError::OutputWriteFailed {
                path: path.to_path_buf(),
                source: e.error,
            })?;
        Ok(())
    }
}

/// Hard end-of-run assertions: image counts equal, every heading has
/// exactly one TOC entry, every TOC bookmark resolves. Violations are
/// fatal for the document.
pub fn assert_preservation(
    original_images: usize,
    translated_images: usize,
    heading_bookmarks: &[String],
    toc_bookmarks: &[String],
) -> Result<(), PipelineError> {
    if original_images != translated_images {
        return Err(PipelineError::ImagePreservationViolation {
            stage: Stage::Assembly,
            before: original_images,
            after: translated_images,
        });
    }
    if heading_bookmarks.len() != toc_bookmarks.len() {
        return Err(PipelineError::AssemblerInvariant(format!(
            "{} headings but {} TOC entries",
            heading_bookmarks.len(),
            toc_bookmarks.len()
        )));
    }
    for bookmark in toc_bookmarks {
        if !heading_bookmarks.contains(bookmark) {
            return Err(PipelineError::AssemblerInvariant(format!(
                "TOC references unknown bookmark '{bookmark}'"
            )));
        }
    }
    Ok(())
}
