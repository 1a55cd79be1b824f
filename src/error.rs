//! Error types for the pdftrans library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`] — **Fatal for a document (or the process)**: the
//!   translation cannot proceed at all (bad input file, invalid config,
//!   layout extraction exhausted its retries, an assembler invariant broke).
//!   Returned as `Err(PipelineError)` from the top-level `translate_document`
//!   entry point.
//!
//! * [`BlockError`] — **Non-fatal**: a single content block failed
//!   (validation never converged, the endpoint blocked that exact text, a
//!   split could not be recovered) but the rest of the document is fine.
//!   Block errors are recorded in the quarantine store and the document
//!   continues with the original text substituted in place.
//!
//! The separation lets callers decide their own tolerance: abort on the
//! first quarantined block, log and continue, or inspect the quarantine
//! directory for a post-run report. The process exit code reflects the
//! worst document outcome (see [`crate::convert::exit_code_for`]).

use std::path::PathBuf;
use thiserror::Error;

use crate::trace::Stage;

/// All fatal errors returned by the pdftrans library.
///
/// Block-level failures use [`BlockError`] and are stored in the quarantine
/// store rather than propagated here.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── Configuration errors (exit code 1) ────────────────────────────────
    /// A configuration value failed validation.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The configuration file could not be read or parsed.
    #[error("Failed to load configuration from '{path}': {detail}")]
    ConfigUnreadable { path: PathBuf, detail: String },

    // ── Extractor errors (exit code 2) ────────────────────────────────────
    /// Every configured layout extractor failed after all retries.
    ///
    /// The visual extractor failing is *not* fatal — the document proceeds
    /// without images and the trace is flagged.
    #[error("Layout extraction failed after {attempts} attempts across {extractors} extractor(s): {detail}")]
    ExtractorExhausted {
        attempts: u32,
        extractors: usize,
        detail: String,
    },

    /// The PDF itself is corrupt; retrying another extractor will not help.
    /// The file is quarantined and other documents continue.
    #[error("PDF '{path}' is corrupt and was quarantined: {detail}")]
    CorruptInput { path: PathBuf, detail: String },

    // ── Translation endpoint errors (exit code 3) ─────────────────────────
    /// The endpoint could not be reached at all (DNS, connect, auth).
    ///
    /// Distinct from per-batch transient failures, which retry and then
    /// quarantine only the affected blocks.
    #[error("Translation endpoint unreachable: {0}")]
    EndpointUnreachable(String),

    // ── Document-fatal invariants ─────────────────────────────────────────
    /// The assembler detected a broken invariant (TOC/heading mismatch,
    /// dangling bookmark). Fatal for this document; the trace is dumped.
    #[error("Assembler invariant violated: {0}")]
    AssemblerInvariant(String),

    /// An image placeholder was dropped between two pipeline stages.
    ///
    /// Images may be reordered but never lost; this names the exact stage
    /// boundary where the count decreased.
    #[error("Image preservation violated at stage {stage:?}: {before} images before, {after} after")]
    ImagePreservationViolation {
        stage: Stage,
        before: usize,
        after: usize,
    },

    /// The document model failed its own validation (duplicate ids,
    /// dangling caption target, unresolved asset).
    #[error("Document invariant violated: {0}")]
    DocumentInvariant(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output artifact.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error scoped to a single content block.
///
/// Stored in the quarantine record when a block fails terminally. The
/// overall translation continues with `original_text` substituted and a
/// `TRANSLATION_FAILED` marker in the block's metadata.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum BlockError {
    /// The endpoint rate-limited the batch and backoff retries ran out.
    #[error("rate limited after {retries} retries: {detail}")]
    RateLimited { retries: u32, detail: String },

    /// A transient endpoint failure (5xx, timeout) survived all retries.
    #[error("endpoint transient failure after {retries} retries: {detail}")]
    EndpointTransient { retries: u32, detail: String },

    /// The endpoint refused this exact text (safety / recitation / other).
    /// Never retried on the same prompt.
    #[error("endpoint blocked the text: {reason}")]
    EndpointBlocked { reason: String },

    /// Structural validation failed and the self-correction budget is spent.
    #[error("validation failed after {attempts} correction attempts: {issues}")]
    ValidationFailed { attempts: u32, issues: String },

    /// A grouped response could not be split back onto its source blocks.
    /// Logged, not quarantined — the first block receives the whole output.
    #[error("grouped response could not be split: {detail}")]
    FailedSplit { detail: String },

    /// A cache tier failed an I/O operation. The tier is skipped and the
    /// pipeline degrades to uncached operation.
    #[error("cache I/O error: {detail}")]
    CacheIo { detail: String },
}

impl BlockError {
    /// Whether this failure should land the block in quarantine.
    ///
    /// Failed splits and cache degradation are logged but the block keeps
    /// its (possibly imperfect) result; everything else quarantines.
    pub fn quarantines(&self) -> bool {
        !matches!(
            self,
            BlockError::FailedSplit { .. } | BlockError::CacheIo { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_preservation_display_names_stage() {
        let e = PipelineError::ImagePreservationViolation {
            stage: Stage::Translation,
            before: 4,
            after: 3,
        };
        let msg = e.to_string();
        assert!(msg.contains("Translation"), "got: {msg}");
        assert!(msg.contains("4 images before"), "got: {msg}");
    }

    #[test]
    fn blocked_error_quarantines_but_failed_split_does_not() {
        let blocked = BlockError::EndpointBlocked {
            reason: "safety_blocked".into(),
        };
        let split = BlockError::FailedSplit {
            detail: "separator count mismatch".into(),
        };
        assert!(blocked.quarantines());
        assert!(!split.quarantines());
    }

    #[test]
    fn block_error_serialises() {
        let e = BlockError::ValidationFailed {
            attempts: 2,
            issues: "row count mismatch".into(),
        };
        let json = serde_json::to_string(&e).unwrap();
        let back: BlockError = serde_json::from_str(&json).unwrap();
        assert!(back.to_string().contains("row count mismatch"));
    }
}
