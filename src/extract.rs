//! External extraction interfaces: the layout (text/OCR) and visual
//! (figure) extractors.
//!
//! The pipeline never links a specific PDF engine. Both extractors are
//! object-safe async traits with a health-check-before-use contract; any
//! engine — a classic text extractor, an OCR model, a detection-based
//! layout service — plugs in behind the same two traits, and the choice is
//! configuration, not code.
//!
//! ## Failure contract
//!
//! * [`ExtractorError::Unavailable`] and [`ExtractorError::Timeout`] are
//!   retryable; the pipeline backs off and then tries the next configured
//!   layout extractor before declaring the document fatal.
//! * [`ExtractorError::CorruptInput`] is terminal for the PDF — another
//!   engine will not parse a broken file — and quarantines it.
//! * The *visual* extractor failing for any reason is recoverable: the
//!   document proceeds without images and the trace is flagged.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::model::BBox;

/// Errors surfaced by either extractor.
#[derive(Debug, Clone, Error)]
pub enum ExtractorError {
    /// The engine is not installed, not responding, or failed its health
    /// check. Retry with backoff, then fall through to the alternative.
    #[error("extractor unavailable: {0}")]
    Unavailable(String),

    /// The engine exceeded its per-document budget.
    #[error("extractor timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The PDF cannot be parsed by any engine. Quarantine the file.
    #[error("corrupt input: {0}")]
    CorruptInput(String),
}

impl ExtractorError {
    /// Whether a retry (possibly with another engine) can help.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExtractorError::CorruptInput(_))
    }
}

/// One positioned text fragment with its font attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextFragment {
    pub text: String,
    pub bbox: BBox,
    pub font_name: String,
    pub font_size: f32,
    pub bold: bool,
    pub italic: bool,
    /// 0-indexed page.
    pub page_index: usize,
}

/// A rectangular region the extractor flagged as special.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionHint {
    pub page_index: usize,
    pub bbox: BBox,
}

/// Structural hints the layout extractor attaches to its fragment stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockHints {
    pub latex_spans: Vec<RegionHint>,
    pub table_regions: Vec<RegionHint>,
    pub figure_placeholders: Vec<RegionHint>,
    pub heading_candidates: Vec<RegionHint>,
}

/// Complete output of the layout extractor for one PDF.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayoutOutput {
    pub page_count: usize,
    /// Uniform page geometry in the same coordinate space as the bboxes.
    pub page_width: f32,
    pub page_height: f32,
    /// Ordered per page, top to bottom as emitted by the engine.
    pub fragments: Vec<TextFragment>,
    pub hints: BlockHints,
}

impl LayoutOutput {
    pub fn fragments_for_page(&self, page_index: usize) -> impl Iterator<Item = &TextFragment> {
        self.fragments
            .iter()
            .filter(move |f| f.page_index == page_index)
    }
}

/// One binary figure from the visual extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualAsset {
    pub asset_id: String,
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub bbox: BBox,
    /// 0-indexed page.
    pub page_index: usize,
    pub min_dim_px: u32,
    pub aspect_ratio: f32,
}

/// The text/structure source of the hybrid reconciler.
#[async_trait]
pub trait LayoutExtractor: Send + Sync {
    /// Short engine name for logs and the trace.
    fn name(&self) -> &str;

    /// Cheap liveness probe, called before `extract`. Engines that spawn
    /// subprocesses or load models verify them here so failures surface as
    /// [`ExtractorError::Unavailable`] instead of a mid-extraction crash.
    async fn health_check(&self) -> Result<(), ExtractorError>;

    /// Extract the fragment stream and block hints for the whole PDF
    /// (or a page range when `pages` is given, 0-indexed inclusive).
    async fn extract(
        &self,
        pdf_path: &Path,
        pages: Option<(usize, usize)>,
    ) -> Result<LayoutOutput, ExtractorError>;
}

/// The figure/binary source of the hybrid reconciler.
#[async_trait]
pub trait VisualExtractor: Send + Sync {
    fn name(&self) -> &str;

    async fn health_check(&self) -> Result<(), ExtractorError>;

    /// Extract all embedded raster figures. Implementations should already
    /// drop decorative elements, but the reconciler re-filters by
    /// `min_dim_px` and `aspect_ratio` regardless.
    async fn extract(&self, pdf_path: &Path) -> Result<Vec<VisualAsset>, ExtractorError>;
}

// ── Fixture extractors ───────────────────────────────────────────────────
//
// Deterministic in-process extractors returning pre-built outputs. The
// test-suite builds whole pipelines on these; they are also the quickest
// way to drive the pipeline from content produced by an out-of-process
// engine.

/// A [`LayoutExtractor`] that returns a fixed [`LayoutOutput`].
#[derive(Debug, Clone)]
pub struct FixtureLayoutExtractor {
    pub output: LayoutOutput,
    pub healthy: bool,
}

impl FixtureLayoutExtractor {
    pub fn new(output: LayoutOutput) -> Self {
        Self {
            output,
            healthy: true,
        }
    }

    /// A fixture that fails its health check, for fallback-path tests.
    pub fn unhealthy() -> Self {
        Self {
            output: LayoutOutput::default(),
            healthy: false,
        }
    }
}

#[async_trait]
impl LayoutExtractor for FixtureLayoutExtractor {
    fn name(&self) -> &str {
        "fixture-layout"
    }

    async fn health_check(&self) -> Result<(), ExtractorError> {
        if self.healthy {
            Ok(())
        } else {
            Err(ExtractorError::Unavailable("fixture marked unhealthy".into()))
        }
    }

    async fn extract(
        &self,
        _pdf_path: &Path,
        _pages: Option<(usize, usize)>,
    ) -> Result<LayoutOutput, ExtractorError> {
        if !self.healthy {
            return Err(ExtractorError::Unavailable("fixture marked unhealthy".into()));
        }
        Ok(self.output.clone())
    }
}

/// A [`VisualExtractor`] that returns fixed assets.
#[derive(Debug, Clone, Default)]
pub struct FixtureVisualExtractor {
    pub assets: Vec<VisualAsset>,
    pub fail: bool,
}

impl FixtureVisualExtractor {
    pub fn new(assets: Vec<VisualAsset>) -> Self {
        Self {
            assets,
            fail: false,
        }
    }

    /// A fixture whose extraction fails, to exercise the image-less
    /// recovery path.
    pub fn failing() -> Self {
        Self {
            assets: Vec::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl VisualExtractor for FixtureVisualExtractor {
    fn name(&self) -> &str {
        "fixture-visual"
    }

    async fn health_check(&self) -> Result<(), ExtractorError> {
        if self.fail {
            Err(ExtractorError::Unavailable("fixture marked failing".into()))
        } else {
            Ok(())
        }
    }

    async fn extract(&self, _pdf_path: &Path) -> Result<Vec<VisualAsset>, ExtractorError> {
        if self.fail {
            return Err(ExtractorError::Unavailable("fixture marked failing".into()));
        }
        Ok(self.assets.clone())
    }
}

/// Convenience builder for fixture fragments.
pub fn fragment(text: &str, page_index: usize, bbox: BBox, size: f32) -> TextFragment {
    TextFragment {
        text: text.to_string(),
        bbox,
        font_name: "Times".to_string(),
        font_size: size,
        bold: false,
        italic: false,
        page_index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_input_is_not_retryable() {
        assert!(!ExtractorError::CorruptInput("xref broken".into()).is_retryable());
        assert!(ExtractorError::Unavailable("down".into()).is_retryable());
        assert!(ExtractorError::Timeout { secs: 1200 }.is_retryable());
    }

    #[tokio::test]
    async fn fixture_layout_round_trips_output() {
        let output = LayoutOutput {
            page_count: 1,
            page_width: 612.0,
            page_height: 792.0,
            fragments: vec![fragment("hello", 0, BBox::new(0.0, 0.0, 100.0, 12.0), 10.0)],
            hints: BlockHints::default(),
        };
        let ex = FixtureLayoutExtractor::new(output.clone());
        ex.health_check().await.unwrap();
        let got = ex.extract(Path::new("/dev/null"), None).await.unwrap();
        assert_eq!(got, output);
    }

    #[tokio::test]
    async fn failing_visual_extractor_reports_unavailable() {
        let ex = FixtureVisualExtractor::failing();
        assert!(ex.health_check().await.is_err());
        assert!(ex.extract(Path::new("/dev/null")).await.is_err());
    }
}
