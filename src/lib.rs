//! # pdftrans
//!
//! Translate complex PDFs (academic papers, technical manuals) into a
//! target language while preserving structure: headings, paragraphs,
//! footnotes, tables, formulas, lists, and embedded figures. A table of
//! contents with page numbers and working cross-references is
//! regenerated; figures pass through byte-identical; footnotes relocate
//! to a tail "Notes" section.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Extract    layout extractor (text + structure hints) ∥ visual
//!  │                extractor (figure binaries), in parallel
//!  ├─ 2. Reconcile  fuse both streams into one ordered Document
//!  │                (font analysis, classification, merging, reading order)
//!  ├─ 3. Route      per-block strategy: preserve / self-correcting /
//!  │                markdown-aware cost or quality tier
//!  ├─ 4. Translate  two-tier semantic cache → batched endpoint calls →
//!  │                structural validation → targeted correction loop
//!  ├─ 5. Assemble   pass 1: content + bookmarks + page estimation
//!  │                pass 2: table of contents with page numbers
//!  └─ 6. Output     output.md + assets/ + trace.json (+ quarantine/)
//! ```
//!
//! A tracer threads through every stage and audits block counts at each
//! boundary — an image lost anywhere between extraction and assembly is a
//! fatal error naming the exact stage. Blocks that fail terminally are
//! quarantined and the document continues with the original text marked
//! `[TRANSLATION_FAILED]`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pdftrans::{
//!     CancelFlag, FixtureLayoutExtractor, FixtureVisualExtractor, HttpProvider,
//!     LayoutOutput, Pipeline, PipelineConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = PipelineConfig::default();
//!     config.translation.target_language = "Greek".into();
//!     config.translation.endpoint_url = "http://localhost:8089/translate".into();
//!
//!     let provider = Arc::new(HttpProvider::new(
//!         &config.translation.endpoint_url,
//!         config.translation.resolve_api_key(),
//!         config.translation.request_timeout_seconds,
//!     )?);
//!     // Swap the fixtures for a real engine behind the same traits.
//!     let layout = Arc::new(FixtureLayoutExtractor::new(LayoutOutput::default()));
//!     let visual = Arc::new(FixtureVisualExtractor::default());
//!
//!     let pipeline = Pipeline::new(config, vec![layout], visual, provider)?;
//!     let outcome = pipeline
//!         .translate_document(
//!             "paper.pdf".as_ref(),
//!             "out".as_ref(),
//!             None,
//!             &CancelFlag::new(),
//!         )
//!         .await?;
//!     println!("wrote {}", outcome.output_path.display());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdftrans` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pdftrans = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod assemble;
pub mod cache;
pub mod config;
pub mod convert;
pub mod error;
pub mod executor;
pub mod extract;
pub mod model;
pub mod prompts;
pub mod quarantine;
pub mod reconcile;
pub mod retry;
pub mod route;
pub mod trace;
pub mod translate;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cache::{CacheHit, CacheKey, CacheStats, TranslationCache};
pub use config::{PipelineConfig, RoutingProfile};
pub use convert::{exit_code_for, Pipeline, PipelineStats, TranslationOutcome};
pub use error::{BlockError, PipelineError};
pub use executor::CancelFlag;
pub use extract::{
    BlockHints, ExtractorError, FixtureLayoutExtractor, FixtureVisualExtractor, LayoutExtractor,
    LayoutOutput, TextFragment, VisualAsset, VisualExtractor,
};
pub use model::{BlockKind, ContentBlock, Document};
pub use translate::{
    FinishReason, HttpProvider, ProviderError, TranslationProvider, TranslationRequest,
    TranslationResponse,
};
