//! The document translation entry point.
//!
//! [`Pipeline::translate_document`] drives the full staged flow:
//! extraction (both extractors in parallel) → reconciliation → routing →
//! cached/batched translation → two-pass assembly, with the tracer
//! auditing every stage boundary and the quarantine store catching
//! terminally failed blocks.
//!
//! ## Ownership model
//!
//! One controller per document: this function owns the [`Document`] and is
//! the only writer. Workers translate batches concurrently and hand back
//! `(block id, result)` pairs; the controller applies them in document
//! order, so order is preserved end to end no matter how batches complete.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::assemble;
use crate::cache::{CacheHit, CacheKey, TranslationCache};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::executor::{
    plan_batches, BatchExecutor, CancelFlag, ExecutorItem, RateLimiter,
};
use crate::extract::{
    ExtractorError, LayoutExtractor, LayoutOutput, VisualAsset, VisualExtractor,
};
use crate::model::{BlockCensus, BlockKind, Document};
use crate::quarantine::{QuarantineEntry, QuarantineStore};
use crate::reconcile::{self, spatial};
use crate::retry::RetryPolicy;
use crate::route::{route_block, Route, Strategy};
use crate::trace::{assert_preservation, Stage, Tracer};
use crate::translate::corrective::{CorrectiveParams, SelfCorrectingTranslator};
use crate::translate::validator::render_table;
use crate::translate::TranslationProvider;

/// Final statistics for one document run.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub pages: usize,
    pub blocks: usize,
    pub translated_blocks: usize,
    pub preserved_blocks: usize,
    pub cache_hits: u64,
    pub api_calls: u64,
    pub usage_tokens: u64,
    pub quarantined_blocks: usize,
    pub total_duration_ms: u64,
}

/// Result of a successful (possibly partial) document translation.
#[derive(Debug, Clone)]
pub struct TranslationOutcome {
    pub output_path: PathBuf,
    pub trace_path: Option<PathBuf>,
    pub toc_entries: usize,
    pub stats: PipelineStats,
    /// True when cancellation stopped the run early; completed batches
    /// were flushed to the cache and a rerun resumes from there.
    pub cancelled: bool,
}

impl TranslationOutcome {
    /// Partial success: the document was produced but carries
    /// `[TRANSLATION_FAILED]` substitutions.
    pub fn is_partial(&self) -> bool {
        self.stats.quarantined_blocks > 0
    }
}

/// The configured pipeline: collaborators injected once, documents
/// translated many times.
pub struct Pipeline {
    config: PipelineConfig,
    layout_extractors: Vec<Arc<dyn LayoutExtractor>>,
    visual_extractor: Arc<dyn VisualExtractor>,
    provider: Arc<dyn TranslationProvider>,
    cache: Arc<TranslationCache>,
}

impl Pipeline {
    /// Build a pipeline, validating the configuration (exit code 1 on
    /// failure). The cache is constructed from the config; use
    /// [`Pipeline::with_cache`] to inject one (tests pass memory-only
    /// handles).
    pub fn new(
        config: PipelineConfig,
        layout_extractors: Vec<Arc<dyn LayoutExtractor>>,
        visual_extractor: Arc<dyn VisualExtractor>,
        provider: Arc<dyn TranslationProvider>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        if layout_extractors.is_empty() {
            return Err(PipelineError::ConfigInvalid(
                "at least one layout extractor is required".into(),
            ));
        }
        let cache = Arc::new(TranslationCache::new(&config.cache));
        Ok(Self {
            config,
            layout_extractors,
            visual_extractor,
            provider,
            cache,
        })
    }

    pub fn with_cache(
        config: PipelineConfig,
        layout_extractors: Vec<Arc<dyn LayoutExtractor>>,
        visual_extractor: Arc<dyn VisualExtractor>,
        provider: Arc<dyn TranslationProvider>,
        cache: Arc<TranslationCache>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        if layout_extractors.is_empty() {
            return Err(PipelineError::ConfigInvalid(
                "at least one layout extractor is required".into(),
            ));
        }
        Ok(Self {
            config,
            layout_extractors,
            visual_extractor,
            provider,
            cache,
        })
    }

    pub fn cache(&self) -> &Arc<TranslationCache> {
        &self.cache
    }

    /// Translate one PDF into `<output_dir>/<stem>/output.md` (plus
    /// assets, trace, and quarantine records).
    pub async fn translate_document(
        &self,
        input_pdf: &Path,
        output_dir: &Path,
        target_language_override: Option<&str>,
        cancel: &CancelFlag,
    ) -> Result<TranslationOutcome, PipelineError> {
        let total_start = Instant::now();
        let target_language = target_language_override
            .unwrap_or(&self.config.translation.target_language)
            .to_string();

        info!(
            input = %input_pdf.display(),
            target = target_language,
            "starting document translation"
        );

        // ── Step 1: Resolve and verify the input ─────────────────────────
        resolve_input(input_pdf)?;
        let stem = input_pdf
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("document")
            .to_string();
        let document_dir = output_dir.join(&stem);

        let mut tracer = Tracer::new(&stem);

        // ── Step 2: Run both extractors in parallel ──────────────────────
        let extraction_span = tracer.begin_span("content_extraction");
        let image_span = tracer.begin_span("image_extraction");

        let extractor_timeout =
            Duration::from_secs(self.config.translation.extractor_timeout_seconds);
        let (layout, visuals) = tokio::join!(
            self.run_layout_extraction(input_pdf, extractor_timeout),
            self.run_visual_extraction(input_pdf, extractor_timeout),
        );
        let layout = layout?;

        // The visual extractor failing is recoverable: image-less
        // document, flagged trace.
        let visuals = match visuals {
            Ok(assets) => Some(assets),
            Err(e) => {
                warn!("visual extraction failed; continuing without images: {e}");
                tracer.flag(format!("visual extractor failed: {e}"));
                None
            }
        };

        // The extraction census counts assets *after* the decorative
        // filter — decorative elements are outside the preservation
        // contract.
        let filtered_visuals = visuals
            .map(|v| spatial::filter_decorative(v, &self.config.reconciliation));
        let extraction_census = BlockCensus {
            total_blocks: layout.fragments.len()
                + filtered_visuals.as_ref().map_or(0, Vec::len),
            image_blocks: filtered_visuals.as_ref().map_or(0, Vec::len),
            text_blocks: layout.fragments.len(),
            math_blocks: 0,
            table_blocks: 0,
        };

        let mut span = extraction_span;
        span.set("fragments", layout.fragments.len());
        span.set("pages", layout.page_count);
        tracer.end_span(span);
        let mut span = image_span;
        span.set("images_found", extraction_census.image_blocks);
        tracer.end_span(span);

        tracer.audit(Stage::Extraction, extraction_census)?;
        let original_image_count = extraction_census.image_blocks;

        // ── Step 3: Reconcile into the document model ────────────────────
        let mut doc =
            reconcile::reconcile(&layout, filtered_visuals, &self.config.reconciliation)?;
        doc.source_path = Some(input_pdf.to_path_buf());
        tracer.audit(Stage::Reconciliation, doc.census())?;

        // ── Step 4: Route every block ────────────────────────────────────
        let routes: HashMap<_, _> = doc
            .blocks()
            .map(|b| (b.id, route_block(b, &self.config.routing)))
            .collect();

        // Preserve strategies apply immediately: original text copied
        // through, no API call.
        let mut preserved_blocks = 0usize;
        for block in doc.blocks_mut() {
            let route = &routes[&block.id];
            if route.strategy == Strategy::Preserve {
                preserved_blocks += 1;
                if !matches!(block.kind, BlockKind::ImagePlaceholder { .. }) {
                    block.translated_text = Some(block.original_text.clone());
                }
            }
        }
        tracer.audit(Stage::Routing, doc.census())?;

        // ── Step 5: Cache lookups, then batch the misses ─────────────────
        let translation_span = tracer.begin_span("translation");
        let mut items: Vec<ExecutorItem> = Vec::new();
        let mut cache_applied: Vec<(crate::model::BlockId, String)> = Vec::new();

        for block in doc.blocks() {
            let route = &routes[&block.id];
            if !route.strategy.uses_endpoint() {
                continue;
            }
            let payload = translation_payload(block);
            let key = CacheKey::new(&payload, &target_language, &route.model);
            match self.cache.lookup(&key) {
                Some(hit) => {
                    debug!(block = %block.id, "cache hit");
                    cache_applied.push((block.id, hit.translation().to_string()));
                    if let CacheHit::Semantic { similarity, .. } = hit {
                        debug!(similarity, "semantic reuse");
                    }
                }
                None => items.push(ExecutorItem {
                    block_id: block.id,
                    text: payload,
                    route: route.clone(),
                    groupable: groupable(block, route),
                }),
            }
        }

        for (block_id, translation) in cache_applied {
            if let Some(block) = doc.find_block_mut(block_id) {
                block.translated_text = Some(translation);
            }
        }

        let batches = plan_batches(items, &self.config.grouping);

        // ── Step 6: Execute the batches ──────────────────────────────────
        let corrective = Arc::new(SelfCorrectingTranslator::new(
            self.provider.clone(),
            CorrectiveParams {
                target_language: target_language.clone(),
                source_language_hint: None,
                temperature: self.config.translation.temperature,
                max_correction_attempts: self.config.self_correction.max_attempts,
            },
        ));
        let limiter = (self.config.translation.requests_per_minute > 0).then(|| {
            Arc::new(RateLimiter::new(self.config.translation.requests_per_minute))
        });
        let executor = BatchExecutor {
            provider: self.provider.clone(),
            cache: self.cache.clone(),
            corrective,
            limiter,
            target_language: target_language.clone(),
            source_language_hint: None,
            temperature: self.config.translation.temperature,
            max_concurrent: self.config.translation.max_concurrent_translations,
            max_group_size_chars: self.config.grouping.max_group_size_chars,
        };

        let (results, exec_stats) = executor.run(batches, cancel).await?;
        let cancelled = cancel.is_cancelled();

        // ── Step 7: Apply results and quarantine terminal failures ───────
        let quarantine_dir = resolve_dir(&self.config.quarantine.directory, &document_dir);
        let quarantine = QuarantineStore::open(&quarantine_dir, self.config.quarantine.retention_days)?;
        quarantine.sweep_expired();

        let neighbors = neighbor_texts(&doc);
        let mut quarantined = 0usize;
        for result in results {
            let Some(block) = doc.find_block_mut(result.block_id) else {
                continue;
            };
            match (result.translation, result.error) {
                (Some(translation), None) => {
                    block.translated_text = Some(translation);
                }
                (_, Some(error)) if error.quarantines() => {
                    quarantined += 1;
                    let entry = QuarantineEntry {
                        document_id: stem.clone(),
                        block_id: block.id.to_string(),
                        block_type: block.kind.name().to_string(),
                        original_text: block.original_text.clone(),
                        last_error: error,
                        attempt_count: self.config.self_correction.max_attempts + 1,
                        timestamp: Utc::now(),
                        context_neighbors: neighbors
                            .get(&block.id)
                            .cloned()
                            .unwrap_or_default(),
                    };
                    block.mark_translation_failed();
                    quarantine.append(&entry);
                }
                (_, Some(error)) => {
                    // Failed split / cache degradation: keep the original
                    // text, log, continue.
                    warn!(block = %block.id, "non-quarantining failure: {error}");
                    tracer.flag(format!("block {}: {error}", block.id));
                    block.translated_text = Some(block.original_text.clone());
                    block
                        .metadata
                        .insert("failed_split".into(), "true".into());
                }
                (None, None) => {
                    // Cancellation skipped this batch entirely.
                    debug!(block = %block.id, "block skipped by cancellation");
                }
            }
        }

        let cache_stats = self.cache.stats();
        let mut span = translation_span;
        span.set("api_calls", exec_stats.api_calls);
        span.set("cache_hits", cache_stats.exact_hits + cache_stats.semantic_hits);
        span.set("validation_passes", exec_stats.validation_passes);
        span.set("validation_failures", exec_stats.validation_failures);
        span.set("quarantined", quarantined);
        tracer.end_span(span);
        tracer.audit(Stage::Translation, doc.census())?;

        // ── Step 8: Assemble (two passes) ────────────────────────────────
        let assembly_span = tracer.begin_span("assembly");
        doc.validate()?;
        let assembled = assemble::assemble(&doc)?;

        let heading_bookmarks: Vec<String> = doc
            .headings()
            .filter_map(|h| h.bookmark_id().map(str::to_string))
            .collect();
        let toc_bookmarks: Vec<String> =
            assembled.toc.iter().map(|t| t.bookmark_id.clone()).collect();
        assert_preservation(
            original_image_count,
            doc.image_placeholder_count(),
            &heading_bookmarks,
            &toc_bookmarks,
        )?;
        tracer.audit(Stage::Assembly, doc.census())?;

        // ── Step 9: Write artifacts ──────────────────────────────────────
        let written = assemble::write_artifacts(&doc, &assembled, &document_dir)?;

        let mut span = assembly_span;
        span.set("toc_entries", assembled.toc.len());
        span.set("images_preserved", doc.image_placeholder_count());
        tracer.end_span(span);

        let trace_path = if self.config.tracing.enable {
            let path = document_dir.join("trace.json");
            tracer.write_summary(&path)?;
            Some(path)
        } else {
            None
        };

        // ── Step 10: Final stats ─────────────────────────────────────────
        let translated_blocks = doc
            .blocks()
            .filter(|b| b.translated_text.is_some() && !b.translation_failed())
            .count();
        let stats = PipelineStats {
            pages: doc.pages.len(),
            blocks: doc.block_count(),
            translated_blocks,
            preserved_blocks,
            cache_hits: cache_stats.exact_hits + cache_stats.semantic_hits,
            api_calls: exec_stats.api_calls,
            usage_tokens: exec_stats.usage_tokens,
            quarantined_blocks: quarantined,
            total_duration_ms: total_start.elapsed().as_millis() as u64,
        };

        info!(
            blocks = stats.blocks,
            translated = stats.translated_blocks,
            cache_hits = stats.cache_hits,
            quarantined = stats.quarantined_blocks,
            duration_ms = stats.total_duration_ms,
            "document translation complete"
        );

        Ok(TranslationOutcome {
            output_path: written.output_path,
            trace_path,
            toc_entries: assembled.toc.len(),
            stats,
            cancelled,
        })
    }

    /// Layout extraction with health check, per-engine retries, and
    /// fall-through to the next configured engine.
    async fn run_layout_extraction(
        &self,
        pdf: &Path,
        budget: Duration,
    ) -> Result<LayoutOutput, PipelineError> {
        let policy = RetryPolicy::extractor();
        let mut attempts_total = 0u32;
        let mut last_error = String::new();

        for extractor in &self.layout_extractors {
            if let Err(e) = extractor.health_check().await {
                warn!(engine = extractor.name(), "health check failed: {e}");
                last_error = e.to_string();
                continue;
            }

            for attempt in 1..=policy.max_attempts {
                attempts_total += 1;
                match timeout(budget, extractor.extract(pdf, None)).await {
                    Ok(Ok(output)) => {
                        info!(engine = extractor.name(), "layout extraction succeeded");
                        return Ok(output);
                    }
                    Ok(Err(ExtractorError::CorruptInput(detail))) => {
                        // No engine will parse a corrupt file.
                        return Err(PipelineError::CorruptInput {
                            path: pdf.to_path_buf(),
                            detail,
                        });
                    }
                    Ok(Err(e)) => {
                        warn!(
                            engine = extractor.name(),
                            attempt, "layout extraction failed: {e}"
                        );
                        last_error = e.to_string();
                    }
                    Err(_) => {
                        warn!(engine = extractor.name(), attempt, "layout extraction timed out");
                        last_error = format!("timed out after {}s", budget.as_secs());
                    }
                }
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.delay(attempt)).await;
                }
            }
        }

        Err(PipelineError::ExtractorExhausted {
            attempts: attempts_total,
            extractors: self.layout_extractors.len(),
            detail: last_error,
        })
    }

    async fn run_visual_extraction(
        &self,
        pdf: &Path,
        budget: Duration,
    ) -> Result<Vec<VisualAsset>, ExtractorError> {
        self.visual_extractor.health_check().await?;
        match timeout(budget, self.visual_extractor.extract(pdf)).await {
            Ok(result) => result,
            Err(_) => Err(ExtractorError::Timeout {
                secs: budget.as_secs(),
            }),
        }
    }
}

/// Validate the input path and PDF magic bytes.
fn resolve_input(path: &Path) -> Result<(), PipelineError> {
    if !path.exists() {
        return Err(PipelineError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    match std::fs::File::open(path) {
        Ok(mut f) => {
            use std::io::Read;
            let mut magic = [0u8; 4];
            if f.read_exact(&mut magic).is_ok() && &magic != b"%PDF" {
                return Err(PipelineError::NotAPdf {
                    path: path.to_path_buf(),
                    magic,
                });
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(PipelineError::PermissionDenied {
                path: path.to_path_buf(),
            })
        }
        Err(_) => Err(PipelineError::FileNotFound {
            path: path.to_path_buf(),
        }),
    }
}

/// The text payload sent to the translator for a block.
fn translation_payload(block: &crate::model::ContentBlock) -> String {
    match &block.kind {
        BlockKind::Table { rows, header_rows, .. } => render_table(rows, *header_rows),
        _ => block.original_text.clone(),
    }
}

/// Headings and footnotes form singleton batches; self-correcting blocks
/// never group either.
fn groupable(block: &crate::model::ContentBlock, route: &Route) -> bool {
    if route.strategy == Strategy::SelfCorrecting {
        return false;
    }
    !matches!(
        block.kind,
        BlockKind::Heading { .. } | BlockKind::Footnote { .. }
    )
}

/// Effective text of each block's immediate neighbours, for quarantine
/// context.
fn neighbor_texts(
    doc: &Document,
) -> HashMap<crate::model::BlockId, Vec<String>> {
    let ordered: Vec<_> = doc.blocks().collect();
    let mut map = HashMap::new();
    for (i, block) in ordered.iter().enumerate() {
        let mut neighbors = Vec::new();
        if i > 0 {
            neighbors.push(truncate(&ordered[i - 1].original_text, 120));
        }
        if i + 1 < ordered.len() {
            neighbors.push(truncate(&ordered[i + 1].original_text, 120));
        }
        map.insert(block.id, neighbors);
    }
    map
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn resolve_dir(configured: &Path, document_dir: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        document_dir.join(configured)
    }
}

/// Map a run result to the documented process exit codes.
///
/// `0` success; `1` configuration error; `2` fatal extractor/input error;
/// `3` endpoint unreachable; `4` partial success with quarantined blocks;
/// `5` other document-fatal errors (codes above 4 are reserved).
pub fn exit_code_for(result: &Result<TranslationOutcome, PipelineError>) -> i32 {
    match result {
        Ok(outcome) if outcome.is_partial() => 4,
        Ok(_) => 0,
        Err(PipelineError::ConfigInvalid(_)) | Err(PipelineError::ConfigUnreadable { .. }) => 1,
        Err(PipelineError::FileNotFound { .. })
        | Err(PipelineError::PermissionDenied { .. })
        | Err(PipelineError::NotAPdf { .. })
        | Err(PipelineError::ExtractorExhausted { .. })
        | Err(PipelineError::CorruptInput { .. }) => 2,
        Err(PipelineError::EndpointUnreachable(_)) => 3,
        Err(_) => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_contract() {
        let ok = Ok(TranslationOutcome {
            output_path: PathBuf::from("out.md"),
            trace_path: None,
            toc_entries: 0,
            stats: PipelineStats::default(),
            cancelled: false,
        });
        assert_eq!(exit_code_for(&ok), 0);

        let partial = Ok(TranslationOutcome {
            output_path: PathBuf::from("out.md"),
            trace_path: None,
            toc_entries: 0,
            stats: PipelineStats {
                quarantined_blocks: 2,
                ..Default::default()
            },
            cancelled: false,
        });
        assert_eq!(exit_code_for(&partial), 4);

        assert_eq!(
            exit_code_for(&Err(PipelineError::ConfigInvalid("x".into()))),
            1
        );
        assert_eq!(
            exit_code_for(&Err(PipelineError::ExtractorExhausted {
                attempts: 3,
                extractors: 1,
                detail: "down".into()
            })),
            2
        );
        assert_eq!(
            exit_code_for(&Err(PipelineError::EndpointUnreachable("dns".into()))),
            3
        );
        assert_eq!(
            exit_code_for(&Err(PipelineError::AssemblerInvariant("toc".into()))),
            5
        );
    }

    #[test]
    fn magic_byte_check_rejects_non_pdf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.pdf");
        std::fs::write(&path, b"MZ\x90\x00not a pdf").unwrap();
        assert!(matches!(
            resolve_input(&path),
            Err(PipelineError::NotAPdf { .. })
        ));

        let real = dir.path().join("real.pdf");
        std::fs::write(&real, b"%PDF-1.7 rest of file").unwrap();
        assert!(resolve_input(&real).is_ok());

        assert!(matches!(
            resolve_input(Path::new("/definitely/missing.pdf")),
            Err(PipelineError::FileNotFound { .. })
        ));
    }
}
