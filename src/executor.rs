//! The async batch executor: grouped, rate-limited, cancellable dispatch.
//!
//! Translation tasks run as *batches* built by the grouping policy:
//! compatible consecutive blocks (same strategy and model) are packed into
//! the transport form up to the size and item caps. Headings, footnotes,
//! and self-correcting blocks always travel alone. Batches run under
//! `buffer_unordered` bounded by the concurrency cap — the same bounded
//! fan-out the rest of the pipeline uses — so memory stays proportional to
//! the cap, not to the document.
//!
//! Batches may complete out of order; results are keyed by block id and
//! the controller applies them in document order, so block order in the
//! document is preserved end to end.
//!
//! A `length_cap` finish reason halves the batch and retries both halves;
//! blocked finish reasons fail only the affected blocks. Cancellation is
//! cooperative: each batch checks the flag before starting and the
//! executor returns the partial results already computed (all of which
//! have been flushed to the cache).

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tokio::sync::watch;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, TranslationCache};
use crate::config::GroupingConfig;
use crate::error::{BlockError, PipelineError};
use crate::model::BlockId;
use crate::prompts;
use crate::retry::{call_with_retry, CallError};
use crate::route::{Route, Strategy};
use crate::translate::corrective::SelfCorrectingTranslator;
use crate::translate::transport;
use crate::translate::{TranslationProvider, TranslationRequest};

// ── Cancellation ─────────────────────────────────────────────────────────

/// Cooperative per-document cancellation flag.
///
/// Cloneable; `cancel()` trips every clone. Awaitables check it at their
/// next suspension point.
#[derive(Debug, Clone)]
pub struct CancelFlag {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

// ── Rate limiting ────────────────────────────────────────────────────────

/// Token-bucket limiter parameterised by requests per minute.
pub struct RateLimiter {
    state: tokio::sync::Mutex<BucketState>,
    per_second: f64,
    capacity: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        let per_second = requests_per_minute as f64 / 60.0;
        // A small burst allowance smooths start-up without defeating the
        // average rate.
        let capacity = (requests_per_minute as f64 / 6.0).max(1.0);
        Self {
            state: tokio::sync::Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            per_second,
            capacity,
        }
    }

    /// Wait until a request token is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.per_second).min(self.capacity);
                state.last_refill = Instant::now();
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.per_second)
            };
            sleep(wait).await;
        }
    }
}

// ── Batching ─────────────────────────────────────────────────────────────

/// One unit of work handed to the executor.
#[derive(Debug, Clone)]
pub struct ExecutorItem {
    pub block_id: BlockId,
    pub text: String,
    pub route: Route,
    /// False for headings, footnotes, and self-correcting blocks, which
    /// always form singleton batches.
    pub groupable: bool,
}

/// A planned batch: consecutive compatible items.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: usize,
    pub items: Vec<ExecutorItem>,
}

impl Batch {
    pub fn strategy(&self) -> Strategy {
        self.items[0].route.strategy
    }

    pub fn model(&self) -> &str {
        &self.items[0].route.model
    }

    pub fn char_count(&self) -> usize {
        self.items.iter().map(|i| i.text.chars().count()).sum()
    }
}

/// Build batches from items in document order.
///
/// Compatibility = same strategy and model; the combined size and item
/// count stay within the configured caps. Non-groupable items and
/// grouping-disabled runs produce singleton batches.
pub fn plan_batches(items: Vec<ExecutorItem>, config: &GroupingConfig) -> Vec<Batch> {
    let mut batches: Vec<Batch> = Vec::new();
    let mut current: Vec<ExecutorItem> = Vec::new();
    let mut current_chars = 0usize;
    let mut next_id = 1usize;

    let mut flush = |current: &mut Vec<ExecutorItem>, current_chars: &mut usize, next_id: &mut usize, batches: &mut Vec<Batch>| {
        if !current.is_empty() {
            batches.push(Batch {
                id: *next_id,
                items: std::mem::take(current),
            });
            *next_id += 1;
            *current_chars = 0;
        }
    };

    for item in items {
        let chars = item.text.chars().count();

        let singleton = !config.enable || !item.groupable;
        if singleton {
            flush(&mut current, &mut current_chars, &mut next_id, &mut batches);
            batches.push(Batch {
                id: next_id,
                items: vec![item],
            });
            next_id += 1;
            continue;
        }

        let compatible = current.last().is_some_and(|prev| {
            prev.route.strategy == item.route.strategy && prev.route.model == item.route.model
        });
        let fits = current_chars + chars <= config.max_group_size_chars
            && current.len() < config.max_items_per_group;

        if !current.is_empty() && (!compatible || !fits) {
            flush(&mut current, &mut current_chars, &mut next_id, &mut batches);
        }

        current_chars += chars;
        current.push(item);
    }
    flush(&mut current, &mut current_chars, &mut next_id, &mut batches);

    batches
}

// ── Execution ────────────────────────────────────────────────────────────

/// Per-block result delivered back to the controller.
#[derive(Debug, Clone)]
pub struct BlockResult {
    pub block_id: BlockId,
    pub translation: Option<String>,
    /// Quality score for cache accounting (split method × validation).
    pub quality: f32,
    pub error: Option<BlockError>,
}

/// Aggregate counters for the trace.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutorStats {
    pub api_calls: u64,
    pub usage_tokens: u64,
    pub validation_passes: u64,
    pub validation_failures: u64,
    pub batches_split_on_length_cap: u64,
}

/// Shared pieces each batch task needs.
pub struct BatchExecutor {
    pub provider: Arc<dyn TranslationProvider>,
    pub cache: Arc<TranslationCache>,
    pub corrective: Arc<SelfCorrectingTranslator>,
    pub limiter: Option<Arc<RateLimiter>>,
    pub target_language: String,
    pub source_language_hint: Option<String>,
    pub temperature: f32,
    pub max_concurrent: usize,
    /// Grouping size cap, reused as the chunking bound for a single block
    /// that exceeds it on its own.
    pub max_group_size_chars: usize,
}

impl BatchExecutor {
    /// Run all batches under the concurrency cap. Returns per-block
    /// results (possibly partial under cancellation) and aggregate stats.
    ///
    /// `Err` only for a fatal unreachable endpoint.
    pub async fn run(
        &self,
        batches: Vec<Batch>,
        cancel: &CancelFlag,
    ) -> Result<(Vec<BlockResult>, ExecutorStats), PipelineError> {
        let total = batches.len();
        info!(batches = total, cap = self.max_concurrent, "dispatching translation batches");

        let outcomes: Vec<Result<(Vec<BlockResult>, ExecutorStats), PipelineError>> =
            stream::iter(batches.into_iter().map(|batch| {
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        debug!(batch = batch.id, "skipping batch after cancellation");
                        return Ok((Vec::new(), ExecutorStats::default()));
                    }
                    self.run_batch(batch).await
                }
            }))
            .buffer_unordered(self.max_concurrent.max(1))
            .collect()
            .await;

        let mut results = Vec::new();
        let mut stats = ExecutorStats::default();
        for outcome in outcomes {
            let (mut block_results, batch_stats) = outcome?;
            results.append(&mut block_results);
            stats.api_calls += batch_stats.api_calls;
            stats.usage_tokens += batch_stats.usage_tokens;
            stats.validation_passes += batch_stats.validation_passes;
            stats.validation_failures += batch_stats.validation_failures;
            stats.batches_split_on_length_cap += batch_stats.batches_split_on_length_cap;
        }
        Ok((results, stats))
    }

    async fn run_batch(
        &self,
        batch: Batch,
    ) -> Result<(Vec<BlockResult>, ExecutorStats), PipelineError> {
        let mut stats = ExecutorStats::default();

        let results = match batch.strategy() {
            Strategy::SelfCorrecting => {
                let mut results = Vec::with_capacity(batch.items.len());
                for item in &batch.items {
                    results.push(self.run_corrective(item, &mut stats).await?);
                }
                results
            }
            Strategy::MarkdownAwareQuality | Strategy::MarkdownAwareCost => {
                self.run_transport(&batch.items, &mut stats).await?
            }
            Strategy::Preserve => {
                // Preserve never reaches the executor; tolerate it anyway.
                batch
                    .items
                    .iter()
                    .map(|i| BlockResult {
                        block_id: i.block_id,
                        translation: Some(i.text.clone()),
                        quality: 1.0,
                        error: None,
                    })
                    .collect()
            }
        };

        Ok((results, stats))
    }

    /// Self-correcting path: one block at a time, cache-wrapped.
    async fn run_corrective(
        &self,
        item: &ExecutorItem,
        stats: &mut ExecutorStats,
    ) -> Result<BlockResult, PipelineError> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let outcome = self
            .corrective
            .translate_block(&item.text, &item.route.model)
            .await
            .map_err(PipelineError::EndpointUnreachable)?;

        stats.api_calls += 1 + outcome.attempts_used as u64;
        stats.usage_tokens += outcome.usage_tokens;

        if outcome.is_valid() {
            stats.validation_passes += 1;
            let key = CacheKey::new(&item.text, &self.target_language, &item.route.model);
            self.cache.store(&key, &outcome.translation, outcome.confidence);
            Ok(BlockResult {
                block_id: item.block_id,
                translation: Some(outcome.translation),
                quality: outcome.confidence,
                error: None,
            })
        } else {
            stats.validation_failures += 1;
            Ok(BlockResult {
                block_id: item.block_id,
                translation: None,
                quality: 0.0,
                error: outcome.failure,
            })
        }
    }

    /// Transport path: join → call → split (with fallbacks) → validate →
    /// escalate failures to the corrective loop.
    fn run_transport<'a>(
        &'a self,
        items: &'a [ExecutorItem],
        stats: &'a mut ExecutorStats,
    ) -> BoxFuture<'a, Result<Vec<BlockResult>, PipelineError>> {
        async move {
            // A lone block larger than the grouping cap is translated in
            // sentence-boundary chunks and reassembled.
            if items.len() == 1 && items[0].text.chars().count() > self.max_group_size_chars {
                let result = self.run_chunked(&items[0], stats).await?;
                return Ok(vec![result]);
            }

            if let Some(limiter) = &self.limiter {
                limiter.acquire().await;
            }

            let texts: Vec<String> = items.iter().map(|i| i.text.clone()).collect();
            let payload = transport::join_blocks(&texts);
            let model = items[0].route.model.clone();

            let request = TranslationRequest {
                text: payload,
                source_language_hint: self.source_language_hint.clone(),
                target_language: self.target_language.clone(),
                model_identifier: model.clone(),
                temperature: self.temperature,
                system_instructions: prompts::system_prompt(&self.target_language),
            };

            stats.api_calls += 1;
            let response = match call_with_retry(self.provider.as_ref(), &request).await {
                Ok(r) => r,
                Err(CallError::Unreachable(detail)) => {
                    return Err(PipelineError::EndpointUnreachable(detail));
                }
                Err(CallError::Block(e)) => {
                    return Ok(items
                        .iter()
                        .map(|i| BlockResult {
                            block_id: i.block_id,
                            translation: None,
                            quality: 0.0,
                            error: Some(e.clone()),
                        })
                        .collect());
                }
            };
            stats.usage_tokens += response.usage_tokens;

            // `length_cap`: halve the batch and retry both halves.
            if response.finish_reason == crate::translate::FinishReason::LengthCap
                && items.len() > 1
            {
                warn!(items = items.len(), "length cap hit; halving batch");
                stats.batches_split_on_length_cap += 1;
                let mid = items.len() / 2;
                let mut left = self.run_transport(&items[..mid], stats).await?;
                let right = self.run_transport(&items[mid..], stats).await?;
                left.extend(right);
                return Ok(left);
            }

            if response.finish_reason.is_blocked() {
                // Blocked is terminal for that exact text. A grouped
                // payload is not the same text as its members, so retry
                // the members individually and fail only the offender.
                if items.len() > 1 {
                    warn!(items = items.len(), "batch blocked; isolating members");
                    let mut results = Vec::with_capacity(items.len());
                    for item in items {
                        let singleton = std::slice::from_ref(item);
                        results.extend(self.run_transport(singleton, stats).await?);
                    }
                    return Ok(results);
                }
                let e = BlockError::EndpointBlocked {
                    reason: format!("{:?}", response.finish_reason),
                };
                return Ok(items
                    .iter()
                    .map(|i| BlockResult {
                        block_id: i.block_id,
                        translation: None,
                        quality: 0.0,
                        error: Some(e.clone()),
                    })
                    .collect());
            }

            let cleaned = transport::clean_response(&response.translated_text);
            let split = transport::split_response(&cleaned, &texts);
            let split_quality = split.method.quality_score();

            let mut results = Vec::with_capacity(items.len());
            for (idx, (item, part)) in items.iter().zip(split.parts.iter()).enumerate() {
                // A failed split assigns everything to the first block and
                // marks the rest failed-split (logged, not quarantined).
                if split.method == transport::SplitMethod::FirstBlockOnly && idx > 0 {
                    results.push(BlockResult {
                        block_id: item.block_id,
                        translation: None,
                        quality: 0.0,
                        error: Some(BlockError::FailedSplit {
                            detail: "grouped response assigned to first block".into(),
                        }),
                    });
                    continue;
                }

                let scores = transport::structural_scores(&item.text, part);
                if scores.passes() {
                    stats.validation_passes += 1;
                    let key = CacheKey::new(&item.text, &self.target_language, &model);
                    self.cache.store(&key, part, split_quality);
                    results.push(BlockResult {
                        block_id: item.block_id,
                        translation: Some(part.clone()),
                        quality: split_quality,
                        error: None,
                    });
                } else {
                    // Escalate to the self-correcting loop.
                    stats.validation_failures += 1;
                    debug!(block = %item.block_id, "transport validation failed; escalating");
                    let escalated = self.run_corrective(item, stats).await?;
                    results.push(escalated);
                }
            }
            Ok(results)
        }
        .boxed()
    }

    /// Translate one oversized block in grouping-bounded chunks and
    /// concatenate the part translations — no duplication, no loss.
    async fn run_chunked(
        &self,
        item: &ExecutorItem,
        stats: &mut ExecutorStats,
    ) -> Result<BlockResult, PipelineError> {
        let chunks = transport::chunk_sentences(&item.text, self.max_group_size_chars);
        info!(
            block = %item.block_id,
            chunks = chunks.len(),
            "block exceeds grouping cap; translating in chunks"
        );

        let mut parts: Vec<String> = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            if let Some(limiter) = &self.limiter {
                limiter.acquire().await;
            }
            let request = TranslationRequest {
                text: chunk.clone(),
                source_language_hint: self.source_language_hint.clone(),
                target_language: self.target_language.clone(),
                model_identifier: item.route.model.clone(),
                temperature: self.temperature,
                system_instructions: prompts::system_prompt(&self.target_language),
            };
            stats.api_calls += 1;
            let response = match call_with_retry(self.provider.as_ref(), &request).await {
                Ok(r) => r,
                Err(CallError::Unreachable(detail)) => {
                    return Err(PipelineError::EndpointUnreachable(detail));
                }
                Err(CallError::Block(e)) => {
                    return Ok(BlockResult {
                        block_id: item.block_id,
                        translation: None,
                        quality: 0.0,
                        error: Some(e),
                    });
                }
            };
            stats.usage_tokens += response.usage_tokens;
            if response.finish_reason.is_blocked() {
                return Ok(BlockResult {
                    block_id: item.block_id,
                    translation: None,
                    quality: 0.0,
                    error: Some(BlockError::EndpointBlocked {
                        reason: format!("{:?}", response.finish_reason),
                    }),
                });
            }
            parts.push(transport::clean_response(&response.translated_text));
        }

        stats.validation_passes += 1;
        let translation = parts.join(" ");
        let key = CacheKey::new(&item.text, &self.target_language, &item.route.model);
        self.cache.store(&key, &translation, 1.0);
        Ok(BlockResult {
            block_id: item.block_id,
            translation: Some(translation),
            quality: 1.0,
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Strategy;

    fn item(text: &str, strategy: Strategy, groupable: bool) -> ExecutorItem {
        ExecutorItem {
            block_id: BlockId::new(),
            text: text.to_string(),
            route: Route {
                strategy,
                model: "m".into(),
                complexity: 0.0,
            },
            groupable,
        }
    }

    #[test]
    fn grouping_respects_size_and_count_caps() {
        let config = GroupingConfig {
            enable: true,
            max_group_size_chars: 20,
            max_items_per_group: 8,
        };
        let items = vec![
            item("aaaaaaaaaa", Strategy::MarkdownAwareCost, true), // 10 chars
            item("bbbbbbbbbb", Strategy::MarkdownAwareCost, true), // 10 chars
            item("cccccccccc", Strategy::MarkdownAwareCost, true), // would exceed 20
        ];
        let batches = plan_batches(items, &config);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].items.len(), 2);
        assert_eq!(batches[1].items.len(), 1);
    }

    #[test]
    fn item_count_cap_applies() {
        let config = GroupingConfig {
            enable: true,
            max_group_size_chars: 100_000,
            max_items_per_group: 2,
        };
        let items = (0..5)
            .map(|_| item("x", Strategy::MarkdownAwareCost, true))
            .collect();
        let batches = plan_batches(items, &config);
        assert_eq!(batches.len(), 3);
    }

    #[test]
    fn non_groupable_items_are_singletons() {
        let config = GroupingConfig::default();
        let items = vec![
            item("para", Strategy::MarkdownAwareCost, true),
            item("Heading", Strategy::MarkdownAwareQuality, false),
            item("para 2", Strategy::MarkdownAwareCost, true),
        ];
        let batches = plan_batches(items, &config);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1].items[0].text, "Heading");
    }

    #[test]
    fn mixed_strategies_never_share_a_batch() {
        let config = GroupingConfig::default();
        let items = vec![
            item("a", Strategy::MarkdownAwareCost, true),
            item("b", Strategy::MarkdownAwareQuality, true),
            item("c", Strategy::MarkdownAwareQuality, true),
        ];
        let batches = plan_batches(items, &config);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].items.len(), 2);
    }

    #[test]
    fn grouping_disabled_yields_all_singletons() {
        let config = GroupingConfig {
            enable: false,
            ..Default::default()
        };
        let items = (0..4)
            .map(|_| item("x", Strategy::MarkdownAwareCost, true))
            .collect();
        let batches = plan_batches(items, &config);
        assert_eq!(batches.len(), 4);
    }

    #[tokio::test]
    async fn rate_limiter_enforces_spacing() {
        // 600 rpm = 10 per second; the bucket starts full (burst of 100).
        let limiter = RateLimiter::new(600);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        // The initial burst admits these immediately.
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn cancel_flag_trips_all_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }
}
