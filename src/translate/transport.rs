//! The transport form: how block groups travel to the endpoint and back.
//!
//! Grouped blocks are concatenated with an item separator and paragraph
//! breaks are replaced by an atomic placeholder token, so one API call can
//! carry several blocks without the model blurring their boundaries. On
//! the way back the split is attempted with the primary separator first,
//! then down a fallback chain of progressively weaker heuristics — models
//! occasionally mangle separators, and losing a whole batch to a mangled
//! `%%%%ITEM_BREAK%%%%` is far worse than a best-effort re-split.
//!
//! ## Cleanup rules
//!
//! Raw endpoint output is cleaned deterministically before splitting:
//! outer code fences stripped (models wrap output in fences despite being
//! told not to), line endings normalised, trailing whitespace trimmed,
//! blank-line runs collapsed. Each rule is a pure `&str → String` pass.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Atomic paragraph-break placeholder. The translator is instructed to
/// preserve it verbatim.
pub const PARAGRAPH_BREAK: &str = "[[PARAGRAPH_BREAK]]";

/// Separator between grouped blocks.
pub const ITEM_BREAK: &str = "%%%%ITEM_BREAK%%%%";

/// Separator variants models tend to produce in place of the real one.
const ALTERNATIVE_SEPARATORS: &[&str] = &[
    "%%%% ITEM_BREAK %%%%",
    "%%%%ITEM BREAK%%%%",
    "ITEM_BREAK",
    "\n---\n",
    "\n***\n",
];

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown)?\n(.*)\n```\s*$").unwrap());
static RE_BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());
static RE_HEADER_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#{1,6}\s+").unwrap());
static RE_LIST_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*(?:[-*+]|\d+\.)\s+").unwrap());
static RE_SENTENCE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?。；;]\s+").unwrap());

// ── Packing ──────────────────────────────────────────────────────────────

/// Serialise a group of block texts into one transport payload.
pub fn join_blocks(texts: &[String]) -> String {
    texts
        .iter()
        .map(|t| t.replace("\n\n", PARAGRAPH_BREAK))
        .collect::<Vec<_>>()
        .join(&format!("\n{ITEM_BREAK}\n"))
}

/// Restore paragraph breaks in one split part.
fn restore_paragraphs(part: &str) -> String {
    part.trim().replace(PARAGRAPH_BREAK, "\n\n")
}

// ── Splitting ────────────────────────────────────────────────────────────

/// How the response was mapped back onto its source blocks. The method
/// degrades the quality score recorded in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitMethod {
    Primary,
    AlternativeSeparator,
    ParagraphBoundary,
    SentenceRegroup,
    FirstBlockOnly,
}

impl SplitMethod {
    /// Quality score contribution for cache writes: 1.0 for an exact
    /// split, lower for each recovery tier.
    pub fn quality_score(self) -> f32 {
        match self {
            SplitMethod::Primary => 1.0,
            SplitMethod::AlternativeSeparator => 0.9,
            SplitMethod::ParagraphBoundary => 0.75,
            SplitMethod::SentenceRegroup => 0.6,
            SplitMethod::FirstBlockOnly => 0.0,
        }
    }
}

/// Result of mapping an endpoint response back onto `expected` blocks.
#[derive(Debug, Clone)]
pub struct SplitResult {
    /// Always exactly `expected` entries. Entries past the first are empty
    /// only in the [`SplitMethod::FirstBlockOnly`] last resort.
    pub parts: Vec<String>,
    pub method: SplitMethod,
}

/// Split a cleaned response back into per-block texts.
///
/// `input_texts` are the original block texts, used by the proportional
/// sentence regrouping tier to size the output buckets.
pub fn split_response(output: &str, input_texts: &[String]) -> SplitResult {
    let expected = input_texts.len();
    assert!(expected > 0, "split_response needs at least one input block");

    if expected == 1 {
        return SplitResult {
            parts: vec![restore_paragraphs(output)],
            method: SplitMethod::Primary,
        };
    }

    // Tier 0: the primary separator, exactly as instructed.
    let primary: Vec<&str> = output.split(ITEM_BREAK).collect();
    if primary.len() == expected {
        return SplitResult {
            parts: primary.into_iter().map(restore_paragraphs).collect(),
            method: SplitMethod::Primary,
        };
    }

    // Tier 1: separator variants models substitute.
    for sep in ALTERNATIVE_SEPARATORS {
        let parts: Vec<&str> = output.split(sep).collect();
        if parts.len() == expected {
            debug!(separator = sep, "recovered split with alternative separator");
            return SplitResult {
                parts: parts.into_iter().map(restore_paragraphs).collect(),
                method: SplitMethod::AlternativeSeparator,
            };
        }
    }

    // Tier 2: paragraph boundaries ([[PARAGRAPH_BREAK]]-aware).
    let para_parts: Vec<&str> = if output.contains(PARAGRAPH_BREAK) {
        output.split(PARAGRAPH_BREAK).collect()
    } else {
        output.split("\n\n").collect()
    };
    if para_parts.len() == expected {
        debug!("recovered split at paragraph boundaries");
        return SplitResult {
            parts: para_parts.into_iter().map(restore_paragraphs).collect(),
            method: SplitMethod::ParagraphBoundary,
        };
    }

    // Tier 3: sentence split, regrouped proportionally to the input block
    // lengths while respecting sentence boundaries.
    if let Some(parts) = sentence_regroup(output, input_texts) {
        debug!("recovered split by proportional sentence regrouping");
        return SplitResult {
            parts,
            method: SplitMethod::SentenceRegroup,
        };
    }

    // Tier 4: last resort — everything to the first block.
    warn!(
        expected,
        got = primary.len(),
        "could not split grouped response; assigning all output to the first block"
    );
    let mut parts = vec![String::new(); expected];
    parts[0] = restore_paragraphs(output);
    SplitResult {
        parts,
        method: SplitMethod::FirstBlockOnly,
    }
}

/// Cut the output into sentences and pack them into `input_texts.len()`
/// buckets whose sizes are proportional to the input block lengths.
fn sentence_regroup(output: &str, input_texts: &[String]) -> Option<Vec<String>> {
    let sentences = split_sentences(output);
    if sentences.len() < input_texts.len() {
        return None;
    }

    let total_in: usize = input_texts.iter().map(|t| t.chars().count().max(1)).sum();
    let total_out: usize = sentences.iter().map(|s| s.chars().count()).sum();

    let mut parts = Vec::with_capacity(input_texts.len());
    let mut cursor = 0usize;
    let mut consumed_chars = 0usize;

    for (i, input) in input_texts.iter().enumerate() {
        let remaining_blocks = input_texts.len() - i;
        let remaining_sentences = sentences.len() - cursor;
        // Each later block must still receive at least one sentence.
        let max_take = remaining_sentences.saturating_sub(remaining_blocks - 1);

        let target_chars = if i + 1 == input_texts.len() {
            usize::MAX
        } else {
            let share = input.chars().count().max(1) as f64 / total_in as f64;
            consumed_chars + (share * total_out as f64).round() as usize
        };

        let mut bucket = String::new();
        let mut taken = 0usize;
        while cursor < sentences.len()
            && taken < max_take.max(1)
            && (bucket.is_empty() || consumed_chars < target_chars)
        {
            if !bucket.is_empty() {
                bucket.push(' ');
            }
            consumed_chars += sentences[cursor].chars().count();
            bucket.push_str(sentences[cursor].trim());
            cursor += 1;
            taken += 1;
        }
        parts.push(restore_paragraphs(&bucket));
    }

    // Any stragglers join the last bucket.
    if cursor < sentences.len() {
        let tail: Vec<&str> = sentences[cursor..].iter().map(|s| s.trim()).collect();
        let last = parts.last_mut().unwrap();
        if !last.is_empty() {
            last.push(' ');
        }
        last.push_str(&tail.join(" "));
    }

    Some(parts)
}

/// Cut an oversized text into chunks no larger than `max_chars`, breaking
/// only at sentence boundaries (a sentence longer than the cap becomes its
/// own chunk). Used when a single block exceeds the grouping size cap: the
/// chunks translate as separate calls and concatenate back losslessly.
pub fn chunk_sentences(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for sentence in split_sentences(text) {
        let sentence_len = sentence.chars().count();
        let current_len = current.chars().count();
        if !current.is_empty() && current_len + sentence_len > max_chars {
            chunks.push(std::mem::take(&mut current).trim().to_string());
        }
        current.push_str(&sentence);
    }
    if !current.trim().is_empty() {
        chunks.push(current.trim().to_string());
    }
    if chunks.is_empty() {
        chunks.push(text.trim().to_string());
    }
    chunks
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut last = 0usize;
    for m in RE_SENTENCE_END.find_iter(text) {
        sentences.push(text[last..m.end()].to_string());
        last = m.end();
    }
    if last < text.len() {
        let tail = text[last..].trim();
        if !tail.is_empty() {
            sentences.push(tail.to_string());
        }
    }
    sentences
}

// ── Response cleanup ─────────────────────────────────────────────────────

/// Deterministic cleanup of raw endpoint output, applied before splitting.
pub fn clean_response(raw: &str) -> String {
    let s = strip_outer_fences(raw);
    let s = s.replace("\r\n", "\n").replace('\r', "\n");
    let s: String = s
        .lines()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n");
    RE_BLANK_RUNS.replace_all(&s, "\n\n").trim().to_string()
}

fn strip_outer_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

// ── Structural validation ────────────────────────────────────────────────

/// Post-translation structural comparison between a source text and its
/// translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StructuralScores {
    pub header_score: f32,
    pub list_score: f32,
    pub paragraph_ok: bool,
    pub paragraph_ratio: f32,
}

impl StructuralScores {
    /// Pass when at least 2 of the 3 criteria clear, or the average of the
    /// three scores is ≥ 0.75.
    pub fn passes(&self) -> bool {
        let clears = [
            self.header_score >= 0.7,
            self.list_score >= 0.5,
            self.paragraph_ok,
        ]
        .iter()
        .filter(|&&c| c)
        .count();
        if clears >= 2 {
            return true;
        }
        let para_score = if self.paragraph_ok { 1.0 } else { self.paragraph_ratio };
        (self.header_score + self.list_score + para_score) / 3.0 >= 0.75
    }
}

/// Compare markdown structure between source and translation.
pub fn structural_scores(original: &str, translated: &str) -> StructuralScores {
    let count_ratio = |a: usize, b: usize| -> f32 {
        (a.min(b) as f32) / (a.max(b).max(1) as f32)
    };

    let in_headers = RE_HEADER_LINE.find_iter(original).count();
    let out_headers = RE_HEADER_LINE.find_iter(translated).count();
    let header_score = if in_headers == 0 && out_headers == 0 {
        1.0
    } else {
        count_ratio(in_headers, out_headers)
    };

    let in_lists = RE_LIST_LINE.find_iter(original).count();
    let out_lists = RE_LIST_LINE.find_iter(translated).count();
    let list_score = if in_lists == 0 && out_lists == 0 {
        1.0
    } else {
        count_ratio(in_lists, out_lists)
    };

    let in_breaks = original.matches("\n\n").count() + original.matches(PARAGRAPH_BREAK).count();
    let out_breaks =
        translated.matches("\n\n").count() + translated.matches(PARAGRAPH_BREAK).count();
    let diff = in_breaks.abs_diff(out_breaks);
    let paragraph_ok = diff * 2 <= in_breaks || (in_breaks == 0 && out_breaks == 0);
    let paragraph_ratio = count_ratio(in_breaks, out_breaks);

    StructuralScores {
        header_score,
        list_score,
        paragraph_ok,
        paragraph_ratio,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn split_of_join_is_identity() {
        let blocks = strings(&[
            "First block.\n\nWith two paragraphs.",
            "Second block.",
            "Third block with a [1] marker.",
        ]);
        let joined = join_blocks(&blocks);
        let result = split_response(&joined, &blocks);
        assert_eq!(result.method, SplitMethod::Primary);
        assert_eq!(result.parts, blocks);
    }

    #[test]
    fn paragraph_break_token_is_atomic_in_transport() {
        let blocks = strings(&["a\n\nb"]);
        let joined = join_blocks(&blocks);
        assert!(joined.contains(PARAGRAPH_BREAK));
        assert!(!joined.contains("\n\n"));
    }

    #[test]
    fn alternative_separator_recovers() {
        let inputs = strings(&["one", "two"]);
        let output = "uno\n---\ndos";
        let result = split_response(output, &inputs);
        assert_eq!(result.method, SplitMethod::AlternativeSeparator);
        assert_eq!(result.parts, vec!["uno", "dos"]);
        assert!(result.method.quality_score() < 1.0);
    }

    #[test]
    fn paragraph_boundary_recovers() {
        let inputs = strings(&["one", "two", "three"]);
        let output = "uno\n\ndos\n\ntres";
        let result = split_response(output, &inputs);
        assert_eq!(result.method, SplitMethod::ParagraphBoundary);
        assert_eq!(result.parts, vec!["uno", "dos", "tres"]);
    }

    #[test]
    fn sentence_regroup_respects_block_count() {
        let inputs = strings(&[
            "A fairly long first block that covers two sentences of source text.",
            "Short second.",
        ]);
        // No separators survived at all; four sentences came back.
        let output = "Primera frase larga. Segunda frase tambien larga. Tercera. Cuarta.";
        let result = split_response(output, &inputs);
        assert_eq!(result.method, SplitMethod::SentenceRegroup);
        assert_eq!(result.parts.len(), 2);
        assert!(!result.parts[0].is_empty());
        assert!(!result.parts[1].is_empty());
        // Nothing lost, nothing duplicated.
        let rejoined = result.parts.join(" ");
        for word in ["Primera", "Segunda", "Tercera", "Cuarta"] {
            assert_eq!(rejoined.matches(word).count(), 1, "word {word}");
        }
    }

    #[test]
    fn last_resort_assigns_all_to_first() {
        let inputs = strings(&["one", "two", "three"]);
        let output = "an unsplittable blob";
        let result = split_response(output, &inputs);
        assert_eq!(result.method, SplitMethod::FirstBlockOnly);
        assert_eq!(result.parts[0], "an unsplittable blob");
        assert!(result.parts[1].is_empty() && result.parts[2].is_empty());
        assert_eq!(result.method.quality_score(), 0.0);
    }

    #[test]
    fn chunking_respects_cap_and_loses_nothing() {
        let text = "First sentence here. Second sentence follows. Third one too. Fourth closes.";
        let chunks = chunk_sentences(text, 30);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 60, "chunk too large: {chunk}");
        }
        let rejoined = chunks.join(" ");
        fn words(s: &str) -> Vec<&str> {
            s.split_whitespace().collect::<Vec<_>>()
        }
        assert_eq!(words(&rejoined), words(text));
    }

    #[test]
    fn single_giant_sentence_is_one_chunk() {
        let text = "no sentence boundary in this entire run of words at all";
        let chunks = chunk_sentences(text, 10);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn cleanup_strips_fences_and_normalises() {
        let raw = "```markdown\n# Title\r\n\r\nBody   \n\n\n\n\nMore\n```";
        let cleaned = clean_response(raw);
        assert!(cleaned.starts_with("# Title"));
        assert!(!cleaned.contains("\r"));
        assert!(!cleaned.contains("\n\n\n"));
        assert!(!cleaned.contains("```"));
    }

    #[test]
    fn structural_scores_pass_on_faithful_translation() {
        let original = "# Title\n\n- one\n- two\n\nA paragraph.";
        let translated = "# Titel\n\n- eins\n- zwei\n\nEin Absatz.";
        let scores = structural_scores(original, translated);
        assert!(scores.passes(), "{scores:?}");
    }

    #[test]
    fn structural_scores_fail_on_dropped_headers_and_lists() {
        let original = "# A\n\n## B\n\n- one\n- two\n- three\n\ntext\n\nmore\n\nyet more";
        let translated = "all flattened into a single line of prose";
        let scores = structural_scores(original, translated);
        assert!(!scores.passes(), "{scores:?}");
    }

    #[test]
    fn plain_text_with_no_structure_passes_trivially() {
        let scores = structural_scores("plain sentence", "einfacher Satz");
        assert!(scores.passes());
        assert_eq!(scores.header_score, 1.0);
        assert_eq!(scores.list_score, 1.0);
    }
}
