//! Global font analysis and per-fragment block classification.
//!
//! Classification runs with a fixed precedence so that a fragment matching
//! several rules lands in the most specific kind: LaTeX math beats code,
//! code beats tables, tables beat footnotes, footnotes beat headings,
//! headings beat list items, and everything else is a paragraph.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::ReconciliationConfig;
use crate::extract::{LayoutOutput, TextFragment};
use crate::model::{BlockKind, ContentBlock, DisplayMode, FontProfile, FontStyle};

// ── Pattern tables ───────────────────────────────────────────────────────

static RE_DISPLAY_MATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\$\$[\s\S]+\$\$|\\begin\{(equation|align|gather)\*?\})").unwrap());
static RE_INLINE_MATH_ONLY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\$[^$]+\$\s*$").unwrap());
static RE_CODE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^```(\w+)?").unwrap());
static RE_FOOTNOTE_LEAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:\[(\d+)\]|\((\d+)\)|(\d+)\.|([ivxlcdm]+)\.|(\*))\s+(\S.*)$").unwrap()
});
static RE_SECTION_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+(?:\.\d+)*)\s+").unwrap());
static RE_BULLET: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\s*)([-*+•])\s+\S").unwrap());
static RE_ORDERED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\s*)(\d+[.)]|[a-z][.)])\s+\S").unwrap());

/// Semantic keywords that promote a short line to a heading even when the
/// font evidence is inconclusive.
const HEADING_KEYWORDS: &[&str] = &[
    "introduction",
    "chapter",
    "conclusion",
    "abstract",
    "references",
    "appendix",
    "acknowledgements",
];

// ── Font analysis ────────────────────────────────────────────────────────

/// Tally (name, size, bold, italic) frequency across the whole document.
/// The most frequent style becomes *body*; styles at least
/// `heading_min_font_ratio` × body size whose fragments stay short are
/// heading-eligible, levelled by size rank (largest → H1).
pub fn analyze_fonts(layout: &LayoutOutput, config: &ReconciliationConfig) -> FontProfile {
    let mut tally: HashMap<FontStyle, usize> = HashMap::new();
    for frag in &layout.fragments {
        let style = FontStyle::new(&frag.font_name, frag.font_size, frag.bold, frag.italic);
        *tally.entry(style).or_insert(0) += frag.text.chars().count().max(1);
    }

    let body = tally
        .iter()
        .max_by_key(|(_, &count)| count)
        .map(|(style, _)| style.clone());

    let mut heading_sizes = Vec::new();
    if let Some(body_style) = &body {
        let min_heading_tenths =
            (body_style.size() * config.heading_min_font_ratio * 10.0).round() as u32;

        // Only sizes whose fragments are consistently short qualify.
        let mut eligible: Vec<u32> = tally
            .keys()
            .filter(|s| s.size_tenths >= min_heading_tenths)
            .filter(|s| style_is_short(layout, s, config))
            .map(|s| s.size_tenths)
            .collect();
        eligible.sort_unstable_by(|a, b| b.cmp(a));
        eligible.dedup();
        eligible.truncate(6);
        heading_sizes = eligible;
    }

    FontProfile {
        body,
        heading_sizes,
    }
}

/// Whether every fragment of a style fits the heading length budget.
fn style_is_short(layout: &LayoutOutput, style: &FontStyle, config: &ReconciliationConfig) -> bool {
    layout
        .fragments
        .iter()
        .filter(|f| {
            FontStyle::new(&f.font_name, f.font_size, f.bold, f.italic) == *style
        })
        .all(|f| within_heading_budget(&f.text, config))
}

fn within_heading_budget(text: &str, config: &ReconciliationConfig) -> bool {
    text.split_whitespace().count() <= config.heading_max_words
        && text.chars().count() <= config.heading_max_chars
}

// ── Classification ───────────────────────────────────────────────────────

/// Classify one fragment into a prototype block.
///
/// Table rows are detected here but assembled into a single Table block by
/// the caller (consecutive rows coalesce).
pub fn classify_fragment(
    frag: &TextFragment,
    profile: &FontProfile,
    page_height: f32,
    config: &ReconciliationConfig,
) -> ContentBlock {
    let text = frag.text.trim();
    let page_number = frag.page_index + 1;

    // 1. LaTeX delimiters win outright.
    if RE_DISPLAY_MATH.is_match(text) {
        return ContentBlock::new(
            BlockKind::MathFormula {
                latex: text.to_string(),
                display_mode: DisplayMode::Block,
            },
            page_number,
            frag.bbox,
            text,
        );
    }
    if RE_INLINE_MATH_ONLY.is_match(text) {
        return ContentBlock::new(
            BlockKind::MathFormula {
                latex: text.to_string(),
                display_mode: DisplayMode::Inline,
            },
            page_number,
            frag.bbox,
            text,
        );
    }

    // 2. Fenced or indented monospace.
    if RE_CODE_FENCE.is_match(text) || looks_monospace(frag) {
        let language = RE_CODE_FENCE
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
        return ContentBlock::new(
            BlockKind::CodeBlock { language },
            page_number,
            frag.bbox,
            text,
        );
    }

    // 3. Table rows (coalesced by the caller).
    if is_table_row(text) {
        return ContentBlock::new(
            BlockKind::Table {
                rows: vec![parse_table_cells(text)],
                header_rows: 0,
                caption_id: None,
            },
            page_number,
            frag.bbox,
            text,
        );
    }

    // 4. Footnote candidates: marker prefix in the bottom ~15% of the
    //    page. The marker is stripped from the stored body; the assembler
    //    re-prefixes it in the Notes section.
    if frag.bbox.y0 >= page_height * 0.85 {
        if let Some((reference_id, body)) = footnote_reference(text) {
            return ContentBlock::new(
                BlockKind::Footnote {
                    reference_id,
                    origin_page: page_number,
                },
                page_number,
                frag.bbox,
                &body,
            );
        }
    }

    // 5. Headings: font evidence or semantic keywords, within the length
    //    budget (the length filter demotes oversized candidates).
    if within_heading_budget(text, config) {
        if let Some(level) = heading_level(frag, text, profile) {
            let mut block = ContentBlock::heading(page_number, frag.bbox, text, level);
            if let Some(caps) = RE_SECTION_NUMBER.captures(text) {
                if let BlockKind::Heading { numbering, .. } = &mut block.kind {
                    *numbering = Some(caps[1].to_string());
                }
            }
            return block;
        }
    }

    // 6. List items. Matched against the raw fragment — trimming would
    //    erase the indentation that encodes the nesting level.
    if let Some(caps) = RE_BULLET.captures(&frag.text) {
        return ContentBlock::new(
            BlockKind::ListItem {
                marker: caps[2].to_string(),
                nesting_level: caps[1].len() / 2,
                ordered: false,
            },
            page_number,
            frag.bbox,
            text,
        );
    }
    if let Some(caps) = RE_ORDERED.captures(&frag.text) {
        return ContentBlock::new(
            BlockKind::ListItem {
                marker: caps[2].to_string(),
                nesting_level: caps[1].len() / 2,
                ordered: true,
            },
            page_number,
            frag.bbox,
            text,
        );
    }

    // 7. Everything else is a paragraph.
    ContentBlock::paragraph(page_number, frag.bbox, text)
}

fn heading_level(frag: &TextFragment, text: &str, profile: &FontProfile) -> Option<u8> {
    if let Some(level) = profile.heading_level_for(frag.font_size) {
        return Some(level);
    }

    let lower = text.to_lowercase();
    let keyword_hit = HEADING_KEYWORDS.iter().any(|k| lower.starts_with(k));
    let numbered = RE_SECTION_NUMBER.is_match(text);

    if (keyword_hit || numbered) && (frag.bold || frag.font_size > profile.body_size()) {
        // Derive the level from the numbering depth where present.
        let level = RE_SECTION_NUMBER
            .captures(text)
            .map(|c| c[1].matches('.').count() as u8 + 1)
            .unwrap_or(1);
        return Some(level.min(6));
    }
    None
}

fn looks_monospace(frag: &TextFragment) -> bool {
    let name = frag.font_name.to_lowercase();
    name.contains("mono") || name.contains("courier") || name.contains("consolas")
}

pub fn is_table_row(text: &str) -> bool {
    let t = text.trim();
    t.starts_with('|') && t.ends_with('|') && t.matches('|').count() >= 2
}

/// Whether a table row is a GFM separator (`| --- | :--: |`).
pub fn is_separator_row(text: &str) -> bool {
    let t = text.trim();
    t.starts_with('|')
        && t.chars()
            .all(|c| matches!(c, '|' | '-' | ':' | ' '))
        && t.contains('-')
}

pub fn parse_table_cells(text: &str) -> Vec<String> {
    let t = text.trim().trim_start_matches('|').trim_end_matches('|');
    t.split('|').map(|c| c.trim().to_string()).collect()
}

fn footnote_reference(text: &str) -> Option<(String, String)> {
    let caps = RE_FOOTNOTE_LEAD.captures(text)?;
    let body = caps.get(6)?.as_str().to_string();
    for idx in 1..=5 {
        if let Some(m) = caps.get(idx) {
            return Some((m.as_str().to_string(), body));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::fragment;
    use crate::model::BBox;

    fn cfg() -> ReconciliationConfig {
        ReconciliationConfig::default()
    }

    fn layout_with(fragments: Vec<TextFragment>) -> LayoutOutput {
        LayoutOutput {
            page_count: 1,
            page_width: 612.0,
            page_height: 792.0,
            fragments,
            hints: Default::default(),
        }
    }

    #[test]
    fn body_style_is_most_frequent_by_chars() {
        let layout = layout_with(vec![
            fragment(
                "This long paragraph dominates the character tally across the page.",
                0,
                BBox::new(0.0, 100.0, 500.0, 112.0),
                10.0,
            ),
            fragment("Title", 0, BBox::new(0.0, 10.0, 200.0, 40.0), 24.0),
        ]);
        let profile = analyze_fonts(&layout, &cfg());
        assert_eq!(profile.body.as_ref().unwrap().size_tenths, 100);
        assert_eq!(profile.heading_level_for(24.0), Some(1));
    }

    #[test]
    fn oversized_body_text_is_not_heading_eligible() {
        // A huge font whose fragments run long fails the short-text gate.
        let long = "word ".repeat(40);
        let layout = layout_with(vec![
            fragment("body body body body body", 0, BBox::default(), 10.0),
            fragment(&long, 0, BBox::default(), 20.0),
        ]);
        let profile = analyze_fonts(&layout, &cfg());
        assert_eq!(profile.heading_level_for(20.0), None);
    }

    #[test]
    fn latex_beats_everything() {
        let f = fragment("$$\\int_0^1 x\\,dx$$", 0, BBox::default(), 10.0);
        let block = classify_fragment(&f, &FontProfile::default(), 792.0, &cfg());
        assert!(matches!(
            block.kind,
            BlockKind::MathFormula {
                display_mode: DisplayMode::Block,
                ..
            }
        ));
    }

    #[test]
    fn code_fence_captures_language() {
        let f = fragment("```rust", 0, BBox::default(), 10.0);
        let block = classify_fragment(&f, &FontProfile::default(), 792.0, &cfg());
        match block.kind {
            BlockKind::CodeBlock { language } => assert_eq!(language.as_deref(), Some("rust")),
            other => panic!("expected code block, got {other:?}"),
        }
    }

    #[test]
    fn footnote_requires_bottom_of_page() {
        let cfg = cfg();
        let profile = FontProfile::default();

        let mut low = fragment("[1] See Smith 2020.", 0, BBox::new(0.0, 700.0, 300.0, 712.0), 8.0);
        low.bbox.y0 = 700.0; // 700/792 > 0.85
        let block = classify_fragment(&low, &profile, 792.0, &cfg);
        match &block.kind {
            BlockKind::Footnote { reference_id, origin_page } => {
                assert_eq!(reference_id, "1");
                assert_eq!(*origin_page, 1);
            }
            other => panic!("expected footnote, got {other:?}"),
        }

        // Same text mid-page is a paragraph.
        let mid = fragment("[1] See Smith 2020.", 0, BBox::new(0.0, 300.0, 300.0, 312.0), 8.0);
        let block = classify_fragment(&mid, &profile, 792.0, &cfg);
        assert!(matches!(block.kind, BlockKind::Paragraph { .. }));
    }

    #[test]
    fn long_heading_candidate_demotes_to_paragraph() {
        let profile = FontProfile {
            body: Some(FontStyle::new("Times", 10.0, false, false)),
            heading_sizes: vec![240],
        };
        let long = "a ".repeat(20) + "closing words of a long paragraph fragment";
        let f = fragment(&long, 0, BBox::default(), 24.0);
        let block = classify_fragment(&f, &profile, 792.0, &cfg());
        assert!(matches!(block.kind, BlockKind::Paragraph { .. }));
    }

    #[test]
    fn numbered_section_becomes_heading_with_numbering() {
        let profile = FontProfile {
            body: Some(FontStyle::new("Times", 10.0, false, false)),
            heading_sizes: vec![],
        };
        let mut f = fragment("2.1 Network Architecture", 0, BBox::default(), 12.0);
        f.bold = true;
        let block = classify_fragment(&f, &profile, 792.0, &cfg());
        match &block.kind {
            BlockKind::Heading {
                level, numbering, ..
            } => {
                assert_eq!(*level, 2);
                assert_eq!(numbering.as_deref(), Some("2.1"));
            }
            other => panic!("expected heading, got {other:?}"),
        }
    }

    #[test]
    fn list_items_capture_marker_and_order() {
        let f = fragment("- first point", 0, BBox::default(), 10.0);
        let block = classify_fragment(&f, &FontProfile::default(), 792.0, &cfg());
        assert!(matches!(
            block.kind,
            BlockKind::ListItem { ordered: false, .. }
        ));

        let f = fragment("3. third point", 0, BBox::default(), 10.0);
        let block = classify_fragment(&f, &FontProfile::default(), 792.0, &cfg());
        match &block.kind {
            BlockKind::ListItem {
                marker, ordered, ..
            } => {
                assert_eq!(marker, "3.");
                assert!(ordered);
            }
            other => panic!("expected list item, got {other:?}"),
        }
    }

    #[test]
    fn table_rows_parse_cells() {
        assert!(is_table_row("| a | b | c |"));
        assert!(is_separator_row("| --- | :--: | --- |"));
        assert!(!is_separator_row("| a | b |"));
        assert_eq!(parse_table_cells("| a | b | c |"), vec!["a", "b", "c"]);
    }
}
