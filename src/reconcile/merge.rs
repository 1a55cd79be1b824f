//! Merging heuristics and artifact filtering.
//!
//! These passes run after per-fragment classification, on whole pages (or
//! the whole document for the heading merge, which may cross a page
//! boundary). They only ever *combine* or *drop* blocks — translation has
//! not started, so no translated text is at risk.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::{BlockKind, ContentBlock};

static RE_STANDALONE_INT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\d{1,4}\s*$").unwrap());
static RE_HEADER_FOOTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(Copyright|©|Confidential|https?://)").unwrap());
static RE_TERMINAL_PUNCT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?:;]\s*$").unwrap());

/// Words that, when starting the second of two adjacent same-level
/// headings, indicate the first heading wrapped onto a new line.
const CONTINUATION_STARTERS: &[&str] = &[
    "and", "or", "of", "in", "on", "for", "with", "to", "the", "a", "an", "but",
];

// ── Artifact filter ──────────────────────────────────────────────────────

/// Drop page numbers and boilerplate headers/footers.
///
/// Standalone integers in the top or bottom 10% of the page are page
/// numbers; lines matching the header/footer patterns are dropped anywhere.
pub fn filter_artifacts(blocks: Vec<ContentBlock>, page_height: f32) -> Vec<ContentBlock> {
    blocks
        .into_iter()
        .filter(|b| !is_artifact(b, page_height))
        .collect()
}

fn is_artifact(block: &ContentBlock, page_height: f32) -> bool {
    let text = block.original_text.trim();
    if RE_HEADER_FOOTER.is_match(text) {
        return true;
    }
    if RE_STANDALONE_INT.is_match(text) {
        let y = block.bounding_box.y0;
        let margin = page_height * 0.10;
        return y <= margin || y >= page_height - margin - block.bounding_box.height();
    }
    false
}

// ── Paragraph merging ────────────────────────────────────────────────────

/// Merge consecutive paragraphs where the first spans the full line width
/// and the second continues it: next line, no indentation, no blank gap,
/// and no terminating punctuation on the first.
pub fn merge_paragraphs(blocks: Vec<ContentBlock>, page_width: f32) -> Vec<ContentBlock> {
    let mut merged: Vec<ContentBlock> = Vec::with_capacity(blocks.len());

    for block in blocks {
        let should_merge = match merged.last() {
            Some(prev) => paragraphs_continue(prev, &block, page_width),
            None => false,
        };

        if should_merge {
            let prev = merged.last_mut().unwrap();
            prev.original_text.push(' ');
            prev.original_text.push_str(block.original_text.trim());
            prev.bounding_box.x1 = prev.bounding_box.x1.max(block.bounding_box.x1);
            prev.bounding_box.y1 = block.bounding_box.y1;
            if let BlockKind::Paragraph { is_continuation } = &mut prev.kind {
                *is_continuation = true;
            }
        } else {
            merged.push(block);
        }
    }

    merged
}

fn paragraphs_continue(prev: &ContentBlock, next: &ContentBlock, page_width: f32) -> bool {
    if !matches!(prev.kind, BlockKind::Paragraph { .. })
        || !matches!(next.kind, BlockKind::Paragraph { .. })
    {
        return false;
    }
    // First line must span most of the text column.
    if prev.bounding_box.width() < page_width * 0.7 {
        return false;
    }
    // Continuation starts at (or left of) the first line's margin.
    if next.bounding_box.x0 > prev.bounding_box.x0 + 2.0 {
        return false;
    }
    // No blank-line gap: the vertical jump stays within ~1.8 line heights.
    let line_height = prev.bounding_box.height().max(6.0);
    if next.bounding_box.y0 - prev.bounding_box.y1 > line_height * 1.8 {
        return false;
    }
    // A sentence-final first line stands alone.
    !RE_TERMINAL_PUNCT.is_match(prev.original_text.trim_end())
}

// ── Heading merge ────────────────────────────────────────────────────────

/// Merge two consecutive headings of the same level, on the same or
/// adjacent pages, when the first lacks terminal punctuation and the second
/// starts lowercase or with a connective — the signature of a wrapped title.
pub fn merge_headings(blocks: Vec<ContentBlock>) -> Vec<ContentBlock> {
    let mut merged: Vec<ContentBlock> = Vec::with_capacity(blocks.len());

    for block in blocks {
        let should_merge = match merged.last() {
            Some(prev) => headings_continue(prev, &block),
            None => false,
        };

        if should_merge {
            let prev = merged.last_mut().unwrap();
            prev.original_text.push(' ');
            prev.original_text.push_str(block.original_text.trim());
        } else {
            merged.push(block);
        }
    }

    merged
}

fn headings_continue(prev: &ContentBlock, next: &ContentBlock) -> bool {
    let (prev_level, next_level) = match (&prev.kind, &next.kind) {
        (BlockKind::Heading { level: a, .. }, BlockKind::Heading { level: b, .. }) => (*a, *b),
        _ => return false,
    };
    if prev_level != next_level {
        return false;
    }
    if next.page_number.saturating_sub(prev.page_number) > 1 {
        return false;
    }
    if RE_TERMINAL_PUNCT.is_match(prev.original_text.trim_end()) {
        return false;
    }
    let first_word = next
        .original_text
        .split_whitespace()
        .next()
        .unwrap_or_default();
    first_word.chars().next().is_some_and(|c| c.is_lowercase())
        || CONTINUATION_STARTERS.contains(&first_word.to_lowercase().as_str())
}

// ── Footnote extraction ──────────────────────────────────────────────────

/// Pull footnote blocks out of the page flow. The inline marker stays
/// inside its referencing paragraph; the footnote body moves to the
/// document tail.
pub fn split_footnotes(blocks: Vec<ContentBlock>) -> (Vec<ContentBlock>, Vec<ContentBlock>) {
    blocks
        .into_iter()
        .partition(|b| !matches!(b.kind, BlockKind::Footnote { .. }))
}

// ── Table coalescing ─────────────────────────────────────────────────────

/// Collapse runs of single-row Table blocks (one per extracted line) into
/// one Table with all rows. A GFM separator as the second row marks one
/// header row and is not stored as data.
pub fn coalesce_tables(blocks: Vec<ContentBlock>) -> Vec<ContentBlock> {
    use super::classify::is_separator_row;

    let mut out: Vec<ContentBlock> = Vec::with_capacity(blocks.len());

    for block in blocks {
        let is_row = matches!(block.kind, BlockKind::Table { .. });
        let extends_prev = is_row
            && matches!(
                out.last().map(|b| &b.kind),
                Some(BlockKind::Table { .. })
            )
            && out.last().is_some_and(|prev| prev.page_number == block.page_number);

        if extends_prev {
            let prev = out.last_mut().unwrap();
            let row_index_is_separator = is_separator_row(block.original_text.trim());
            if let (
                BlockKind::Table {
                    rows, header_rows, ..
                },
                BlockKind::Table { rows: new_rows, .. },
            ) = (&mut prev.kind, &block.kind)
            {
                if row_index_is_separator {
                    // Separator right after the first row ⇒ one header row.
                    if rows.len() == 1 {
                        *header_rows = 1;
                    }
                } else {
                    rows.extend(new_rows.iter().cloned());
                }
            }
            prev.original_text.push('\n');
            prev.original_text.push_str(block.original_text.trim());
            prev.bounding_box.y1 = block.bounding_box.y1;
        } else {
            out.push(block);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BBox;

    fn para(text: &str, page: usize, bbox: BBox) -> ContentBlock {
        ContentBlock::paragraph(page, bbox, text)
    }

    #[test]
    fn page_numbers_dropped_only_at_margins() {
        let page_height = 792.0;
        let top = para("3", 1, BBox::new(300.0, 20.0, 312.0, 32.0));
        let middle = para("3", 1, BBox::new(300.0, 400.0, 312.0, 412.0));
        let bottom = para("42", 1, BBox::new(300.0, 770.0, 312.0, 782.0));

        let kept = filter_artifacts(vec![top, middle, bottom], page_height);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].original_text, "3");
        assert!((kept[0].bounding_box.y0 - 400.0).abs() < 1e-3);
    }

    #[test]
    fn boilerplate_lines_dropped_anywhere() {
        let blocks = vec![
            para("Copyright 2021 Example Corp", 1, BBox::new(0.0, 400.0, 300.0, 412.0)),
            para("https://example.com/terms", 1, BBox::new(0.0, 420.0, 300.0, 432.0)),
            para("Real content stays.", 1, BBox::new(0.0, 440.0, 300.0, 452.0)),
        ];
        let kept = filter_artifacts(blocks, 792.0);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].original_text, "Real content stays.");
    }

    #[test]
    fn continuation_lines_merge_into_one_paragraph() {
        let page_width = 612.0;
        let first = para(
            "The experiment continued without any",
            1,
            BBox::new(50.0, 100.0, 560.0, 112.0),
        );
        let second = para(
            "interruption for several hours.",
            1,
            BBox::new(50.0, 114.0, 400.0, 126.0),
        );
        let merged = merge_paragraphs(vec![first, second], page_width);
        assert_eq!(merged.len(), 1);
        assert_eq!(
            merged[0].original_text,
            "The experiment continued without any interruption for several hours."
        );
        assert!(matches!(
            merged[0].kind,
            BlockKind::Paragraph {
                is_continuation: true
            }
        ));
    }

    #[test]
    fn sentence_final_line_does_not_merge() {
        let page_width = 612.0;
        let first = para(
            "This sentence ends here.",
            1,
            BBox::new(50.0, 100.0, 560.0, 112.0),
        );
        let second = para("A new thought begins.", 1, BBox::new(50.0, 114.0, 400.0, 126.0));
        let merged = merge_paragraphs(vec![first, second], page_width);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn indented_line_does_not_merge() {
        let page_width = 612.0;
        let first = para(
            "A full width line without punctuation",
            1,
            BBox::new(50.0, 100.0, 560.0, 112.0),
        );
        let second = para("Indented new paragraph", 1, BBox::new(80.0, 114.0, 400.0, 126.0));
        let merged = merge_paragraphs(vec![first, second], page_width);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn wrapped_heading_merges_across_pages() {
        let first = ContentBlock::heading(
            1,
            BBox::new(50.0, 760.0, 500.0, 780.0),
            "A Study of Deep Networks for",
            2,
        );
        let second = ContentBlock::heading(
            2,
            BBox::new(50.0, 40.0, 300.0, 60.0),
            "machine translation",
            2,
        );
        let merged = merge_headings(vec![first, second]);
        assert_eq!(merged.len(), 1);
        assert_eq!(
            merged[0].original_text,
            "A Study of Deep Networks for machine translation"
        );
    }

    #[test]
    fn capitalised_second_heading_does_not_merge() {
        let first = ContentBlock::heading(1, BBox::default(), "Background", 2);
        let second = ContentBlock::heading(1, BBox::default(), "Methods", 2);
        let merged = merge_headings(vec![first, second]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn footnotes_partition_out_of_page_flow() {
        let blocks = vec![
            para("Body text.[1]", 1, BBox::default()),
            ContentBlock::new(
                BlockKind::Footnote {
                    reference_id: "1".into(),
                    origin_page: 1,
                },
                1,
                BBox::default(),
                "[1] See Smith 2020.",
            ),
        ];
        let (flow, notes) = split_footnotes(blocks);
        assert_eq!(flow.len(), 1);
        assert_eq!(notes.len(), 1);
        assert!(matches!(notes[0].kind, BlockKind::Footnote { .. }));
    }

    #[test]
    fn table_rows_coalesce_with_header_detection() {
        let mk = |text: &str, cells: Vec<&str>| {
            ContentBlock::new(
                BlockKind::Table {
                    rows: vec![cells.into_iter().map(String::from).collect()],
                    header_rows: 0,
                    caption_id: None,
                },
                1,
                BBox::default(),
                text,
            )
        };
        let blocks = vec![
            mk("| H1 | H2 | H3 |", vec!["H1", "H2", "H3"]),
            mk("| --- | --- | --- |", vec!["---", "---", "---"]),
            mk("| a | b | c |", vec!["a", "b", "c"]),
            mk("| d | e | f |", vec!["d", "e", "f"]),
            mk("| g | h | i |", vec!["g", "h", "i"]),
        ];
        let out = coalesce_tables(blocks);
        assert_eq!(out.len(), 1);
        match &out[0].kind {
            BlockKind::Table {
                rows, header_rows, ..
            } => {
                assert_eq!(rows.len(), 4, "header + 3 data rows, separator dropped");
                assert_eq!(*header_rows, 1);
                assert_eq!(rows[0], vec!["H1", "H2", "H3"]);
            }
            other => panic!("expected table, got {other:?}"),
        }
    }
}
