//! The output page estimator.
//!
//! The assembler needs page numbers for the TOC before any physical
//! renderer has paginated anything, so it runs a content-type-weighted
//! line counter: every block contributes a fixed or size-derived number of
//! output lines, and a page break occurs when the running count crosses
//! the per-page threshold. No calibration table is promised — only
//! *consistency*: the same heading always lands on the same page within a
//! run, which is what makes the TOC trustworthy.

use crate::model::{BlockKind, ContentBlock};

/// Content-type line weights and the page threshold.
#[derive(Debug, Clone, Copy)]
pub struct PageEstimator {
    pub chars_per_line: usize,
    pub lines_per_page: usize,
    lines_emitted: usize,
}

impl Default for PageEstimator {
    fn default() -> Self {
        Self {
            chars_per_line: 80,
            lines_per_page: 25,
            lines_emitted: 0,
        }
    }
}

impl PageEstimator {
    pub fn new(chars_per_line: usize, lines_per_page: usize) -> Self {
        Self {
            chars_per_line: chars_per_line.max(1),
            lines_per_page: lines_per_page.max(1),
            lines_emitted: 0,
        }
    }

    /// Estimated line count for one block.
    pub fn lines_for(&self, block: &ContentBlock) -> usize {
        match &block.kind {
            BlockKind::Heading { .. } => 4,
            BlockKind::Paragraph { .. } | BlockKind::Caption { .. } => {
                self.text_lines(block.effective_text())
            }
            BlockKind::ListItem { nesting_level, .. } => 1 + nesting_level / 2,
            BlockKind::ImagePlaceholder { .. } => 12,
            BlockKind::Table { rows, .. } => 2 + rows.len(),
            BlockKind::MathFormula { .. } => self.text_lines(&block.original_text).max(2),
            BlockKind::CodeBlock { .. } => block.original_text.lines().count().max(1) + 2,
            BlockKind::Footnote { .. } => self.text_lines(block.effective_text()),
        }
    }

    fn text_lines(&self, text: &str) -> usize {
        let chars = text.chars().count();
        chars.div_ceil(self.chars_per_line).max(1)
    }

    /// The page the *next* emitted block starts on (1-indexed).
    pub fn current_page(&self) -> usize {
        self.lines_emitted / self.lines_per_page + 1
    }

    /// Account for an emitted block and return the page it started on.
    pub fn advance(&mut self, block: &ContentBlock) -> usize {
        let page = self.current_page();
        self.lines_emitted += self.lines_for(block);
        page
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BBox;

    #[test]
    fn weights_match_the_design_table() {
        let e = PageEstimator::default();

        let heading = ContentBlock::heading(1, BBox::default(), "Intro", 1);
        assert_eq!(e.lines_for(&heading), 4);

        let image = ContentBlock::new(
            BlockKind::ImagePlaceholder {
                image_asset_id: "a".into(),
                caption_id: None,
                spatial_relationship: crate::model::SpatialRelationship::After,
                reading_order_position: 0,
            },
            1,
            BBox::default(),
            "",
        );
        assert_eq!(e.lines_for(&image), 12);

        let table = ContentBlock::new(
            BlockKind::Table {
                rows: vec![vec!["a".into()]; 5],
                header_rows: 1,
                caption_id: None,
            },
            1,
            BBox::default(),
            "",
        );
        assert_eq!(e.lines_for(&table), 7);

        let para = ContentBlock::paragraph(1, BBox::default(), &"x".repeat(200));
        assert_eq!(e.lines_for(&para), 3); // ceil(200 / 80)
    }

    #[test]
    fn page_breaks_at_threshold() {
        let mut e = PageEstimator::new(80, 25);
        // Seven headings = 28 lines; the first seven start within the
        // first 25-line page window (0, 4, …, 24).
        for i in 0..7 {
            let h = ContentBlock::heading(1, BBox::default(), &format!("H{i}"), 1);
            assert_eq!(e.advance(&h), 1, "heading {i}");
        }
        // The next block starts past the threshold.
        let h = ContentBlock::heading(1, BBox::default(), "H8", 1);
        assert_eq!(e.advance(&h), 2);
    }

    #[test]
    fn estimation_is_consistent_within_a_run() {
        let blocks: Vec<ContentBlock> = (0..30)
            .map(|i| ContentBlock::paragraph(1, BBox::default(), &format!("paragraph {i} {}", "word ".repeat(30))))
            .collect();

        let run = |blocks: &[ContentBlock]| -> Vec<usize> {
            let mut e = PageEstimator::default();
            blocks.iter().map(|b| e.advance(b)).collect()
        };
        assert_eq!(run(&blocks), run(&blocks));
    }
}
