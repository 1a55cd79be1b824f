//! Markdown rendering of individual blocks.
//!
//! Rendering rules: math emits its LaTeX untouched inside its original
//! delimiters; code keeps fences and language; images emit a reference
//! into the `assets/` directory at their recorded reading-order position
//! with the caption (if any) rendered directly after; headings carry an
//! HTML anchor so the TOC can link to them.

use crate::model::{BlockKind, ContentBlock, DisplayMode};
use crate::translate::validator::render_table;

/// Render one block to markdown. Captions linked to a figure are rendered
/// by the figure's renderer, not standalone (the assembler skips them in
/// the main sweep).
pub fn render_block(block: &ContentBlock, caption: Option<&ContentBlock>) -> String {
    match &block.kind {
        BlockKind::Heading { level, bookmark_id, .. } => {
            let hashes = "#".repeat(*level as usize);
            format!(
                "<a id=\"{bookmark_id}\"></a>\n\n{hashes} {}",
                block.effective_text().trim()
            )
        }

        BlockKind::Paragraph { .. } => block.effective_text().trim().to_string(),

        BlockKind::ListItem {
            marker,
            nesting_level,
            ..
        } => {
            let indent = "  ".repeat(*nesting_level);
            let text = strip_marker(block.effective_text().trim(), marker);
            format!("{indent}{marker} {text}")
        }

        BlockKind::Table { rows, header_rows, .. } => {
            let table_md = match &block.translated_text {
                Some(t) if !t.trim().is_empty() => t.trim().to_string(),
                _ => render_table(rows, *header_rows),
            };
            match caption {
                Some(c) => format!("{table_md}\n\n*{}*", c.effective_text().trim()),
                None => table_md,
            }
        }

        BlockKind::Caption { .. } => format!("*{}*", block.effective_text().trim()),

        BlockKind::MathFormula { latex, display_mode } => match display_mode {
            // The latex field carries its own delimiters from extraction.
            DisplayMode::Inline | DisplayMode::Block => latex.trim().to_string(),
        },

        BlockKind::CodeBlock { language } => {
            let text = block.original_text.trim();
            if text.starts_with("```") {
                text.to_string()
            } else {
                let tag = language.as_deref().unwrap_or("");
                format!("```{tag}\n{text}\n```")
            }
        }

        BlockKind::ImagePlaceholder { image_asset_id, .. } => {
            let image_md = format!("![](assets/{image_asset_id})");
            match caption {
                Some(c) => format!("{image_md}\n\n*{}*", c.effective_text().trim()),
                None => image_md,
            }
        }

        BlockKind::Footnote { reference_id, .. } => {
            format!("[{reference_id}] {}", block.effective_text().trim())
        }
    }
}

/// Avoid doubling a marker that the extractor left inside the text.
fn strip_marker<'a>(text: &'a str, marker: &str) -> &'a str {
    text.strip_prefix(marker).map(str::trim_start).unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BBox;

    #[test]
    fn heading_carries_anchor_and_level() {
        let mut h = ContentBlock::heading(1, BBox::default(), "Methods", 2);
        h.translated_text = Some("Méthodes".into());
        let md = render_block(&h, None);
        let anchor = h.bookmark_id().unwrap();
        assert!(md.contains(&format!("<a id=\"{anchor}\"></a>")));
        assert!(md.contains("## Méthodes"));
    }

    #[test]
    fn math_renders_original_latex_verbatim() {
        let m = ContentBlock::new(
            BlockKind::MathFormula {
                latex: "$E = mc^2$".into(),
                display_mode: DisplayMode::Inline,
            },
            1,
            BBox::default(),
            "$E = mc^2$",
        );
        assert_eq!(render_block(&m, None), "$E = mc^2$");
    }

    #[test]
    fn unfenced_code_gains_fences_with_language() {
        let c = ContentBlock::new(
            BlockKind::CodeBlock {
                language: Some("python".into()),
            },
            1,
            BBox::default(),
            "print('hi')",
        );
        let md = render_block(&c, None);
        assert!(md.starts_with("```python\n"));
        assert!(md.ends_with("\n```"));
    }

    #[test]
    fn image_renders_asset_reference_with_caption_after() {
        let img = ContentBlock::new(
            BlockKind::ImagePlaceholder {
                image_asset_id: "fig-1.png".into(),
                caption_id: None,
                spatial_relationship: crate::model::SpatialRelationship::After,
                reading_order_position: 0,
            },
            1,
            BBox::default(),
            "",
        );
        let mut caption = ContentBlock::paragraph(1, BBox::default(), "Figure 1: Architecture.");
        caption.translated_text = Some("Figure 1: Architektur.".into());

        let md = render_block(&img, Some(&caption));
        assert!(md.starts_with("![](assets/fig-1.png)"));
        assert!(md.ends_with("*Figure 1: Architektur.*"));
    }

    #[test]
    fn list_item_does_not_double_the_marker() {
        let li = ContentBlock::new(
            BlockKind::ListItem {
                marker: "-".into(),
                nesting_level: 1,
                ordered: false,
            },
            1,
            BBox::default(),
            "- a point",
        );
        assert_eq!(render_block(&li, None), "  - a point");
    }

    #[test]
    fn untranslated_table_renders_from_rows() {
        let t = ContentBlock::new(
            BlockKind::Table {
                rows: vec![
                    vec!["H".into(), "I".into()],
                    vec!["1".into(), "2".into()],
                ],
                header_rows: 1,
                caption_id: None,
            },
            1,
            BBox::default(),
            "",
        );
        let md = render_block(&t, None);
        assert!(md.contains("| H | I |"));
        assert!(md.contains("| --- |"));
    }
}
