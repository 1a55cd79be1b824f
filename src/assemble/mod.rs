//! The two-pass document assembler.
//!
//! Pass 1 emits content in document order, inserting a bookmark anchor at
//! every heading and feeding each block through the page estimator so the
//! heading → page map exists before any TOC is written. Footnotes render
//! into a trailing "Notes" section in original reference order. Pass 2
//! walks the heading list and regenerates the table of contents with
//! hyperlinks and the recorded page numbers, failing fast if the TOC and
//! heading sets disagree.

pub mod estimator;
pub mod render;

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::model::{BlockId, BlockKind, Document};
use estimator::PageEstimator;

/// One table-of-contents entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocEntry {
    pub bookmark_id: String,
    pub text: String,
    pub level: u8,
    pub page_number: usize,
}

/// The assembled artifact.
#[derive(Debug, Clone)]
pub struct AssembledDocument {
    /// Final markdown, TOC included.
    pub markdown: String,
    pub toc: Vec<TocEntry>,
    /// bookmark_id → estimated page, recorded during pass 1.
    pub heading_pages: BTreeMap<String, usize>,
}

/// Assemble the translated document.
pub fn assemble(doc: &Document) -> Result<AssembledDocument, PipelineError> {
    let estimator = PageEstimator::default();
    assemble_with(doc, estimator)
}

/// Assembly with an explicit estimator (tests tune the page threshold).
pub fn assemble_with(
    doc: &Document,
    mut estimator: PageEstimator,
) -> Result<AssembledDocument, PipelineError> {
    // Captions claimed by a figure or table render with their owner, not
    // at their own flow position.
    let claimed_captions: HashSet<BlockId> = doc
        .blocks()
        .filter_map(|b| match &b.kind {
            BlockKind::ImagePlaceholder { caption_id, .. }
            | BlockKind::Table { caption_id, .. } => *caption_id,
            _ => None,
        })
        .collect();

    // ── Pass 1: content, bookmarks, page tracking ────────────────────────
    let mut body_parts: Vec<String> = Vec::new();
    let mut heading_pages: BTreeMap<String, usize> = BTreeMap::new();
    let mut headings: Vec<TocEntry> = Vec::new();

    for page in &doc.pages {
        for block in &page.blocks {
            if claimed_captions.contains(&block.id) {
                continue;
            }

            let page_number = estimator.advance(block);

            if let BlockKind::Heading { level, bookmark_id, .. } = &block.kind {
                heading_pages.insert(bookmark_id.clone(), page_number);
                headings.push(TocEntry {
                    bookmark_id: bookmark_id.clone(),
                    text: block.effective_text().trim().to_string(),
                    level: *level,
                    page_number,
                });
            }

            let caption = match &block.kind {
                BlockKind::ImagePlaceholder { caption_id, .. }
                | BlockKind::Table { caption_id, .. } => {
                    caption_id.and_then(|id| doc.find_block(id))
                }
                _ => None,
            };
            body_parts.push(render::render_block(block, caption));
        }
    }

    // Footnote tail, in original reference order.
    if !doc.footnotes.is_empty() {
        body_parts.push("---".to_string());
        body_parts.push("## Notes".to_string());
        for footnote in &doc.footnotes {
            estimator.advance(footnote);
            body_parts.push(render::render_block(footnote, None));
        }
    }

    // ── Pass 2: table of contents ────────────────────────────────────────
    let toc = build_toc(&headings, &heading_pages)?;

    let mut parts: Vec<String> = Vec::new();
    if !toc.is_empty() {
        parts.push("## Contents".to_string());
        parts.push(render_toc(&toc));
    }
    parts.extend(body_parts);

    let markdown = finalize(parts.join("\n\n"));

    info!(
        headings = toc.len(),
        pages_estimated = estimator.current_page(),
        bytes = markdown.len(),
        "assembly complete"
    );

    Ok(AssembledDocument {
        markdown,
        toc,
        heading_pages,
    })
}

/// Pass 2 proper: every heading becomes exactly one TOC entry with the
/// page recorded in pass 1. Fail fast on any mismatch.
fn build_toc(
    headings: &[TocEntry],
    heading_pages: &BTreeMap<String, usize>,
) -> Result<Vec<TocEntry>, PipelineError> {
    let mut toc = Vec::with_capacity(headings.len());
    for heading in headings {
        let page = heading_pages.get(&heading.bookmark_id).copied().ok_or_else(|| {
            PipelineError::AssemblerInvariant(format!(
                "heading '{}' has no recorded page",
                heading.bookmark_id
            ))
        })?;
        debug_assert_eq!(page, heading.page_number);
        toc.push(heading.clone());
    }
    if toc.len() != headings.len() {
        return Err(PipelineError::AssemblerInvariant(format!(
            "TOC has {} entries for {} headings",
            toc.len(),
            headings.len()
        )));
    }
    Ok(toc)
}

fn render_toc(toc: &[TocEntry]) -> String {
    toc.iter()
        .map(|entry| {
            let indent = "  ".repeat((entry.level.saturating_sub(1)) as usize);
            format!(
                "{indent}- [{}](#{}) — p. {}",
                entry.text, entry.bookmark_id, entry.page_number
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Collapse blank runs and end with exactly one newline.
fn finalize(markdown: String) -> String {
    let collapsed = markdown
        .split("\n\n\n")
        .collect::<Vec<_>>()
        .join("\n\n");
    let trimmed = collapsed.trim_end();
    if trimmed.is_empty() {
        "\n".to_string()
    } else {
        format!("{trimmed}\n")
    }
}

// ── Artifact writing ─────────────────────────────────────────────────────

/// Where the assembled artifacts landed.
#[derive(Debug, Clone)]
pub struct WrittenArtifacts {
    pub output_path: PathBuf,
    pub assets_dir: PathBuf,
    pub asset_count: usize,
}

/// Write `output.md` and the `assets/` directory under
/// `<output_dir>/<document_stem>/`. The markdown is written atomically
/// (temp file + rename) so a crash never leaves a partial document.
pub fn write_artifacts(
    doc: &Document,
    assembled: &AssembledDocument,
    document_dir: &Path,
) -> Result<WrittenArtifacts, PipelineError> {
    let write_err = |path: &Path, source: std::io::Error| PipelineError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    std::fs::create_dir_all(document_dir).map_err(|e| write_err(document_dir, e))?;

    let assets_dir = document_dir.join("assets");
    std::fs::create_dir_all(&assets_dir).map_err(|e| write_err(&assets_dir, e))?;

    let mut asset_count = 0usize;
    for (asset_id, record) in doc.assets.iter() {
        let asset_path = assets_dir.join(asset_id.to_string());
        std::fs::write(&asset_path, &record.bytes).map_err(|e| write_err(&asset_path, e))?;
        asset_count += 1;
    }

    let output_path = document_dir.join("output.md");
    let mut tmp = tempfile::NamedTempFile::new_in(document_dir)
        .map_err(|e| write_err(&output_path, e))?;
    tmp.write_all(assembled.markdown.as_bytes())
        .map_err(|e| write_err(&output_path, e))?;
    tmp.persist(&output_path)
        .map_err(|e| write_err(&output_path, e.error))?;

    debug!(path = %output_path.display(), assets = asset_count, "artifacts written");

    Ok(WrittenArtifacts {
        output_path,
        assets_dir,
        asset_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BBox, ContentBlock, Page};

    fn doc_with_blocks(blocks: Vec<ContentBlock>) -> Document {
        let mut doc = Document::new("Test");
        let mut page = Page::new(1);
        page.blocks = blocks;
        doc.pages.push(page);
        doc
    }

    #[test]
    fn empty_document_assembles_with_zero_entry_toc() {
        let doc = Document::new("Empty");
        let assembled = assemble(&doc).unwrap();
        assert!(assembled.toc.is_empty());
        assert!(!assembled.markdown.contains("## Contents"));
        assert_eq!(assembled.markdown, "\n");
    }

    #[test]
    fn toc_entries_match_headings_with_pages() {
        let mut blocks = vec![ContentBlock::heading(1, BBox::default(), "First", 1)];
        // Enough paragraphs to push the second heading to page 2
        // (25 lines per page, 4 for the heading).
        for i in 0..12 {
            blocks.push(ContentBlock::paragraph(
                1,
                BBox::default(),
                &format!("Filler paragraph {i} {}", "word ".repeat(40)),
            ));
        }
        blocks.push(ContentBlock::heading(1, BBox::default(), "Second", 1));
        let doc = doc_with_blocks(blocks);

        let assembled = assemble(&doc).unwrap();
        assert_eq!(assembled.toc.len(), 2);
        assert_eq!(assembled.toc[0].page_number, 1);
        assert!(assembled.toc[1].page_number > 1, "{:?}", assembled.toc);

        // Each bookmark appears once in the TOC link and once as a body
        // anchor.
        for entry in &assembled.toc {
            let link = format!("(#{})", entry.bookmark_id);
            let anchor = format!("<a id=\"{}\"></a>", entry.bookmark_id);
            assert_eq!(assembled.markdown.matches(&link).count(), 1);
            assert_eq!(assembled.markdown.matches(&anchor).count(), 1);
        }
    }

    #[test]
    fn footnotes_render_in_a_trailing_notes_section() {
        let mut doc = doc_with_blocks(vec![ContentBlock::paragraph(
            1,
            BBox::default(),
            "Body with a marker.[1]",
        )]);
        let mut footnote = ContentBlock::new(
            BlockKind::Footnote {
                reference_id: "1".into(),
                origin_page: 2,
            },
            2,
            BBox::default(),
            "See Smith 2020.",
        );
        footnote.translated_text = Some("Βλέπε Smith 2020.".into());
        doc.footnotes.push(footnote);

        let assembled = assemble(&doc).unwrap();
        let notes_pos = assembled.markdown.find("## Notes").unwrap();
        let body_pos = assembled.markdown.find("Body with a marker.[1]").unwrap();
        assert!(body_pos < notes_pos);
        assert!(assembled.markdown[notes_pos..].contains("[1] Βλέπε Smith 2020."));
        // The footnote body appears only in the Notes section.
        assert_eq!(assembled.markdown.matches("Βλέπε Smith 2020.").count(), 1);
    }

    #[test]
    fn claimed_caption_renders_once_after_its_image() {
        let mut image = ContentBlock::new(
            BlockKind::ImagePlaceholder {
                image_asset_id: "fig.png".into(),
                caption_id: None,
                spatial_relationship: crate::model::SpatialRelationship::After,
                reading_order_position: 0,
            },
            1,
            BBox::default(),
            "",
        );
        let caption = ContentBlock::new(
            BlockKind::Caption {
                target_id: image.id,
            },
            1,
            BBox::default(),
            "Figure 1: System architecture.",
        );
        if let BlockKind::ImagePlaceholder { caption_id, .. } = &mut image.kind {
            *caption_id = Some(caption.id);
        }

        let mut doc = doc_with_blocks(vec![image, caption]);
        doc.assets.insert("fig.png".into(), vec![1, 2], "image/png");

        let assembled = assemble(&doc).unwrap();
        assert_eq!(
            assembled
                .markdown
                .matches("Figure 1: System architecture.")
                .count(),
            1
        );
        let img_pos = assembled.markdown.find("![](assets/fig.png)").unwrap();
        let cap_pos = assembled.markdown.find("Figure 1:").unwrap();
        assert!(img_pos < cap_pos);
    }

    #[test]
    fn artifacts_written_with_assets() {
        let mut doc = doc_with_blocks(vec![ContentBlock::paragraph(
            1,
            BBox::default(),
            "content",
        )]);
        doc.assets.insert("img-1.png".into(), vec![9, 8, 7], "image/png");

        let assembled = assemble(&doc).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let written = write_artifacts(&doc, &assembled, dir.path()).unwrap();

        assert!(written.output_path.exists());
        assert_eq!(written.asset_count, 1);
        assert_eq!(
            std::fs::read(written.assets_dir.join("img-1.png")).unwrap(),
            vec![9, 8, 7]
        );
        let md = std::fs::read_to_string(&written.output_path).unwrap();
        assert!(md.ends_with('\n'));
    }
}
