//! The hybrid content reconciler.
//!
//! Fuses two parallel extractions — the layout extractor's styled text
//! stream and the visual extractor's binary figures — into one ordered
//! [`Document`]. Each submodule implements one family of passes:
//!
//! * [`classify`] — global font analysis and per-fragment classification
//! * [`merge`]    — paragraph/heading merging, footnote extraction,
//!   artifact filtering, table coalescing
//! * [`spatial`]  — decorative filtering, image/caption association, and
//!   reading order (column-aware sweep)
//!
//! The reconciler is the only component allowed to reorder or merge
//! blocks, and it runs exactly once, before any translation. After it
//! returns, blocks change only by gaining `translated_text`.

pub mod classify;
pub mod merge;
pub mod spatial;

use tracing::{debug, info, warn};

use crate::config::ReconciliationConfig;
use crate::extract::{LayoutOutput, VisualAsset};
use crate::error::PipelineError;
use crate::model::{
    AssetId, BlockKind, ContentBlock, Document, Page, SpatialRelationship,
};

/// Fuse the two extraction outputs into a validated document.
///
/// `visuals` is `None` when the visual extractor failed — a recoverable
/// condition that yields an image-less document (the caller flags the
/// trace).
pub fn reconcile(
    layout: &LayoutOutput,
    visuals: Option<Vec<VisualAsset>>,
    config: &ReconciliationConfig,
) -> Result<Document, PipelineError> {
    let font_profile = classify::analyze_fonts(layout, config);
    debug!(
        body_size = font_profile.body_size(),
        heading_sizes = font_profile.heading_sizes.len(),
        "global font analysis complete"
    );

    let assets = visuals
        .map(|v| spatial::filter_decorative(v, config))
        .unwrap_or_default();

    let mut doc = Document::new("Untitled Document");
    doc.font_profile = font_profile.clone();

    let mut all_footnotes: Vec<ContentBlock> = Vec::new();

    for page_index in 0..layout.page_count.max(1) {
        let fragments: Vec<_> = layout.fragments_for_page(page_index).cloned().collect();

        // Classify, then run the page-local passes in a fixed order:
        // artifacts out first (so page numbers never merge into prose),
        // tables coalesced before paragraph merging sees them.
        let mut blocks: Vec<ContentBlock> = fragments
            .iter()
            .filter(|f| !f.text.trim().is_empty())
            .map(|f| classify::classify_fragment(f, &font_profile, layout.page_height, config))
            .collect();

        blocks = merge::filter_artifacts(blocks, layout.page_height);
        blocks = merge::coalesce_tables(blocks);
        blocks = merge::merge_paragraphs(blocks, layout.page_width);

        let (mut flow, footnotes) = merge::split_footnotes(blocks);
        all_footnotes.extend(footnotes);

        attach_images(&mut flow, &assets, page_index, &mut doc);
        attach_table_captions(&mut flow);

        // Total reading order for the page, then stamp image positions.
        let order = spatial::reading_order(&flow, layout.page_width);
        let mut ordered: Vec<ContentBlock> = order.into_iter().map(|i| flow[i].clone()).collect();
        spatial::stamp_reading_positions(&mut ordered);

        let mut page = Page::new(page_index + 1);
        page.blocks = ordered;
        doc.pages.push(page);
    }

    // Heading merge may cross a page boundary, so it runs on the flattened
    // flow and pages are rebuilt afterwards.
    merge_headings_across_pages(&mut doc);

    doc.footnotes = all_footnotes;
    doc.title = derive_title(&doc);
    finalize_bookmarks(&mut doc);

    doc.validate()?;

    info!(
        pages = doc.pages.len(),
        blocks = doc.block_count(),
        images = doc.image_placeholder_count(),
        footnotes = doc.footnotes.len(),
        "reconciliation complete"
    );

    Ok(doc)
}

/// Insert image placeholders for this page's assets, linking captions and
/// the nearest text block's spatial relationship.
fn attach_images(
    flow: &mut Vec<ContentBlock>,
    assets: &[VisualAsset],
    page_index: usize,
    doc: &mut Document,
) {
    for asset in assets.iter().filter(|a| a.page_index == page_index) {
        let relationship = spatial::nearest_block(&asset.bbox, flow)
            .map(|i| spatial::relationship_to(&asset.bbox, &flow[i].bounding_box))
            .unwrap_or(SpatialRelationship::Before);

        let mut image = ContentBlock::new(
            BlockKind::ImagePlaceholder {
                image_asset_id: AssetId(asset.asset_id.clone()),
                caption_id: None,
                spatial_relationship: relationship,
                reading_order_position: 0,
            },
            page_index + 1,
            asset.bbox,
            "",
        );

        // Promote a nearby `Figure N:` line to a Caption targeting this
        // image. The caption keeps its own position in the reading order.
        if let Some(caption_idx) = spatial::find_caption_index(&asset.bbox, flow) {
            let caption_block = &mut flow[caption_idx];
            if matches!(caption_block.kind, BlockKind::Paragraph { .. }) {
                caption_block.kind = BlockKind::Caption {
                    target_id: image.id,
                };
                if let BlockKind::ImagePlaceholder { caption_id, .. } = &mut image.kind {
                    *caption_id = Some(caption_block.id);
                }
            }
        }

        doc.assets
            .insert(AssetId(asset.asset_id.clone()), asset.bytes.clone(), &asset.mime_type);
        flow.push(image);
    }
}

/// Link `Table N:` caption lines to the table they describe.
fn attach_table_captions(flow: &mut [ContentBlock]) {
    let table_info: Vec<(usize, crate::model::BlockId, crate::model::BBox)> = flow
        .iter()
        .enumerate()
        .filter(|(_, b)| matches!(b.kind, BlockKind::Table { .. }))
        .map(|(i, b)| (i, b.id, b.bounding_box))
        .collect();

    for (table_idx, table_id, table_bbox) in table_info {
        let caption_idx = flow
            .iter()
            .enumerate()
            .filter(|(i, b)| {
                *i != table_idx
                    && matches!(b.kind, BlockKind::Paragraph { .. })
                    && b.original_text.trim().starts_with("Table")
                    && spatial::is_caption_text(&b.original_text)
            })
            .min_by(|(_, a), (_, b)| {
                table_bbox
                    .center_distance(&a.bounding_box)
                    .partial_cmp(&table_bbox.center_distance(&b.bounding_box))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i);

        if let Some(ci) = caption_idx {
            let caption_id = flow[ci].id;
            flow[ci].kind = BlockKind::Caption { target_id: table_id };
            if let BlockKind::Table { caption_id: slot, .. } = &mut flow[table_idx].kind {
                *slot = Some(caption_id);
            }
        }
    }
}

/// Run the heading merge over the flattened page flow and rebuild pages.
fn merge_headings_across_pages(doc: &mut Document) {
    let page_count = doc.pages.len();
    let flat: Vec<ContentBlock> = doc
        .pages
        .drain(..)
        .flat_map(|p| p.blocks.into_iter())
        .collect();
    let merged = merge::merge_headings(flat);

    let mut pages: Vec<Page> = (1..=page_count).map(Page::new).collect();
    for block in merged {
        let idx = block.page_number.saturating_sub(1).min(page_count.saturating_sub(1));
        if let Some(page) = pages.get_mut(idx) {
            page.blocks.push(block);
        } else {
            warn!(page = block.page_number, "block outside page range; dropped page rebuild");
        }
    }
    doc.pages = pages;
}

/// Renumber heading bookmarks deterministically in document order. The
/// ids stay stable from here through assembly, and identical inputs yield
/// identical anchors across runs (the warm-cache rerun contract).
fn finalize_bookmarks(doc: &mut Document) {
    let mut index = 0usize;
    for block in doc.blocks_mut() {
        let slug = crate::model::slugify(&block.original_text);
        if let BlockKind::Heading { bookmark_id, .. } = &mut block.kind {
            index += 1;
            *bookmark_id = if slug.is_empty() {
                format!("bm-{index:03}")
            } else {
                format!("bm-{index:03}-{slug}")
            };
        }
    }
}

/// First H1 text, else the source default.
fn derive_title(doc: &Document) -> String {
    doc.blocks()
        .find_map(|b| match &b.kind {
            BlockKind::Heading { level: 1, .. } => Some(b.original_text.clone()),
            _ => None,
        })
        .unwrap_or_else(|| "Untitled Document".to_string())
}
