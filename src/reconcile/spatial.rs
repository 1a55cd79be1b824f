//! Spatial analysis: image association, caption linking, and reading order.
//!
//! Images arrive from the visual extractor as positioned binaries with no
//! relation to the text stream. This module filters out decorative
//! elements, attaches each surviving image to its nearest text block,
//! promotes `Figure N:`-style lines to Caption blocks, and computes a total
//! reading order per page via a top-to-bottom / left-to-right sweep with
//! 1-D k-means column detection (k ∈ {1, 2} on block x-centers).

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::config::ReconciliationConfig;
use crate::extract::VisualAsset;
use crate::model::{BBox, BlockKind, ContentBlock, SpatialRelationship};

static RE_CAPTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(Figure|Fig\.|Table)\s+\d+").unwrap());

// ── Decorative filter ────────────────────────────────────────────────────

/// Drop decorative images: extreme aspect ratios (rules, borders) and
/// anything below the minimum dimension.
pub fn filter_decorative(assets: Vec<VisualAsset>, config: &ReconciliationConfig) -> Vec<VisualAsset> {
    let before = assets.len();
    let kept: Vec<VisualAsset> = assets
        .into_iter()
        .filter(|a| {
            a.aspect_ratio <= config.max_aspect_ratio as f32
                && a.min_dim_px >= config.min_image_width_px.min(config.min_image_height_px)
        })
        .collect();
    if kept.len() != before {
        debug!("filtered {} decorative image(s)", before - kept.len());
    }
    kept
}

// ── Image association ────────────────────────────────────────────────────

/// Spatial relationship of an image to its nearest text block, judged by
/// relative center positions (overlap beats direction).
pub fn relationship_to(image: &BBox, text: &BBox) -> SpatialRelationship {
    let (ix, iy) = image.center();
    let (tx, ty) = text.center();

    if image.vertical_overlap(text) {
        // Side-by-side with overlapping vertical extent.
        if (ix - tx).abs() > (iy - ty).abs() {
            return SpatialRelationship::Alongside;
        }
        return SpatialRelationship::Wrapped;
    }
    if iy < ty {
        SpatialRelationship::Before
    } else {
        SpatialRelationship::After
    }
}

/// Index of the text block nearest to `image` by center distance.
pub fn nearest_block(image: &BBox, blocks: &[ContentBlock]) -> Option<usize> {
    blocks
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            image
                .center_distance(&a.bounding_box)
                .partial_cmp(&image.center_distance(&b.bounding_box))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
}

/// Find a caption line for a figure: the closest block on the page whose
/// text starts `Figure N` / `Fig. N` / `Table N`, within a vertical band
/// around the figure.
pub fn find_caption_index(image: &BBox, blocks: &[ContentBlock]) -> Option<usize> {
    blocks
        .iter()
        .enumerate()
        .filter(|(_, b)| RE_CAPTION.is_match(b.original_text.trim()))
        .filter(|(_, b)| {
            // Captions sit near their figure, typically just below it.
            let band = image.height().max(40.0) * 1.5;
            (b.bounding_box.y0 - image.y1).abs() <= band
                || (image.y0 - b.bounding_box.y1).abs() <= band
        })
        .min_by(|(_, a), (_, b)| {
            image
                .center_distance(&a.bounding_box)
                .partial_cmp(&image.center_distance(&b.bounding_box))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
}

pub fn is_caption_text(text: &str) -> bool {
    RE_CAPTION.is_match(text.trim())
}

// ── Reading order ────────────────────────────────────────────────────────

/// Sort a page's blocks into reading order and return the permutation.
///
/// Column detection: 1-D k-means with k = 2 on block x-centers; two
/// columns are accepted only when the cluster means separate by more than
/// a quarter of the page width and neither cluster is trivial. Otherwise
/// the page is single-column and the sweep is purely top-to-bottom.
pub fn reading_order(blocks: &[ContentBlock], page_width: f32) -> Vec<usize> {
    if blocks.is_empty() {
        return Vec::new();
    }

    let centers: Vec<f32> = blocks
        .iter()
        .map(|b| b.bounding_box.center().0)
        .collect();

    let mut order: Vec<usize> = (0..blocks.len()).collect();

    match split_columns(&centers, page_width) {
        Some(assignment) => {
            // Left column first (all rows), then right column.
            order.sort_by(|&a, &b| {
                assignment[a]
                    .cmp(&assignment[b])
                    .then_with(|| {
                        blocks[a]
                            .bounding_box
                            .y0
                            .partial_cmp(&blocks[b].bounding_box.y0)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .then_with(|| {
                        blocks[a]
                            .bounding_box
                            .x0
                            .partial_cmp(&blocks[b].bounding_box.x0)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
            });
        }
        None => {
            order.sort_by(|&a, &b| {
                blocks[a]
                    .bounding_box
                    .y0
                    .partial_cmp(&blocks[b].bounding_box.y0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| {
                        blocks[a]
                            .bounding_box
                            .x0
                            .partial_cmp(&blocks[b].bounding_box.x0)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
            });
        }
    }

    order
}

/// 1-D 2-means on x-centers. Returns per-block column assignment (0 left,
/// 1 right) when the page is genuinely two-column, `None` otherwise.
fn split_columns(centers: &[f32], page_width: f32) -> Option<Vec<usize>> {
    if centers.len() < 4 {
        return None;
    }

    let min = centers.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = centers.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if (max - min) < page_width * 0.2 {
        return None;
    }

    let mut mean_left = min;
    let mut mean_right = max;
    let mut assignment = vec![0usize; centers.len()];

    for _ in 0..10 {
        for (i, &c) in centers.iter().enumerate() {
            assignment[i] = usize::from((c - mean_left).abs() > (c - mean_right).abs());
        }
        let (mut sum_l, mut n_l, mut sum_r, mut n_r) = (0.0f32, 0usize, 0.0f32, 0usize);
        for (i, &c) in centers.iter().enumerate() {
            if assignment[i] == 0 {
                sum_l += c;
                n_l += 1;
            } else {
                sum_r += c;
                n_r += 1;
            }
        }
        if n_l == 0 || n_r == 0 {
            return None;
        }
        let new_left = sum_l / n_l as f32;
        let new_right = sum_r / n_r as f32;
        if (new_left - mean_left).abs() < 0.5 && (new_right - mean_right).abs() < 0.5 {
            mean_left = new_left;
            mean_right = new_right;
            break;
        }
        mean_left = new_left;
        mean_right = new_right;
    }

    // Accept two columns only with clear separation and non-trivial sides.
    let n_left = assignment.iter().filter(|&&a| a == 0).count();
    let n_right = assignment.len() - n_left;
    let balanced = n_left * 5 >= assignment.len() && n_right * 5 >= assignment.len();
    if (mean_right - mean_left) > page_width * 0.25 && balanced {
        Some(assignment)
    } else {
        None
    }
}

/// Stamp `reading_order_position` on every image placeholder in the given
/// (already ordered) page block slice.
pub fn stamp_reading_positions(blocks: &mut [ContentBlock]) {
    for (position, block) in blocks.iter_mut().enumerate() {
        if let BlockKind::ImagePlaceholder {
            reading_order_position,
            ..
        } = &mut block.kind
        {
            *reading_order_position = position;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContentBlock;

    fn asset(id: &str, min_dim: u32, aspect: f32) -> VisualAsset {
        VisualAsset {
            asset_id: id.to_string(),
            bytes: vec![0u8; 4],
            mime_type: "image/png".into(),
            bbox: BBox::new(0.0, 0.0, 100.0, 100.0),
            page_index: 0,
            min_dim_px: min_dim,
            aspect_ratio: aspect,
        }
    }

    #[test]
    fn decorative_images_are_dropped() {
        let cfg = ReconciliationConfig::default();
        let kept = filter_decorative(
            vec![
                asset("good", 120, 1.5),
                asset("hairline", 800, 40.0), // aspect > 20
                asset("tiny", 8, 1.0),        // min dim < 50
            ],
            &cfg,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].asset_id, "good");
    }

    #[test]
    fn relationship_detects_above_below_and_alongside() {
        let text = BBox::new(50.0, 200.0, 550.0, 260.0);
        assert_eq!(
            relationship_to(&BBox::new(50.0, 40.0, 300.0, 160.0), &text),
            SpatialRelationship::Before
        );
        assert_eq!(
            relationship_to(&BBox::new(50.0, 300.0, 300.0, 420.0), &text),
            SpatialRelationship::After
        );
        assert_eq!(
            relationship_to(&BBox::new(560.0, 190.0, 610.0, 270.0), &text),
            SpatialRelationship::Alongside
        );
    }

    #[test]
    fn caption_patterns_match() {
        assert!(is_caption_text("Figure 1: System architecture."));
        assert!(is_caption_text("Fig. 12 shows the decay"));
        assert!(is_caption_text("Table 3"));
        assert!(!is_caption_text("The figure below shows"));
    }

    #[test]
    fn caption_search_prefers_nearby_caption_line() {
        let image = BBox::new(100.0, 100.0, 300.0, 260.0);
        let blocks = vec![
            ContentBlock::paragraph(1, BBox::new(50.0, 20.0, 550.0, 60.0), "Intro text."),
            ContentBlock::paragraph(
                1,
                BBox::new(100.0, 270.0, 400.0, 284.0),
                "Figure 1: System architecture.",
            ),
            ContentBlock::paragraph(
                1,
                BBox::new(50.0, 700.0, 550.0, 714.0),
                "Figure 2: A distant caption.",
            ),
        ];
        let idx = find_caption_index(&image, &blocks).unwrap();
        assert_eq!(idx, 1);
    }

    #[test]
    fn single_column_sweep_is_top_to_bottom() {
        let blocks = vec![
            ContentBlock::paragraph(1, BBox::new(50.0, 300.0, 550.0, 320.0), "third"),
            ContentBlock::paragraph(1, BBox::new(50.0, 100.0, 550.0, 120.0), "first"),
            ContentBlock::paragraph(1, BBox::new(50.0, 200.0, 550.0, 220.0), "second"),
        ];
        let order = reading_order(&blocks, 612.0);
        let texts: Vec<&str> = order
            .iter()
            .map(|&i| blocks[i].original_text.as_str())
            .collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[test]
    fn two_column_page_reads_left_column_first() {
        // Left column x≈50..280, right column x≈330..560.
        let mut blocks = Vec::new();
        for row in 0..3 {
            let y = 100.0 + row as f32 * 120.0;
            blocks.push(ContentBlock::paragraph(
                1,
                BBox::new(50.0, y, 280.0, y + 20.0),
                &format!("L{row}"),
            ));
            blocks.push(ContentBlock::paragraph(
                1,
                BBox::new(330.0, y, 560.0, y + 20.0),
                &format!("R{row}"),
            ));
        }
        let order = reading_order(&blocks, 612.0);
        let texts: Vec<&str> = order
            .iter()
            .map(|&i| blocks[i].original_text.as_str())
            .collect();
        assert_eq!(texts, vec!["L0", "L1", "L2", "R0", "R1", "R2"]);
    }

    #[test]
    fn reading_positions_stamped_on_images() {
        let mut blocks = vec![
            ContentBlock::paragraph(1, BBox::default(), "text"),
            ContentBlock::new(
                BlockKind::ImagePlaceholder {
                    image_asset_id: "a".into(),
                    caption_id: None,
                    spatial_relationship: SpatialRelationship::After,
                    reading_order_position: 0,
                },
                1,
                BBox::default(),
                "",
            ),
        ];
        stamp_reading_positions(&mut blocks);
        match &blocks[1].kind {
            BlockKind::ImagePlaceholder {
                reading_order_position,
                ..
            } => assert_eq!(*reading_order_position, 1),
            other => panic!("expected image, got {other:?}"),
        }
    }
}
