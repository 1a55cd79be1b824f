//! Content blocks: the tagged-variant atom of a document.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata key set on a block whose translation failed terminally.
pub const TRANSLATION_FAILED_META_KEY: &str = "translation_failed";

/// Marker substituted into output for quarantined blocks.
pub const TRANSLATION_FAILED_MARKER: &str = "[TRANSLATION_FAILED]";

/// Unique identifier of a content block within a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(Uuid);

impl BlockId {
    pub fn new() -> Self {
        BlockId(Uuid::new_v4())
    }
}

impl Default for BlockId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stable identifier of a binary asset in the [`crate::model::AssetStore`].
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct AssetId(pub String);

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for AssetId {
    fn from(s: &str) -> Self {
        AssetId(s.to_string())
    }
}

/// Axis-aligned bounding box in page coordinates (origin top-left).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BBox {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> f32 {
        (self.x1 - self.x0).abs()
    }

    pub fn height(&self) -> f32 {
        (self.y1 - self.y0).abs()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0)
    }

    /// Euclidean distance between box centers. Used by the reconciler to
    /// pick the nearest text block for each extracted image.
    pub fn center_distance(&self, other: &BBox) -> f32 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }

    /// Whether the vertical extents of two boxes overlap.
    pub fn vertical_overlap(&self, other: &BBox) -> bool {
        self.y0.max(other.y0) < self.y1.min(other.y1)
    }
}

/// Whether a math formula renders inline or as its own display block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    Inline,
    Block,
}

/// Spatial relation of an image to its nearest text block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpatialRelationship {
    Before,
    After,
    Alongside,
    Wrapped,
}

/// The variant payload of a [`ContentBlock`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    Heading {
        /// 1..=6; enforced by the reconciler's font analysis.
        level: u8,
        /// Unique anchor name, stable from creation through assembly.
        bookmark_id: String,
        /// Section numbering as printed in the source ("2.1.3"), if any.
        numbering: Option<String>,
    },
    Paragraph {
        /// True when this paragraph was produced by merging a line that
        /// continued across block (or page) boundaries.
        is_continuation: bool,
    },
    ListItem {
        /// The literal marker as extracted ("-", "2.", "a)").
        marker: String,
        nesting_level: usize,
        ordered: bool,
    },
    Footnote {
        /// Matches exactly one inline marker in some paragraph ("1", "*").
        reference_id: String,
        origin_page: usize,
    },
    Table {
        rows: Vec<Vec<String>>,
        /// 0 or 1.
        header_rows: usize,
        caption_id: Option<BlockId>,
    },
    Caption {
        /// The table or image this caption belongs to.
        target_id: BlockId,
    },
    /// Never translated; `latex` carries verbatim through the pipeline.
    MathFormula {
        latex: String,
        display_mode: DisplayMode,
    },
    /// Never translated.
    CodeBlock { language: Option<String> },
    /// Binary carried through untouched; only the caption (a separate
    /// block) is translated.
    ImagePlaceholder {
        image_asset_id: AssetId,
        caption_id: Option<BlockId>,
        spatial_relationship: SpatialRelationship,
        reading_order_position: usize,
    },
}

impl BlockKind {
    /// Stable lowercase name of the variant, used in logs, quarantine
    /// records, and the audit census.
    pub fn name(&self) -> &'static str {
        match self {
            BlockKind::Heading { .. } => "heading",
            BlockKind::Paragraph { .. } => "paragraph",
            BlockKind::ListItem { .. } => "list_item",
            BlockKind::Footnote { .. } => "footnote",
            BlockKind::Table { .. } => "table",
            BlockKind::Caption { .. } => "caption",
            BlockKind::MathFormula { .. } => "math_formula",
            BlockKind::CodeBlock { .. } => "code_block",
            BlockKind::ImagePlaceholder { .. } => "image_placeholder",
        }
    }
}

/// One block of document content: common fields plus a [`BlockKind`] payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    pub id: BlockId,
    /// 1-indexed source page.
    pub page_number: usize,
    pub bounding_box: BBox,
    pub original_text: String,
    /// Set exactly once, by the router (preserve) or the translator.
    pub translated_text: Option<String>,
    /// Free-form annotations (failure markers, extraction provenance).
    /// BTreeMap keeps serialisation deterministic for the round-trip
    /// guarantee.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub kind: BlockKind,
}

impl ContentBlock {
    pub fn new(kind: BlockKind, page_number: usize, bounding_box: BBox, text: &str) -> Self {
        Self {
            id: BlockId::new(),
            page_number,
            bounding_box,
            original_text: text.to_string(),
            translated_text: None,
            metadata: BTreeMap::new(),
            kind,
        }
    }

    pub fn paragraph(page_number: usize, bbox: BBox, text: &str) -> Self {
        Self::new(
            BlockKind::Paragraph {
                is_continuation: false,
            },
            page_number,
            bbox,
            text,
        )
    }

    pub fn heading(page_number: usize, bbox: BBox, text: &str, level: u8) -> Self {
        let bookmark_id = bookmark_for(text, page_number);
        Self::new(
            BlockKind::Heading {
                level: level.clamp(1, 6),
                bookmark_id,
                numbering: None,
            },
            page_number,
            bbox,
            text,
        )
    }

    /// Whether this block is copied through verbatim (no API call).
    pub fn is_preserve(&self) -> bool {
        matches!(
            self.kind,
            BlockKind::MathFormula { .. }
                | BlockKind::CodeBlock { .. }
                | BlockKind::ImagePlaceholder { .. }
        )
    }

    /// Whether this block carries text that goes to the translator.
    pub fn is_translatable(&self) -> bool {
        matches!(
            self.kind,
            BlockKind::Heading { .. }
                | BlockKind::Paragraph { .. }
                | BlockKind::ListItem { .. }
                | BlockKind::Footnote { .. }
                | BlockKind::Caption { .. }
                | BlockKind::Table { .. }
        )
    }

    /// Translated text when available, original otherwise. Assembly always
    /// renders through this so quarantined blocks fall back gracefully.
    pub fn effective_text(&self) -> &str {
        self.translated_text.as_deref().unwrap_or(&self.original_text)
    }

    /// Mark the block as terminally failed and substitute the original.
    pub fn mark_translation_failed(&mut self) {
        self.metadata.insert(
            TRANSLATION_FAILED_META_KEY.to_string(),
            TRANSLATION_FAILED_MARKER.to_string(),
        );
        self.translated_text = Some(self.original_text.clone());
    }

    pub fn translation_failed(&self) -> bool {
        self.metadata.contains_key(TRANSLATION_FAILED_META_KEY)
    }

    /// The bookmark id, for headings.
    pub fn bookmark_id(&self) -> Option<&str> {
        match &self.kind {
            BlockKind::Heading { bookmark_id, .. } => Some(bookmark_id),
            _ => None,
        }
    }
}

/// Lowercased, dash-separated slug of the leading heading characters.
pub(crate) fn slugify(text: &str) -> String {
    let slug: String = text
        .chars()
        .take(40)
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    slug.trim_matches('-').to_string()
}

/// Provisional anchor name for a freshly classified heading.
///
/// The reconciler renumbers bookmarks deterministically (document order)
/// once the final heading set is known, so reruns produce byte-identical
/// output; the random suffix only disambiguates until then.
fn bookmark_for(text: &str, page: usize) -> String {
    let slug = slugify(text);
    let suffix = &Uuid::new_v4().simple().to_string()[..8];
    if slug.is_empty() {
        format!("bm-p{page}-{suffix}")
    } else {
        format!("bm-{slug}-p{page}-{suffix}")
    }
}
