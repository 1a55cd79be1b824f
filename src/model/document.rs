//! Document, pages, the asset store, and the model-level invariants.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::block::{AssetId, BlockId, BlockKind, ContentBlock};
use super::font::FontProfile;
use crate::error::PipelineError;

/// One binary asset (an extracted figure) plus its content type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Binary assets keyed by stable id. BTreeMap keeps serialisation
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetStore {
    assets: BTreeMap<AssetId, AssetRecord>,
}

impl AssetStore {
    pub fn insert(&mut self, id: AssetId, bytes: Vec<u8>, mime_type: &str) {
        self.assets.insert(
            id,
            AssetRecord {
                bytes,
                mime_type: mime_type.to_string(),
            },
        );
    }

    pub fn get(&self, id: &AssetId) -> Option<&AssetRecord> {
        self.assets.get(id)
    }

    pub fn contains(&self, id: &AssetId) -> bool {
        self.assets.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AssetId, &AssetRecord)> {
        self.assets.iter()
    }
}

/// One source page: an ordered sequence of blocks in reading order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// 1-indexed.
    pub number: usize,
    pub blocks: Vec<ContentBlock>,
}

impl Page {
    pub fn new(number: usize) -> Self {
        Self {
            number,
            blocks: Vec::new(),
        }
    }
}

/// Per-stage census of block counts, logged at every stage boundary.
///
/// Any decrease in `image_blocks` between consecutive stages is an error
/// (see [`crate::trace::Tracer::audit`]).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCensus {
    pub total_blocks: usize,
    pub image_blocks: usize,
    pub text_blocks: usize,
    pub math_blocks: usize,
    pub table_blocks: usize,
}

/// The top-level container traversing the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub source_path: Option<PathBuf>,
    pub pages: Vec<Page>,
    /// Footnotes relocated out of page flow by the reconciler, in original
    /// reference order. Rendered into the trailing "Notes" section.
    pub footnotes: Vec<ContentBlock>,
    pub assets: AssetStore,
    pub font_profile: FontProfile,
}

impl Document {
    pub fn new(title: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            ..Default::default()
        }
    }

    /// All blocks in document order: page flow first, footnote tail last.
    pub fn blocks(&self) -> impl Iterator<Item = &ContentBlock> {
        self.pages
            .iter()
            .flat_map(|p| p.blocks.iter())
            .chain(self.footnotes.iter())
    }

    pub fn blocks_mut(&mut self) -> impl Iterator<Item = &mut ContentBlock> {
        self.pages
            .iter_mut()
            .flat_map(|p| p.blocks.iter_mut())
            .chain(self.footnotes.iter_mut())
    }

    pub fn block_count(&self) -> usize {
        self.blocks().count()
    }

    pub fn is_empty(&self) -> bool {
        self.block_count() == 0
    }

    pub fn find_block(&self, id: BlockId) -> Option<&ContentBlock> {
        self.blocks().find(|b| b.id == id)
    }

    pub fn find_block_mut(&mut self, id: BlockId) -> Option<&mut ContentBlock> {
        self.blocks_mut().find(|b| b.id == id)
    }

    pub fn headings(&self) -> impl Iterator<Item = &ContentBlock> {
        self.blocks()
            .filter(|b| matches!(b.kind, BlockKind::Heading { .. }))
    }

    pub fn image_placeholder_count(&self) -> usize {
        self.blocks()
            .filter(|b| matches!(b.kind, BlockKind::ImagePlaceholder { .. }))
            .count()
    }

    /// Blocks whose text goes through the translation router.
    pub fn translatable_blocks(&self) -> impl Iterator<Item = &ContentBlock> {
        self.blocks().filter(|b| b.is_translatable())
    }

    /// Snapshot for the stage-boundary audits.
    pub fn census(&self) -> BlockCensus {
        let mut census = BlockCensus::default();
        for block in self.blocks() {
            census.total_blocks += 1;
            match block.kind {
                BlockKind::ImagePlaceholder { .. } => census.image_blocks += 1,
                BlockKind::MathFormula { .. } => census.math_blocks += 1,
                BlockKind::Table { .. } => census.table_blocks += 1,
                _ => census.text_blocks += 1,
            }
        }
        census
    }

    /// Content fingerprint for warm-start detection: same source content
    /// hashes identically across runs (block ids are excluded).
    pub fn content_hash(&self) -> String {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for block in self.blocks() {
            for byte in block
                .kind
                .name()
                .bytes()
                .chain([b':'])
                .chain(block.original_text.bytes())
                .chain([b'|'])
            {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(0x1000_0000_01b3);
            }
        }
        format!("{hash:016x}")
    }

    /// Check the model invariants. Called after reconciliation and before
    /// assembly; a violation is fatal for the document.
    ///
    /// 1. Block ids are unique.
    /// 2. Footnote reference ids and inline markers are in bijection.
    /// 3. Caption targets resolve to a table or image in this document.
    /// 4. Image asset ids resolve to stored binaries.
    /// 5. Math/code blocks never carry a translation differing from the
    ///    original.
    /// 6. Heading bookmark ids are unique.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut ids = HashSet::new();
        let mut bookmarks = HashSet::new();

        for block in self.blocks() {
            if !ids.insert(block.id) {
                return Err(PipelineError::DocumentInvariant(format!(
                    "duplicate block id {}",
                    block.id
                )));
            }

            match &block.kind {
                BlockKind::Heading { bookmark_id, .. } => {
                    if !bookmarks.insert(bookmark_id.clone()) {
                        return Err(PipelineError::DocumentInvariant(format!(
                            "duplicate bookmark id '{bookmark_id}'"
                        )));
                    }
                }
                BlockKind::Caption { target_id } => {
                    let target = self.find_block(*target_id);
                    let ok = matches!(
                        target.map(|t| &t.kind),
                        Some(BlockKind::Table { .. })
                            | Some(BlockKind::ImagePlaceholder { .. })
                    );
                    if !ok {
                        return Err(PipelineError::DocumentInvariant(format!(
                            "caption {} targets missing or non-figure block {target_id}",
                            block.id
                        )));
                    }
                }
                BlockKind::ImagePlaceholder { image_asset_id, .. } => {
                    if !self.assets.contains(image_asset_id) {
                        return Err(PipelineError::DocumentInvariant(format!(
                            "image placeholder {} references unknown asset '{image_asset_id}'",
                            block.id
                        )));
                    }
                }
                BlockKind::MathFormula { .. } | BlockKind::CodeBlock { .. } => {
                    if let Some(t) = &block.translated_text {
                        if t != &block.original_text {
                            return Err(PipelineError::DocumentInvariant(format!(
                                "preserve block {} was altered by translation",
                                block.id
                            )));
                        }
                    }
                }
                _ => {}
            }
        }

        self.validate_footnote_bijection()
    }

    /// Invariant 2: every footnote's reference id has exactly one inline
    /// marker in some paragraph, and every inline marker resolves to
    /// exactly one footnote.
    fn validate_footnote_bijection(&self) -> Result<(), PipelineError> {
        let mut footnote_refs: BTreeMap<&str, usize> = BTreeMap::new();
        for fnote in &self.footnotes {
            if let BlockKind::Footnote { reference_id, .. } = &fnote.kind {
                *footnote_refs.entry(reference_id.as_str()).or_insert(0) += 1;
            }
        }

        for (reference_id, count) in &footnote_refs {
            if *count > 1 {
                return Err(PipelineError::DocumentInvariant(format!(
                    "footnote reference '[{reference_id}]' defined {count} times"
                )));
            }
            let marker = format!("[{reference_id}]");
            let inline_count: usize = self
                .pages
                .iter()
                .flat_map(|p| p.blocks.iter())
                .filter(|b| matches!(b.kind, BlockKind::Paragraph { .. }))
                .map(|b| b.original_text.matches(&marker).count())
                .sum();
            if inline_count != 1 {
                return Err(PipelineError::DocumentInvariant(format!(
                    "footnote reference '{marker}' has {inline_count} inline markers, expected exactly 1"
                )));
            }
        }
        Ok(())
    }
}
