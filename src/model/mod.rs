//! The structured document model.
//!
//! Every pipeline stage speaks [`ContentBlock`]: a tagged variant with the
//! common fields (id, page, bounding box, original/translated text,
//! metadata) and a [`BlockKind`] payload. A [`Document`] owns pages of
//! blocks in reading order, a footnote tail section, the binary asset
//! store, and the font profile derived by global font analysis.
//!
//! The model is deliberately *closed*: downstream components match on the
//! kind tag rather than downcasting, and blocks are mutated only by setting
//! `translated_text`. Reordering and merging happen exactly once, inside
//! the reconciler, before any translation starts.

mod block;
mod document;
mod font;

pub use block::{
    AssetId, BBox, BlockId, BlockKind, ContentBlock, DisplayMode, SpatialRelationship,
    TRANSLATION_FAILED_MARKER, TRANSLATION_FAILED_META_KEY,
};
pub(crate) use block::slugify;
pub use document::{AssetRecord, AssetStore, BlockCensus, Document, Page};
pub use font::{FontProfile, FontStyle};
