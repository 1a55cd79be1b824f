//! Font profile: the document-wide result of global font analysis.

use serde::{Deserialize, Serialize};

/// A (name, size, bold, italic) style as observed on text fragments.
///
/// Sizes are quantized to tenths of a point so that near-identical float
/// sizes (11.99 vs 12.0) tally into the same bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FontStyle {
    pub name: String,
    pub size_tenths: u32,
    pub bold: bool,
    pub italic: bool,
}

impl FontStyle {
    pub fn new(name: &str, size: f32, bold: bool, italic: bool) -> Self {
        Self {
            name: name.to_string(),
            size_tenths: (size * 10.0).round().max(0.0) as u32,
            bold,
            italic,
        }
    }

    pub fn size(&self) -> f32 {
        self.size_tenths as f32 / 10.0
    }
}

/// Dominant body style plus the size → heading-level map derived from
/// whole-document frequency analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FontProfile {
    /// The most frequent style in the document, treated as body text.
    pub body: Option<FontStyle>,
    /// Heading-eligible sizes (tenths) sorted descending, largest = H1.
    /// At most six entries; anything smaller is not a heading.
    pub heading_sizes: Vec<u32>,
}

impl FontProfile {
    /// Heading level for a fragment of the given size, if the size ranks
    /// among the heading-eligible sizes. Largest size maps to level 1.
    pub fn heading_level_for(&self, size: f32) -> Option<u8> {
        let tenths = (size * 10.0).round() as u32;
        self.heading_sizes
            .iter()
            .position(|&s| s == tenths)
            .map(|rank| (rank as u8 + 1).min(6))
    }

    pub fn body_size(&self) -> f32 {
        self.body.as_ref().map(|b| b.size()).unwrap_or(10.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_quantize_to_tenths() {
        let a = FontStyle::new("Times", 11.99, false, false);
        let b = FontStyle::new("Times", 12.0, false, false);
        assert_eq!(a.size_tenths, b.size_tenths);
    }

    #[test]
    fn heading_levels_rank_by_size() {
        let profile = FontProfile {
            body: Some(FontStyle::new("Times", 10.0, false, false)),
            heading_sizes: vec![240, 180, 140],
        };
        assert_eq!(profile.heading_level_for(24.0), Some(1));
        assert_eq!(profile.heading_level_for(18.0), Some(2));
        assert_eq!(profile.heading_level_for(14.0), Some(3));
        assert_eq!(profile.heading_level_for(10.0), None);
    }
}
