//! The translation strategy router.
//!
//! For each block the router decides a [`Strategy`] and a model tier. The
//! mapping from block kind to strategy is fixed; only Paragraph routing is
//! influenced by the global [`RoutingProfile`] knob, via the complexity
//! threshold. Preserve and self-correcting choices never change with the
//! knob.
//!
//! | Block kind        | Strategy                 |
//! |-------------------|--------------------------|
//! | MathFormula       | Preserve                 |
//! | CodeBlock         | Preserve                 |
//! | ImagePlaceholder  | Preserve                 |
//! | Table             | SelfCorrecting           |
//! | Heading           | MarkdownAwareQuality     |
//! | Footnote          | MarkdownAwareQuality     |
//! | Caption           | MarkdownAwareQuality     |
//! | Paragraph simple  | MarkdownAwareCost        |
//! | Paragraph complex | MarkdownAwareQuality     |

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::RoutingConfig;
use crate::model::{BlockKind, ContentBlock};

static RE_CITATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\d+\]").unwrap());
static RE_INLINE_MATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$[^$]+\$").unwrap());
static RE_NESTED_MARKUP: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*|__|`").unwrap());
static RE_MOSTLY_SYMBOLIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\d\s\p{P}ivxlcdm]+$").unwrap());

/// Glossary terms whose presence marks a paragraph as domain-heavy enough
/// for the quality tier.
const RARE_GLOSSARY_TERMS: &[&str] = &[
    "theorem",
    "lemma",
    "corollary",
    "isomorphism",
    "eigenvalue",
    "covariance",
    "homomorphism",
    "manifold",
];

/// How a block travels through the translation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Copy `original_text` into `translated_text`; no API call.
    Preserve,
    /// Translate → validate → targeted correction loop.
    SelfCorrecting,
    /// Transport-form translation on the quality model tier.
    MarkdownAwareQuality,
    /// Transport-form translation on the cost model tier.
    MarkdownAwareCost,
}

impl Strategy {
    pub fn uses_endpoint(self) -> bool {
        self != Strategy::Preserve
    }
}

/// The routing decision for one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub strategy: Strategy,
    /// Model identifier for the call; empty for preserve.
    pub model: String,
    /// Complexity score that drove a paragraph decision (0 for others).
    pub complexity: f32,
}

/// Decide the strategy and tier for a block.
pub fn route_block(block: &ContentBlock, config: &RoutingConfig) -> Route {
    match &block.kind {
        BlockKind::MathFormula { .. }
        | BlockKind::CodeBlock { .. }
        | BlockKind::ImagePlaceholder { .. } => Route {
            strategy: Strategy::Preserve,
            model: String::new(),
            complexity: 0.0,
        },

        BlockKind::Table { .. } => Route {
            strategy: Strategy::SelfCorrecting,
            model: config.quality_model.clone(),
            complexity: 0.0,
        },

        BlockKind::Heading { .. } | BlockKind::Footnote { .. } | BlockKind::Caption { .. } => {
            Route {
                strategy: Strategy::MarkdownAwareQuality,
                model: config.quality_model.clone(),
                complexity: 0.0,
            }
        }

        BlockKind::ListItem { .. } => Route {
            strategy: Strategy::MarkdownAwareCost,
            model: config.cost_model.clone(),
            complexity: 0.0,
        },

        BlockKind::Paragraph { .. } => {
            // Content not worth an API call (bare numbers, roman numerals,
            // punctuation runs) preserves as-is.
            let text = block.original_text.trim();
            if text.len() < 3 || RE_MOSTLY_SYMBOLIC.is_match(&text.to_lowercase()) {
                return Route {
                    strategy: Strategy::Preserve,
                    model: String::new(),
                    complexity: 0.0,
                };
            }

            let complexity = complexity_score(text);
            if complexity >= config.effective_threshold() {
                Route {
                    strategy: Strategy::MarkdownAwareQuality,
                    model: config.quality_model.clone(),
                    complexity,
                }
            } else {
                Route {
                    strategy: Strategy::MarkdownAwareCost,
                    model: config.cost_model.clone(),
                    complexity,
                }
            }
        }
    }
}

/// Weighted complexity score in [0, 1].
///
/// Components: word count (long paragraphs carry more compounding context),
/// citation density, inline math markers, parenthetical nesting depth, and
/// rare glossary terms.
pub fn complexity_score(text: &str) -> f32 {
    let words = text.split_whitespace().count() as f32;
    let word_component = (words / 120.0).min(1.0) * 0.25;

    let citations = RE_CITATION.find_iter(text).count() as f32;
    let citation_component = (citations / 4.0).min(1.0) * 0.2;

    let math = RE_INLINE_MATH.find_iter(text).count() as f32;
    let math_component = (math / 2.0).min(1.0) * 0.25;

    let depth = max_paren_depth(text) as f32;
    let paren_component = (depth / 3.0).min(1.0) * 0.1;

    let lower = text.to_lowercase();
    let glossary_hits = RARE_GLOSSARY_TERMS
        .iter()
        .filter(|t| lower.contains(**t))
        .count() as f32;
    let glossary_component = (glossary_hits / 2.0).min(1.0) * 0.1;

    let markup_component = if RE_NESTED_MARKUP.is_match(text) { 0.1 } else { 0.0 };

    word_component
        + citation_component
        + math_component
        + paren_component
        + glossary_component
        + markup_component
}

fn max_paren_depth(text: &str) -> usize {
    let mut depth = 0usize;
    let mut max = 0usize;
    for c in text.chars() {
        match c {
            '(' => {
                depth += 1;
                max = max.max(depth);
            }
            ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingProfile;
    use crate::model::{BBox, DisplayMode};

    fn cfg() -> RoutingConfig {
        RoutingConfig::default()
    }

    #[test]
    fn preserve_kinds_never_call_the_endpoint() {
        let math = ContentBlock::new(
            BlockKind::MathFormula {
                latex: "$x$".into(),
                display_mode: DisplayMode::Inline,
            },
            1,
            BBox::default(),
            "$x$",
        );
        let route = route_block(&math, &cfg());
        assert_eq!(route.strategy, Strategy::Preserve);
        assert!(!route.strategy.uses_endpoint());

        let code = ContentBlock::new(
            BlockKind::CodeBlock { language: None },
            1,
            BBox::default(),
            "let x = 1;",
        );
        assert_eq!(route_block(&code, &cfg()).strategy, Strategy::Preserve);
    }

    #[test]
    fn tables_always_self_correct() {
        let table = ContentBlock::new(
            BlockKind::Table {
                rows: vec![vec!["a".into(), "b".into()]],
                header_rows: 1,
                caption_id: None,
            },
            1,
            BBox::default(),
            "| a | b |",
        );
        // The knob must not change this.
        for profile in [
            RoutingProfile::CostOptimized,
            RoutingProfile::QualityFocused,
            RoutingProfile::Balanced,
            RoutingProfile::SpeedFocused,
        ] {
            let mut c = cfg();
            c.strategy = profile;
            assert_eq!(route_block(&table, &c).strategy, Strategy::SelfCorrecting);
        }
    }

    #[test]
    fn headings_and_footnotes_take_the_quality_tier() {
        let heading = ContentBlock::heading(1, BBox::default(), "Introduction", 1);
        let route = route_block(&heading, &cfg());
        assert_eq!(route.strategy, Strategy::MarkdownAwareQuality);
        assert_eq!(route.model, cfg().quality_model);

        let footnote = ContentBlock::new(
            BlockKind::Footnote {
                reference_id: "1".into(),
                origin_page: 1,
            },
            1,
            BBox::default(),
            "See Smith 2020.",
        );
        assert_eq!(
            route_block(&footnote, &cfg()).strategy,
            Strategy::MarkdownAwareQuality
        );
    }

    #[test]
    fn simple_paragraph_takes_cost_tier() {
        let para = ContentBlock::paragraph(
            1,
            BBox::default(),
            "The quick brown fox jumps over the lazy dog.",
        );
        let route = route_block(&para, &cfg());
        assert_eq!(route.strategy, Strategy::MarkdownAwareCost);
        assert_eq!(route.model, cfg().cost_model);
    }

    #[test]
    fn complex_paragraph_takes_quality_tier() {
        let text = "We prove the theorem [1] using the eigenvalue decomposition \
                    $A = Q \\Lambda Q^{-1}$ (see also [2], [3] (and (nested) remarks)) \
                    where the covariance structure follows the manifold hypothesis \
                    [4] as introduced earlier in this lemma.";
        let para = ContentBlock::paragraph(1, BBox::default(), text);
        let route = route_block(&para, &cfg());
        assert_eq!(route.strategy, Strategy::MarkdownAwareQuality);
        assert!(route.complexity >= cfg().effective_threshold());
    }

    #[test]
    fn bare_numbers_preserve_without_an_api_call() {
        let para = ContentBlock::paragraph(1, BBox::default(), "1 2 3 4 5");
        assert_eq!(route_block(&para, &cfg()).strategy, Strategy::Preserve);

        let roman = ContentBlock::paragraph(1, BBox::default(), "xiv");
        assert_eq!(route_block(&roman, &cfg()).strategy, Strategy::Preserve);
    }

    #[test]
    fn quality_profile_lowers_the_bar_for_quality_routing() {
        let text = "A moderately complex sentence citing [1] and little else in particular here.";
        let para = ContentBlock::paragraph(1, BBox::default(), text);

        let mut cost = cfg();
        cost.strategy = RoutingProfile::CostOptimized;
        let mut quality = cfg();
        quality.strategy = RoutingProfile::QualityFocused;

        let cost_route = route_block(&para, &cost);
        let quality_route = route_block(&para, &quality);

        // The same text must never get a *cheaper* tier under the quality
        // profile than under the cost profile.
        let rank = |s: Strategy| match s {
            Strategy::MarkdownAwareCost => 0,
            Strategy::MarkdownAwareQuality => 1,
            _ => unreachable!(),
        };
        assert!(rank(quality_route.strategy) >= rank(cost_route.strategy));
    }

    #[test]
    fn complexity_score_is_bounded() {
        let wild = format!(
            "{} [1][2][3][4][5] $a$ $b$ $c$ ((((deep)))) theorem lemma manifold **bold**",
            "word ".repeat(300)
        );
        let score = complexity_score(&wild);
        assert!(score <= 1.0 + f32::EPSILON, "got {score}");
        assert!(complexity_score("short") < 0.1);
    }
}
