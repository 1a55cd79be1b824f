//! Configuration types for the translation pipeline.
//!
//! All behaviour is controlled through [`PipelineConfig`], a hierarchical
//! structure mirroring the sections of the on-disk TOML file. Every key has
//! a default, so an empty file (or no file at all) yields a working
//! configuration; [`PipelineConfig::validate`] enforces the documented
//! ranges and maps violations to [`PipelineError::ConfigInvalid`]
//! (process exit code 1).
//!
//! # Design choice: serde defaults over a builder
//! The config is dominated by optional knobs with sensible defaults and is
//! loaded from a file far more often than constructed in code. Nested
//! `#[serde(default)]` structs keep the file format, the defaults, and the
//! in-memory representation in one place; tests and the CLI mutate fields
//! directly after loading.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Top-level configuration, one field per TOML section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub translation: TranslationConfig,
    pub routing: RoutingConfig,
    pub cache: CacheConfig,
    pub grouping: GroupingConfig,
    pub self_correction: SelfCorrectionConfig,
    pub reconciliation: ReconciliationConfig,
    pub tracing: TracingConfig,
    pub quarantine: QuarantineConfig,
}

/// `[translation]` — endpoint, model, and concurrency knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    /// Target language name or code ("Greek", "el").
    pub target_language: String,

    /// Model identifier sent to the endpoint.
    pub model_identifier: String,

    /// Sampling temperature, 0.0–1.0. Low values keep the model faithful
    /// to the source text, which is what translation wants.
    pub temperature: f32,

    /// Concurrent in-flight translation batches, 1–64.
    pub max_concurrent_translations: usize,

    /// Per-API-call timeout in seconds.
    pub request_timeout_seconds: u64,

    /// Per-extractor timeout in seconds.
    pub extractor_timeout_seconds: u64,

    /// Endpoint base URL. Empty means the caller must inject a provider.
    pub endpoint_url: String,

    /// API key. Prefer the environment variable; the config file value is
    /// a fallback for local development only.
    pub api_key: Option<String>,

    /// Environment variable consulted before `api_key`.
    pub api_key_env: String,

    /// Requests-per-minute budget for the token-bucket limiter.
    /// 0 disables rate limiting.
    pub requests_per_minute: u32,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            target_language: "English".to_string(),
            model_identifier: "gemini-1.5-flash-latest".to_string(),
            temperature: 0.1,
            max_concurrent_translations: 10,
            request_timeout_seconds: 600,
            extractor_timeout_seconds: 1200,
            endpoint_url: String::new(),
            api_key: None,
            api_key_env: "PDFTRANS_API_KEY".to_string(),
            requests_per_minute: 0,
        }
    }
}

impl TranslationConfig {
    /// Resolve the API key: environment first, config file second.
    pub fn resolve_api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| self.api_key.clone())
    }
}

/// Global routing profile. Shifts Paragraph thresholds only; never changes
/// preserve / self-correcting choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingProfile {
    CostOptimized,
    QualityFocused,
    #[default]
    Balanced,
    SpeedFocused,
}

/// `[routing]` — strategy profile and model tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub strategy: RoutingProfile,
    /// Model used for cost-tier paragraph batches.
    pub cost_model: String,
    /// Model used for quality-tier blocks (headings, footnotes, complex
    /// paragraphs, self-corrected tables).
    pub quality_model: String,
    /// Paragraph complexity score at or above which the quality tier is
    /// used. The profile nudges this value (see `effective_threshold`).
    pub complexity_threshold: f32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingProfile::Balanced,
            cost_model: "gemini-1.5-flash-latest".to_string(),
            quality_model: "gemini-1.5-pro-latest".to_string(),
            complexity_threshold: 0.5,
        }
    }
}

impl RoutingConfig {
    /// The threshold after applying the profile shift. Cost/speed profiles
    /// raise it (fewer quality calls); quality lowers it.
    pub fn effective_threshold(&self) -> f32 {
        let shift = match self.strategy {
            RoutingProfile::CostOptimized => 0.25,
            RoutingProfile::SpeedFocused => 0.15,
            RoutingProfile::Balanced => 0.0,
            RoutingProfile::QualityFocused => -0.25,
        };
        (self.complexity_threshold + shift).clamp(0.05, 0.95)
    }
}

/// `[cache]` — two-tier semantic cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enable_memory: bool,
    pub memory_capacity: usize,
    pub enable_persistent: bool,
    pub persistent_path: PathBuf,
    pub persistent_capacity: usize,
    /// Cosine similarity cutoff for semantic hits, 0.0–1.0. A similarity
    /// exactly at the threshold is a hit.
    pub similarity_threshold: f32,
    /// Identifier of the sentence-embedding model used for the semantic
    /// tier. The bundled default is a deterministic hashed bag-of-words
    /// embedder that needs no model download.
    pub embedding_model: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_memory: true,
            memory_capacity: 1_000,
            enable_persistent: true,
            persistent_path: PathBuf::from("cache/persistent"),
            persistent_capacity: 10_000,
            similarity_threshold: 0.85,
            embedding_model: "hashed-bow-256".to_string(),
        }
    }
}

/// `[grouping]` — batch-building policy for the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupingConfig {
    pub enable: bool,
    pub max_group_size_chars: usize,
    pub max_items_per_group: usize,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            enable: true,
            max_group_size_chars: 12_000,
            max_items_per_group: 8,
        }
    }
}

/// `[self_correction]` — validation/retry budget, 0–5.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfCorrectionConfig {
    pub max_attempts: u32,
}

impl Default for SelfCorrectionConfig {
    fn default() -> Self {
        Self { max_attempts: 2 }
    }
}

/// `[reconciliation]` — extraction fusion thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    pub min_image_width_px: u32,
    pub min_image_height_px: u32,
    pub max_aspect_ratio: u32,
    pub heading_max_words: usize,
    pub heading_max_chars: usize,
    pub heading_min_font_ratio: f32,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            min_image_width_px: 50,
            min_image_height_px: 50,
            max_aspect_ratio: 20,
            heading_max_words: 15,
            heading_max_chars: 100,
            heading_min_font_ratio: 1.4,
        }
    }
}

/// `[tracing]` — trace summary output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    pub enable: bool,
    pub output_dir: PathBuf,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enable: true,
            output_dir: PathBuf::from("."),
        }
    }
}

/// `[quarantine]` — durable failed-block store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarantineConfig {
    pub directory: PathBuf,
    pub retention_days: u32,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("quarantine"),
            retention_days: 30,
        }
    }
}

impl PipelineConfig {
    /// Load from a TOML file. Missing keys take defaults; unknown keys are
    /// ignored.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let raw = std::fs::read_to_string(path).map_err(|e| PipelineError::ConfigUnreadable {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        let config: Self =
            toml::from_str(&raw).map_err(|e| PipelineError::ConfigUnreadable {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an optional path, falling back to defaults when absent.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, PipelineError> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Enforce the documented ranges. Called by `load`; call it again after
    /// mutating fields in code.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let t = &self.translation;
        if !(0.0..=1.0).contains(&t.temperature) {
            return Err(PipelineError::ConfigInvalid(format!(
                "translation.temperature must be 0.0–1.0, got {}",
                t.temperature
            )));
        }
        if !(1..=64).contains(&t.max_concurrent_translations) {
            return Err(PipelineError::ConfigInvalid(format!(
                "translation.max_concurrent_translations must be 1–64, got {}",
                t.max_concurrent_translations
            )));
        }
        if t.target_language.trim().is_empty() {
            return Err(PipelineError::ConfigInvalid(
                "translation.target_language must not be empty".into(),
            ));
        }
        if self.self_correction.max_attempts > 5 {
            return Err(PipelineError::ConfigInvalid(format!(
                "self_correction.max_attempts must be 0–5, got {}",
                self.self_correction.max_attempts
            )));
        }
        if !(0.0..=1.0).contains(&self.cache.similarity_threshold) {
            return Err(PipelineError::ConfigInvalid(format!(
                "cache.similarity_threshold must be 0.0–1.0, got {}",
                self.cache.similarity_threshold
            )));
        }
        if self.grouping.max_items_per_group == 0 {
            return Err(PipelineError::ConfigInvalid(
                "grouping.max_items_per_group must be ≥ 1".into(),
            ));
        }
        if self.grouping.max_group_size_chars == 0 {
            return Err(PipelineError::ConfigInvalid(
                "grouping.max_group_size_chars must be ≥ 1".into(),
            ));
        }
        if self.reconciliation.heading_min_font_ratio <= 1.0 {
            return Err(PipelineError::ConfigInvalid(format!(
                "reconciliation.heading_min_font_ratio must be > 1.0, got {}",
                self.reconciliation.heading_min_font_ratio
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = PipelineConfig::default();
        assert!((c.translation.temperature - 0.1).abs() < f32::EPSILON);
        assert_eq!(c.translation.max_concurrent_translations, 10);
        assert_eq!(c.cache.memory_capacity, 1_000);
        assert_eq!(c.cache.persistent_capacity, 10_000);
        assert!((c.cache.similarity_threshold - 0.85).abs() < f32::EPSILON);
        assert_eq!(c.grouping.max_group_size_chars, 12_000);
        assert_eq!(c.grouping.max_items_per_group, 8);
        assert_eq!(c.self_correction.max_attempts, 2);
        assert_eq!(c.reconciliation.heading_max_words, 15);
        assert_eq!(c.quarantine.retention_days, 30);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let c: PipelineConfig = toml::from_str("").unwrap();
        assert_eq!(c.translation.max_concurrent_translations, 10);
        assert_eq!(c.routing.strategy, RoutingProfile::Balanced);
    }

    #[test]
    fn partial_toml_overrides_only_named_keys() {
        let c: PipelineConfig = toml::from_str(
            r#"
            [translation]
            target_language = "Greek"
            max_concurrent_translations = 4

            [routing]
            strategy = "quality_focused"
            "#,
        )
        .unwrap();
        assert_eq!(c.translation.target_language, "Greek");
        assert_eq!(c.translation.max_concurrent_translations, 4);
        assert_eq!(c.routing.strategy, RoutingProfile::QualityFocused);
        // Untouched sections keep defaults.
        assert_eq!(c.grouping.max_items_per_group, 8);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let mut c = PipelineConfig::default();
        c.translation.temperature = 1.5;
        assert!(c.validate().is_err());

        let mut c = PipelineConfig::default();
        c.translation.max_concurrent_translations = 65;
        assert!(c.validate().is_err());

        let mut c = PipelineConfig::default();
        c.self_correction.max_attempts = 6;
        assert!(c.validate().is_err());
    }

    #[test]
    fn routing_profile_shifts_threshold() {
        let mut c = RoutingConfig::default();
        let balanced = c.effective_threshold();
        c.strategy = RoutingProfile::QualityFocused;
        assert!(c.effective_threshold() < balanced);
        c.strategy = RoutingProfile::CostOptimized;
        assert!(c.effective_threshold() > balanced);
    }
}
