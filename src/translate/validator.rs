//! Structural validation of translated content.
//!
//! The validator compares a translation against its source and reports the
//! specific violations, so the corrective loop can name them in a targeted
//! retry prompt ("original has 4 rows, yours has 37"). Checks are
//! content-type-specific: table geometry, code fences, LaTeX balance, and
//! list shape. Confidence feeds the cache quality score.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static RE_TABLE_ROW: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*\|.*\|\s*$").unwrap());
static RE_TABLE_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*\|[\s\-:|]+\|\s*$").unwrap());
static RE_CODE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^```(\w+)?\s*$").unwrap());
static RE_DISPLAY_MATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\$").unwrap());
static RE_LATEX_BEGIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\begin\{(\w+)\*?\}").unwrap());
static RE_LATEX_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\end\{(\w+)\*?\}").unwrap());
static RE_LATEX_COMMAND: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\[a-zA-Z]+").unwrap());
static RE_BULLET_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^(\s*)[-*+]\s+").unwrap());
static RE_ORDERED_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^(\s*)\d+\.\s+").unwrap());

/// Content family, detected from the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuredKind {
    Table,
    CodeFence,
    Latex,
    List,
    Plain,
}

/// The validator's verdict: the violations found and a confidence in
/// `[0, 1]` (1.0 = clean pass).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssues {
    pub issues: Vec<String>,
    pub confidence: f32,
}

impl ValidationIssues {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }

    fn from_issues(issues: Vec<String>, penalty_per_issue: f32) -> Self {
        let confidence = (1.0 - issues.len() as f32 * penalty_per_issue).max(0.0);
        Self { issues, confidence }
    }
}

/// Validates the structural integrity of translated content.
#[derive(Debug, Default, Clone)]
pub struct StructuredValidator;

impl StructuredValidator {
    pub fn new() -> Self {
        Self
    }

    /// Detect the content family of a source text.
    pub fn detect(&self, text: &str) -> StructuredKind {
        if RE_TABLE_ROW.is_match(text) {
            StructuredKind::Table
        } else if RE_CODE_FENCE.is_match(text) {
            StructuredKind::CodeFence
        } else if RE_DISPLAY_MATH.is_match(text)
            || RE_LATEX_BEGIN.is_match(text)
            || text.matches('$').count() >= 2
        {
            StructuredKind::Latex
        } else if RE_BULLET_ITEM.is_match(text) || RE_ORDERED_ITEM.is_match(text) {
            StructuredKind::List
        } else {
            StructuredKind::Plain
        }
    }

    /// Validate a translation against its source.
    pub fn validate(&self, original: &str, translated: &str) -> ValidationIssues {
        match self.detect(original) {
            StructuredKind::Table => self.validate_table(original, translated),
            StructuredKind::CodeFence => self.validate_code(original, translated),
            StructuredKind::Latex => self.validate_latex(original, translated),
            StructuredKind::List => self.validate_list(original, translated),
            StructuredKind::Plain => self.validate_plain(original, translated),
        }
    }

    /// Tables: data row count within 10% of the input, average column
    /// count within ±1, and the header separator preserved.
    fn validate_table(&self, original: &str, translated: &str) -> ValidationIssues {
        let mut issues = Vec::new();

        let orig_rows = data_rows(original);
        let trans_rows = data_rows(translated);

        let allowed = (orig_rows.len() / 10).max(0);
        let diff = orig_rows.len().abs_diff(trans_rows.len());
        if diff > allowed {
            issues.push(format!(
                "original has {} rows, yours has {} — regenerate preserving exactly {} rows",
                orig_rows.len(),
                trans_rows.len(),
                orig_rows.len()
            ));
        }

        let orig_cols = average_columns(&orig_rows);
        let trans_cols = average_columns(&trans_rows);
        if (orig_cols - trans_cols).abs() > 1.0 {
            issues.push(format!(
                "column count changed: original averages {orig_cols:.1} columns, yours {trans_cols:.1}"
            ));
        }

        let orig_seps = RE_TABLE_SEPARATOR.find_iter(original).count();
        let trans_seps = RE_TABLE_SEPARATOR.find_iter(translated).count();
        if orig_seps != trans_seps {
            issues.push(format!(
                "header separator rows changed: original has {orig_seps}, yours has {trans_seps}"
            ));
        }

        ValidationIssues::from_issues(issues, 0.3)
    }

    /// Code fences: open/close count matches and language tags survive.
    fn validate_code(&self, original: &str, translated: &str) -> ValidationIssues {
        let mut issues = Vec::new();

        let orig_fences: Vec<Option<&str>> = fence_tags(original);
        let trans_fences: Vec<Option<&str>> = fence_tags(translated);

        if orig_fences.len() != trans_fences.len() {
            issues.push(format!(
                "code fence count changed: original has {}, yours has {}",
                orig_fences.len(),
                trans_fences.len()
            ));
        }

        let orig_langs: Vec<&str> = orig_fences.iter().flatten().copied().collect();
        let trans_langs: Vec<&str> = trans_fences.iter().flatten().copied().collect();
        if orig_langs != trans_langs {
            issues.push(format!(
                "language tags changed: original {orig_langs:?}, yours {trans_langs:?}"
            ));
        }

        ValidationIssues::from_issues(issues, 0.4)
    }

    /// LaTeX: `$` and `$$` balance, matched `\begin`/`\end` environments,
    /// and command count within ±1.
    fn validate_latex(&self, original: &str, translated: &str) -> ValidationIssues {
        let mut issues = Vec::new();

        let orig_display = RE_DISPLAY_MATH.find_iter(original).count();
        let trans_display = RE_DISPLAY_MATH.find_iter(translated).count();
        if orig_display != trans_display {
            issues.push(format!(
                "$$ delimiter count changed: original has {orig_display}, yours has {trans_display}"
            ));
        }

        if original.matches('$').count() % 2 == 0 && translated.matches('$').count() % 2 != 0 {
            issues.push("unbalanced $ delimiters in your translation".to_string());
        }

        let orig_envs = env_names(original, &RE_LATEX_BEGIN);
        let trans_envs = env_names(translated, &RE_LATEX_BEGIN);
        let trans_ends = env_names(translated, &RE_LATEX_END);
        if orig_envs != trans_envs {
            issues.push(format!(
                "LaTeX environments changed: original {orig_envs:?}, yours {trans_envs:?}"
            ));
        }
        if trans_envs != trans_ends {
            issues.push(format!(
                "\\begin/\\end mismatch in your translation: begins {trans_envs:?}, ends {trans_ends:?}"
            ));
        }

        let orig_cmds = RE_LATEX_COMMAND.find_iter(original).count();
        let trans_cmds = RE_LATEX_COMMAND.find_iter(translated).count();
        if orig_cmds.abs_diff(trans_cmds) > 1 {
            issues.push(format!(
                "LaTeX command count changed: original has {orig_cmds}, yours has {trans_cmds}"
            ));
        }

        ValidationIssues::from_issues(issues, 0.35)
    }

    /// Lists: marker counts and nesting levels preserved.
    fn validate_list(&self, original: &str, translated: &str) -> ValidationIssues {
        let mut issues = Vec::new();

        let orig_bullets = RE_BULLET_ITEM.find_iter(original).count();
        let trans_bullets = RE_BULLET_ITEM.find_iter(translated).count();
        if orig_bullets != trans_bullets {
            issues.push(format!(
                "bullet item count changed: original has {orig_bullets}, yours has {trans_bullets}"
            ));
        }

        let orig_numbered = RE_ORDERED_ITEM.find_iter(original).count();
        let trans_numbered = RE_ORDERED_ITEM.find_iter(translated).count();
        if orig_numbered != trans_numbered {
            issues.push(format!(
                "numbered item count changed: original has {orig_numbered}, yours has {trans_numbered}"
            ));
        }

        let orig_depths = nesting_profile(original);
        let trans_depths = nesting_profile(translated);
        if orig_depths != trans_depths {
            issues.push("list nesting levels changed".to_string());
        }

        ValidationIssues::from_issues(issues, 0.3)
    }

    /// Plain text: guard against truncation and runaway expansion only.
    fn validate_plain(&self, original: &str, translated: &str) -> ValidationIssues {
        let mut issues = Vec::new();
        let orig_len = original.trim().chars().count();
        let trans_len = translated.trim().chars().count();

        if orig_len >= 20 && trans_len * 10 < orig_len * 3 {
            issues.push("translation appears truncated".to_string());
        } else if trans_len > orig_len * 3 + 40 {
            issues.push("translation appears padded with extra content".to_string());
        }

        ValidationIssues::from_issues(issues, 0.3)
    }
}

// ── Table helpers ────────────────────────────────────────────────────────

/// Table rows excluding separator rows.
fn data_rows(text: &str) -> Vec<&str> {
    text.lines()
        .filter(|l| {
            let t = l.trim();
            t.starts_with('|') && t.ends_with('|') && !RE_TABLE_SEPARATOR.is_match(l)
        })
        .collect()
}

fn average_columns(rows: &[&str]) -> f32 {
    if rows.is_empty() {
        return 0.0;
    }
    let total: usize = rows
        .iter()
        .map(|r| r.trim().matches('|').count().saturating_sub(1))
        .sum();
    total as f32 / rows.len() as f32
}

fn fence_tags(text: &str) -> Vec<Option<&str>> {
    RE_CODE_FENCE
        .captures_iter(text)
        .map(|c| c.get(1).map(|m| m.as_str()))
        .collect()
}

fn env_names<'a>(text: &'a str, re: &Regex) -> Vec<&'a str> {
    re.captures_iter(text)
        .map(|c| c.get(1).unwrap().as_str())
        .collect()
}

fn nesting_profile(text: &str) -> Vec<usize> {
    let mut depths: Vec<usize> = RE_BULLET_ITEM
        .captures_iter(text)
        .chain(RE_ORDERED_ITEM.captures_iter(text))
        .map(|c| c.get(1).map(|m| m.as_str().len()).unwrap_or(0) / 2)
        .collect();
    depths.sort_unstable();
    depths
}

// ── Markdown table rendering (for Table blocks) ──────────────────────────

/// Render table rows as a GFM table. With a header row a separator is
/// emitted after the first row.
pub fn render_table(rows: &[Vec<String>], header_rows: usize) -> String {
    let mut out = String::new();
    for (i, row) in rows.iter().enumerate() {
        out.push_str("| ");
        out.push_str(&row.join(" | "));
        out.push_str(" |\n");
        if i == 0 && header_rows == 1 {
            out.push('|');
            for _ in 0..row.len() {
                out.push_str(" --- |");
            }
            out.push('\n');
        }
    }
    out.trim_end().to_string()
}

/// Parse a GFM table back into rows (separator rows dropped).
pub fn parse_table(text: &str) -> Vec<Vec<String>> {
    data_rows(text)
        .into_iter()
        .map(|line| {
            line.trim()
                .trim_start_matches('|')
                .trim_end_matches('|')
                .split('|')
                .map(|c| c.trim().to_string())
                .collect()
        })
        .collect()
}
