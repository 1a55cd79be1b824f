//! System prompts for structure-preserving translation.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth** — changing how the endpoint is instructed
//!    (a new preservation rule, a tweak to table handling) requires editing
//!    exactly one place.
//!
//! 2. **Testability** — unit tests can inspect prompts directly without a
//!    live endpoint, so prompt regressions are caught like any other
//!    regression.

use crate::translate::validator::ValidationIssues;

/// Default system prompt for transport-form translation.
///
/// The `{target}` placeholder is filled by [`system_prompt`].
const TRANSLATE_SYSTEM_TEMPLATE: &str = r#"You are an expert technical translator. Translate the provided content to {target}.

Follow these rules precisely:

1. STRUCTURE PRESERVATION
   - Preserve every [[PARAGRAPH_BREAK]] token verbatim, in place
   - Preserve every %%%%ITEM_BREAK%%%% separator verbatim, in place
   - Never merge, split, add, or remove segments between separators

2. MARKDOWN
   - Keep markdown structural characters unchanged: # * - | ` and table pipes
   - Keep heading levels identical (# stays #, ## stays ##)
   - Keep list markers and their nesting identical

3. WHAT NOT TO TRANSLATE
   - LaTeX math ($...$, $$...$$, \begin{...}...\end{...}) stays verbatim
   - Code spans and fenced blocks stay verbatim, including language tags
   - Citation markers like [1] and footnote markers stay verbatim

4. OUTPUT FORMAT
   - Output ONLY the translated content
   - Do NOT wrap the output in code fences
   - Do NOT add commentary, notes, or explanations"#;

/// Build the system prompt for a target language.
pub fn system_prompt(target_language: &str) -> String {
    TRANSLATE_SYSTEM_TEMPLATE.replace("{target}", target_language)
}

/// Strict prompt for self-corrected structured content (tables, escalated
/// blocks). More emphatic about counts than the transport prompt.
pub fn strict_structural_prompt(target_language: &str) -> String {
    format!(
        "You are a specialized translator for structured content. Translate to {target_language} \
         while preserving the structure EXACTLY: the same number of table rows and columns, all \
         | separators and |---| header separator rows, all code fences with their language tags, \
         all LaTeX delimiters, and the same list markers at the same nesting. Translate only the \
         human-readable text. Output only the translated content."
    )
}

/// Targeted correction prompt naming the specific violations found by the
/// validator. Sent with the original and the failed translation so the
/// endpoint can fix structure without re-deciding wording from scratch.
pub fn correction_prompt(
    target_language: &str,
    original: &str,
    failed_translation: &str,
    issues: &ValidationIssues,
) -> String {
    let issue_lines: String = issues
        .issues
        .iter()
        .map(|i| format!("- {i}\n"))
        .collect();

    format!(
        "Your previous translation to {target_language} broke the content structure.\n\
         \n\
         ORIGINAL:\n{original}\n\
         \n\
         YOUR TRANSLATION:\n{failed_translation}\n\
         \n\
         STRUCTURAL VIOLATIONS:\n{issue_lines}\
         \n\
         Regenerate the translation fixing exactly these violations. Keep the wording of \
         correct parts; change only what the violations require. Output only the corrected \
         translation."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_names_the_target_language() {
        let p = system_prompt("Greek");
        assert!(p.contains("Greek"));
        assert!(p.contains("[[PARAGRAPH_BREAK]]"));
        assert!(p.contains("%%%%ITEM_BREAK%%%%"));
        assert!(!p.contains("{target}"));
    }

    #[test]
    fn correction_prompt_embeds_the_violations() {
        let issues = ValidationIssues {
            issues: vec!["original has 4 rows, yours has 37".into()],
            confidence: 0.4,
        };
        let p = correction_prompt("Greek", "| a |", "| b |\n| c |", &issues);
        assert!(p.contains("original has 4 rows, yours has 37"));
        assert!(p.contains("ORIGINAL:"));
        assert!(p.contains("YOUR TRANSLATION:"));
    }
}
