//! The self-correcting translation loop.
//!
//! Contract: translate a structured block (a table, or a text block that
//! failed transport validation) such that the structural invariants hold.
//! The loop is translate → validate → targeted correction prompt → retry,
//! bounded by the configured attempt budget. When the budget is spent the
//! *best* attempt by validator confidence is kept, the failure is reported,
//! and the caller quarantines the block and substitutes the original text.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::BlockError;
use crate::prompts;
use crate::retry::{call_with_retry, CallError};
use crate::translate::transport::clean_response;
use crate::translate::validator::{StructuredValidator, ValidationIssues};
use crate::translate::{TranslationProvider, TranslationRequest};

/// Parameters shared by every corrective call.
#[derive(Debug, Clone)]
pub struct CorrectiveParams {
    pub target_language: String,
    pub source_language_hint: Option<String>,
    pub temperature: f32,
    /// 0–5; 0 means validate once and never correct.
    pub max_correction_attempts: u32,
}

/// Outcome of one corrective translation.
#[derive(Debug, Clone)]
pub struct CorrectionOutcome {
    /// Best translation produced (may be invalid when `failure` is set).
    pub translation: String,
    /// Validator confidence of the returned translation.
    pub confidence: f32,
    /// Correction attempts actually used (0 = first shot was valid).
    pub attempts_used: u32,
    /// Endpoint tokens consumed across all attempts.
    pub usage_tokens: u64,
    /// Set when the loop could not produce a valid translation.
    pub failure: Option<BlockError>,
}

impl CorrectionOutcome {
    pub fn is_valid(&self) -> bool {
        self.failure.is_none()
    }
}

/// Wraps the endpoint with validation and targeted re-prompting.
pub struct SelfCorrectingTranslator {
    provider: Arc<dyn TranslationProvider>,
    validator: StructuredValidator,
    params: CorrectiveParams,
}

impl SelfCorrectingTranslator {
    pub fn new(provider: Arc<dyn TranslationProvider>, params: CorrectiveParams) -> Self {
        Self {
            provider,
            validator: StructuredValidator::new(),
            params,
        }
    }

    /// Translate one block with validation and bounded correction.
    ///
    /// `Err` is reserved for the endpoint being unreachable — a run-fatal
    /// condition. Every block-scoped failure comes back inside the
    /// outcome so the caller can quarantine and continue.
    pub async fn translate_block(
        &self,
        text: &str,
        model: &str,
    ) -> Result<CorrectionOutcome, String> {
        let mut usage_tokens = 0u64;

        // Initial translation with the strict structural prompt.
        let request = self.request(text, model, prompts::strict_structural_prompt(&self.params.target_language));
        let response = match call_with_retry(self.provider.as_ref(), &request).await {
            Ok(r) => r,
            Err(CallError::Unreachable(detail)) => return Err(detail),
            Err(CallError::Block(e)) => {
                return Ok(failed_outcome(String::new(), 0.0, 0, usage_tokens, e));
            }
        };
        usage_tokens += response.usage_tokens;

        if response.finish_reason.is_blocked() {
            let e = BlockError::EndpointBlocked {
                reason: format!("{:?}", response.finish_reason),
            };
            return Ok(failed_outcome(String::new(), 0.0, 0, usage_tokens, e));
        }

        let mut current = clean_response(&response.translated_text);
        let mut verdict = self.validator.validate(text, &current);

        if verdict.is_valid() {
            debug!("translation valid on first attempt");
            return Ok(CorrectionOutcome {
                translation: current,
                confidence: verdict.confidence,
                attempts_used: 0,
                usage_tokens,
                failure: None,
            });
        }

        // Track the best attempt so an exhausted budget still returns the
        // least-broken translation for inspection.
        let mut best = (current.clone(), verdict.confidence);

        for attempt in 1..=self.params.max_correction_attempts {
            info!(
                attempt,
                budget = self.params.max_correction_attempts,
                issues = verdict.issues.len(),
                "correction attempt"
            );

            let prompt = prompts::correction_prompt(
                &self.params.target_language,
                text,
                &current,
                &verdict,
            );
            let request = self.request(text, model, prompt);

            let response = match call_with_retry(self.provider.as_ref(), &request).await {
                Ok(r) => r,
                Err(CallError::Unreachable(detail)) => return Err(detail),
                Err(CallError::Block(e)) => {
                    return Ok(failed_outcome(best.0, best.1, attempt, usage_tokens, e));
                }
            };
            usage_tokens += response.usage_tokens;

            if response.finish_reason.is_blocked() {
                let e = BlockError::EndpointBlocked {
                    reason: format!("{:?}", response.finish_reason),
                };
                return Ok(failed_outcome(best.0, best.1, attempt, usage_tokens, e));
            }

            current = clean_response(&response.translated_text);
            verdict = self.validator.validate(text, &current);

            if verdict.is_valid() {
                info!(attempt, "correction succeeded");
                return Ok(CorrectionOutcome {
                    translation: current,
                    confidence: verdict.confidence,
                    attempts_used: attempt,
                    usage_tokens,
                    failure: None,
                });
            }

            if verdict.confidence > best.1 {
                best = (current.clone(), verdict.confidence);
            }
        }

        warn!(
            attempts = self.params.max_correction_attempts,
            "correction budget exhausted; block will be quarantined"
        );
        let failure = BlockError::ValidationFailed {
            attempts: self.params.max_correction_attempts,
            issues: verdict.issues.join("; "),
        };
        Ok(failed_outcome(
            best.0,
            best.1,
            self.params.max_correction_attempts,
            usage_tokens,
            failure,
        ))
    }

    /// Validate an already-produced translation (used when transport
    /// validation escalates a block that was translated in a group).
    pub fn validate_only(&self, original: &str, translated: &str) -> ValidationIssues {
        self.validator.validate(original, translated)
    }

    fn request(&self, text: &str, model: &str, system: String) -> TranslationRequest {
        TranslationRequest {
            text: text.to_string(),
            source_language_hint: self.params.source_language_hint.clone(),
            target_language: self.params.target_language.clone(),
            model_identifier: model.to_string(),
            temperature: self.params.temperature,
            system_instructions: system,
        }
    }
}

fn failed_outcome(
    translation: String,
    confidence: f32,
    attempts_used: u32,
    usage_tokens: u64,
    failure: BlockError,
) -> CorrectionOutcome {
    CorrectionOutcome {
        translation,
        confidence,
        attempts_used,
        usage_tokens,
        failure: Some(failure),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::{
        FinishReason, ProviderError, TranslationResponse,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// A provider that replays a scripted sequence of responses.
    struct ScriptedProvider {
        script: Mutex<Vec<Result<TranslationResponse, ProviderError>>>,
        requests: Mutex<Vec<TranslationRequest>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<TranslationResponse, ProviderError>>) -> Self {
            Self {
                script: Mutex::new(script),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn ok(text: &str) -> Result<TranslationResponse, ProviderError> {
            Ok(TranslationResponse {
                translated_text: text.to_string(),
                finish_reason: FinishReason::Complete,
                usage_tokens: 10,
            })
        }
    }

    #[async_trait]
    impl TranslationProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn translate(
            &self,
            request: &TranslationRequest,
        ) -> Result<TranslationResponse, ProviderError> {
            self.requests.lock().unwrap().push(request.clone());
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Err(ProviderError::Transient("script exhausted".into()));
            }
            script.remove(0)
        }
    }

    fn params() -> CorrectiveParams {
        CorrectiveParams {
            target_language: "Greek".into(),
            source_language_hint: None,
            temperature: 0.1,
            max_correction_attempts: 2,
        }
    }

    const TABLE: &str = "| a | b |\n| --- | --- |\n| 1 | 2 |\n| 3 | 4 |";

    #[tokio::test]
    async fn valid_first_attempt_uses_no_corrections() {
        let good = "| α | β |\n| --- | --- |\n| 1 | 2 |\n| 3 | 4 |";
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::ok(good)]));
        let translator = SelfCorrectingTranslator::new(provider.clone(), params());

        let outcome = translator.translate_block(TABLE, "quality-model").await.unwrap();
        assert!(outcome.is_valid());
        assert_eq!(outcome.attempts_used, 0);
        assert_eq!(outcome.confidence, 1.0);
        assert_eq!(provider.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn broken_structure_triggers_targeted_correction() {
        let broken = "| α | β |\n| 1 | 2 |"; // dropped separator + a row
        let fixed = "| α | β |\n| --- | --- |\n| 1 | 2 |\n| 3 | 4 |";
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::ok(broken),
            ScriptedProvider::ok(fixed),
        ]));
        let translator = SelfCorrectingTranslator::new(provider.clone(), params());

        let outcome = translator.translate_block(TABLE, "quality-model").await.unwrap();
        assert!(outcome.is_valid());
        assert_eq!(outcome.attempts_used, 1);
        assert_eq!(outcome.translation, fixed);

        // The correction request must name the concrete violation.
        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].system_instructions.contains("STRUCTURAL VIOLATIONS"));
        assert!(requests[1].system_instructions.contains("rows"));
    }

    #[tokio::test]
    async fn exhausted_budget_reports_validation_failure() {
        let broken = "| α |"; // never fixed
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::ok(broken),
            ScriptedProvider::ok(broken),
            ScriptedProvider::ok(broken),
        ]));
        let translator = SelfCorrectingTranslator::new(provider, params());

        let outcome = translator.translate_block(TABLE, "quality-model").await.unwrap();
        assert!(!outcome.is_valid());
        assert_eq!(outcome.attempts_used, 2);
        assert!(matches!(
            outcome.failure,
            Some(BlockError::ValidationFailed { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn blocked_finish_reason_is_terminal_without_retry() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(TranslationResponse {
            translated_text: String::new(),
            finish_reason: FinishReason::SafetyBlocked,
            usage_tokens: 0,
        })]));
        let translator = SelfCorrectingTranslator::new(provider.clone(), params());

        let outcome = translator.translate_block(TABLE, "m").await.unwrap();
        assert!(matches!(
            outcome.failure,
            Some(BlockError::EndpointBlocked { .. })
        ));
        // Exactly one request: blocked content is never retried.
        assert_eq!(provider.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn zero_budget_never_corrects() {
        let broken = "| α |";
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::ok(broken)]));
        let mut p = params();
        p.max_correction_attempts = 0;
        let translator = SelfCorrectingTranslator::new(provider.clone(), p);

        let outcome = translator.translate_block(TABLE, "m").await.unwrap();
        assert!(!outcome.is_valid());
        assert_eq!(provider.requests.lock().unwrap().len(), 1);
    }
}
