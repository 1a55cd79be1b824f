//! The translation endpoint interface and its HTTP implementation.
//!
//! The pipeline talks to exactly one narrow trait,
//! [`TranslationProvider`]; everything else — transport-form packing,
//! validation, self-correction — is layered on top in the sibling modules:
//!
//! * [`transport`]  — serialisation of block groups to the wire form and
//!   the split-fallback chain on the way back
//! * [`validator`]  — structural validation of translated content
//! * [`corrective`] — the translate → validate → targeted-retry loop
//!
//! Blocked finish reasons (`safety_blocked`, `recitation_blocked`,
//! `other_blocked`) are terminal for that exact text: the block is
//! quarantined and never retried on the same prompt. `length_cap` is the
//! executor's cue to halve the batch and retry both halves.

pub mod corrective;
pub mod transport;
pub mod validator;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Why the endpoint stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Complete,
    /// Output hit the model's length cap; the caller splits and retries.
    LengthCap,
    SafetyBlocked,
    RecitationBlocked,
    OtherBlocked,
}

impl FinishReason {
    /// Blocked reasons are non-retryable for that exact text.
    pub fn is_blocked(self) -> bool {
        matches!(
            self,
            FinishReason::SafetyBlocked
                | FinishReason::RecitationBlocked
                | FinishReason::OtherBlocked
        )
    }
}

/// One request to the endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationRequest {
    pub text: String,
    pub source_language_hint: Option<String>,
    pub target_language: String,
    pub model_identifier: String,
    pub temperature: f32,
    pub system_instructions: String,
}

/// One response from the endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationResponse {
    pub translated_text: String,
    pub finish_reason: FinishReason,
    pub usage_tokens: u64,
}

/// Transport-level provider failures. Blocked content is *not* an error —
/// it arrives as a response with a blocked [`FinishReason`].
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Endpoint cannot be reached at all; fatal for the run (exit 3).
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// Transient failure (5xx, timeout); retried per policy.
    #[error("transient endpoint failure: {0}")]
    Transient(String),

    /// HTTP 429; retried with exponential backoff and jitter.
    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },
}

/// The downstream LLM translation endpoint.
#[async_trait]
pub trait TranslationProvider: Send + Sync {
    /// Human-readable provider name for logs and the trace.
    fn name(&self) -> &str;

    async fn translate(
        &self,
        request: &TranslationRequest,
    ) -> Result<TranslationResponse, ProviderError>;
}

// ── HTTP implementation ──────────────────────────────────────────────────

/// JSON body sent to the HTTP endpoint.
#[derive(Serialize)]
struct WireRequest<'a> {
    text: &'a str,
    source_language_hint: Option<&'a str>,
    target_language: &'a str,
    model: &'a str,
    temperature: f32,
    system_instructions: &'a str,
}

/// JSON body received from the HTTP endpoint.
#[derive(Deserialize)]
struct WireResponse {
    translated_text: String,
    #[serde(default = "default_finish")]
    finish_reason: FinishReason,
    #[serde(default)]
    usage_tokens: u64,
}

fn default_finish() -> FinishReason {
    FinishReason::Complete
}

/// A [`TranslationProvider`] speaking JSON over HTTP.
pub struct HttpProvider {
    client: reqwest::Client,
    endpoint_url: String,
    api_key: Option<String>,
}

impl HttpProvider {
    /// Build a provider with the given per-call timeout.
    pub fn new(
        endpoint_url: &str,
        api_key: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            endpoint_url: endpoint_url.to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl TranslationProvider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn translate(
        &self,
        request: &TranslationRequest,
    ) -> Result<TranslationResponse, ProviderError> {
        let body = WireRequest {
            text: &request.text,
            source_language_hint: request.source_language_hint.as_deref(),
            target_language: &request.target_language,
            model: &request.model_identifier,
            temperature: request.temperature,
            system_instructions: &request.system_instructions,
        };

        let mut req = self.client.post(&self.endpoint_url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Transient(format!("timeout: {e}"))
            } else if e.is_connect() {
                ProviderError::Unreachable(e.to_string())
            } else {
                ProviderError::Transient(e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(ProviderError::RateLimited { retry_after_secs });
        }
        if status.is_server_error() {
            return Err(ProviderError::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(ProviderError::Unreachable(format!("HTTP {status}")));
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("bad response body: {e}")))?;

        debug!(
            model = request.model_identifier,
            tokens = wire.usage_tokens,
            finish = ?wire.finish_reason,
            "endpoint call complete"
        );

        Ok(TranslationResponse {
            translated_text: wire.translated_text,
            finish_reason: wire.finish_reason,
            usage_tokens: wire.usage_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_reasons_are_terminal() {
        assert!(FinishReason::SafetyBlocked.is_blocked());
        assert!(FinishReason::RecitationBlocked.is_blocked());
        assert!(FinishReason::OtherBlocked.is_blocked());
        assert!(!FinishReason::Complete.is_blocked());
        assert!(!FinishReason::LengthCap.is_blocked());
    }

    #[test]
    fn finish_reason_round_trips_snake_case() {
        let json = serde_json::to_string(&FinishReason::LengthCap).unwrap();
        assert_eq!(json, "\"length_cap\"");
        let back: FinishReason = serde_json::from_str("\"safety_blocked\"").unwrap();
        assert_eq!(back, FinishReason::SafetyBlocked);
    }

    #[test]
    fn wire_response_defaults_finish_to_complete() {
        let wire: WireResponse =
            serde_json::from_str(r#"{"translated_text": "γειά"}"#).unwrap();
        assert_eq!(wire.finish_reason, FinishReason::Complete);
        assert_eq!(wire.usage_tokens, 0);
    }
}
