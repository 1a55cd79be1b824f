//! One retry policy object for every external call.
//!
//! The failure-kind → policy mapping lives here, in one table, instead of
//! being scattered across call sites:
//!
//! | Kind                    | Attempts | Backoff                    |
//! |-------------------------|----------|----------------------------|
//! | Rate limited            | 5        | exponential + jitter       |
//! | Endpoint transient      | 3        | exponential                |
//! | Extractor unavailable   | 3        | exponential                |
//!
//! Exponential backoff doubles after each attempt; jitter spreads
//! simultaneous retries from concurrent workers so a recovering endpoint
//! is not immediately re-overwhelmed.

use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

use crate::error::BlockError;
use crate::translate::{ProviderError, TranslationProvider, TranslationRequest, TranslationResponse};

/// Backoff schedule for one failure kind.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub jitter: bool,
}

impl RetryPolicy {
    /// HTTP 429 from the endpoint: up to 5 retries, jittered.
    pub fn rate_limited() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            jitter: true,
        }
    }

    /// 5xx / timeout from the endpoint: up to 3 retries.
    pub fn transient() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            jitter: false,
        }
    }

    /// Extractor unavailable/timeout: up to 3 retries before falling
    /// through to the alternative engine.
    pub fn extractor() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            jitter: false,
        }
    }

    /// Delay before the given retry attempt (1-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay_ms.saturating_mul(1u64 << (attempt - 1).min(16));
        let ms = if self.jitter {
            // Up to +50% spread.
            let spread = rand::thread_rng().gen_range(0..=exp / 2);
            exp + spread
        } else {
            exp
        };
        Duration::from_millis(ms)
    }
}

/// Outcome of a retried endpoint call.
#[derive(Debug)]
pub enum CallError {
    /// The endpoint cannot be reached at all. Fatal for the run (exit 3).
    Unreachable(String),
    /// A block-scoped failure after the retry budget (never aborts the
    /// document).
    Block(BlockError),
}

/// Call the endpoint with the §7 retry policies applied: transient errors
/// retry up to 3 times, rate limits up to 5 with jittered backoff,
/// connection failures are immediately fatal.
///
/// Blocked finish reasons are *returned* (they arrive as successful
/// responses); the caller decides quarantine.
pub async fn call_with_retry(
    provider: &dyn TranslationProvider,
    request: &TranslationRequest,
) -> Result<TranslationResponse, CallError> {
    let transient = RetryPolicy::transient();
    let rate = RetryPolicy::rate_limited();

    let mut transient_attempts = 0u32;
    let mut rate_attempts = 0u32;

    loop {
        match provider.translate(request).await {
            Ok(response) => return Ok(response),

            Err(ProviderError::Unreachable(detail)) => {
                return Err(CallError::Unreachable(detail));
            }

            Err(ProviderError::Transient(detail)) => {
                transient_attempts += 1;
                if transient_attempts > transient.max_attempts {
                    return Err(CallError::Block(BlockError::EndpointTransient {
                        retries: transient.max_attempts,
                        detail,
                    }));
                }
                let delay = transient.delay(transient_attempts);
                warn!(
                    attempt = transient_attempts,
                    ?delay,
                    "transient endpoint failure; backing off"
                );
                sleep(delay).await;
            }

            Err(ProviderError::RateLimited { retry_after_secs }) => {
                rate_attempts += 1;
                if rate_attempts > rate.max_attempts {
                    return Err(CallError::Block(BlockError::RateLimited {
                        retries: rate.max_attempts,
                        detail: "rate limit persisted through backoff".into(),
                    }));
                }
                let delay = retry_after_secs
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| rate.delay(rate_attempts));
                warn!(attempt = rate_attempts, ?delay, "rate limited; backing off");
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let p = RetryPolicy::transient();
        assert_eq!(p.delay(1), Duration::from_millis(500));
        assert_eq!(p.delay(2), Duration::from_millis(1_000));
        assert_eq!(p.delay(3), Duration::from_millis(2_000));
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let p = RetryPolicy::rate_limited();
        for attempt in 1..=5 {
            let base = 1_000u64 << (attempt - 1);
            let d = p.delay(attempt).as_millis() as u64;
            assert!(d >= base, "attempt {attempt}: {d} < {base}");
            assert!(d <= base + base / 2, "attempt {attempt}: {d} too large");
        }
    }

    #[test]
    fn policy_table_matches_error_design() {
        assert_eq!(RetryPolicy::rate_limited().max_attempts, 5);
        assert_eq!(RetryPolicy::transient().max_attempts, 3);
        assert_eq!(RetryPolicy::extractor().max_attempts, 3);
        assert!(RetryPolicy::rate_limited().jitter);
    }
}
