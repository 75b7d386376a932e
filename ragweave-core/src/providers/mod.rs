//! LLM provider implementations.
//!
//! Provides concrete implementations of the `LlmProvider` trait for:
//! - OpenAI-compatible APIs (OpenAI, the Hugging Face router, Ollama, vLLM)
//! - Google Gemini API
//!
//! Use `create_provider()` to instantiate the appropriate provider based on config.
//! Every provider it returns is wrapped in [`RetryingProvider`], so transient
//! failures are retried with backoff before any caller sees them.

pub mod gemini;
pub mod openai_compat;

use crate::brain::LlmProvider;
use crate::config::{LlmConfig, ProviderKind, ResolvedCredentials, RetryConfig};
use crate::error::{ConfigError, LlmError};
use crate::types::{CompletionRequest, CompletionResponse};
use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use gemini::GeminiProvider;
pub use openai_compat::OpenAiCompatibleProvider;

/// Execute an async operation with exponential backoff retry on transient errors.
///
/// Retries on `LlmError::RateLimited` (respects `retry_after_secs`), `LlmError::ServerError`,
/// `LlmError::Connection`, and `LlmError::Timeout`. Permanent errors (auth, parse) return immediately.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T, LlmError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut last_err = None;
    for attempt in 0..=config.max_retries {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !is_retryable(&e) || attempt == config.max_retries {
                    return Err(e);
                }

                let backoff_ms = compute_backoff(config, attempt, &e);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = config.max_retries,
                    backoff_ms = backoff_ms,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| LlmError::Connection {
        message: "All retry attempts exhausted".to_string(),
    }))
}

/// Check if an error is retryable (transient).
pub fn is_retryable(err: &LlmError) -> bool {
    matches!(
        err,
        LlmError::RateLimited { .. }
            | LlmError::ServerError { .. }
            | LlmError::Connection { .. }
            | LlmError::Timeout { .. }
    )
}

/// Compute backoff delay, respecting rate limit retry-after hints.
fn compute_backoff(config: &RetryConfig, attempt: u32, err: &LlmError) -> u64 {
    if let LlmError::RateLimited { retry_after_secs } = err {
        let server_ms = retry_after_secs * 1000;
        let computed = compute_exponential_backoff(config, attempt);
        return server_ms.max(computed);
    }
    compute_exponential_backoff(config, attempt)
}

/// Pure exponential backoff with optional jitter.
fn compute_exponential_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(config.max_backoff_ms as f64) as u64;
    if config.jitter {
        // Up to 25% jitter
        let jitter = (capped as f64 * 0.25 * rand::thread_rng().r#gen::<f64>()) as u64;
        capped + jitter
    } else {
        capped
    }
}

/// Build the shared HTTP client used by every adapter.
pub fn build_http_client(timeout_secs: u64) -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| ConfigError::invalid(format!("failed to build HTTP client: {}", e)))
}

/// Classify a transport-level failure.
pub fn map_transport_error(err: reqwest::Error, timeout_secs: u64) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout { timeout_secs }
    } else if err.is_connect() {
        LlmError::Connection {
            message: err.to_string(),
        }
    } else {
        LlmError::ApiRequest {
            message: format!("Request failed: {}", err),
        }
    }
}

/// Classify a non-success HTTP status.
///
/// 401/403 are auth failures, 429 is a rate limit (the hint is read from
/// an "... in Xs" message when present), and 5xx is a retryable server error.
pub fn map_status_error(provider: &str, status: u16, body: &str) -> LlmError {
    match status {
        401 | 403 => {
            tracing::debug!(provider = provider, body = %body, "Authentication failed");
            LlmError::AuthFailed {
                provider: provider.to_string(),
            }
        }
        429 => LlmError::RateLimited {
            retry_after_secs: parse_retry_after(body).unwrap_or(5),
        },
        s if s >= 500 => LlmError::ServerError {
            status: s,
            message: truncate_body(body),
        },
        s => LlmError::ApiRequest {
            message: format!("HTTP {}: {}", s, truncate_body(body)),
        },
    }
}

fn parse_retry_after(body: &str) -> Option<u64> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let msg = value.get("error")?.get("message")?.as_str()?;
    let tail = msg.rsplit("in ").next()?;
    let digits: String = tail
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<u64>().ok()
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 500;
    if body.chars().count() <= MAX {
        body.to_string()
    } else {
        let cut: String = body.chars().take(MAX).collect();
        format!("{}...", cut)
    }
}

/// Wraps a provider so each completion goes through [`with_retry`].
pub struct RetryingProvider {
    inner: Arc<dyn LlmProvider>,
    retry: RetryConfig,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn LlmProvider>, retry: RetryConfig) -> Self {
        Self { inner, retry }
    }
}

#[async_trait]
impl LlmProvider for RetryingProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        with_retry(&self.retry, || self.inner.complete(request.clone())).await
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

/// Create an LLM provider based on the configuration.
///
/// Routes to the appropriate provider implementation:
/// - `gemini` → `GeminiProvider`
/// - everything else → `OpenAiCompatibleProvider`
///
/// The API key comes from `credentials`, which must have been resolved at
/// startup. A missing key is a `ConfigError::MissingCredential`.
pub fn create_provider(
    config: &LlmConfig,
    credentials: &ResolvedCredentials,
    retry: &RetryConfig,
) -> Result<Arc<dyn LlmProvider>, ConfigError> {
    let api_key = match config.credential_requirement() {
        Some(req) => Some(credentials.key_for(&req)?),
        None => None,
    };

    let provider: Arc<dyn LlmProvider> = match config.provider {
        ProviderKind::Gemini => {
            let key = api_key.ok_or_else(|| ConfigError::missing_field("llm.api_key_env"))?;
            Arc::new(GeminiProvider::new(config, key)?)
        }
        ProviderKind::OpenAi | ProviderKind::HuggingFace | ProviderKind::Local => {
            Arc::new(OpenAiCompatibleProvider::new(config, api_key)?)
        }
    };

    tracing::debug!(
        provider = %config.provider,
        model = %config.model,
        "Created LLM provider"
    );
    Ok(Arc::new(RetryingProvider::new(provider, retry.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::MockLlmProvider;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_create_provider_local_needs_no_key() {
        let config = LlmConfig::default();
        let provider =
            create_provider(&config, &ResolvedCredentials::new(), &RetryConfig::default()).unwrap();
        assert_eq!(provider.model_name(), "llama3.1:8b");
    }

    #[test]
    fn test_create_provider_gemini_with_key() {
        let config = LlmConfig {
            provider: ProviderKind::Gemini,
            model: "gemini-1.5-flash".into(),
            ..Default::default()
        };
        let creds = ResolvedCredentials::new().with_key("GOOGLE_API_KEY", "test-key");
        let provider = create_provider(&config, &creds, &RetryConfig::default()).unwrap();
        assert_eq!(provider.model_name(), "gemini-1.5-flash");
    }

    #[test]
    fn test_create_provider_missing_key_is_config_error() {
        let config = LlmConfig {
            provider: ProviderKind::OpenAi,
            model: "gpt-4o-mini".into(),
            ..Default::default()
        };
        let result = create_provider(&config, &ResolvedCredentials::new(), &RetryConfig::default());
        match result {
            Err(ConfigError::MissingCredential { var, .. }) => assert_eq!(var, "OPENAI_API_KEY"),
            Err(other) => panic!("Expected MissingCredential, got {:?}", other),
            Ok(_) => panic!("Expected an error"),
        }
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_after_transient_errors() {
        let attempts = AtomicU32::new(0);
        let result = with_retry(&fast_retry(3), || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(LlmError::ServerError {
                    status: 503,
                    message: "busy".into(),
                })
            } else {
                Ok("done")
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_after_max() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), LlmError> = with_retry(&fast_retry(2), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(LlmError::Timeout { timeout_secs: 1 })
        })
        .await;
        assert!(matches!(result, Err(LlmError::Timeout { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_auth() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), LlmError> = with_retry(&fast_retry(3), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(LlmError::AuthFailed {
                provider: "openai".into(),
            })
        })
        .await;
        assert!(matches!(result, Err(LlmError::AuthFailed { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retrying_provider_passes_through() {
        let inner = Arc::new(MockLlmProvider::with_response("hi"));
        let provider = RetryingProvider::new(inner.clone(), fast_retry(2));
        assert_eq!(provider.generate("hello").await.unwrap(), "hi");
        assert_eq!(inner.call_count(), 1);
    }

    #[tokio::test]
    async fn test_retrying_provider_retries_connection_failures() {
        let inner = Arc::new(MockLlmProvider::failing());
        let provider = RetryingProvider::new(inner.clone(), fast_retry(2));
        assert!(provider.generate("hello").await.is_err());
        assert_eq!(inner.call_count(), 3);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 1000,
            max_backoff_ms: 4000,
            backoff_multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(compute_exponential_backoff(&config, 0), 1000);
        assert_eq!(compute_exponential_backoff(&config, 1), 2000);
        assert_eq!(compute_exponential_backoff(&config, 5), 4000);
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let config = RetryConfig {
            jitter: true,
            initial_backoff_ms: 1000,
            ..Default::default()
        };
        for _ in 0..20 {
            let ms = compute_exponential_backoff(&config, 0);
            assert!((1000..=1250).contains(&ms));
        }
    }

    #[test]
    fn test_rate_limit_backoff_respects_hint() {
        let config = fast_retry(3);
        let ms = compute_backoff(
            &config,
            0,
            &LlmError::RateLimited {
                retry_after_secs: 2,
            },
        );
        assert_eq!(ms, 2000);
    }

    #[test]
    fn test_map_status_error() {
        assert!(matches!(
            map_status_error("openai", 401, ""),
            LlmError::AuthFailed { .. }
        ));
        assert!(matches!(
            map_status_error("gemini", 403, ""),
            LlmError::AuthFailed { .. }
        ));
        assert!(matches!(
            map_status_error("openai", 502, "bad gateway"),
            LlmError::ServerError { status: 502, .. }
        ));
        assert!(matches!(
            map_status_error("openai", 400, "bad request"),
            LlmError::ApiRequest { .. }
        ));
    }

    #[test]
    fn test_map_status_error_reads_retry_hint() {
        let body = r#"{"error":{"message":"Rate limit reached. Please try again in 7s"}}"#;
        match map_status_error("openai", 429, body) {
            LlmError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, 7),
            other => panic!("Expected RateLimited, got {:?}", other),
        }
        match map_status_error("openai", 429, "slow down") {
            LlmError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, 5),
            other => panic!("Expected RateLimited, got {:?}", other),
        }
    }
}
