//! Provider gateway for chat completions.
//!
//! Two backends implement [`ChatProvider`]: OpenRouter and a plain inference
//! endpoint. [`ProviderGateway`] wraps either one with retries and usage
//! recording and is what the survey code talks to through [`ChatGateway`].

pub mod endpoint;
pub mod error;
pub mod openrouter;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::sleep;

use endpoint::EndpointAdapter;
use openrouter::OpenRouterAdapter;
use usage::{ProviderCallRecord, UsageSink as UsageSinkTrait};

pub use error::{ErrorContext, ProviderError};
pub use types::*;
pub use usage::{
    CallStatus, NoopUsageSink, TallyUsageSink, UsageSink, UsageTally,
};

/// Maximum allowed response body length (1MB).
pub(crate) const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum allowed input characters.
pub(crate) const MAX_INPUT_CHARS: usize = 500_000;

/// A single backend able to answer chat requests.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// What the survey code calls. Implemented by [`ProviderGateway`] and by
/// in-process fakes in tests.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

pub struct ProviderGateway<U: UsageSinkTrait> {
    provider: Box<dyn ChatProvider>,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait]
impl<U: UsageSinkTrait> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U> {
    /// OpenRouter gateway configured from `OPENROUTER_*` environment variables.
    pub fn openrouter_from_env(usage_sink: Arc<U>, config: GatewayConfig) -> Result<Self, ProviderError> {
        let adapter = OpenRouterAdapter::from_env()?;
        Ok(Self::with_config(adapter, usage_sink, config))
    }

    /// Gateway for a plain inference endpoint.
    pub fn endpoint(
        url: impl Into<String>,
        timeout: Duration,
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Result<Self, ProviderError> {
        let adapter = EndpointAdapter::new(url, timeout)?;
        Ok(Self::with_config(adapter, usage_sink, config))
    }

    pub fn with_config(
        provider: impl ChatProvider + 'static,
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            provider: Box::new(provider),
            usage_sink,
            config,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut attempt = 0;
        loop {
            let start = Instant::now();
            match self.provider.chat(&req).await {
                Ok(resp) => {
                    let record = self
                        .base_record(&req, attempt)
                        .tokens(resp.input_tokens, resp.output_tokens)
                        .latency(resp.latency.as_millis() as u64);
                    self.usage_sink.record(record).await;
                    return Ok(resp);
                }
                Err(err) => {
                    let record = self
                        .base_record(&req, attempt)
                        .latency(start.elapsed().as_millis() as u64)
                        .error(err.code());
                    self.usage_sink.record(record).await;

                    if !err.is_retryable() || attempt >= self.config.max_retries {
                        return Err(err);
                    }

                    sleep(backoff_delay(self.config.retry_base_delay, attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    fn base_record(&self, req: &ChatRequest, attempt: u32) -> ProviderCallRecord {
        ProviderCallRecord::new(
            req.model.provider(),
            req.model.model_id(),
            req.attribution.caller,
        )
        .run(req.attribution.run_id)
        .configuration(req.attribution.configuration.clone())
        .attempt(attempt)
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.pow(attempt.min(5));
    base * multiplier
}

/// Read a response body, failing once it exceeds [`MAX_RESPONSE_LEN`].
pub(crate) async fn read_limited_body(
    provider: &'static str,
    mut response: reqwest::Response,
) -> Result<String, ProviderError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let new_len = bytes.len() + chunk.len();
        if new_len > MAX_RESPONSE_LEN {
            return Err(ProviderError::provider(
                provider,
                format!("Response too large: {new_len} bytes"),
                false,
            ));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Whether a message reads like a refusal to answer.
pub fn is_refusal(msg: &str) -> bool {
    let l = msg.trim_start().to_lowercase();
    let first_line = l.lines().next().unwrap_or("");

    const PREFIXES: &[&str] = &[
        "refus",
        "i cannot",
        "i can't",
        "i won't",
        "i will not",
        "i am unable to",
        "i'm unable to",
        "as an ai",
        "unable to comply",
        "unable to assist",
        "unable to provide",
    ];

    PREFIXES.iter().any(|p| first_line.starts_with(p)) || l.contains("request was refused")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 9), Duration::from_millis(3200));
    }

    #[test]
    fn refusal_detection_looks_at_first_line() {
        assert!(is_refusal("I cannot answer that as it asks for an opinion."));
        assert!(is_refusal("  As an AI, I do not hold views."));
        assert!(!is_refusal("I would rate this a 4."));
    }
}
