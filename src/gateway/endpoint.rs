//! Adapter for a self-hosted inference endpoint.
//!
//! The endpoint accepts `{model, messages, format?, options?}` and answers
//! `{response: "..."}`. Anything else (transport error, non-2xx, missing
//! `response` field) is a provider error.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::types::*;
use super::{read_limited_body, ChatProvider, MAX_INPUT_CHARS};

/// Inference endpoint adapter.
#[derive(Debug, Clone)]
pub struct EndpointAdapter {
    client: reqwest::Client,
    url: String,
}

impl EndpointAdapter {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(ProviderError::config("inference endpoint URL is empty"));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, url })
    }
}

#[derive(Serialize)]
struct EndpointRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a serde_json::Value>,
    options: EndpointOptions,
}

#[derive(Serialize)]
struct EndpointOptions {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Deserialize)]
struct EndpointResponse {
    response: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[async_trait]
impl ChatProvider for EndpointAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let total_chars: usize = req.messages.iter().map(|m| m.content.len()).sum();
        if total_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "Input too large: {total_chars} chars (max {MAX_INPUT_CHARS})"
            )));
        }

        let start = Instant::now();
        let body = EndpointRequest {
            model: req.model.model_id(),
            messages: &req.messages,
            format: req.response_schema.as_ref().map(|s| &s.schema),
            options: EndpointOptions {
                temperature: req.temperature,
                num_predict: req.max_tokens,
            },
        };

        let response = self.client.post(&self.url).json(&body).send().await?;
        let status = response.status();
        let ctx = ErrorContext::new().with_status(status.as_u16());
        let raw = read_limited_body("endpoint", response).await?;

        if !status.is_success() {
            return Err(match status.as_u16() {
                429 => ProviderError::rate_limited(Duration::from_secs(30), ctx),
                code => ProviderError::provider_with_context(
                    "endpoint",
                    format!("HTTP {code}"),
                    code >= 500,
                    ctx,
                ),
            });
        }

        let parsed: EndpointResponse = serde_json::from_str(&raw).map_err(|e| {
            ProviderError::provider("endpoint", format!("Invalid JSON: {e}"), false)
        })?;
        let content = parsed.response.ok_or_else(|| {
            ProviderError::provider_with_context(
                "endpoint",
                "Missing 'response' field",
                false,
                ctx,
            )
        })?;

        Ok(ChatResponse {
            content,
            input_tokens: parsed.prompt_eval_count.unwrap_or(0),
            output_tokens: parsed.eval_count.unwrap_or(0),
            latency: start.elapsed(),
            finish_reason: FinishReason::Stop,
        })
    }
}
