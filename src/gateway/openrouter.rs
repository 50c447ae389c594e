//! OpenRouter adapter for chat completions.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::types::*;
use super::{is_refusal, read_limited_body, ChatProvider, MAX_INPUT_CHARS};

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// OpenRouter API adapter for chat completions.
#[derive(Debug, Clone)]
pub struct OpenRouterAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl OpenRouterAdapter {
    /// Create from environment variables.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ProviderError::config("OPENROUTER_API_KEY not set"))?;

        let base_url =
            std::env::var("OPENROUTER_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());

        let timeout = std::env::var("OPENROUTER_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(120));

        let referer = std::env::var("OPENROUTER_REFERER").ok();
        let app_title = std::env::var("OPENROUTER_APP_TITLE").ok();

        Self::with_config(api_key, base_url, timeout, referer, app_title)
    }

    /// Create with custom configuration.
    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
        referer: Option<String>,
        app_title: Option<String>,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        let base_url = base_url.into();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ProviderError::config("Invalid API key format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        if let Some(v) = referer.as_deref().and_then(|r| HeaderValue::from_str(r).ok()) {
            headers.insert("HTTP-Referer", v);
        }
        if let Some(v) = app_title.as_deref().and_then(|t| HeaderValue::from_str(t).ok()) {
            headers.insert("X-Title", v);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, base_url })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat<'a>>,
}

#[derive(Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    format_type: &'static str,
    json_schema: JsonSchemaFormat<'a>,
}

#[derive(Serialize)]
struct JsonSchemaFormat<'a> {
    name: &'a str,
    strict: bool,
    schema: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Option<Vec<Choice>>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    code: Option<serde_json::Value>,
}

// =============================================================================
// CHAT PROVIDER IMPL
// =============================================================================

#[async_trait]
impl ChatProvider for OpenRouterAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let total_chars: usize = req.messages.iter().map(|m| m.content.len()).sum();
        if total_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "Input too large: {total_chars} chars (max {MAX_INPUT_CHARS})"
            )));
        }

        let start = Instant::now();

        let api_req = ChatApiRequest {
            model: req.model.model_id(),
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            response_format: req.response_schema.as_ref().map(|s| ResponseFormat {
                format_type: "json_schema",
                json_schema: JsonSchemaFormat {
                    name: &s.name,
                    strict: true,
                    schema: &s.schema,
                },
            }),
        };

        let response = self
            .client
            .post(self.chat_url())
            .json(&api_req)
            .send()
            .await?;

        let status = response.status();
        let ctx = ErrorContext::new().with_status(status.as_u16());
        let ctx = match response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
        {
            Some(id) => ctx.with_request_id(id),
            None => ctx,
        };

        let body = read_limited_body("openrouter", response).await?;

        if !status.is_success() {
            let parsed_error = serde_json::from_str::<ChatApiResponse>(&body)
                .ok()
                .and_then(|p| p.error);
            let (message, ctx) = match parsed_error {
                Some(error) => {
                    let ctx = match error.code {
                        Some(serde_json::Value::String(code)) => ctx.with_code(code),
                        Some(other) => ctx.with_code(other.to_string()),
                        None => ctx,
                    };
                    (error.message.unwrap_or_default(), ctx)
                }
                None => (format!("HTTP {}", status.as_u16()), ctx),
            };

            return Err(match status.as_u16() {
                429 => ProviderError::rate_limited(Duration::from_secs(60), ctx),
                code => ProviderError::provider_with_context("openrouter", message, code >= 500, ctx),
            });
        }

        let parsed: ChatApiResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::provider("openrouter", format!("Invalid JSON: {e}"), false)
        })?;

        if let Some(error) = parsed.error {
            let message = error.message.unwrap_or_default();
            if is_refusal(&message) {
                return Err(ProviderError::refused(message));
            }
            return Err(ProviderError::provider("openrouter", message, false));
        }

        let choice = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| {
                ProviderError::provider("openrouter", "No choices in response", false)
            })?;

        let content = choice
            .message
            .and_then(|m| m.content)
            .unwrap_or_default();

        let (input_tokens, output_tokens) = parsed
            .usage
            .map(|u| (u.prompt_tokens.unwrap_or(0), u.completion_tokens.unwrap_or(0)))
            .unwrap_or((0, 0));

        Ok(ChatResponse {
            content,
            input_tokens,
            output_tokens,
            latency: start.elapsed(),
            finish_reason: FinishReason::from(choice.finish_reason),
        })
    }
}
