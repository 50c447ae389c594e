//! Core types for the provider gateway.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Attribution for usage accounting and debugging.
///
/// Every request through the gateway carries attribution so usage records can
/// be traced back to the run and the code path that issued them.
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    /// Survey run this request is part of.
    pub run_id: Option<Uuid>,
    /// Configuration label ("persona/model_dir") the call was made for.
    pub configuration: Option<String>,
    /// Which code path made this call, e.g. "survey::text".
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_configuration(mut self, label: impl Into<String>) -> Self {
        self.configuration = Some(label.into());
        self
    }
}

// =============================================================================
// CHAT TYPES
// =============================================================================

/// Chat message role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Model to call, tagged by backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatModel {
    /// OpenRouter model, e.g. "meta-llama/llama-3.1-8b-instruct"
    OpenRouter(String),
    /// Model served by a plain inference endpoint, e.g. "llama3.1:8b"
    Endpoint(String),
}

impl ChatModel {
    pub fn openrouter(model_id: impl Into<String>) -> Self {
        ChatModel::OpenRouter(model_id.into())
    }

    pub fn endpoint(model_id: impl Into<String>) -> Self {
        ChatModel::Endpoint(model_id.into())
    }

    pub fn model_id(&self) -> &str {
        match self {
            ChatModel::OpenRouter(id) | ChatModel::Endpoint(id) => id,
        }
    }

    pub fn provider(&self) -> &'static str {
        match self {
            ChatModel::OpenRouter(_) => "openrouter",
            ChatModel::Endpoint(_) => "endpoint",
        }
    }
}

/// Which backend serves the survey's models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[serde(rename = "openrouter")]
    OpenRouter,
    Endpoint,
}

impl ProviderKind {
    pub fn chat_model(self, model_id: impl Into<String>) -> ChatModel {
        match self {
            ProviderKind::OpenRouter => ChatModel::openrouter(model_id),
            ProviderKind::Endpoint => ChatModel::endpoint(model_id),
        }
    }
}

/// JSON schema the response must conform to (constrained decoding).
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSchema {
    /// Schema name, forwarded to providers that require one.
    pub name: String,
    /// The JSON schema document.
    pub schema: serde_json::Value,
}

/// Request for chat completion.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model to use.
    pub model: ChatModel,
    /// Messages in the conversation.
    pub messages: Vec<Message>,
    /// Sampling temperature (0.0 - 2.0).
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Constrain the output to this JSON schema.
    pub response_schema: Option<ResponseSchema>,
    /// Attribution for usage accounting.
    pub attribution: Attribution,
}

impl ChatRequest {
    pub fn new(model: ChatModel, messages: Vec<Message>, attribution: Attribution) -> Self {
        Self {
            model,
            messages,
            temperature: 0.0,
            max_tokens: None,
            response_schema: None,
            attribution,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn schema(mut self, schema: ResponseSchema) -> Self {
        self.response_schema = Some(schema);
        self
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Unknown(String),
}

impl From<Option<String>> for FinishReason {
    fn from(s: Option<String>) -> Self {
        match s.as_deref() {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some("tool_calls") => FinishReason::ToolCalls,
            Some(other) => FinishReason::Unknown(other.to_string()),
            None => FinishReason::Unknown("none".to_string()),
        }
    }
}

/// Response from chat completion.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Generated content.
    pub content: String,
    /// Input tokens consumed (0 when the backend does not report usage).
    pub input_tokens: u32,
    /// Output tokens generated.
    pub output_tokens: u32,
    /// Time taken for the request.
    pub latency: Duration,
    /// Why the model stopped.
    pub finish_reason: FinishReason,
}

impl ChatResponse {
    /// Response carrying only content, used by fakes and simple backends.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            input_tokens: 0,
            output_tokens: 0,
            latency: Duration::from_millis(0),
            finish_reason: FinishReason::Stop,
        }
    }
}
