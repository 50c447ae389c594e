//! Inference client: one persona-conditioned question in, one answer out.
//!
//! Expected per-call failures (transport errors, refusals, unparsable
//! replies) never abort a pass. They come back as [`AnswerOutcome::Failed`]
//! with a tagged reason. Only a misconfigured client surfaces as
//! [`InferenceError`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::extract::{check_scale, extract_numeric_answer, parse_constrained_answer, ScaleCheck};
use crate::gateway::{
    is_refusal, Attribution, ChatGateway, ChatRequest, ProviderError, ProviderKind,
};
use crate::persona::{ModelDescriptor, Persona};
use crate::prompts::{scale_schema, QuestionPrompt};
use crate::questionnaire::{AnswerValue, Question, Segment};

// =============================================================================
// Outcomes
// =============================================================================

/// Why a question produced no usable answer (or a suspect one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationFlag {
    TransportError,
    Refused,
    NoAnswer,
    OutsideConstraint,
    OutOfScale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerFailure {
    /// Network error, bad status, malformed payload, rate limit.
    Transport { code: &'static str, message: String },
    /// The model declined to answer.
    Refused,
    /// No digit in a free-text reply.
    NoAnswer,
    /// Constrained reply missing or not one of the scale tokens.
    OutsideConstraint,
}

impl AnswerFailure {
    pub fn flag(&self) -> ObservationFlag {
        match self {
            AnswerFailure::Transport { .. } => ObservationFlag::TransportError,
            AnswerFailure::Refused => ObservationFlag::Refused,
            AnswerFailure::NoAnswer => ObservationFlag::NoAnswer,
            AnswerFailure::OutsideConstraint => ObservationFlag::OutsideConstraint,
        }
    }

    fn from_provider(err: &ProviderError) -> Self {
        match err {
            ProviderError::Refused { .. } => AnswerFailure::Refused,
            other => AnswerFailure::Transport {
                code: other.code(),
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerOutcome {
    /// An admissible scale value.
    Answered(AnswerValue),
    /// Extracted, but not one of the segment's scale tokens. Recorded as-is.
    OutOfScale(AnswerValue),
    Failed(AnswerFailure),
}

impl AnswerOutcome {
    /// Value written to the sample (`None` serializes as null).
    pub fn response(&self) -> Option<&AnswerValue> {
        match self {
            AnswerOutcome::Answered(v) | AnswerOutcome::OutOfScale(v) => Some(v),
            AnswerOutcome::Failed(_) => None,
        }
    }

    pub fn flag(&self) -> Option<ObservationFlag> {
        match self {
            AnswerOutcome::Answered(_) => None,
            AnswerOutcome::OutOfScale(_) => Some(ObservationFlag::OutOfScale),
            AnswerOutcome::Failed(f) => Some(f.flag()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("inference client misconfigured: {0}")]
    Misconfigured(#[source] ProviderError),
}

// =============================================================================
// Client trait
// =============================================================================

/// One question for one configuration.
#[derive(Debug, Clone, Copy)]
pub struct AnswerRequest<'a> {
    pub persona: &'a Persona,
    pub model: &'a ModelDescriptor,
    pub segment: &'a Segment,
    pub question: &'a Question,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStrategy {
    /// Free text, first digit extracted.
    #[default]
    Text,
    /// JSON answer restricted to the scale tokens.
    Constrained,
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn answer(
        &self,
        req: AnswerRequest<'_>,
        attribution: Attribution,
    ) -> Result<AnswerOutcome, InferenceError>;
}

/// Sampling temperature when none is configured. Matches the default of
/// common local inference servers.
pub const DEFAULT_TEMPERATURE: f32 = 0.8;

/// Transport settings shared by both strategies.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub provider: ProviderKind,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Endpoint,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: None,
        }
    }
}

impl ClientOptions {
    fn request(
        &self,
        req: &AnswerRequest<'_>,
        prompt: &QuestionPrompt,
        attribution: Attribution,
    ) -> ChatRequest {
        let chat = ChatRequest::new(
            self.provider.chat_model(req.model.id()),
            prompt.to_messages(),
            attribution,
        )
        .temperature(self.temperature);
        match self.max_tokens {
            Some(max) => chat.max_tokens(max),
            None => chat,
        }
    }
}

/// Build the client for a strategy over a shared gateway.
pub fn client_for(
    strategy: AnswerStrategy,
    gateway: Arc<dyn ChatGateway>,
    options: ClientOptions,
) -> Arc<dyn InferenceClient> {
    match strategy {
        AnswerStrategy::Text => Arc::new(TextInferenceClient::new(gateway, options)),
        AnswerStrategy::Constrained => Arc::new(ConstrainedInferenceClient::new(gateway, options)),
    }
}

async fn send(
    gateway: &dyn ChatGateway,
    chat: ChatRequest,
    req: &AnswerRequest<'_>,
) -> Result<Result<String, AnswerFailure>, InferenceError> {
    match gateway.chat(chat).await {
        Ok(resp) => Ok(Ok(resp.content)),
        Err(err) if err.is_fatal() => Err(InferenceError::Misconfigured(err)),
        Err(err) => {
            warn!(
                persona = %req.persona.id,
                model = req.model.id(),
                segment = %req.segment.label,
                question = req.question.id,
                code = err.code(),
                request_id = err.request_id().unwrap_or(""),
                "inference call failed: {err}"
            );
            Ok(Err(AnswerFailure::from_provider(&err)))
        }
    }
}

fn log_unusable(req: &AnswerRequest<'_>, outcome: &AnswerOutcome) {
    if let Some(flag) = outcome.flag() {
        warn!(
            persona = %req.persona.id,
            model = req.model.id(),
            segment = %req.segment.label,
            question = req.question.id,
            ?flag,
            response = ?outcome.response(),
            "unusable answer"
        );
    }
}

// =============================================================================
// Unconstrained text
// =============================================================================

pub struct TextInferenceClient {
    gateway: Arc<dyn ChatGateway>,
    options: ClientOptions,
}

impl TextInferenceClient {
    pub fn new(gateway: Arc<dyn ChatGateway>, options: ClientOptions) -> Self {
        Self { gateway, options }
    }
}

#[async_trait]
impl InferenceClient for TextInferenceClient {
    async fn answer(
        &self,
        req: AnswerRequest<'_>,
        attribution: Attribution,
    ) -> Result<AnswerOutcome, InferenceError> {
        let prompt = QuestionPrompt::render(req.persona, req.segment, req.question);
        let chat = self.options.request(&req, &prompt, attribution);

        let content = match send(self.gateway.as_ref(), chat, &req).await? {
            Ok(content) => content,
            Err(failure) => return Ok(AnswerOutcome::Failed(failure)),
        };

        let outcome = match extract_numeric_answer(&content) {
            Some(digit) => match check_scale(AnswerValue::Text(digit), &req.segment.scale) {
                ScaleCheck::InScale(v) => AnswerOutcome::Answered(v),
                ScaleCheck::OutOfScale(v) => AnswerOutcome::OutOfScale(v),
            },
            None if is_refusal(&content) => AnswerOutcome::Failed(AnswerFailure::Refused),
            None => AnswerOutcome::Failed(AnswerFailure::NoAnswer),
        };
        log_unusable(&req, &outcome);
        Ok(outcome)
    }
}

// =============================================================================
// Constrained decoding
// =============================================================================

pub struct ConstrainedInferenceClient {
    gateway: Arc<dyn ChatGateway>,
    options: ClientOptions,
}

impl ConstrainedInferenceClient {
    pub fn new(gateway: Arc<dyn ChatGateway>, options: ClientOptions) -> Self {
        Self { gateway, options }
    }
}

#[async_trait]
impl InferenceClient for ConstrainedInferenceClient {
    async fn answer(
        &self,
        req: AnswerRequest<'_>,
        attribution: Attribution,
    ) -> Result<AnswerOutcome, InferenceError> {
        let scale = &req.segment.scale;
        let prompt =
            QuestionPrompt::render(req.persona, req.segment, req.question).constrained(scale);
        let chat = self
            .options
            .request(&req, &prompt, attribution)
            .schema(scale_schema(scale));

        let content = match send(self.gateway.as_ref(), chat, &req).await? {
            Ok(content) => content,
            Err(failure) => return Ok(AnswerOutcome::Failed(failure)),
        };

        let outcome = match parse_constrained_answer(&content, scale) {
            Some(token) => AnswerOutcome::Answered(token),
            None if is_refusal(&content) => AnswerOutcome::Failed(AnswerFailure::Refused),
            None => AnswerOutcome::Failed(AnswerFailure::OutsideConstraint),
        };
        log_unusable(&req, &outcome);
        Ok(outcome)
    }
}
