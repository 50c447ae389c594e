//! Prompt rendering for survey questions.
//!
//! Provider-agnostic: produces gateway messages and, for constrained
//! decoding, the JSON schema restricting the answer to the segment scale.

use serde_json::json;

use crate::gateway::{Message, ResponseSchema};
use crate::persona::Persona;
use crate::questionnaire::{AnswerValue, Question, Scale, Segment};

/// Rendered prompt ready for the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionPrompt {
    pub system: Option<String>,
    pub user: String,
}

impl QuestionPrompt {
    /// Persona content becomes the system prompt; the segment task followed by
    /// the question becomes the user prompt.
    pub fn render(persona: &Persona, segment: &Segment, question: &Question) -> Self {
        Self {
            system: persona.system_prompt().map(str::to_string),
            user: format!("{}\n\nSentence: {}", segment.task, question.content),
        }
    }

    /// Same prompt with an instruction to answer with one scale token in JSON.
    pub fn constrained(mut self, scale: &Scale) -> Self {
        let options = scale
            .entries()
            .iter()
            .map(|e| format!("{} = {}", e.token, e.meaning))
            .collect::<Vec<_>>()
            .join("\n");
        self.user = format!(
            "{}\n\nAnswer options:\n{options}\n\nRespond with JSON only: {{\"answer\": <one of the option values>}}",
            self.user
        );
        self
    }

    pub fn to_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system {
            messages.push(Message::system(system));
        }
        messages.push(Message::user(&self.user));
        messages
    }
}

/// JSON schema admitting exactly `{"answer": <scale token>}`.
pub fn scale_schema(scale: &Scale) -> ResponseSchema {
    let tokens: Vec<serde_json::Value> = scale
        .tokens()
        .map(|t| match t {
            AnswerValue::Int(n) => json!(n),
            AnswerValue::Text(s) => json!(s),
        })
        .collect();

    ResponseSchema {
        name: "survey_answer".to_string(),
        schema: json!({
            "type": "object",
            "properties": {
                "answer": { "enum": tokens }
            },
            "required": ["answer"],
            "additionalProperties": false
        }),
    }
}
