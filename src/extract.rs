//! Answer extraction from free-text model output.

use serde::Deserialize;

use crate::questionnaire::{AnswerValue, Scale};

/// First ASCII digit in `text`, scanning left to right.
///
/// Deliberately lossy: "42" yields "4", and the digit is not checked against
/// any scale. Use [`check_scale`] to classify the result.
pub fn extract_numeric_answer(text: &str) -> Option<String> {
    text.chars()
        .find(char::is_ascii_digit)
        .map(|c| c.to_string())
}

/// Where an extracted value falls relative to a segment scale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleCheck {
    /// The value is one of the scale tokens.
    InScale(AnswerValue),
    /// The value was extracted but is not an admissible token.
    OutOfScale(AnswerValue),
}

pub fn check_scale(value: AnswerValue, scale: &Scale) -> ScaleCheck {
    if scale.contains(&value) {
        ScaleCheck::InScale(value)
    } else {
        ScaleCheck::OutOfScale(value)
    }
}

#[derive(Debug, Deserialize)]
struct ConstrainedReply {
    answer: serde_json::Value,
}

/// Parse a constrained-decoding reply `{"answer": <token>}` and map it onto
/// the matching scale token. `None` when the reply does not conform.
pub fn parse_constrained_answer(raw: &str, scale: &Scale) -> Option<AnswerValue> {
    let json = extract_json(raw)?;
    let reply: ConstrainedReply = serde_json::from_str(json).ok()?;
    let candidate = match reply.answer {
        serde_json::Value::Number(n) => AnswerValue::Int(n.as_i64()?),
        serde_json::Value::String(s) => AnswerValue::from_key(&s),
        _ => return None,
    };
    scale.lookup(&candidate).cloned()
}

/// Extract a JSON object from potentially noisy LLM output (code fences,
/// surrounding prose).
fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in raw[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
