//! Questionnaire model: segments of questions sharing a task and a closed
//! answer scale.
//!
//! Loaded from a JSON array of segment objects and validated once; the result
//! is immutable for the rest of the run.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

// =============================================================================
// Answer values
// =============================================================================

/// An admissible answer token or a recorded response: integer or short string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    Int(i64),
    Text(String),
}

impl AnswerValue {
    /// Interpret a scale key: integers become `Int`, everything else `Text`.
    pub fn from_key(key: &str) -> Self {
        match key.trim().parse::<i64>() {
            Ok(n) => AnswerValue::Int(n),
            Err(_) => AnswerValue::Text(key.to_string()),
        }
    }

    /// Numeric reading of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AnswerValue::Int(n) => Some(*n as f64),
            AnswerValue::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }

    /// Same token regardless of representation (`7` and `"7"` match).
    pub fn same_token(&self, other: &AnswerValue) -> bool {
        match (self, other) {
            (AnswerValue::Int(a), AnswerValue::Int(b)) => a == b,
            _ => self.to_string().trim() == other.to_string().trim(),
        }
    }
}

impl fmt::Display for AnswerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnswerValue::Int(n) => write!(f, "{n}"),
            AnswerValue::Text(s) => f.write_str(s),
        }
    }
}

// =============================================================================
// Scale
// =============================================================================

/// One admissible answer and its human-readable meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleEntry {
    pub token: AnswerValue,
    pub meaning: String,
}

/// Closed, ordered set of admissible answers for a segment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Scale {
    entries: Vec<ScaleEntry>,
}

impl Scale {
    pub fn new(entries: Vec<ScaleEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[ScaleEntry] {
        &self.entries
    }

    pub fn tokens(&self) -> impl Iterator<Item = &AnswerValue> {
        self.entries.iter().map(|e| &e.token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The scale token matching `value`, if any.
    pub fn lookup(&self, value: &AnswerValue) -> Option<&AnswerValue> {
        self.tokens().find(|t| t.same_token(value))
    }

    pub fn contains(&self, value: &AnswerValue) -> bool {
        self.lookup(value).is_some()
    }
}

impl Serialize for Scale {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for entry in &self.entries {
            map.serialize_entry(&entry.token.to_string(), &entry.meaning)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Scale {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // serde_json is built with `preserve_order`, so declaration order survives.
        let raw = serde_json::Map::<String, serde_json::Value>::deserialize(deserializer)?;
        let mut entries = Vec::with_capacity(raw.len());
        for (key, value) in raw {
            let meaning = match value {
                serde_json::Value::String(s) => s,
                other => {
                    return Err(de::Error::custom(format!(
                        "scale entry '{key}' must map to a string, got {other}"
                    )))
                }
            };
            entries.push(ScaleEntry {
                token: AnswerValue::from_key(&key),
                meaning,
            });
        }
        Ok(Scale { entries })
    }
}

// =============================================================================
// Questions and segments
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: i64,
    pub content: String,
    pub dimension: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub label: String,
    pub task: String,
    pub questions: Vec<Question>,
    pub scale: Scale,
}

impl Segment {
    pub fn question(&self, id: i64) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == id)
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}

// =============================================================================
// Questionnaire
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QuestionnaireError {
    #[error("failed to read questionnaire {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid questionnaire JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("questionnaire has no segments")]
    Empty,
    #[error("duplicate segment label '{0}'")]
    DuplicateSegment(String),
    #[error("segment '{0}' has no questions")]
    EmptySegment(String),
    #[error("segment '{0}' has an empty scale")]
    EmptyScale(String),
    #[error("segment '{segment}' has a duplicate scale token '{token}'")]
    DuplicateScaleToken { segment: String, token: String },
    #[error("segment '{segment}' repeats question id {id}")]
    DuplicateQuestion { segment: String, id: i64 },
}

/// Validated, ordered set of segments.
#[derive(Debug, Clone, PartialEq)]
pub struct Questionnaire {
    segments: Vec<Segment>,
}

impl Questionnaire {
    pub fn new(segments: Vec<Segment>) -> Result<Self, QuestionnaireError> {
        validate(&segments)?;
        Ok(Self { segments })
    }

    pub fn from_json_str(raw: &str) -> Result<Self, QuestionnaireError> {
        let segments: Vec<Segment> = serde_json::from_str(raw)?;
        Self::new(segments)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, QuestionnaireError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| QuestionnaireError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment(&self, label: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.label == label)
    }

    pub fn question(&self, segment: &str, id: i64) -> Option<&Question> {
        self.segment(segment).and_then(|s| s.question(id))
    }

    /// Total number of questions across all segments.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every (segment, question) pair in traversal order.
    pub fn items(&self) -> impl Iterator<Item = (&Segment, &Question)> {
        self.segments
            .iter()
            .flat_map(|s| s.questions.iter().map(move |q| (s, q)))
    }
}

fn validate(segments: &[Segment]) -> Result<(), QuestionnaireError> {
    if segments.is_empty() {
        return Err(QuestionnaireError::Empty);
    }

    let mut labels = HashSet::new();
    for segment in segments {
        if !labels.insert(segment.label.as_str()) {
            return Err(QuestionnaireError::DuplicateSegment(segment.label.clone()));
        }
        if segment.questions.is_empty() {
            return Err(QuestionnaireError::EmptySegment(segment.label.clone()));
        }
        if segment.scale.is_empty() {
            return Err(QuestionnaireError::EmptyScale(segment.label.clone()));
        }

        let mut tokens: Vec<&AnswerValue> = Vec::new();
        for token in segment.scale.tokens() {
            if tokens.iter().any(|t| t.same_token(token)) {
                return Err(QuestionnaireError::DuplicateScaleToken {
                    segment: segment.label.clone(),
                    token: token.to_string(),
                });
            }
            tokens.push(token);
        }

        let mut ids = HashSet::new();
        for question in &segment.questions {
            if !ids.insert(question.id) {
                return Err(QuestionnaireError::DuplicateQuestion {
                    segment: segment.label.clone(),
                    id: question.id,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[
        {
            "label": "relevance",
            "task": "Rate how relevant each consideration is.",
            "questions": [
                {"id": 1, "content": "Whether or not someone suffered emotionally", "dimension": "care"},
                {"id": 2, "content": "Whether or not someone acted unfairly", "dimension": "fairness"}
            ],
            "scale": {"0": "not at all relevant", "5": "extremely relevant", "x": "skip"}
        },
        {
            "label": "agreement",
            "task": "Rate your agreement.",
            "questions": [
                {"id": 1, "content": "Compassion is a crucial virtue.", "dimension": "care"}
            ],
            "scale": {"1": "disagree", "2": "agree"}
        }
    ]"#;

    #[test]
    fn parses_segments_in_declared_order() {
        let q = Questionnaire::from_json_str(SAMPLE).unwrap();
        assert_eq!(q.len(), 3);
        let labels: Vec<_> = q.segments().iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, ["relevance", "agreement"]);

        let order: Vec<_> = q.items().map(|(s, q)| (s.label.clone(), q.id)).collect();
        assert_eq!(
            order,
            vec![
                ("relevance".to_string(), 1),
                ("relevance".to_string(), 2),
                ("agreement".to_string(), 1)
            ]
        );
    }

    #[test]
    fn scale_keeps_order_and_mixed_token_types() {
        let q = Questionnaire::from_json_str(SAMPLE).unwrap();
        let tokens: Vec<_> = q.segments()[0].scale.tokens().cloned().collect();
        assert_eq!(
            tokens,
            vec![
                AnswerValue::Int(0),
                AnswerValue::Int(5),
                AnswerValue::Text("x".into())
            ]
        );
        assert!(q.segments()[0]
            .scale
            .contains(&AnswerValue::Text("5".into())));
        assert!(!q.segments()[0].scale.contains(&AnswerValue::Int(3)));
    }

    #[test]
    fn question_lookup_by_segment_and_id() {
        let q = Questionnaire::from_json_str(SAMPLE).unwrap();
        assert_eq!(
            q.question("agreement", 1).map(|q| q.dimension.as_str()),
            Some("care")
        );
        assert!(q.question("agreement", 2).is_none());
        assert!(q.question("missing", 1).is_none());
    }

    #[test]
    fn rejects_duplicate_question_ids() {
        let raw = r#"[{"label": "a", "task": "t",
            "questions": [
                {"id": 1, "content": "x", "dimension": "d"},
                {"id": 1, "content": "y", "dimension": "d"}
            ],
            "scale": {"1": "one"}}]"#;
        let err = Questionnaire::from_json_str(raw).unwrap_err();
        assert!(matches!(
            err,
            QuestionnaireError::DuplicateQuestion { id: 1, .. }
        ));
    }

    #[test]
    fn rejects_empty_scale_and_duplicate_labels() {
        let empty_scale = r#"[{"label": "a", "task": "t",
            "questions": [{"id": 1, "content": "x", "dimension": "d"}],
            "scale": {}}]"#;
        assert!(matches!(
            Questionnaire::from_json_str(empty_scale),
            Err(QuestionnaireError::EmptyScale(_))
        ));

        let dup = r#"[
            {"label": "a", "task": "t", "questions": [{"id": 1, "content": "x", "dimension": "d"}], "scale": {"1": "one"}},
            {"label": "a", "task": "t", "questions": [{"id": 2, "content": "y", "dimension": "d"}], "scale": {"1": "one"}}
        ]"#;
        assert!(matches!(
            Questionnaire::from_json_str(dup),
            Err(QuestionnaireError::DuplicateSegment(_))
        ));
    }

    #[test]
    fn rejects_non_string_scale_meaning() {
        let raw = r#"[{"label": "a", "task": "t",
            "questions": [{"id": 1, "content": "x", "dimension": "d"}],
            "scale": {"1": 1}}]"#;
        assert!(matches!(
            Questionnaire::from_json_str(raw),
            Err(QuestionnaireError::Parse(_))
        ));
    }
}
