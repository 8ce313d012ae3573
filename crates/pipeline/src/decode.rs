//! Decoding of batch output lines.
//!
//! An output line wraps the original request and the service response:
//!
//! ```text
//! {"key": "...", "request": {...},
//!  "response": {"candidates": [...], "modelVersion": "..."}, "status": ""}
//! ```
//!
//! The model's answer is text inside the first candidate. It is decoded as
//! JSON directly and, failing that, once more after stripping a Markdown code
//! fence.

use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use batchflow_core::RecordId;

use crate::request::RECORD_ID_LABEL;

pub type JsonObject = Map<String, JsonValue>;

const FENCE: &str = "```";

/// The model answer after unwrapping.
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    /// The text was a JSON object.
    Structured(JsonObject),
    /// The text was a JSON object inside a code fence.
    Fenced(JsonObject),
    Unparseable(String),
}

impl Answer {
    pub fn decode(text: &str) -> Self {
        let first = match serde_json::from_str::<JsonValue>(text.trim()) {
            Ok(JsonValue::Object(map)) => return Answer::Structured(map),
            Ok(_) => "answer is not a JSON object".to_string(),
            Err(e) => e.to_string(),
        };

        let Some(inner) = strip_fences(text) else {
            return Answer::Unparseable(first);
        };
        match serde_json::from_str::<JsonValue>(inner) {
            Ok(JsonValue::Object(map)) => Answer::Fenced(map),
            Ok(_) => Answer::Unparseable("fenced answer is not a JSON object".to_string()),
            Err(e) => Answer::Unparseable(format!("fenced answer: {e}")),
        }
    }

    pub fn into_object(self) -> Result<JsonObject, String> {
        match self {
            Answer::Structured(map) | Answer::Fenced(map) => Ok(map),
            Answer::Unparseable(reason) => Err(reason),
        }
    }
}

/// Content between the opening fence and the last closing fence.
///
/// The opening fence may carry a language tag (```` ```json ````). The body
/// may start on the fence line itself (```` ```{"a": 1}``` ````), and a
/// missing closing fence is tolerated.
pub fn strip_fences(text: &str) -> Option<&str> {
    let start = text.find(FENCE)?;
    let after_open = &text[start + FENCE.len()..];
    let tag_len = after_open
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+')))
        .unwrap_or(after_open.len());
    let after_tag = &after_open[tag_len..];
    let body = match after_tag.find('\n') {
        Some(newline) if after_tag[..newline].trim().is_empty() => &after_tag[newline + 1..],
        // Single-line fence. A word glued to the fence is content, not a tag.
        _ if after_tag.starts_with(char::is_whitespace) => after_tag,
        _ => after_open,
    };
    let body = match body.rfind(FENCE) {
        Some(end) => &body[..end],
        None => body,
    };
    Some(body.trim())
}

/// Why a line could not be turned into a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LineError {
    #[error("line is not valid json: {0}")]
    Envelope(String),

    #[error("service reported failure: {0}")]
    Failed(String),

    #[error("response has no candidate text")]
    NoCandidate,

    #[error("answer could not be decoded: {0}")]
    Answer(String),

    #[error("invalid record id: {0}")]
    InvalidKey(String),
}

/// A successfully decoded output line.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLine {
    /// Record id echoed by the service, if any.
    pub record_id: Option<RecordId>,
    pub analysis: JsonObject,
    pub model: Option<String>,
    pub fenced: bool,
}

impl DecodedLine {
    /// Best-effort id from a field inside the answer itself.
    pub fn natural_key(&self, field: &str) -> Option<RecordId> {
        match self.analysis.get(field)? {
            JsonValue::String(s) => RecordId::new(s.as_str()).ok(),
            JsonValue::Number(n) => RecordId::new(n.to_string()).ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OutputLine {
    #[serde(default)]
    key: Option<JsonValue>,
    #[serde(default)]
    request: Option<EchoedRequest>,
    #[serde(default)]
    response: Option<Response>,
    #[serde(default)]
    status: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct EchoedRequest {
    #[serde(default)]
    labels: std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Response {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

/// Decode one output line.
pub fn decode_line(line: &str) -> Result<DecodedLine, LineError> {
    let envelope: OutputLine =
        serde_json::from_str(line).map_err(|e| LineError::Envelope(e.to_string()))?;

    if let Some(status) = envelope.status.as_ref().and_then(failure_status) {
        return Err(LineError::Failed(status));
    }

    let record_id = echoed_id(&envelope)?;

    let response = envelope.response.ok_or(LineError::NoCandidate)?;
    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(LineError::NoCandidate);
    }

    let answer = Answer::decode(&text);
    let fenced = matches!(answer, Answer::Fenced(_));
    let analysis = answer.into_object().map_err(LineError::Answer)?;

    Ok(DecodedLine {
        record_id,
        analysis,
        model: response.model_version,
        fenced,
    })
}

fn failure_status(status: &JsonValue) -> Option<String> {
    match status {
        JsonValue::Null => None,
        JsonValue::String(s) if s.trim().is_empty() => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Object(map) if map.is_empty() => None,
        other => Some(other.to_string()),
    }
}

fn echoed_id(envelope: &OutputLine) -> Result<Option<RecordId>, LineError> {
    let raw = match &envelope.key {
        Some(JsonValue::String(s)) => Some(s.clone()),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => envelope
            .request
            .as_ref()
            .and_then(|r| r.labels.get(RECORD_ID_LABEL).cloned()),
    };
    raw.map(|id| RecordId::new(id.as_str()).map_err(|_| LineError::InvalidKey(id)))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn output_line(key: Option<&str>, text: &str) -> String {
        let mut line = json!({
            "request": {"contents": []},
            "response": {
                "candidates": [{"content": {"role": "model", "parts": [{"text": text}]}}],
                "modelVersion": "gemini-test"
            },
            "status": ""
        });
        if let Some(key) = key {
            line["key"] = json!(key);
        }
        line.to_string()
    }

    #[test]
    fn plain_json_answer_is_structured() {
        assert_eq!(
            Answer::decode(r#"{"sentiment": "positive"}"#),
            Answer::Structured(json!({"sentiment": "positive"}).as_object().unwrap().clone())
        );
    }

    #[test]
    fn fenced_answer_is_unwrapped() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\n";
        assert_eq!(
            Answer::decode(text),
            Answer::Fenced(json!({"a": 1}).as_object().unwrap().clone())
        );
    }

    #[test]
    fn non_object_answers_are_rejected() {
        assert!(matches!(Answer::decode("[1, 2]"), Answer::Unparseable(_)));
        assert!(matches!(Answer::decode("```\n42\n```"), Answer::Unparseable(_)));
        assert!(matches!(Answer::decode("no json here"), Answer::Unparseable(_)));
    }

    #[test]
    fn strip_fences_tolerates_missing_close() {
        assert_eq!(strip_fences("```json\n{\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(strip_fences("plain"), None);
    }

    #[test]
    fn single_line_fences_keep_their_body() {
        assert_eq!(strip_fences("```{\"a\":1}```"), Some("{\"a\":1}"));
        assert_eq!(strip_fences("```json {\"a\":1}```"), Some("{\"a\":1}"));
        assert_eq!(strip_fences("```{\"a\":1}\n```"), Some("{\"a\":1}"));
        assert_eq!(
            Answer::decode("```{\"a\":1}```"),
            Answer::Fenced(json!({"a": 1}).as_object().unwrap().clone())
        );
    }

    #[test]
    fn line_with_key_decodes() {
        let decoded = decode_line(&output_line(Some("rec-1"), r#"{"score": 3}"#)).unwrap();
        assert_eq!(decoded.record_id.unwrap().as_str(), "rec-1");
        assert_eq!(decoded.analysis["score"], 3);
        assert_eq!(decoded.model.as_deref(), Some("gemini-test"));
        assert!(!decoded.fenced);
    }

    #[test]
    fn label_is_used_when_key_is_absent() {
        let line = json!({
            "request": {"labels": {"record_id": "rec-9"}},
            "response": {"candidates": [{"content": {"parts": [{"text": "{}"}]}}]}
        })
        .to_string();
        assert_eq!(decode_line(&line).unwrap().record_id.unwrap().as_str(), "rec-9");
    }

    #[test]
    fn natural_key_reads_answer_field() {
        let decoded = decode_line(&output_line(None, r#"{"record_id": "rec-3"}"#)).unwrap();
        assert!(decoded.record_id.is_none());
        assert_eq!(decoded.natural_key("record_id").unwrap().as_str(), "rec-3");
        assert!(decoded.natural_key("missing").is_none());
    }

    #[test]
    fn failed_lines_are_reported() {
        let line = json!({"key": "a", "status": "quota exceeded"}).to_string();
        assert_eq!(
            decode_line(&line),
            Err(LineError::Failed("quota exceeded".into()))
        );
        assert!(matches!(decode_line("{not json"), Err(LineError::Envelope(_))));
        assert_eq!(
            decode_line(&json!({"key": "a", "response": {"candidates": []}}).to_string()),
            Err(LineError::NoCandidate)
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn objects_survive_fencing(
            fields in proptest::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..6),
            tag in proptest::option::of("[a-z]{1,6}"),
        ) {
            let object: JsonObject = fields.into_iter().map(|(k, v)| (k, json!(v))).collect();
            let body = serde_json::to_string_pretty(&object).unwrap();
            let fenced = format!("```{}\n{}\n```", tag.unwrap_or_default(), body);

            prop_assert_eq!(Answer::decode(&body), Answer::Structured(object.clone()));
            prop_assert_eq!(Answer::decode(&fenced), Answer::Fenced(object));
        }

        #[test]
        fn arbitrary_lines_never_panic(line in ".{0,200}") {
            let _ = decode_line(&line);
        }
    }
}
