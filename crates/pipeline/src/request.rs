//! Manifest entries: one inference request per source record.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use batchflow_core::{RecordId, SourceRecord};

/// Label key carrying the originating record id inside the request.
pub const RECORD_ID_LABEL: &str = "record_id";

const MAX_LABEL_LEN: usize = 63;

/// Request parameters shared by every manifest line.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestTemplate {
    pub system_instruction: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub response_mime_type: Option<String>,
}

impl Default for RequestTemplate {
    fn default() -> Self {
        Self {
            system_instruction: None,
            temperature: Some(0.0),
            max_output_tokens: None,
            response_mime_type: Some("application/json".to_string()),
        }
    }
}

impl RequestTemplate {
    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    fn generation_config(&self) -> Option<GenerationConfig> {
        let config = GenerationConfig {
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
            response_mime_type: self.response_mime_type.clone(),
        };
        let empty = config.temperature.is_none()
            && config.max_output_tokens.is_none()
            && config.response_mime_type.is_none();
        (!empty).then_some(config)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
}

/// Body of a single generate-content call as the batch service expects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// One manifest line. `key` is echoed back verbatim in the output line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub key: RecordId,
    pub request: GenerateContentRequest,
}

impl ManifestEntry {
    pub fn for_record(record: &SourceRecord, template: &RequestTemplate) -> Self {
        let mut labels = BTreeMap::new();
        if label_safe(record.id.as_str()) {
            labels.insert(RECORD_ID_LABEL.to_string(), record.id.as_str().to_string());
        }

        let request = GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: record.payload_text(),
                }],
            }],
            system_instruction: template.system_instruction.as_ref().map(|text| Content {
                role: None,
                parts: vec![Part { text: text.clone() }],
            }),
            generation_config: template.generation_config(),
            labels,
        };

        Self {
            key: record.id.clone(),
            request,
        }
    }

    /// Serialize as a single manifest line (no trailing newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Label values are limited to lowercase letters, digits, `_` and `-`.
pub fn label_safe(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_LABEL_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn record(id: &str, payload: Value) -> SourceRecord {
        SourceRecord::pending(RecordId::new(id).unwrap(), payload)
    }

    #[test]
    fn entry_carries_key_and_label() {
        let entry = ManifestEntry::for_record(
            &record("rec-1", json!("hello")),
            &RequestTemplate::default().with_system_instruction("summarize"),
        );
        let line: Value = serde_json::from_str(&entry.to_line().unwrap()).unwrap();

        assert_eq!(line["key"], "rec-1");
        assert_eq!(line["request"]["labels"]["record_id"], "rec-1");
        assert_eq!(line["request"]["contents"][0]["parts"][0]["text"], "hello");
        assert_eq!(line["request"]["systemInstruction"]["parts"][0]["text"], "summarize");
        assert_eq!(
            line["request"]["generationConfig"]["responseMimeType"],
            "application/json"
        );
    }

    #[test]
    fn unsafe_ids_are_not_labelled() {
        let source = record("Ticket/42", json!({"a": 1}));
        let entry = ManifestEntry::for_record(&source, &RequestTemplate::default());
        assert!(entry.request.labels.is_empty());
        assert_eq!(entry.key.as_str(), "Ticket/42");
        assert!(entry.request.contents[0].parts[0].text.contains("\"a\": 1"));
    }

    #[test]
    fn label_rules() {
        assert!(label_safe("abc_1-2"));
        assert!(!label_safe(""));
        assert!(!label_safe("Upper"));
        assert!(!label_safe(&"a".repeat(64)));
    }

    #[test]
    fn manifest_lines_are_single_line() {
        let source = record("x", json!("multi\nline\ntext"));
        let entry = ManifestEntry::for_record(&source, &RequestTemplate::default());
        assert!(!entry.to_line().unwrap().contains('\n'));
    }
}
