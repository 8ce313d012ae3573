//! Analysis results imported from batch output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::id::RecordId;

/// Structured analysis for one source record.
///
/// At most one exists per `original_record_id`; re-imports overwrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub original_record_id: RecordId,
    /// The decoded model answer. Its schema belongs to the prompt, not to
    /// the pipeline.
    pub analysis: JsonValue,
    pub model: Option<String>,
    /// Output object the result was read from.
    pub source_object: Option<String>,
    pub imported_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn new(original_record_id: RecordId, analysis: JsonValue) -> Self {
        Self {
            original_record_id,
            analysis,
            model: None,
            source_object: None,
            imported_at: Utc::now(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_source_object(mut self, source: impl Into<String>) -> Self {
        self.source_object = Some(source.into());
        self
    }
}

/// Counts returned by an idempotent upsert.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub inserted: u64,
    pub updated: u64,
}

impl UpsertOutcome {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated
    }
}
