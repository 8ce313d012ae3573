//! Source records and their export state.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{ModelError, ModelResult};
use crate::id::RecordId;

/// Export state of a source record within the current generation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportState {
    /// Not yet written to a durable manifest.
    Pending,
    /// Included in a manifest that was flushed and closed.
    Exported,
}

impl ExportState {
    pub fn as_str(self) -> &'static str {
        match self {
            ExportState::Pending => "pending",
            ExportState::Exported => "exported",
        }
    }

    /// `pending → exported`. Any other transition is rejected.
    pub fn export(self) -> ModelResult<Self> {
        match self {
            ExportState::Pending => Ok(ExportState::Exported),
            ExportState::Exported => Err(ModelError::invalid_transition(
                "record is already exported",
            )),
        }
    }

    /// `exported → pending`, opening a new generation for the record.
    pub fn requeue(self) -> ModelResult<Self> {
        match self {
            ExportState::Exported => Ok(ExportState::Pending),
            ExportState::Pending => Err(ModelError::invalid_transition(
                "record is already pending",
            )),
        }
    }
}

impl core::fmt::Display for ExportState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExportState::Pending),
            "exported" => Ok(ExportState::Exported),
            other => Err(ModelError::validation(format!("unknown export state: {other}"))),
        }
    }
}

/// An analyzable unit (document, conversation, ...) identified by a stable id.
///
/// The payload is opaque to the pipeline: a JSON string is sent as text,
/// anything else is rendered as pretty-printed JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: RecordId,
    pub payload: JsonValue,
    pub export_state: ExportState,
}

impl SourceRecord {
    pub fn pending(id: RecordId, payload: JsonValue) -> Self {
        Self {
            id,
            payload,
            export_state: ExportState::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.export_state == ExportState::Pending
    }

    /// Text handed to the inference request for this record.
    pub fn payload_text(&self) -> String {
        match &self.payload {
            JsonValue::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        }
    }
}
