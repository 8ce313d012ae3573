//! Model error and the pipeline-wide error classification.

use thiserror::Error;

/// Result type used across the model layer.
pub type ModelResult<T> = Result<T, ModelError>;

/// Model-level error.
///
/// Keep this focused on deterministic failures (validation, illegal state
/// transitions). I/O concerns belong to the adapter error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. empty record id).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A state transition is not allowed from the current state.
    #[error("invalid state transition: {0}")]
    InvalidTransition(String),
}

impl ModelError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }
}

/// How a failure is handled by the pipeline.
///
/// - `Transient`: network/remote errors; retried, then abort the phase.
/// - `Structural`: malformed lines/entries; counted and skipped.
/// - `Invariant`: data corruption or duplicate jobs; fatal.
/// - `Configuration`: missing credentials/settings; fatal before any mutation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Transient,
    Structural,
    Invariant,
    Configuration,
}

impl ErrorClass {
    /// Process exit code for a phase that ended with this class of error.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorClass::Transient | ErrorClass::Structural => 1,
            ErrorClass::Invariant => 2,
            ErrorClass::Configuration => 3,
        }
    }

    /// Whether this class requires operator intervention.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorClass::Invariant | ErrorClass::Configuration)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Structural => "structural",
            ErrorClass::Invariant => "invariant",
            ErrorClass::Configuration => "configuration",
        }
    }
}

impl core::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classes_have_distinct_exit_codes() {
        assert_eq!(ErrorClass::Transient.exit_code(), 1);
        assert_eq!(ErrorClass::Invariant.exit_code(), 2);
        assert_eq!(ErrorClass::Configuration.exit_code(), 3);
        assert!(ErrorClass::Invariant.is_fatal());
        assert!(!ErrorClass::Structural.is_fatal());
    }
}
