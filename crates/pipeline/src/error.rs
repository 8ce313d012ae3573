//! Adapter and phase error types.
//!
//! Adapters report `StoreError` (record/result stores) or `RemoteError`
//! (object storage, batch service). Phases wrap them in `PipelineError`,
//! whose `class()` decides retry and exit behavior.

use std::fmt;

use thiserror::Error;

use batchflow_core::{ErrorClass, ModelError};

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors that a retry wrapper can inspect.
pub trait Retryable {
    /// Whether repeating the same call may succeed.
    fn is_transient(&self) -> bool;
}

/// Record/result store operation error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection lost, pool exhausted, timeouts.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the statement.
    #[error("query failed: {0}")]
    Query(String),

    /// A stored row could not be mapped to the model.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<ModelError> for StoreError {
    fn from(value: ModelError) -> Self {
        StoreError::Corrupt(value.to_string())
    }
}

/// Error talking to object storage or the batch inference service.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Connection, TLS or timeout failure before a response arrived.
    #[error("transport error: {0}")]
    Transport(String),

    /// The service answered with a non-success status.
    #[error("http {status}: {message}")]
    Status { status: u16, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// The response did not have the expected shape.
    #[error("unexpected response: {0}")]
    Protocol(String),

    /// Reading the local file being uploaded failed.
    #[error("local i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }
}

impl Retryable for RemoteError {
    fn is_transient(&self) -> bool {
        match self {
            RemoteError::Transport(_) => true,
            RemoteError::Status { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            RemoteError::NotFound(_) | RemoteError::Protocol(_) | RemoteError::Io(_) => false,
        }
    }
}

/// Phase-level error.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("record store: {0}")]
    Store(#[from] StoreError),

    #[error("remote service: {0}")]
    Remote(#[from] RemoteError),

    #[error("manifest i/o: {0}")]
    Io(#[from] std::io::Error),

    /// Nothing usable in the input (e.g. empty manifest).
    #[error("empty input: {0}")]
    EmptyInput(String),

    /// A caller-imposed deadline passed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Data corruption or duplicate jobs. Needs an operator.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    /// The phase stopped partway. `summary` describes the work it finished
    /// first, which stays in place.
    #[error("stopped partway ({summary})")]
    Interrupted {
        summary: String,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Attach the summary of the work done before `source` ended the phase.
    pub fn interrupted(summary: impl fmt::Display, source: PipelineError) -> Self {
        Self::Interrupted {
            summary: summary.to_string(),
            source: Box::new(source),
        }
    }

    /// Summary of the completed work, when the phase got partway.
    pub fn partial_summary(&self) -> Option<&str> {
        match self {
            PipelineError::Interrupted { summary, .. } => Some(summary),
            _ => None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Interrupted { source, .. } => source.class(),
            PipelineError::Store(_)
            | PipelineError::Remote(_)
            | PipelineError::Io(_)
            | PipelineError::Timeout(_) => ErrorClass::Transient,
            PipelineError::EmptyInput(_) => ErrorClass::Structural,
            PipelineError::Invariant(_) => ErrorClass::Invariant,
            PipelineError::Configuration(_) => ErrorClass::Configuration,
        }
    }
}

impl Retryable for PipelineError {
    fn is_transient(&self) -> bool {
        match self {
            PipelineError::Store(e) => e.is_transient(),
            PipelineError::Remote(e) => e.is_transient(),
            PipelineError::Interrupted { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}
