//! `batchflow-core`: data model shared by every pipeline phase.
//!
//! This crate contains **pure model** types (no I/O). Each entity here is
//! written by exactly one phase:
//! - `SourceRecord.export_state`: the exporter
//! - `StagingObject`: the staging uploader
//! - `BatchJob`: the external service (observed by the submitter)
//! - `AnalysisResult`: the result importer

pub mod analysis;
pub mod error;
pub mod id;
pub mod job;
pub mod record;
pub mod staging;

pub use analysis::{AnalysisResult, UpsertOutcome};
pub use error::{ErrorClass, ModelError, ModelResult};
pub use id::{RecordId, RunId};
pub use job::{BatchJob, JobSpec, JobState};
pub use record::{ExportState, SourceRecord};
pub use staging::{Fingerprint, FingerprintMatch, ObjectPath, StagingObject};
