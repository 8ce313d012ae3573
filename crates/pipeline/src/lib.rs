//! `batchflow-pipeline`
//!
//! **Responsibility:** the four resumable phases of a batch analysis run and
//! the ports they talk to.
//!
//! - `export`: pending records → line-delimited manifest → mark exported
//! - `upload`: manifest → remote staging object (skipped when already present)
//! - `submit`: staging object → external batch job (deduplicated by input)
//! - `import`: job output → idempotent result upserts
//!
//! Storage and remote services are reached only through the traits in
//! `records`, `results`, `storage` and `service`; in-memory implementations
//! live next to each trait for tests and dry runs.

pub mod decode;
pub mod error;
pub mod export;
pub mod import;
pub mod records;
pub mod request;
pub mod results;
pub mod retry;
pub mod service;
pub mod storage;
pub mod submit;
pub mod upload;

pub use decode::{Answer, DecodedLine, LineError};
pub use error::{PipelineError, PipelineResult, RemoteError, Retryable, StoreError};
pub use export::{ExportConfig, ExportOutcome, ExportSummary, Exporter};
pub use import::{ImportConfig, ImportSummary, ResultImporter};
pub use records::{InMemoryRecordStore, MarkReport, RecordStore, RecordStoreAdapter, StateCounts};
pub use request::{ManifestEntry, RequestTemplate};
pub use results::{InMemoryResultStore, ResultStore};
pub use retry::{Backoff, RetryPolicy};
pub use service::{BatchService, InMemoryBatchService};
pub use storage::{trim_line_end, InMemoryObjectStore, LineStream, ObjectMeta, ObjectStore};
pub use submit::{JobSubmitter, PollPolicy, SubmitOutcome};
pub use upload::{StagingUploader, UploadOutcome, UploadPlan};
