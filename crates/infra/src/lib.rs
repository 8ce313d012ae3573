//! `batchflow-infra`
//!
//! Production adapters for the pipeline ports:
//!
//! - `db`: Postgres record and result stores (sqlx)
//! - `external`: Google Cloud Storage and Vertex AI batch prediction (reqwest)
//! - `config`: settings shared by every phase, validated before any mutation

pub mod config;
pub mod db;
pub mod external;

pub use config::{ConfigError, Phase, PipelineConfig};
pub use db::{PostgresRecordStore, PostgresResultStore};
pub use external::{ApiClient, GcsObjectStore, VertexBatchService};
