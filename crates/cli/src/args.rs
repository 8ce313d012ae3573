//! Command-line surface. Every setting can also come from the environment.

use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand};

use batchflow_infra::config::{
    DEFAULT_LOCATION, DEFAULT_MANIFEST, DEFAULT_MODEL, DEFAULT_OUTPUT_PREFIX,
    DEFAULT_STAGING_PREFIX,
};
use batchflow_infra::{Phase, PipelineConfig};
use batchflow_observability::LogFormat;

#[derive(Parser, Debug)]
#[command(name = "batchflow")]
#[command(about = "Export records, run them through batch inference, import the answers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Report what the phase would do without changing anything.
    #[arg(long, global = true, env = "BATCHFLOW_DRY_RUN")]
    pub dry_run: bool,

    /// `json` or `pretty`.
    #[arg(long, global = true, default_value = "json", env = "BATCHFLOW_LOG_FORMAT")]
    pub log_format: LogFormat,

    #[command(flatten)]
    pub settings: Settings,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Write pending records to the manifest and mark them exported.
    Export,
    /// Stage the manifest in the bucket unless an identical copy is there.
    Upload,
    /// Create the batch job for the staged manifest, or reuse the existing one.
    Submit,
    /// Poll the manifest's job until it finishes.
    Wait {
        /// Seconds between the first polls; doubles up to five minutes.
        #[arg(long, default_value_t = 30)]
        poll_secs: u64,

        /// Give up after this many seconds.
        #[arg(long, default_value_t = 86_400)]
        timeout_secs: u64,
    },
    /// Upsert the answers of the manifest's finished job.
    Import {
        /// Read output objects from this `gs://` location instead of the job's.
        #[arg(long)]
        from: Option<String>,
    },
    /// Show record counts, staging state and job state.
    Status,
    /// Return exported records to pending so the next export picks them up.
    #[command(group(ArgGroup::new("target").required(true).args(["ids", "all"])))]
    Requeue {
        ids: Vec<String>,

        /// Requeue every exported record.
        #[arg(long)]
        all: bool,
    },
}

impl Command {
    pub fn phase(&self) -> Phase {
        match self {
            Command::Export => Phase::Export,
            Command::Upload => Phase::Upload,
            Command::Submit => Phase::Submit,
            Command::Wait { .. } => Phase::Wait,
            Command::Import { .. } => Phase::Import,
            Command::Status => Phase::Status,
            Command::Requeue { .. } => Phase::Requeue,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct Settings {
    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    /// Cloud project that owns the bucket and the batch jobs.
    #[arg(long, global = true, env = "BATCHFLOW_PROJECT")]
    pub project: Option<String>,

    /// Region of the batch prediction service.
    #[arg(long, global = true, default_value = DEFAULT_LOCATION, env = "BATCHFLOW_LOCATION")]
    pub location: String,

    /// Staging bucket (bare name, no `gs://`).
    #[arg(long, global = true, env = "BATCHFLOW_BUCKET")]
    pub bucket: Option<String>,

    /// Location used if the bucket has to be created.
    #[arg(long, global = true, env = "BATCHFLOW_BUCKET_LOCATION")]
    pub bucket_location: Option<String>,

    #[arg(
        long,
        global = true,
        default_value = DEFAULT_STAGING_PREFIX,
        env = "BATCHFLOW_STAGING_PREFIX"
    )]
    pub staging_prefix: String,

    #[arg(
        long,
        global = true,
        default_value = DEFAULT_OUTPUT_PREFIX,
        env = "BATCHFLOW_OUTPUT_PREFIX"
    )]
    pub output_prefix: String,

    #[arg(long, global = true, default_value = DEFAULT_MODEL, env = "BATCHFLOW_MODEL")]
    pub model: String,

    /// OAuth bearer token for Cloud Storage and Vertex AI.
    #[arg(long, global = true, env = "GOOGLE_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Local manifest file.
    #[arg(long, global = true, default_value = DEFAULT_MANIFEST, env = "BATCHFLOW_MANIFEST")]
    pub manifest: PathBuf,

    /// File holding the system instruction sent with every request.
    #[arg(long, global = true, env = "BATCHFLOW_PROMPT_FILE")]
    pub prompt_file: Option<PathBuf>,

    #[arg(long, global = true, env = "BATCHFLOW_STORAGE_ENDPOINT")]
    pub storage_endpoint: Option<String>,

    #[arg(long, global = true, env = "BATCHFLOW_AIPLATFORM_ENDPOINT")]
    pub aiplatform_endpoint: Option<String>,

    /// Submit even when existing jobs cannot be listed. May create a duplicate job.
    #[arg(long, global = true, env = "BATCHFLOW_ALLOW_UNVERIFIED_SUBMIT")]
    pub allow_unverified_submit: bool,

    /// Records read per page during export.
    #[arg(long, global = true, default_value_t = 500, env = "BATCHFLOW_PAGE_SIZE")]
    pub page_size: usize,

    /// Rows per batch write (export marking and result upserts).
    #[arg(long, global = true, default_value_t = 1000, env = "BATCHFLOW_WRITE_BATCH")]
    pub write_batch: usize,
}

impl From<Settings> for PipelineConfig {
    fn from(s: Settings) -> Self {
        PipelineConfig {
            database_url: s.database_url,
            project: s.project,
            location: s.location,
            bucket: s.bucket,
            bucket_location: s.bucket_location,
            staging_prefix: s.staging_prefix,
            output_prefix: s.output_prefix,
            model: s.model,
            access_token: s.access_token,
            manifest: s.manifest,
            prompt_file: s.prompt_file,
            storage_endpoint: s.storage_endpoint,
            aiplatform_endpoint: s.aiplatform_endpoint,
            allow_unverified_submit: s.allow_unverified_submit,
            page_size: s.page_size,
            write_batch: s.write_batch,
        }
    }
}
