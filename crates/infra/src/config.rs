//! Pipeline settings.
//!
//! Values come from flags or the environment (see the CLI). Each phase needs
//! a different subset; [`PipelineConfig::validate_for`] checks that subset
//! before the phase touches anything.

use std::path::PathBuf;

use reqwest::Url;
use thiserror::Error;

use batchflow_core::ObjectPath;
use batchflow_pipeline::RequestTemplate;

use crate::external::{gcs, vertex};

pub const DEFAULT_LOCATION: &str = "us-central1";
pub const DEFAULT_STAGING_PREFIX: &str = "batchflow/input";
pub const DEFAULT_OUTPUT_PREFIX: &str = "batchflow/output";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-001";
pub const DEFAULT_MANIFEST: &str = "manifest.jsonl";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} is required for {phase}")]
    Missing { name: &'static str, phase: Phase },

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The command being configured.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    Export,
    Upload,
    Submit,
    Wait,
    Import,
    Status,
    Requeue,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Export => "export",
            Phase::Upload => "upload",
            Phase::Submit => "submit",
            Phase::Wait => "wait",
            Phase::Import => "import",
            Phase::Status => "status",
            Phase::Requeue => "requeue",
        }
    }

    fn needs_database(self) -> bool {
        matches!(self, Phase::Export | Phase::Import | Phase::Status | Phase::Requeue)
    }

    /// Phases that read or name objects in the staging bucket.
    fn needs_storage(self) -> bool {
        matches!(
            self,
            Phase::Upload | Phase::Submit | Phase::Wait | Phase::Import | Phase::Status
        )
    }

    fn needs_batch_service(self) -> bool {
        matches!(self, Phase::Submit | Phase::Wait | Phase::Import | Phase::Status)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub project: Option<String>,
    pub location: String,
    pub bucket: Option<String>,
    pub bucket_location: Option<String>,
    pub staging_prefix: String,
    pub output_prefix: String,
    pub model: String,
    pub access_token: Option<String>,
    pub manifest: PathBuf,
    pub prompt_file: Option<PathBuf>,
    pub storage_endpoint: Option<String>,
    pub aiplatform_endpoint: Option<String>,
    pub allow_unverified_submit: bool,
    pub page_size: usize,
    pub write_batch: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            project: None,
            location: DEFAULT_LOCATION.to_string(),
            bucket: None,
            bucket_location: None,
            staging_prefix: DEFAULT_STAGING_PREFIX.to_string(),
            output_prefix: DEFAULT_OUTPUT_PREFIX.to_string(),
            model: DEFAULT_MODEL.to_string(),
            access_token: None,
            manifest: PathBuf::from(DEFAULT_MANIFEST),
            prompt_file: None,
            storage_endpoint: None,
            aiplatform_endpoint: None,
            allow_unverified_submit: false,
            page_size: 500,
            write_batch: 1000,
        }
    }
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

impl PipelineConfig {
    /// Check everything `phase` needs.
    pub fn validate_for(&self, phase: Phase) -> Result<(), ConfigError> {
        if phase.needs_database() && !present(&self.database_url) {
            return Err(ConfigError::Missing {
                name: "DATABASE_URL",
                phase,
            });
        }
        if phase.needs_storage() && !present(&self.bucket) {
            return Err(ConfigError::Missing {
                name: "BATCHFLOW_BUCKET",
                phase,
            });
        }
        if phase.needs_batch_service() && !present(&self.project) {
            return Err(ConfigError::Missing {
                name: "BATCHFLOW_PROJECT",
                phase,
            });
        }
        if phase == Phase::Upload && !present(&self.project) && !present(&self.storage_endpoint) {
            return Err(ConfigError::Missing {
                name: "BATCHFLOW_PROJECT",
                phase,
            });
        }
        let remote = phase.needs_storage() || phase.needs_batch_service();
        let emulated = present(&self.storage_endpoint) || present(&self.aiplatform_endpoint);
        if remote && !emulated && !present(&self.access_token) {
            return Err(ConfigError::Missing {
                name: "GOOGLE_ACCESS_TOKEN",
                phase,
            });
        }

        if self.page_size == 0 {
            return Err(ConfigError::Invalid {
                name: "BATCHFLOW_PAGE_SIZE",
                reason: "must be positive".into(),
            });
        }
        if self.write_batch == 0 {
            return Err(ConfigError::Invalid {
                name: "BATCHFLOW_WRITE_BATCH",
                reason: "must be positive".into(),
            });
        }
        if let Some(bucket) = &self.bucket {
            if bucket.contains('/') || bucket.starts_with("gs:") {
                return Err(ConfigError::Invalid {
                    name: "BATCHFLOW_BUCKET",
                    reason: format!("expected a bare bucket name, got {bucket:?}"),
                });
            }
        }
        self.storage_endpoint()?;
        self.aiplatform_endpoint()?;
        Ok(())
    }

    pub fn storage_endpoint(&self) -> Result<Url, ConfigError> {
        parse_endpoint(
            "BATCHFLOW_STORAGE_ENDPOINT",
            self.storage_endpoint.as_deref().unwrap_or(gcs::DEFAULT_ENDPOINT),
        )
    }

    pub fn aiplatform_endpoint(&self) -> Result<Url, ConfigError> {
        let default = vertex::default_endpoint(&self.location);
        parse_endpoint(
            "BATCHFLOW_AIPLATFORM_ENDPOINT",
            self.aiplatform_endpoint.as_deref().unwrap_or(&default),
        )
    }

    pub fn bucket(&self) -> &str {
        self.bucket.as_deref().unwrap_or_default()
    }

    pub fn project(&self) -> &str {
        self.project.as_deref().unwrap_or_default()
    }

    /// Output prefix for the job reading `input`: one directory per staged
    /// manifest, so outputs of different manifests never mix.
    pub fn output_uri_for(&self, input: &ObjectPath) -> String {
        let file = input.name.rsplit('/').next().unwrap_or(&input.name);
        let stem = file.strip_suffix(".jsonl").unwrap_or(file);
        let prefix = self.output_prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("gs://{}/{stem}", input.bucket)
        } else {
            format!("gs://{}/{prefix}/{stem}", input.bucket)
        }
    }

    /// Request template, with the system instruction read from the prompt
    /// file when one is configured.
    pub fn request_template(&self) -> Result<RequestTemplate, ConfigError> {
        let template = RequestTemplate::default();
        match &self.prompt_file {
            None => Ok(template),
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
                    path: path.clone(),
                    source,
                })?;
                Ok(template.with_system_instruction(text.trim()))
            }
        }
    }
}

fn parse_endpoint(name: &'static str, value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::Invalid {
        name,
        reason: format!("{value:?}: {e}"),
    })?;
    if url.cannot_be_a_base() {
        return Err(ConfigError::Invalid {
            name,
            reason: format!("{value:?} is not a base url"),
        });
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full() -> PipelineConfig {
        PipelineConfig {
            database_url: Some("postgres://localhost/batchflow".into()),
            project: Some("proj".into()),
            bucket: Some("bucket".into()),
            access_token: Some("token".into()),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn export_only_needs_the_database() {
        let config = PipelineConfig {
            database_url: Some("postgres://localhost/batchflow".into()),
            ..PipelineConfig::default()
        };
        assert!(config.validate_for(Phase::Export).is_ok());
        assert!(matches!(
            config.validate_for(Phase::Upload),
            Err(ConfigError::Missing { name: "BATCHFLOW_BUCKET", .. })
        ));
    }

    #[test]
    fn remote_phases_need_a_token_unless_emulated() {
        let mut config = full();
        config.access_token = None;
        assert!(matches!(
            config.validate_for(Phase::Submit),
            Err(ConfigError::Missing { name: "GOOGLE_ACCESS_TOKEN", .. })
        ));

        config.storage_endpoint = Some("http://127.0.0.1:4443".into());
        assert!(config.validate_for(Phase::Submit).is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = full();
        config.bucket = Some("gs://bucket/path".into());
        assert!(matches!(config.validate_for(Phase::Upload), Err(ConfigError::Invalid { .. })));

        let mut config = full();
        config.write_batch = 0;
        assert!(config.validate_for(Phase::Export).is_err());

        let mut config = full();
        config.storage_endpoint = Some("not a url".into());
        assert!(config.validate_for(Phase::Upload).is_err());
    }

    #[test]
    fn output_uri_is_per_manifest() {
        let config = full();
        let input = ObjectPath::new("bucket", "batchflow/input/manifest-0123456789abcdef.jsonl");
        assert_eq!(
            config.output_uri_for(&input),
            "gs://bucket/batchflow/output/manifest-0123456789abcdef"
        );
    }

    #[test]
    fn prompt_file_becomes_system_instruction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.txt");
        std::fs::write(&path, "Classify the conversation.\n").unwrap();
        let config = PipelineConfig {
            prompt_file: Some(path),
            ..full()
        };
        assert_eq!(
            config.request_template().unwrap().system_instruction.as_deref(),
            Some("Classify the conversation.")
        );
    }
}
