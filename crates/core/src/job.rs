//! External batch jobs as observed by the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse job state.
///
/// The service reports finer-grained states; adapters collapse them into
/// these four and keep the raw value in `BatchJob::raw_state` for display.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    /// A job in this state already covers its input; submitting again would
    /// duplicate paid work.
    pub fn covers_input(self) -> bool {
        matches!(self, JobState::Pending | JobState::Running | JobState::Succeeded)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An externally managed asynchronous batch job.
///
/// The pipeline never writes to a job after creating it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchJob {
    /// Service-assigned identifier (full resource name).
    pub job_id: String,
    pub display_name: String,
    pub input_uri: String,
    pub output_uri_prefix: String,
    /// Concrete directory the service wrote results to, once known.
    pub output_directory: Option<String>,
    pub state: JobState,
    pub raw_state: String,
    pub created_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl BatchJob {
    pub fn consumes(&self, input_uri: &str) -> bool {
        self.input_uri == input_uri
    }

    /// Where to look for output objects: the concrete directory if the
    /// service reported one, otherwise the requested prefix.
    pub fn output_location(&self) -> &str {
        self.output_directory
            .as_deref()
            .unwrap_or(&self.output_uri_prefix)
    }
}

/// Parameters for creating a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub display_name: String,
    pub model: String,
    pub input_uri: String,
    pub output_uri_prefix: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_failed_jobs_leave_input_uncovered() {
        assert!(JobState::Pending.covers_input());
        assert!(JobState::Running.covers_input());
        assert!(JobState::Succeeded.covers_input());
        assert!(!JobState::Failed.covers_input());
    }

    #[test]
    fn output_location_prefers_reported_directory() {
        let mut job = BatchJob {
            job_id: "jobs/1".into(),
            display_name: "j".into(),
            input_uri: "gs://b/in.jsonl".into(),
            output_uri_prefix: "gs://b/out".into(),
            output_directory: None,
            state: JobState::Running,
            raw_state: "JOB_STATE_RUNNING".into(),
            created_at: None,
            error: None,
        };
        assert_eq!(job.output_location(), "gs://b/out");
        job.output_directory = Some("gs://b/out/prediction-1".into());
        assert_eq!(job.output_location(), "gs://b/out/prediction-1");
        assert!(job.consumes("gs://b/in.jsonl"));
    }
}
