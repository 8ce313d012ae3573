//! Vertex AI `batchPredictionJobs` adapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use batchflow_core::{BatchJob, JobSpec, JobState};
use batchflow_pipeline::{BatchService, RemoteError};

use super::{check, json, ApiClient};

const PAGE_SIZE: &str = "100";

/// Default regional endpoint for `location`.
pub fn default_endpoint(location: &str) -> String {
    format!("https://{location}-aiplatform.googleapis.com")
}

/// Collapse a service state into the coarse pipeline state.
///
/// Unknown states count as pending so a job is never re-submitted because
/// the service added a state name.
pub fn map_state(raw: &str) -> JobState {
    match raw.strip_prefix("JOB_STATE_").unwrap_or(raw) {
        "RUNNING" | "CANCELLING" => JobState::Running,
        "SUCCEEDED" | "PARTIALLY_SUCCEEDED" => JobState::Succeeded,
        "FAILED" | "CANCELLED" | "EXPIRED" => JobState::Failed,
        _ => JobState::Pending,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResource {
    name: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    input_config: Option<InputConfig>,
    #[serde(default)]
    output_config: Option<OutputConfig>,
    #[serde(default)]
    output_info: Option<OutputInfo>,
    #[serde(default)]
    state: String,
    #[serde(default)]
    create_time: Option<DateTime<Utc>>,
    #[serde(default)]
    error: Option<JobError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InputConfig {
    #[serde(default)]
    gcs_source: Option<GcsSource>,
}

#[derive(Debug, Deserialize)]
struct GcsSource {
    #[serde(default)]
    uris: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutputConfig {
    #[serde(default)]
    gcs_destination: Option<GcsDestination>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcsDestination {
    #[serde(default)]
    output_uri_prefix: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutputInfo {
    #[serde(default)]
    gcs_output_directory: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobList {
    #[serde(default)]
    batch_prediction_jobs: Vec<JobResource>,
    #[serde(default)]
    next_page_token: Option<String>,
}

impl From<JobResource> for BatchJob {
    fn from(resource: JobResource) -> Self {
        let input_uri = resource
            .input_config
            .and_then(|c| c.gcs_source)
            .and_then(|s| s.uris.into_iter().next())
            .unwrap_or_default();
        let output_uri_prefix = resource
            .output_config
            .and_then(|c| c.gcs_destination)
            .map(|d| d.output_uri_prefix)
            .unwrap_or_default();
        BatchJob {
            job_id: resource.name,
            display_name: resource.display_name,
            input_uri,
            output_uri_prefix,
            output_directory: resource
                .output_info
                .and_then(|o| o.gcs_output_directory)
                .filter(|d| !d.is_empty()),
            state: map_state(&resource.state),
            raw_state: resource.state,
            created_at: resource.create_time,
            error: resource.error.map(|e| e.message).filter(|m| !m.is_empty()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VertexBatchService {
    client: ApiClient,
    endpoint: Url,
    project: String,
    location: String,
}

impl VertexBatchService {
    pub fn new(
        client: ApiClient,
        endpoint: Url,
        project: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint,
            project: project.into(),
            location: location.into(),
        }
    }

    fn url(&self, resource: &str) -> Result<Url, RemoteError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::protocol(format!("{} cannot be a base url", self.endpoint)))?
            .pop_if_empty()
            .push("v1")
            .extend(resource.split('/'));
        Ok(url)
    }

    fn jobs_url(&self) -> Result<Url, RemoteError> {
        self.url(&format!(
            "projects/{}/locations/{}/batchPredictionJobs",
            self.project, self.location
        ))
    }

    /// Bare model ids are publisher models; anything with a `/` is used as is.
    fn model_resource(model: &str) -> String {
        if model.contains('/') {
            model.to_string()
        } else {
            format!("publishers/google/models/{model}")
        }
    }
}

#[async_trait]
impl BatchService for VertexBatchService {
    #[instrument(skip(self), err)]
    async fn list_jobs(&self, input_uri: Option<&str>) -> Result<Vec<BatchJob>, RemoteError> {
        let mut jobs = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = self.jobs_url()?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("pageSize", PAGE_SIZE);
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }
            let resp = self.client.send(self.client.http().get(url)).await?;
            let resp = check(resp, "list jobs").await?;
            let page: JobList = json(resp, "list jobs").await?;
            jobs.extend(page.batch_prediction_jobs.into_iter().map(BatchJob::from));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        if let Some(uri) = input_uri {
            jobs.retain(|j| j.consumes(uri));
        }
        debug!(jobs = jobs.len(), "listed batch jobs");
        Ok(jobs)
    }

    #[instrument(skip(self, spec), fields(input = %spec.input_uri), err)]
    async fn create_job(&self, spec: &JobSpec) -> Result<BatchJob, RemoteError> {
        let body = json!({
            "displayName": spec.display_name,
            "model": Self::model_resource(&spec.model),
            "inputConfig": {
                "instancesFormat": "jsonl",
                "gcsSource": { "uris": [spec.input_uri] },
            },
            "outputConfig": {
                "predictionsFormat": "jsonl",
                "gcsDestination": { "outputUriPrefix": spec.output_uri_prefix },
            },
        });
        let req = self.client.http().post(self.jobs_url()?).json(&body);
        let resp = check(self.client.send(req).await?, "create job").await?;
        let resource: JobResource = json(resp, "create job").await?;
        Ok(resource.into())
    }

    async fn get_job(&self, job_id: &str) -> Result<BatchJob, RemoteError> {
        let resp = check(
            self.client.send(self.client.http().get(self.url(job_id)?)).await?,
            job_id,
        )
        .await?;
        let resource: JobResource = json(resp, job_id).await?;
        Ok(resource.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_collapse_to_four() {
        assert_eq!(map_state("JOB_STATE_QUEUED"), JobState::Pending);
        assert_eq!(map_state("JOB_STATE_PAUSED"), JobState::Pending);
        assert_eq!(map_state("JOB_STATE_RUNNING"), JobState::Running);
        assert_eq!(map_state("JOB_STATE_CANCELLING"), JobState::Running);
        assert_eq!(map_state("JOB_STATE_PARTIALLY_SUCCEEDED"), JobState::Succeeded);
        assert_eq!(map_state("JOB_STATE_EXPIRED"), JobState::Failed);
        assert_eq!(map_state("JOB_STATE_SOMETHING_NEW"), JobState::Pending);
    }

    #[test]
    fn resources_convert_to_jobs() {
        let resource: JobResource = serde_json::from_value(json!({
            "name": "projects/p/locations/l/batchPredictionJobs/7",
            "displayName": "batchflow-x",
            "inputConfig": {"instancesFormat": "jsonl", "gcsSource": {"uris": ["gs://b/in.jsonl"]}},
            "outputConfig": {"gcsDestination": {"outputUriPrefix": "gs://b/out"}},
            "outputInfo": {"gcsOutputDirectory": "gs://b/out/prediction-model-123"},
            "state": "JOB_STATE_SUCCEEDED",
            "createTime": "2026-01-02T03:04:05.123456Z"
        }))
        .unwrap();
        let job = BatchJob::from(resource);

        assert_eq!(job.input_uri, "gs://b/in.jsonl");
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.output_location(), "gs://b/out/prediction-model-123");
        assert!(job.created_at.is_some());
    }

    #[test]
    fn model_ids_expand_to_publisher_models() {
        assert_eq!(
            VertexBatchService::model_resource("gemini-2.0-flash-001"),
            "publishers/google/models/gemini-2.0-flash-001"
        );
        assert_eq!(
            VertexBatchService::model_resource("projects/p/models/m"),
            "projects/p/models/m"
        );
    }
}
