//! Batch inference service port.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use batchflow_core::{BatchJob, JobSpec, JobState};

use crate::error::RemoteError;

/// External asynchronous batch job service.
///
/// The pipeline only creates jobs and reads them; state transitions belong
/// to the service.
#[async_trait]
pub trait BatchService: Send + Sync {
    /// Jobs known to the service. When `input_uri` is given, implementations
    /// may filter server-side but callers re-check `BatchJob::consumes`.
    async fn list_jobs(&self, input_uri: Option<&str>) -> Result<Vec<BatchJob>, RemoteError>;

    async fn create_job(&self, spec: &JobSpec) -> Result<BatchJob, RemoteError>;

    /// Single non-blocking status read.
    async fn get_job(&self, job_id: &str) -> Result<BatchJob, RemoteError>;
}

#[async_trait]
impl<S> BatchService for Arc<S>
where
    S: BatchService + ?Sized,
{
    async fn list_jobs(&self, input_uri: Option<&str>) -> Result<Vec<BatchJob>, RemoteError> {
        (**self).list_jobs(input_uri).await
    }

    async fn create_job(&self, spec: &JobSpec) -> Result<BatchJob, RemoteError> {
        (**self).create_job(spec).await
    }

    async fn get_job(&self, job_id: &str) -> Result<BatchJob, RemoteError> {
        (**self).get_job(job_id).await
    }
}

/// In-memory batch service for tests/dev. Job ids are `jobs/<n>`.
#[derive(Debug, Default)]
pub struct InMemoryBatchService {
    jobs: RwLock<Vec<BatchJob>>,
    created: AtomicUsize,
    listing_fails: AtomicBool,
}

impl InMemoryBatchService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of `create_job` calls that succeeded.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Drive a job's state as the service would.
    pub fn set_state(&self, job_id: &str, state: JobState) {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(job) = jobs.iter_mut().find(|j| j.job_id == job_id) {
            job.state = state;
            job.raw_state = format!("JOB_STATE_{}", state.as_str().to_uppercase());
            if state == JobState::Succeeded && job.output_directory.is_none() {
                job.output_directory = Some(job.output_uri_prefix.clone());
            }
        }
    }

    /// Seed a job created outside this process.
    pub fn insert(&self, job: BatchJob) {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner).push(job);
    }

    pub fn fail_listing(&self, fail: bool) {
        self.listing_fails.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BatchService for InMemoryBatchService {
    async fn list_jobs(&self, input_uri: Option<&str>) -> Result<Vec<BatchJob>, RemoteError> {
        if self.listing_fails.load(Ordering::SeqCst) {
            return Err(RemoteError::status(403, "listing not permitted"));
        }
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(jobs
            .iter()
            .filter(|j| input_uri.is_none_or(|uri| j.consumes(uri)))
            .cloned()
            .collect())
    }

    async fn create_job(&self, spec: &JobSpec) -> Result<BatchJob, RemoteError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let job = BatchJob {
            job_id: format!("jobs/{}", jobs.len() + 1),
            display_name: spec.display_name.clone(),
            input_uri: spec.input_uri.clone(),
            output_uri_prefix: spec.output_uri_prefix.clone(),
            output_directory: None,
            state: JobState::Pending,
            raw_state: "JOB_STATE_PENDING".to_string(),
            created_at: Some(Utc::now()),
            error: None,
        };
        jobs.push(job.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(job)
    }

    async fn get_job(&self, job_id: &str) -> Result<BatchJob, RemoteError> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|j| j.job_id == job_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(job_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(input: &str) -> JobSpec {
        JobSpec {
            display_name: "batchflow-test".into(),
            model: "m".into(),
            input_uri: input.into(),
            output_uri_prefix: "gs://b/out".into(),
        }
    }

    #[tokio::test]
    async fn list_filters_by_input() {
        let service = InMemoryBatchService::new();
        service.create_job(&spec("gs://b/one.jsonl")).await.unwrap();
        service.create_job(&spec("gs://b/two.jsonl")).await.unwrap();

        let jobs = service.list_jobs(Some("gs://b/two.jsonl")).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, "jobs/2");
        assert_eq!(service.list_jobs(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn state_changes_are_observed_by_get() {
        let service = InMemoryBatchService::new();
        let job = service.create_job(&spec("gs://b/one.jsonl")).await.unwrap();
        service.set_state(&job.job_id, JobState::Succeeded);

        let seen = service.get_job(&job.job_id).await.unwrap();
        assert_eq!(seen.state, JobState::Succeeded);
        assert_eq!(seen.output_location(), "gs://b/out");
    }
}
