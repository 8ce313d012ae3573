//! Submit phase: at most one active batch job per staged manifest.
//!
//! Jobs are matched by input uri, not by job id, because no job id survives
//! between runs. The list-then-create sequence is not atomic; only one
//! pipeline instance may run against a dataset generation at a time.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use batchflow_core::{BatchJob, JobSpec, JobState, RunId};

use crate::error::{PipelineError, PipelineResult, Retryable};
use crate::retry::{retry, RetryPolicy};
use crate::service::BatchService;

/// Caller-side polling schedule for [`JobSubmitter::wait_for_terminal`].
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Give up after this long. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(30),
            max_interval: Duration::from_secs(300),
            timeout: Some(Duration::from_secs(24 * 60 * 60)),
        }
    }
}

impl PollPolicy {
    fn next_interval(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_interval)
    }
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub job: BatchJob,
    /// `false` when an existing job for the same input was reused.
    pub created: bool,
}

impl fmt::Display for SubmitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = if self.created { "created" } else { "reused" };
        write!(
            f,
            "submit: {action} {} ({}) for {}",
            self.job.job_id, self.job.raw_state, self.job.input_uri
        )
    }
}

pub struct JobSubmitter<B> {
    service: B,
    model: String,
    retry: RetryPolicy,
    /// Proceed when existing jobs cannot be listed.
    allow_unverified: bool,
}

impl<B: BatchService> JobSubmitter<B> {
    pub fn new(service: B, model: impl Into<String>) -> Self {
        Self {
            service,
            model: model.into(),
            retry: RetryPolicy::default(),
            allow_unverified: false,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn allow_unverified(mut self, allow: bool) -> Self {
        self.allow_unverified = allow;
        self
    }

    pub fn service(&self) -> &B {
        &self.service
    }

    /// The job that already covers `input_uri`, if any.
    ///
    /// A pending or running job wins over a succeeded one; among succeeded
    /// jobs the most recent is returned. Two active jobs for one input mean
    /// a duplicate submission already happened and is reported as an
    /// invariant violation.
    pub async fn find_existing(&self, input_uri: &str) -> PipelineResult<Option<BatchJob>> {
        let jobs = match retry(&self.retry, "list_jobs", || {
            self.service.list_jobs(Some(input_uri))
        })
        .await
        {
            Ok(jobs) => jobs,
            Err(err) if self.allow_unverified => {
                warn!(
                    input = input_uri,
                    error = %err,
                    "cannot list existing jobs; proceeding because unverified submission is allowed"
                );
                return Ok(None);
            }
            Err(err) => {
                warn!(
                    input = input_uri,
                    error = %err,
                    "cannot list existing jobs; refusing to submit"
                );
                return Err(err.into());
            }
        };

        let mut covering: Vec<BatchJob> = jobs
            .into_iter()
            .filter(|j| j.consumes(input_uri) && j.state.covers_input())
            .collect();

        let active: Vec<&BatchJob> = covering
            .iter()
            .filter(|j| matches!(j.state, JobState::Pending | JobState::Running))
            .collect();
        if active.len() > 1 {
            let ids: Vec<&str> = active.iter().map(|j| j.job_id.as_str()).collect();
            return Err(PipelineError::invariant(format!(
                "{} active jobs for {input_uri}: {}",
                active.len(),
                ids.join(", ")
            )));
        }
        if let Some(job) = active.first() {
            return Ok(Some((*job).clone()));
        }

        covering.sort_by_key(|j| j.created_at);
        Ok(covering.pop())
    }

    /// Return the job covering `input_uri`, creating one only if none exists.
    pub async fn submit(
        &self,
        input_uri: &str,
        output_prefix: &str,
        run_id: &RunId,
    ) -> PipelineResult<SubmitOutcome> {
        if let Some(job) = self.find_existing(input_uri).await? {
            info!(job = %job.job_id, state = %job.raw_state, "reusing existing job");
            return Ok(SubmitOutcome {
                job,
                created: false,
            });
        }

        let spec = JobSpec {
            display_name: format!("batchflow-{run_id}"),
            model: self.model.clone(),
            input_uri: input_uri.to_string(),
            output_uri_prefix: output_prefix.to_string(),
        };

        // Not retried blindly: a create that timed out may have succeeded.
        let mut attempt = 0;
        loop {
            match self.service.create_job(&spec).await {
                Ok(job) => {
                    info!(job = %job.job_id, input = input_uri, "created batch job");
                    return Ok(SubmitOutcome { job, created: true });
                }
                Err(err) if err.is_transient() && self.retry.allows_retry(attempt) => {
                    attempt += 1;
                    let delay = self.retry.delay_before(attempt);
                    warn!(
                        attempt,
                        error = %err,
                        "create failed; checking for the job before retrying"
                    );
                    tokio::time::sleep(delay).await;
                    if let Some(job) = self.find_existing(input_uri).await? {
                        info!(job = %job.job_id, "earlier create went through");
                        return Ok(SubmitOutcome {
                            job,
                            created: true,
                        });
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Current view of `job`, retrying transient read failures.
    pub async fn refresh(&self, job: &BatchJob) -> PipelineResult<BatchJob> {
        Ok(retry(&self.retry, "get_job", || self.service.get_job(&job.job_id)).await?)
    }

    /// One status read; the caller owns any polling loop.
    pub async fn poll_status(&self, job: &BatchJob) -> PipelineResult<JobState> {
        Ok(self.service.get_job(&job.job_id).await?.state)
    }

    /// Poll until the job is terminal or the policy's timeout passes.
    pub async fn wait_for_terminal(
        &self,
        job: &BatchJob,
        policy: &PollPolicy,
    ) -> PipelineResult<BatchJob> {
        let started = Instant::now();
        let mut interval = policy.initial_interval;
        let mut last_state = job.raw_state.clone();

        loop {
            match self.service.get_job(&job.job_id).await {
                Ok(current) if current.state.is_terminal() => {
                    info!(job = %current.job_id, state = %current.raw_state, "job finished");
                    return Ok(current);
                }
                Ok(current) => {
                    if current.raw_state != last_state {
                        info!(
                            job = %current.job_id,
                            state = %current.raw_state,
                            "job state changed"
                        );
                        last_state = current.raw_state;
                    }
                }
                Err(err) if err.is_transient() => {
                    warn!(job = %job.job_id, error = %err, "status read failed; will poll again");
                }
                Err(err) => return Err(err.into()),
            }

            if let Some(timeout) = policy.timeout {
                if started.elapsed() + interval > timeout {
                    return Err(PipelineError::Timeout(format!(
                        "{} not finished after {:?} (last state {last_state})",
                        job.job_id,
                        started.elapsed()
                    )));
                }
            }
            tokio::time::sleep(interval).await;
            interval = policy.next_interval(interval);
        }
    }
}
