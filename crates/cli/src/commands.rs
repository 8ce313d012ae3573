//! One function per subcommand. Each wires the production adapters into the
//! matching pipeline phase and prints a one-line summary to stdout.

use std::time::Duration;

use anyhow::{anyhow, bail, Context as _, Result};
use sqlx::PgPool;
use tracing::{debug, info, warn};

use batchflow_core::{BatchJob, JobState, ObjectPath, RecordId, RunId};
use batchflow_infra::db::{self, PostgresRecordStore, PostgresResultStore};
use batchflow_infra::{ApiClient, GcsObjectStore, PipelineConfig, VertexBatchService};
use batchflow_pipeline::upload::fingerprint;
use batchflow_pipeline::{
    ExportConfig, ExportOutcome, Exporter, ImportConfig, JobSubmitter, PollPolicy,
    RecordStoreAdapter, ResultImporter, ResultStore, StagingUploader,
};

use crate::args::Command;

const MAX_DB_CONNECTIONS: u32 = 5;

/// How a phase that did not error ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Finished {
    Complete,
    /// Ran to the end but left work behind (failed batches, unreadable
    /// objects, a failed job). Re-running is safe.
    Incomplete,
}

pub struct Context {
    config: PipelineConfig,
    run_id: RunId,
    dry_run: bool,
}

impl Context {
    pub fn new(config: PipelineConfig, run_id: RunId, dry_run: bool) -> Self {
        Self {
            config,
            run_id,
            dry_run,
        }
    }

    /// Dry runs read the schema as they find it.
    fn creates_schema(&self) -> bool {
        !self.dry_run
    }

    async fn pool(&self) -> Result<PgPool> {
        let url = self.config.database_url.as_deref().unwrap_or_default();
        let pool = db::connect(url, MAX_DB_CONNECTIONS).await?;
        if self.creates_schema() {
            db::ensure_schema(&pool).await?;
        } else {
            debug!("dry run: leaving the database schema untouched");
        }
        Ok(pool)
    }

    fn records(&self, pool: &PgPool) -> RecordStoreAdapter<PostgresRecordStore> {
        RecordStoreAdapter::new(PostgresRecordStore::new(pool.clone()))
            .with_page_size(self.config.page_size)
            .with_write_batch(self.config.write_batch)
    }

    fn client(&self) -> Result<ApiClient> {
        Ok(ApiClient::new(self.config.access_token.clone())?)
    }

    fn objects(&self) -> Result<GcsObjectStore> {
        Ok(GcsObjectStore::new(
            self.client()?,
            self.config.storage_endpoint()?,
            self.config.project(),
        )
        .with_bucket_location(self.config.bucket_location.clone()))
    }

    fn uploader(&self) -> Result<StagingUploader<GcsObjectStore>> {
        Ok(StagingUploader::new(
            self.objects()?,
            self.config.bucket(),
            self.config.staging_prefix.trim_matches('/'),
        ))
    }

    fn submitter(&self) -> Result<JobSubmitter<VertexBatchService>> {
        let service = VertexBatchService::new(
            self.client()?,
            self.config.aiplatform_endpoint()?,
            self.config.project(),
            &self.config.location,
        );
        Ok(JobSubmitter::new(service, &self.config.model)
            .allow_unverified(self.config.allow_unverified_submit))
    }

    /// Where the current manifest is (or would be) staged. Content addressed,
    /// so it is derived from the local file alone.
    async fn staged_path(&self) -> Result<ObjectPath> {
        let manifest = &self.config.manifest;
        let fp = fingerprint(manifest)
            .await
            .with_context(|| format!("reading manifest {}", manifest.display()))?;
        if fp.size_bytes == 0 {
            bail!("{} is empty; export found nothing to process", manifest.display());
        }
        Ok(self.uploader()?.target_path(&fp))
    }

    async fn existing_job(&self, input: &ObjectPath) -> Result<BatchJob> {
        self.submitter()?
            .find_existing(&input.uri())
            .await?
            .ok_or_else(|| anyhow!("no batch job reads {input}; run `batchflow submit` first"))
    }
}

pub async fn run(ctx: &Context, command: Command) -> Result<Finished> {
    match command {
        Command::Export => export(ctx).await,
        Command::Upload => upload(ctx).await,
        Command::Submit => submit(ctx).await,
        Command::Wait {
            poll_secs,
            timeout_secs,
        } => wait(ctx, poll_secs, timeout_secs).await,
        Command::Import { from } => import(ctx, from).await,
        Command::Status => status(ctx).await,
        Command::Requeue { ids, all } => requeue(ctx, ids, all).await,
    }
}

async fn export(ctx: &Context) -> Result<Finished> {
    let pool = ctx.pool().await?;
    let config = ExportConfig::new(&ctx.config.manifest)
        .with_template(ctx.config.request_template()?)
        .dry_run(ctx.dry_run);
    let outcome = Exporter::new(ctx.records(&pool), config).run().await?;
    println!("{outcome}");

    match outcome {
        ExportOutcome::Exported(summary) if !summary.is_complete() => Ok(Finished::Incomplete),
        _ => Ok(Finished::Complete),
    }
}

async fn upload(ctx: &Context) -> Result<Finished> {
    let uploader = ctx.uploader()?;
    if ctx.dry_run {
        println!("{}", uploader.plan(&ctx.config.manifest).await?);
    } else {
        println!("{}", uploader.upload(&ctx.config.manifest).await?);
    }
    Ok(Finished::Complete)
}

async fn submit(ctx: &Context) -> Result<Finished> {
    let plan = ctx.uploader()?.plan(&ctx.config.manifest).await?;
    if plan.transfer_needed {
        bail!(
            "{} is not staged as {}; run `batchflow upload` first",
            ctx.config.manifest.display(),
            plan.target
        );
    }
    let input = plan.target.uri();
    let submitter = ctx.submitter()?;

    if ctx.dry_run {
        match submitter.find_existing(&input).await? {
            Some(job) => println!("submit: would reuse {} ({})", job.job_id, job.raw_state),
            None => println!(
                "submit: would create a {} job for {input} writing to {}",
                ctx.config.model,
                ctx.config.output_uri_for(&plan.target)
            ),
        }
        return Ok(Finished::Complete);
    }

    let outcome = submitter
        .submit(&input, &ctx.config.output_uri_for(&plan.target), &ctx.run_id)
        .await?;
    println!("{outcome}");
    Ok(Finished::Complete)
}

async fn wait(ctx: &Context, poll_secs: u64, timeout_secs: u64) -> Result<Finished> {
    let input = ctx.staged_path().await?;
    let job = ctx.existing_job(&input).await?;
    let policy = PollPolicy {
        initial_interval: Duration::from_secs(poll_secs.max(1)),
        timeout: Some(Duration::from_secs(timeout_secs)),
        ..PollPolicy::default()
    };

    let job = ctx.submitter()?.wait_for_terminal(&job, &policy).await?;
    println!("wait: {} finished as {}", job.job_id, job.raw_state);
    if job.state == JobState::Failed {
        warn!(job = %job.job_id, error = job.error.as_deref().unwrap_or(""), "batch job failed");
        return Ok(Finished::Incomplete);
    }
    Ok(Finished::Complete)
}

async fn import(ctx: &Context, from: Option<String>) -> Result<Finished> {
    let location = match from {
        Some(location) => location,
        None => {
            let input = ctx.staged_path().await?;
            let job = ctx.existing_job(&input).await?;
            if job.state != JobState::Succeeded {
                bail!("{} is {}; import needs a succeeded job", job.job_id, job.raw_state);
            }
            job.output_location().to_string()
        }
    };
    info!(location = %location, "importing batch output");

    let pool = ctx.pool().await?;
    let config = ImportConfig {
        batch_size: ctx.config.write_batch,
        dry_run: ctx.dry_run,
        ..ImportConfig::default()
    };
    let importer = ResultImporter::new(
        ctx.objects()?,
        PostgresResultStore::new(pool.clone()),
        ctx.records(&pool),
        config,
    );
    let summary = importer.import(&location).await?;
    println!("{summary}");

    if summary.is_complete() {
        Ok(Finished::Complete)
    } else {
        Ok(Finished::Incomplete)
    }
}

async fn status(ctx: &Context) -> Result<Finished> {
    let pool = ctx.pool().await?;
    let counts = ctx.records(&pool).counts().await?;
    let results = PostgresResultStore::new(pool.clone()).count().await?;
    println!(
        "records: {} pending, {} exported; results: {results}",
        counts.pending, counts.exported
    );

    if !tokio::fs::try_exists(&ctx.config.manifest).await.unwrap_or(false) {
        println!("manifest: {} not found", ctx.config.manifest.display());
        return Ok(Finished::Complete);
    }
    let plan = match ctx.uploader()?.plan(&ctx.config.manifest).await {
        Ok(plan) => plan,
        Err(err) => {
            println!("manifest: {err}");
            return Ok(Finished::Complete);
        }
    };
    println!("{plan}");
    if plan.transfer_needed {
        return Ok(Finished::Complete);
    }

    match ctx.submitter()?.find_existing(&plan.target.uri()).await? {
        Some(job) => println!("job: {} {}", job.job_id, job.raw_state),
        None => println!("job: none"),
    }
    Ok(Finished::Complete)
}

async fn requeue(ctx: &Context, ids: Vec<String>, all: bool) -> Result<Finished> {
    let ids = ids
        .into_iter()
        .map(RecordId::new)
        .collect::<Result<Vec<_>, _>>()?;
    if ctx.dry_run {
        let target = if all {
            "every exported record".to_string()
        } else {
            format!("{} records", ids.len())
        };
        println!("requeue: would return {target} to pending");
        return Ok(Finished::Complete);
    }

    let pool = ctx.pool().await?;
    let exporter = Exporter::new(ctx.records(&pool), ExportConfig::new(&ctx.config.manifest));
    if all {
        let changed = exporter.requeue_all().await?;
        println!("requeue: {changed} records back to pending");
        return Ok(Finished::Complete);
    }

    let report = exporter.requeue(&ids).await;
    println!(
        "requeue: {} of {} records back to pending, {} failed",
        report.changed,
        report.requested,
        report.failed.len()
    );
    if report.is_complete() {
        Ok(Finished::Complete)
    } else {
        Ok(Finished::Incomplete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_real_runs_create_the_schema() {
        let real = Context::new(PipelineConfig::default(), RunId::new(), false);
        let dry = Context::new(PipelineConfig::default(), RunId::new(), true);
        assert!(real.creates_schema());
        assert!(!dry.creates_schema());
    }
}
