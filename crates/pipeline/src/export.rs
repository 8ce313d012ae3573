//! Export phase: pending records → manifest file → mark exported.
//!
//! The manifest is written to `<manifest>.partial`, flushed, synced and
//! renamed into place. Records are marked only after that rename, so a crash
//! anywhere before it leaves every record `pending` and the next run simply
//! writes the manifest again.

use std::fmt;
use std::path::{Path, PathBuf};

use futures_util::TryStreamExt;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{info, warn};

use batchflow_core::RecordId;

use crate::error::{PipelineError, PipelineResult};
use crate::records::{MarkReport, RecordStore, RecordStoreAdapter};
use crate::request::{ManifestEntry, RequestTemplate};

#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub manifest_path: PathBuf,
    pub template: RequestTemplate,
    /// Write the manifest but leave record state untouched.
    pub dry_run: bool,
    pub progress_every: u64,
}

impl ExportConfig {
    pub fn new(manifest_path: impl Into<PathBuf>) -> Self {
        Self {
            manifest_path: manifest_path.into(),
            template: RequestTemplate::default(),
            dry_run: false,
            progress_every: 10_000,
        }
    }

    pub fn with_template(mut self, template: RequestTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub manifest_path: PathBuf,
    pub lines: u64,
    pub bytes: u64,
    /// `None` in dry-run mode.
    pub marked: Option<MarkReport>,
}

impl ExportSummary {
    /// Every exported record was marked (vacuously true in dry-run).
    pub fn is_complete(&self) -> bool {
        self.marked.as_ref().is_none_or(MarkReport::is_complete)
    }
}

impl fmt::Display for ExportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "export: {} lines ({} bytes) -> {}",
            self.lines,
            self.bytes,
            self.manifest_path.display()
        )?;
        match &self.marked {
            Some(report) => write!(
                f,
                "; marked {} of {} ({} failed batches)",
                report.changed, report.requested, report.failed_batches
            ),
            None => f.write_str("; dry run, nothing marked"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExportOutcome {
    /// No pending records. An empty manifest was written; nothing was marked.
    NothingToDo { manifest_path: PathBuf },
    Exported(ExportSummary),
}

impl fmt::Display for ExportOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportOutcome::NothingToDo { manifest_path } => write!(
                f,
                "export: nothing to do (no pending records, {} is empty)",
                manifest_path.display()
            ),
            ExportOutcome::Exported(summary) => summary.fmt(f),
        }
    }
}

#[derive(Default)]
struct Written {
    ids: Vec<RecordId>,
    bytes: u64,
}

impl Written {
    /// `err` stopped the export before any record was marked.
    fn interrupted(&self, manifest: &Path, err: PipelineError) -> PipelineError {
        PipelineError::interrupted(
            format_args!(
                "export: {} lines ({} bytes) written for {} before the failure; nothing marked",
                self.ids.len(),
                self.bytes,
                manifest.display()
            ),
            err,
        )
    }
}

/// Owns the `pending → exported` transition (and its operator-driven reverse).
pub struct Exporter<S> {
    records: RecordStoreAdapter<S>,
    config: ExportConfig,
}

impl<S: RecordStore> Exporter<S> {
    pub fn new(records: RecordStoreAdapter<S>, config: ExportConfig) -> Self {
        Self { records, config }
    }

    pub fn records(&self) -> &RecordStoreAdapter<S> {
        &self.records
    }

    pub async fn run(&self) -> PipelineResult<ExportOutcome> {
        let manifest = &self.config.manifest_path;
        let partial = partial_path(manifest);

        let mut written = Written::default();
        if let Err(err) = self.write_manifest(&partial, &mut written).await {
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                warn!(
                    path = %partial.display(),
                    error = %cleanup,
                    "could not remove partial manifest"
                );
            }
            return Err(written.interrupted(manifest, err));
        }

        let durable = async {
            tokio::fs::rename(&partial, manifest).await?;
            sync_parent(manifest).await
        };
        if let Err(err) = durable.await {
            return Err(written.interrupted(manifest, err.into()));
        }

        if written.ids.is_empty() {
            info!(path = %manifest.display(), "no pending records");
            return Ok(ExportOutcome::NothingToDo {
                manifest_path: manifest.clone(),
            });
        }

        info!(
            path = %manifest.display(),
            lines = written.ids.len(),
            bytes = written.bytes,
            "manifest durable"
        );

        let marked = if self.config.dry_run {
            info!("dry run: leaving records pending");
            None
        } else {
            let report = self.records.mark_exported(&written.ids).await;
            if !report.is_complete() {
                warn!(
                    failed = report.failed.len(),
                    failed_batches = report.failed_batches,
                    "some records were not marked; they stay pending"
                );
            }
            Some(report)
        };

        Ok(ExportOutcome::Exported(ExportSummary {
            manifest_path: manifest.clone(),
            lines: written.ids.len() as u64,
            bytes: written.bytes,
            marked,
        }))
    }

    /// Progress lands in `written` as it happens, so a failure still reports it.
    async fn write_manifest(&self, path: &Path, written: &mut Written) -> PipelineResult<()> {
        let file = tokio::fs::File::create(path).await?;
        let mut out = BufWriter::new(file);
        let every = self.config.progress_every;

        let mut records = self.records.stream_unexported();
        while let Some(record) = records.try_next().await? {
            let line = ManifestEntry::for_record(&record, &self.config.template)
                .to_line()
                .map_err(|e| PipelineError::invariant(format!("record {}: {e}", record.id)))?;
            out.write_all(line.as_bytes()).await?;
            out.write_all(b"\n").await?;
            written.bytes += line.len() as u64 + 1;
            written.ids.push(record.id);

            if every > 0 && written.ids.len() as u64 % every == 0 {
                info!(lines = written.ids.len(), "export progress");
            }
        }

        out.flush().await?;
        let file = out.into_inner();
        file.sync_all().await?;
        Ok(())
    }

    /// Return the listed records to `pending`, starting a new generation for
    /// them. Their next import overwrites the previous result.
    pub async fn requeue(&self, ids: &[RecordId]) -> MarkReport {
        let report = self.records.requeue(ids).await;
        info!(
            requested = report.requested,
            changed = report.changed,
            failed_batches = report.failed_batches,
            "requeued records"
        );
        report
    }

    pub async fn requeue_all(&self) -> PipelineResult<u64> {
        let changed = self.records.requeue_all().await?;
        info!(changed, "requeued every exported record");
        Ok(changed)
    }
}

fn partial_path(manifest: &Path) -> PathBuf {
    let mut name = manifest.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

#[cfg(unix)]
async fn sync_parent(path: &Path) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::File::open(parent).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_parent(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
