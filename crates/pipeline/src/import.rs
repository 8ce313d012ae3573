//! Import phase: batch output objects → idempotent result upserts.
//!
//! Every output object under the job's output location is streamed line by
//! line. Malformed lines (including ones that are not UTF-8) are counted and
//! skipped. A read error abandons the
//! rest of that object (results decoded before it are still written) and the
//! importer moves on to the next object. Results are upserted in bounded
//! batches keyed by record id, so importing the same output twice leaves the
//! result set unchanged.

use std::collections::BTreeMap;
use std::fmt;

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use batchflow_core::{AnalysisResult, ObjectPath, RecordId, UpsertOutcome};

use crate::decode::{decode_line, DecodedLine};
use crate::error::{PipelineError, PipelineResult};
use crate::records::{RecordStore, RecordStoreAdapter};
use crate::results::ResultStore;
use crate::retry::{retry, RetryPolicy};
use crate::storage::{ObjectMeta, ObjectStore};

/// Malformed lines logged individually per object; the rest are only counted.
const LOGGED_LINE_ERRORS: u64 = 20;

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub batch_size: usize,
    pub progress_every: u64,
    /// Field inside the answer used when the service did not echo an id.
    pub natural_key_field: String,
    /// Decode and count without writing results.
    pub dry_run: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            progress_every: 10_000,
            natural_key_field: "record_id".to_string(),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub objects_total: u64,
    pub objects_imported: u64,
    pub objects_failed: u64,
    pub lines_parsed: u64,
    pub lines_failed: u64,
    pub upserted: u64,
    pub inserted: u64,
    pub updated: u64,
    /// Results matched through the natural-key fallback.
    pub fallback_matches: u64,
    pub failed_objects: Vec<String>,
    pub dry_run: bool,
}

impl ImportSummary {
    fn record_upsert(&mut self, outcome: UpsertOutcome) {
        self.upserted += outcome.total();
        self.inserted += outcome.inserted;
        self.updated += outcome.updated;
    }

    /// Every output object was read to the end.
    pub fn is_complete(&self) -> bool {
        self.objects_failed == 0
    }
}

impl fmt::Display for ImportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "import: {}/{} objects, {} lines parsed, {} failed, {} upserted ({} new, {} updated), \
             {} fallback matches",
            self.objects_imported,
            self.objects_total,
            self.lines_parsed,
            self.lines_failed,
            self.upserted,
            self.inserted,
            self.updated,
            self.fallback_matches
        )?;
        if self.dry_run {
            f.write_str(" [dry run]")?;
        }
        if !self.failed_objects.is_empty() {
            write!(f, "; unreadable: {}", self.failed_objects.join(", "))?;
        }
        Ok(())
    }
}

pub struct ResultImporter<O, S, R> {
    objects: O,
    results: S,
    records: RecordStoreAdapter<R>,
    retry: RetryPolicy,
    config: ImportConfig,
}

impl<O, S, R> ResultImporter<O, S, R>
where
    O: ObjectStore,
    S: ResultStore,
    R: RecordStore,
{
    pub fn new(
        objects: O,
        results: S,
        records: RecordStoreAdapter<R>,
        config: ImportConfig,
    ) -> Self {
        Self {
            objects,
            results,
            records,
            retry: RetryPolicy::default(),
            config,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Import every `.jsonl` object under `output_location` (`gs://bucket/prefix`).
    ///
    /// A store failure ends the run with [`PipelineError::Interrupted`],
    /// carrying the summary of what was written before it.
    pub async fn import(&self, output_location: &str) -> PipelineResult<ImportSummary> {
        let root: ObjectPath = output_location
            .parse()
            .map_err(|e| PipelineError::configuration(format!("output location: {e}")))?;

        let prefix = if root.name.is_empty() || root.name.ends_with('/') {
            root.name.clone()
        } else {
            format!("{}/", root.name)
        };

        let listed = retry(&self.retry, "list", || self.objects.list(&root.bucket, &prefix)).await?;
        let outputs: Vec<ObjectMeta> = listed
            .into_iter()
            .filter(|m| m.path.name.ends_with(".jsonl"))
            .collect();

        let mut summary = ImportSummary {
            objects_total: outputs.len() as u64,
            dry_run: self.config.dry_run,
            ..ImportSummary::default()
        };
        if outputs.is_empty() {
            warn!(location = output_location, "no output objects found");
        }

        for object in &outputs {
            if let Err(err) = self.import_object(&object.path, &mut summary).await {
                warn!(
                    object = %object.path,
                    upserted = summary.upserted,
                    error = %err,
                    "import stopped; results already written are kept"
                );
                return Err(PipelineError::interrupted(&summary, err));
            }
        }

        info!(
            objects = summary.objects_total,
            failed_objects = summary.objects_failed,
            parsed = summary.lines_parsed,
            failed = summary.lines_failed,
            upserted = summary.upserted,
            inserted = summary.inserted,
            updated = summary.updated,
            fallback_matches = summary.fallback_matches,
            "import finished"
        );
        Ok(summary)
    }

    /// Read errors are recorded in `summary`; store errors are returned.
    async fn import_object(
        &self,
        path: &ObjectPath,
        summary: &mut ImportSummary,
    ) -> PipelineResult<()> {
        let source = path.uri();
        info!(object = %source, "importing output object");

        let opened = retry(&self.retry, "read_lines", || self.objects.read_lines(path)).await;
        let mut lines = match opened {
            Ok(lines) => lines,
            Err(err) => {
                warn!(object = %source, error = %err, "cannot open output object; skipping");
                summary.objects_failed += 1;
                summary.failed_objects.push(source);
                return Ok(());
            }
        };

        let mut batch: BTreeMap<RecordId, AnalysisResult> = BTreeMap::new();
        let mut line_no = 0u64;
        let mut object_failures = 0u64;
        let mut read_error = None;

        while let Some(raw) = lines.next().await {
            let raw = match raw {
                Ok(raw) => raw,
                Err(err) => {
                    read_error = Some(err);
                    break;
                }
            };
            line_no += 1;
            let decoded = match String::from_utf8(raw) {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => self.to_result(&line, &source, summary).await?,
                Err(err) => Err(format!("not valid utf-8: {}", err.utf8_error())),
            };

            match decoded {
                Ok(result) => {
                    summary.lines_parsed += 1;
                    batch.insert(result.original_record_id.clone(), result);
                }
                Err(reason) => {
                    summary.lines_failed += 1;
                    object_failures += 1;
                    if object_failures <= LOGGED_LINE_ERRORS {
                        warn!(object = %source, line = line_no, error = %reason, "skipping line");
                    } else {
                        debug!(object = %source, line = line_no, error = %reason, "skipping line");
                    }
                }
            }

            if batch.len() >= self.config.batch_size {
                self.flush(&mut batch, summary).await?;
            }
            let seen = summary.lines_parsed + summary.lines_failed;
            if self.config.progress_every > 0 && seen % self.config.progress_every == 0 {
                info!(
                    parsed = summary.lines_parsed,
                    failed = summary.lines_failed,
                    upserted = summary.upserted,
                    "import progress"
                );
            }
        }

        self.flush(&mut batch, summary).await?;

        match read_error {
            Some(err) => {
                warn!(
                    object = %source,
                    after_lines = line_no,
                    error = %err,
                    "read failed; results up to this point were kept"
                );
                summary.objects_failed += 1;
                summary.failed_objects.push(source);
            }
            None => summary.objects_imported += 1,
        }
        Ok(())
    }

    /// Outer error: the record store failed. Inner error: the line is unusable.
    async fn to_result(
        &self,
        line: &str,
        source: &str,
        summary: &mut ImportSummary,
    ) -> PipelineResult<Result<AnalysisResult, String>> {
        let decoded = match decode_line(line) {
            Ok(decoded) => decoded,
            Err(err) => return Ok(Err(err.to_string())),
        };

        let id = match decoded.record_id.clone() {
            Some(id) => id,
            None => match self.fallback_id(&decoded).await? {
                Some(id) => {
                    warn!(
                        record = %id,
                        object = source,
                        "matched result by natural key; no id was echoed"
                    );
                    summary.fallback_matches += 1;
                    id
                }
                None => {
                    return Ok(Err(format!(
                        "no echoed record id and no known `{}` in the answer",
                        self.config.natural_key_field
                    )));
                }
            },
        };

        let DecodedLine { analysis, model, .. } = decoded;
        let mut result =
            AnalysisResult::new(id, JsonValue::Object(analysis)).with_source_object(source);
        if let Some(model) = model {
            result = result.with_model(model);
        }
        Ok(Ok(result))
    }

    async fn fallback_id(&self, decoded: &DecodedLine) -> PipelineResult<Option<RecordId>> {
        let Some(candidate) = decoded.natural_key(&self.config.natural_key_field) else {
            return Ok(None);
        };
        if self.records.contains(&candidate).await? {
            Ok(Some(candidate))
        } else {
            Ok(None)
        }
    }

    async fn flush(
        &self,
        batch: &mut BTreeMap<RecordId, AnalysisResult>,
        summary: &mut ImportSummary,
    ) -> PipelineResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let results: Vec<AnalysisResult> = std::mem::take(batch).into_values().collect();
        if self.config.dry_run {
            debug!(results = results.len(), "dry run: skipping upsert");
            return Ok(());
        }

        let outcome = retry(&self.retry, "upsert_batch", || {
            self.results.upsert_batch(&results)
        })
        .await?;
        debug!(inserted = outcome.inserted, updated = outcome.updated, "upserted batch");
        summary.record_upsert(outcome);
        Ok(())
    }
}
