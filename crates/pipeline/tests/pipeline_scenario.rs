//! End-to-end run of all four phases against the in-memory ports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use batchflow_core::{
    AnalysisResult, JobState, ObjectPath, RecordId, RunId, SourceRecord, UpsertOutcome,
};
use batchflow_pipeline::{
    ExportConfig, ExportOutcome, Exporter, ImportConfig, InMemoryBatchService, InMemoryObjectStore,
    InMemoryRecordStore, InMemoryResultStore, JobSubmitter, PipelineError, RecordStoreAdapter,
    ResultImporter, ResultStore, RetryPolicy, StagingUploader, StoreError,
};

fn rid(id: &str) -> RecordId {
    RecordId::new(id).unwrap()
}

fn output_line(key: &str, answer: Value) -> String {
    json!({
        "key": key,
        "request": {"contents": [{"role": "user", "parts": [{"text": "..."}]}]},
        "response": {
            "candidates": [{"content": {"role": "model", "parts": [{"text": answer.to_string()}]}}],
            "modelVersion": "gemini-2.0-flash-001"
        },
        "status": ""
    })
    .to_string()
}

#[tokio::test]
async fn full_run_is_idempotent_in_every_phase() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = dir.path().join("manifest.jsonl");

    let records = InMemoryRecordStore::arc();
    for id in ["A", "B", "C"] {
        let payload = json!({"conversation": format!("text of {id}")});
        records.insert(SourceRecord::pending(rid(id), payload));
    }
    let objects = InMemoryObjectStore::arc();
    let service = InMemoryBatchService::arc();
    let results = InMemoryResultStore::arc();
    let run = RunId::new();

    // Export: three lines, then nothing.
    let exporter =
        Exporter::new(RecordStoreAdapter::new(records.clone()), ExportConfig::new(&manifest));
    let ExportOutcome::Exported(first) = exporter.run().await.unwrap() else {
        panic!("first export should write records");
    };
    assert_eq!(first.lines, 3);
    assert!(first.is_complete());
    assert!(records.pending_ids().is_empty());
    let written = std::fs::read_to_string(&manifest).unwrap();
    assert_eq!(written.lines().count(), 3);

    let second = exporter.run().await.unwrap();
    assert!(matches!(second, ExportOutcome::NothingToDo { .. }));

    // The empty second manifest replaced the first; restore it for upload.
    std::fs::write(&manifest, &written).unwrap();

    // Upload twice, transfer once.
    let uploader = StagingUploader::new(objects.clone(), "bucket", "batchflow/input")
        .with_retry_policy(RetryPolicy::no_retry());
    let staged = uploader.upload(&manifest).await.unwrap();
    let again = uploader.upload(&manifest).await.unwrap();
    assert!(staged.transferred);
    assert!(!again.transferred);
    assert_eq!(objects.transfers(), 1);

    // Submit twice, one job.
    let input_uri = staged.object.uri();
    let submitter = JobSubmitter::new(service.clone(), "gemini-2.0-flash-001")
        .with_retry_policy(RetryPolicy::no_retry());
    let output_uri = "gs://bucket/batchflow/output/run";
    let j1 = submitter.submit(&input_uri, output_uri, &run).await.unwrap();
    let j1_again = submitter.submit(&input_uri, output_uri, &run).await.unwrap();
    assert!(j1.created);
    assert!(!j1_again.created);
    assert_eq!(j1.job.job_id, j1_again.job.job_id);
    assert_eq!(service.created(), 1);

    // The service finishes and writes 2 valid answers and 1 malformed line.
    service.set_state(&j1.job.job_id, JobState::Succeeded);
    let finished = submitter.refresh(&j1.job).await.unwrap();
    assert_eq!(finished.state, JobState::Succeeded);
    let output = format!(
        "{}\n{}\n{}\n",
        output_line("A", json!({"topic": "billing"})),
        output_line("B", json!({"topic": "shipping"})),
        json!({
            "key": "C",
            "response": {"candidates": [{"content": {"parts": [{"text": "not json at all"}]}}]}
        }),
    );
    objects.put(
        &ObjectPath::new("bucket", "batchflow/output/run/prediction-model-1/predictions.jsonl"),
        output,
    );

    let importer = ResultImporter::new(
        objects.clone(),
        results.clone(),
        RecordStoreAdapter::new(records.clone()),
        ImportConfig::default(),
    )
    .with_retry_policy(RetryPolicy::no_retry());

    let imported = importer.import(finished.output_location()).await.unwrap();
    assert_eq!(imported.lines_parsed, 2);
    assert_eq!(imported.lines_failed, 1);
    assert_eq!(imported.inserted, 2);
    assert_eq!(results.count().await.unwrap(), 2);

    let reimported = importer.import(finished.output_location()).await.unwrap();
    assert_eq!(reimported.upserted, 2);
    assert_eq!(reimported.inserted, 0);
    assert_eq!(results.count().await.unwrap(), 2);
    let a = results.get(&rid("A")).await.unwrap().unwrap();
    assert_eq!(a.analysis, json!({"topic": "billing"}));
}

#[tokio::test]
async fn requeued_record_is_exported_again() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = dir.path().join("manifest.jsonl");
    let records = InMemoryRecordStore::arc();
    records.insert(SourceRecord::pending(rid("A"), json!("v1")));
    let exporter =
        Exporter::new(RecordStoreAdapter::new(records.clone()), ExportConfig::new(&manifest));

    exporter.run().await.unwrap();
    assert!(matches!(exporter.run().await.unwrap(), ExportOutcome::NothingToDo { .. }));

    let report = exporter.requeue(&[rid("A")]).await;
    assert!(report.is_complete());

    let ExportOutcome::Exported(summary) = exporter.run().await.unwrap() else {
        panic!("requeued record should be exported again");
    };
    assert_eq!(summary.lines, 1);
    assert!(records.pending_ids().is_empty());
}

/// Result store whose database can be switched off between calls.
struct Switchable {
    inner: Arc<InMemoryResultStore>,
    /// Batches accepted before the outage starts.
    down_after: usize,
    calls: std::sync::atomic::AtomicUsize,
    recovered: AtomicBool,
}

#[async_trait]
impl ResultStore for Switchable {
    async fn upsert_batch(&self, results: &[AnalysisResult]) -> Result<UpsertOutcome, StoreError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call >= self.down_after && !self.recovered.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("db down"));
        }
        self.inner.upsert_batch(results).await
    }

    async fn get(&self, id: &RecordId) -> Result<Option<AnalysisResult>, StoreError> {
        self.inner.get(id).await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.inner.count().await
    }
}

#[tokio::test]
async fn damaged_output_and_store_outage_lose_nothing_on_rerun() {
    let objects = InMemoryObjectStore::arc();
    let records = InMemoryRecordStore::arc();
    let results = InMemoryResultStore::arc();

    // First object: a non-UTF-8 line and a truncated line between good ones.
    let mut first = Vec::new();
    for (i, chunk) in [
        output_line("A", json!({"n": 1})).into_bytes(),
        b"{\"key\": \"X\", \"response\": \"\xc3\x28\"}".to_vec(),
        output_line("B", json!({"n": 2})).into_bytes(),
        br#"{"key": "Y", "respo"#.to_vec(),
        output_line("C", json!({"n": 3})).into_bytes(),
    ]
    .into_iter()
    .enumerate()
    {
        if i > 0 {
            first.push(b'\n');
        }
        first.extend_from_slice(&chunk);
    }
    objects.put(&ObjectPath::new("bucket", "out/run/predictions-1.jsonl"), first);
    let second = format!(
        "{}\n{}\n",
        output_line("D", json!({"n": 4})),
        output_line("E", json!({}))
    );
    objects.put(&ObjectPath::new("bucket", "out/run/predictions-2.jsonl"), second);

    let store = Arc::new(Switchable {
        inner: results.clone(),
        down_after: 1,
        calls: Default::default(),
        recovered: AtomicBool::new(false),
    });
    let importer = ResultImporter::new(
        objects.clone(),
        store.clone(),
        RecordStoreAdapter::new(records.clone()),
        ImportConfig {
            batch_size: 2,
            ..ImportConfig::default()
        },
    )
    .with_retry_policy(RetryPolicy::no_retry());

    // The outage hits the second batch; the first batch stays written and
    // the error still says how far the import got.
    let err = importer.import("gs://bucket/out/run").await.unwrap_err();
    let summary = err.partial_summary().expect("interrupted import carries its summary");
    assert!(summary.contains("2 failed"), "{summary}");
    assert!(summary.contains("2 upserted"), "{summary}");
    assert!(matches!(err, PipelineError::Interrupted { .. }));
    assert_eq!(results.count().await.unwrap(), 2);

    store.recovered.store(true, Ordering::SeqCst);
    let rerun = importer.import("gs://bucket/out/run").await.unwrap();
    assert!(rerun.is_complete());
    assert_eq!(rerun.lines_parsed, 5);
    assert_eq!(rerun.lines_failed, 2);
    assert_eq!(rerun.inserted, 3);
    assert_eq!(rerun.updated, 2);
    assert_eq!(results.count().await.unwrap(), 5);
}
