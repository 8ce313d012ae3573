//! Record store port and the adapter the exporter reads through.
//!
//! ## Design
//!
//! - `RecordStore` is the backend boundary (Postgres in production, in-memory
//!   for tests). It only knows pages and single batch writes.
//! - `RecordStoreAdapter` turns pages into a lazy keyset stream and splits
//!   arbitrarily large id sets into bounded batch writes.
//!
//! Batch writes are not atomic across batches: a failed batch is reported
//! per record and the batches already applied stay applied. Records that
//! failed to be marked are still `pending` and are exported again next run.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::Serialize;
use tracing::{debug, warn};

use batchflow_core::{ExportState, ModelResult, RecordId, SourceRecord};

use crate::error::StoreError;
use crate::retry::{retry, RetryPolicy};

/// Record counts by export state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub pending: u64,
    pub exported: u64,
}

/// Backend access to source records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Up to `limit` pending records with ids strictly greater than `after`,
    /// ordered by id.
    async fn fetch_pending_page(
        &self,
        after: Option<&RecordId>,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, StoreError>;

    /// Flip the given records from `pending` to `exported` in one atomic call.
    /// Returns how many rows changed (already-exported ids are not counted).
    async fn mark_exported_batch(&self, ids: &[RecordId]) -> Result<u64, StoreError>;

    /// Flip the given records from `exported` back to `pending` in one call.
    async fn requeue_batch(&self, ids: &[RecordId]) -> Result<u64, StoreError>;

    /// Flip every exported record back to `pending`.
    async fn requeue_all(&self) -> Result<u64, StoreError>;

    async fn contains(&self, id: &RecordId) -> Result<bool, StoreError>;

    async fn counts(&self) -> Result<StateCounts, StoreError>;
}

#[async_trait]
impl<S> RecordStore for Arc<S>
where
    S: RecordStore + ?Sized,
{
    async fn fetch_pending_page(
        &self,
        after: Option<&RecordId>,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, StoreError> {
        (**self).fetch_pending_page(after, limit).await
    }

    async fn mark_exported_batch(&self, ids: &[RecordId]) -> Result<u64, StoreError> {
        (**self).mark_exported_batch(ids).await
    }

    async fn requeue_batch(&self, ids: &[RecordId]) -> Result<u64, StoreError> {
        (**self).requeue_batch(ids).await
    }

    async fn requeue_all(&self) -> Result<u64, StoreError> {
        (**self).requeue_all().await
    }

    async fn contains(&self, id: &RecordId) -> Result<bool, StoreError> {
        (**self).contains(id).await
    }

    async fn counts(&self) -> Result<StateCounts, StoreError> {
        (**self).counts().await
    }
}

/// Outcome of a batched state update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MarkReport {
    pub requested: usize,
    /// Rows whose state actually changed.
    pub changed: u64,
    pub batches: usize,
    pub failed_batches: usize,
    /// Ids from failed batches; their state is unchanged.
    pub failed: Vec<RecordId>,
    pub errors: Vec<String>,
}

impl MarkReport {
    pub fn is_complete(&self) -> bool {
        self.failed_batches == 0
    }
}

/// Cursor-style access to source records with bounded batch writes.
pub struct RecordStoreAdapter<S> {
    store: S,
    page_size: usize,
    write_batch: usize,
    retry: RetryPolicy,
}

struct Cursor {
    after: Option<RecordId>,
    exhausted: bool,
}

impl<S: RecordStore> RecordStoreAdapter<S> {
    pub const DEFAULT_PAGE_SIZE: usize = 500;
    pub const DEFAULT_WRITE_BATCH: usize = 1000;

    pub fn new(store: S) -> Self {
        Self {
            store,
            page_size: Self::DEFAULT_PAGE_SIZE,
            write_batch: Self::DEFAULT_WRITE_BATCH,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_write_batch(mut self, write_batch: usize) -> Self {
        self.write_batch = write_batch.max(1);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Lazy stream over every pending record.
    ///
    /// Each call starts a fresh cursor. Pages are fetched on demand, so peak
    /// memory is one page regardless of backlog size.
    pub fn stream_unexported(&self) -> BoxStream<'_, Result<SourceRecord, StoreError>> {
        let start = Cursor {
            after: None,
            exhausted: false,
        };

        stream::try_unfold(start, move |cursor| self.next_page(cursor))
            .map_ok(|page| stream::iter(page.into_iter().map(Ok::<_, StoreError>)))
            .try_flatten()
            .boxed()
    }

    async fn next_page(
        &self,
        cursor: Cursor,
    ) -> Result<Option<(Vec<SourceRecord>, Cursor)>, StoreError> {
        if cursor.exhausted {
            return Ok(None);
        }

        let page = retry(&self.retry, "fetch_pending_page", || {
            self.store
                .fetch_pending_page(cursor.after.as_ref(), self.page_size)
        })
        .await?;

        if page.is_empty() {
            return Ok(None);
        }

        debug!(records = page.len(), "fetched pending page");
        let next = Cursor {
            after: page.last().map(|r| r.id.clone()),
            exhausted: page.len() < self.page_size,
        };
        Ok(Some((page, next)))
    }

    /// Mark records exported in batches of `write_batch`.
    pub async fn mark_exported(&self, ids: &[RecordId]) -> MarkReport {
        self.apply_in_batches(ids, "mark_exported_batch", |chunk| {
            self.store.mark_exported_batch(chunk)
        })
        .await
    }

    /// Return records to `pending` in batches of `write_batch`.
    pub async fn requeue(&self, ids: &[RecordId]) -> MarkReport {
        self.apply_in_batches(ids, "requeue_batch", |chunk| self.store.requeue_batch(chunk))
            .await
    }

    pub async fn requeue_all(&self) -> Result<u64, StoreError> {
        retry(&self.retry, "requeue_all", || self.store.requeue_all()).await
    }

    pub async fn contains(&self, id: &RecordId) -> Result<bool, StoreError> {
        retry(&self.retry, "contains", || self.store.contains(id)).await
    }

    pub async fn counts(&self) -> Result<StateCounts, StoreError> {
        retry(&self.retry, "counts", || self.store.counts()).await
    }

    async fn apply_in_batches<'a, F, Fut>(
        &'a self,
        ids: &'a [RecordId],
        operation: &str,
        mut write: F,
    ) -> MarkReport
    where
        F: FnMut(&'a [RecordId]) -> Fut,
        Fut: std::future::Future<Output = Result<u64, StoreError>>,
    {
        let mut report = MarkReport {
            requested: ids.len(),
            ..MarkReport::default()
        };

        for chunk in ids.chunks(self.write_batch) {
            report.batches += 1;
            match retry(&self.retry, operation, || write(chunk)).await {
                Ok(changed) => report.changed += changed,
                Err(err) => {
                    warn!(
                        operation,
                        batch = report.batches,
                        records = chunk.len(),
                        error = %err,
                        "batch write failed; earlier batches stay applied"
                    );
                    report.failed_batches += 1;
                    report.failed.extend_from_slice(chunk);
                    report.errors.push(err.to_string());
                }
            }
        }

        report
    }
}

/// In-memory record store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: RwLock<BTreeMap<RecordId, SourceRecord>>,
    /// Ids whose batch writes fail (simulates per-batch write errors).
    poisoned: RwLock<Vec<RecordId>>,
    /// Page reads that still succeed; `None` means unlimited.
    pages_left: RwLock<Option<usize>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn insert(&self, record: SourceRecord) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &RecordId) -> Option<SourceRecord> {
        self.records.read().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    pub fn pending_ids(&self) -> Vec<RecordId> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.is_pending())
            .map(|r| r.id.clone())
            .collect()
    }

    /// Make any batch containing `id` fail.
    pub fn poison(&self, id: RecordId) {
        self.poisoned.write().unwrap_or_else(PoisonError::into_inner).push(id);
    }

    /// Serve `pages` more pending pages, then report the store unavailable.
    pub fn fail_pages_after(&self, pages: usize) {
        *self.pages_left.write().unwrap_or_else(PoisonError::into_inner) = Some(pages);
    }

    fn check_poison(&self, ids: &[RecordId]) -> Result<(), StoreError> {
        let poisoned = self.poisoned.read().unwrap_or_else(PoisonError::into_inner);
        match ids.iter().find(|id| poisoned.contains(id)) {
            Some(id) => Err(StoreError::query(format!("write rejected for {id}"))),
            None => Ok(()),
        }
    }

    /// Apply `step` to every listed record. Records whose current state
    /// `step` rejects are left as they are and not counted.
    fn transition(
        &self,
        ids: &[RecordId],
        step: fn(ExportState) -> ModelResult<ExportState>,
    ) -> Result<u64, StoreError> {
        self.check_poison(ids)?;
        let mut records = self
            .records
            .write()
            .map_err(|_| StoreError::unavailable("lock poisoned"))?;
        let mut changed = 0;
        for id in ids {
            let Some(record) = records.get_mut(id) else {
                continue;
            };
            match step(record.export_state) {
                Ok(next) => {
                    record.export_state = next;
                    changed += 1;
                }
                Err(err) => debug!(record = %id, error = %err, "transition skipped"),
            }
        }
        Ok(changed)
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn fetch_pending_page(
        &self,
        after: Option<&RecordId>,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, StoreError> {
        use std::ops::Bound;

        let mut pages_left = self.pages_left.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(left) = pages_left.as_mut() {
            if *left == 0 {
                return Err(StoreError::unavailable("connection lost"));
            }
            *left -= 1;
        }
        drop(pages_left);

        let records = self
            .records
            .read()
            .map_err(|_| StoreError::unavailable("lock poisoned"))?;
        let lower = match after {
            Some(id) => Bound::Excluded(id.clone()),
            None => Bound::Unbounded,
        };
        Ok(records
            .range((lower, Bound::Unbounded))
            .map(|(_, r)| r)
            .filter(|r| r.is_pending())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_exported_batch(&self, ids: &[RecordId]) -> Result<u64, StoreError> {
        self.transition(ids, ExportState::export)
    }

    async fn requeue_batch(&self, ids: &[RecordId]) -> Result<u64, StoreError> {
        self.transition(ids, ExportState::requeue)
    }

    async fn requeue_all(&self) -> Result<u64, StoreError> {
        let ids: Vec<RecordId> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        self.transition(&ids, ExportState::requeue)
    }

    async fn contains(&self, id: &RecordId) -> Result<bool, StoreError> {
        Ok(self.records.read().unwrap_or_else(PoisonError::into_inner).contains_key(id))
    }

    async fn counts(&self) -> Result<StateCounts, StoreError> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let pending = records.values().filter(|r| r.is_pending()).count() as u64;
        Ok(StateCounts {
            pending,
            exported: records.len() as u64 - pending,
        })
    }
}
