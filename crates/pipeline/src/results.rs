//! Result store port.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use batchflow_core::{AnalysisResult, RecordId, UpsertOutcome};

use crate::error::StoreError;

/// Durable store of analysis results keyed by originating record.
///
/// Implementations must enforce uniqueness on `original_record_id` and apply
/// each batch atomically (the whole batch commits or none of it does).
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Update-or-insert every result in the batch. Ids within one batch are
    /// unique (callers deduplicate).
    async fn upsert_batch(&self, results: &[AnalysisResult]) -> Result<UpsertOutcome, StoreError>;

    async fn get(&self, id: &RecordId) -> Result<Option<AnalysisResult>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}

#[async_trait]
impl<S> ResultStore for Arc<S>
where
    S: ResultStore + ?Sized,
{
    async fn upsert_batch(&self, results: &[AnalysisResult]) -> Result<UpsertOutcome, StoreError> {
        (**self).upsert_batch(results).await
    }

    async fn get(&self, id: &RecordId) -> Result<Option<AnalysisResult>, StoreError> {
        (**self).get(id).await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        (**self).count().await
    }
}

/// In-memory result store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    results: RwLock<HashMap<RecordId, AnalysisResult>>,
    batches: RwLock<usize>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn all(&self) -> Vec<AnalysisResult> {
        let mut all: Vec<_> = self
            .results
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.original_record_id.cmp(&b.original_record_id));
        all
    }

    /// Number of `upsert_batch` calls received.
    pub fn batch_calls(&self) -> usize {
        *self.batches.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn upsert_batch(&self, results: &[AnalysisResult]) -> Result<UpsertOutcome, StoreError> {
        let mut store = self
            .results
            .write()
            .map_err(|_| StoreError::unavailable("lock poisoned"))?;
        *self.batches.write().unwrap_or_else(PoisonError::into_inner) += 1;

        let mut outcome = UpsertOutcome::default();
        for result in results {
            match store.insert(result.original_record_id.clone(), result.clone()) {
                Some(_) => outcome.updated += 1,
                None => outcome.inserted += 1,
            }
        }
        Ok(outcome)
    }

    async fn get(&self, id: &RecordId) -> Result<Option<AnalysisResult>, StoreError> {
        Ok(self.results.read().unwrap_or_else(PoisonError::into_inner).get(id).cloned())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.results.read().unwrap_or_else(PoisonError::into_inner).len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn upsert_never_duplicates_a_record() {
        let store = InMemoryResultStore::new();
        let id = RecordId::new("a").unwrap();

        let first = store
            .upsert_batch(&[AnalysisResult::new(id.clone(), json!({"v": 1}))])
            .await
            .unwrap();
        let second = store
            .upsert_batch(&[AnalysisResult::new(id.clone(), json!({"v": 2}))])
            .await
            .unwrap();

        assert_eq!(first, UpsertOutcome { inserted: 1, updated: 0 });
        assert_eq!(second, UpsertOutcome { inserted: 0, updated: 1 });
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.get(&id).await.unwrap().unwrap().analysis, json!({"v": 2}));
    }
}
