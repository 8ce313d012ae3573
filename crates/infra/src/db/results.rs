//! `analysis_results` table.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tracing::{instrument, Span};

use batchflow_core::{AnalysisResult, RecordId, UpsertOutcome};
use batchflow_pipeline::{ResultStore, StoreError};

use super::map_sqlx_error;

/// Postgres-backed result store.
///
/// A batch is written by one `INSERT ... ON CONFLICT DO UPDATE` statement,
/// so it commits or fails as a whole. `xmax = 0` in `RETURNING` tells fresh
/// inserts apart from updates of an existing row.
#[derive(Debug, Clone)]
pub struct PostgresResultStore {
    pool: Arc<PgPool>,
}

impl PostgresResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl ResultStore for PostgresResultStore {
    #[instrument(skip(self, results), fields(batch = results.len(), inserted, updated), err)]
    async fn upsert_batch(&self, results: &[AnalysisResult]) -> Result<UpsertOutcome, StoreError> {
        if results.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        let ids: Vec<&str> = results.iter().map(|r| r.original_record_id.as_str()).collect();
        let analyses: Vec<JsonValue> = results.iter().map(|r| r.analysis.clone()).collect();
        let models: Vec<Option<&str>> = results.iter().map(|r| r.model.as_deref()).collect();
        let sources: Vec<Option<&str>> =
            results.iter().map(|r| r.source_object.as_deref()).collect();
        let imported: Vec<DateTime<Utc>> = results.iter().map(|r| r.imported_at).collect();

        let rows = sqlx::query(
            r#"
            INSERT INTO analysis_results
                (original_record_id, analysis, model, source_object, imported_at)
            SELECT * FROM UNNEST($1::TEXT[], $2::JSONB[], $3::TEXT[], $4::TEXT[], $5::TIMESTAMPTZ[])
            ON CONFLICT (original_record_id) DO UPDATE
            SET analysis = EXCLUDED.analysis,
                model = EXCLUDED.model,
                source_object = EXCLUDED.source_object,
                imported_at = EXCLUDED.imported_at
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&ids)
        .bind(&analyses)
        .bind(&models)
        .bind(&sources)
        .bind(&imported)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_batch", e))?;

        let mut outcome = UpsertOutcome::default();
        for row in rows {
            let inserted: bool = row
                .try_get("inserted")
                .map_err(|e| map_sqlx_error("upsert_batch", e))?;
            if inserted {
                outcome.inserted += 1;
            } else {
                outcome.updated += 1;
            }
        }

        let span = Span::current();
        span.record("inserted", outcome.inserted);
        span.record("updated", outcome.updated);
        Ok(outcome)
    }

    async fn get(&self, id: &RecordId) -> Result<Option<AnalysisResult>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT original_record_id, analysis, model, source_object, imported_at
            FROM analysis_results
            WHERE original_record_id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let decode = |e| map_sqlx_error("get", e);
        let original: String = row.try_get("original_record_id").map_err(decode)?;
        Ok(Some(AnalysisResult {
            original_record_id: RecordId::new(original)?,
            analysis: row.try_get("analysis").map_err(decode)?,
            model: row.try_get("model").map_err(decode)?,
            source_object: row.try_get("source_object").map_err(decode)?,
            imported_at: row.try_get("imported_at").map_err(decode)?,
        }))
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM analysis_results")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count", e))?;
        let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("count", e))?;
        Ok(n as u64)
    }
}
