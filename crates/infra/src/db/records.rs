//! `source_records` table.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{instrument, Span};

use batchflow_core::{ExportState, RecordId, SourceRecord};
use batchflow_pipeline::{RecordStore, StateCounts, StoreError};

use super::map_sqlx_error;

/// Postgres-backed record store.
///
/// Pages are keyset-paginated on `(export_state, id)`, which the
/// `source_records_export_state_id` index serves directly. State updates
/// only touch rows in the expected source state, so repeating a batch is a
/// no-op.
#[derive(Debug, Clone)]
pub struct PostgresRecordStore {
    pool: Arc<PgPool>,
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Insert or replace a record as `pending`. Used by seeding and tests;
    /// regular ingestion happens upstream.
    #[instrument(skip(self, record), fields(id = %record.id), err)]
    pub async fn insert(&self, record: &SourceRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO source_records (id, payload, export_state, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (id) DO UPDATE
            SET payload = EXCLUDED.payload,
                export_state = EXCLUDED.export_state,
                updated_at = now()
            "#,
        )
        .bind(record.id.as_str())
        .bind(&record.payload)
        .bind(record.export_state.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;
        Ok(())
    }

    async fn transition(
        &self,
        operation: &str,
        ids: &[RecordId],
        from: ExportState,
        to: ExportState,
    ) -> Result<u64, StoreError> {
        let ids: Vec<&str> = ids.iter().map(RecordId::as_str).collect();
        let result = sqlx::query(
            r#"
            UPDATE source_records
            SET export_state = $1, updated_at = now()
            WHERE id = ANY($2) AND export_state = $3
            "#,
        )
        .bind(to.as_str())
        .bind(&ids)
        .bind(from.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    #[instrument(skip(self), fields(rows), err)]
    async fn fetch_pending_page(
        &self,
        after: Option<&RecordId>,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, payload, export_state
            FROM source_records
            WHERE export_state = 'pending' AND ($1::TEXT IS NULL OR id > $1)
            ORDER BY id ASC
            LIMIT $2
            "#,
        )
        .bind(after.map(RecordId::as_str))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_pending_page", e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row
                .try_get("id")
                .map_err(|e| map_sqlx_error("fetch_pending_page", e))?;
            let state: String = row
                .try_get("export_state")
                .map_err(|e| map_sqlx_error("fetch_pending_page", e))?;
            records.push(SourceRecord {
                id: RecordId::new(id)?,
                payload: row
                    .try_get("payload")
                    .map_err(|e| map_sqlx_error("fetch_pending_page", e))?,
                export_state: state.parse()?,
            });
        }

        Span::current().record("rows", records.len());
        Ok(records)
    }

    #[instrument(skip(self, ids), fields(batch = ids.len()), err)]
    async fn mark_exported_batch(&self, ids: &[RecordId]) -> Result<u64, StoreError> {
        self.transition("mark_exported_batch", ids, ExportState::Pending, ExportState::Exported)
            .await
    }

    #[instrument(skip(self, ids), fields(batch = ids.len()), err)]
    async fn requeue_batch(&self, ids: &[RecordId]) -> Result<u64, StoreError> {
        self.transition("requeue_batch", ids, ExportState::Exported, ExportState::Pending)
            .await
    }

    #[instrument(skip(self), err)]
    async fn requeue_all(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE source_records SET export_state = 'pending', updated_at = now() \
             WHERE export_state = 'exported'",
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_all", e))?;
        Ok(result.rows_affected())
    }

    async fn contains(&self, id: &RecordId) -> Result<bool, StoreError> {
        let row =
            sqlx::query("SELECT EXISTS (SELECT 1 FROM source_records WHERE id = $1) AS present")
                .bind(id.as_str())
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("contains", e))?;
        row.try_get("present").map_err(|e| map_sqlx_error("contains", e))
    }

    #[instrument(skip(self), err)]
    async fn counts(&self) -> Result<StateCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE export_state = 'pending') AS pending,
                COUNT(*) FILTER (WHERE export_state = 'exported') AS exported
            FROM source_records
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("counts", e))?;

        let pending: i64 = row.try_get("pending").map_err(|e| map_sqlx_error("counts", e))?;
        let exported: i64 = row.try_get("exported").map_err(|e| map_sqlx_error("counts", e))?;
        Ok(StateCounts {
            pending: pending as u64,
            exported: exported as u64,
        })
    }
}
