//! Postgres adapters for the record and result stores.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (serialization failure, deadlock) | `40001`, `40P01` | `Unavailable` |
//! | Database (connection exception, admin shutdown) | `08*`, `57P*` | `Unavailable` |
//! | Database (other) | Any other | `Query` |
//! | PoolTimedOut, PoolClosed, Io, Tls | N/A | `Unavailable` |
//! | ColumnDecode, Decode | N/A | `Corrupt` |
//! | Other | N/A | `Query` |

pub mod records;
pub mod results;

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use batchflow_pipeline::StoreError;

pub use records::PostgresRecordStore;
pub use results::PostgresResultStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS source_records (
    id TEXT PRIMARY KEY,
    payload JSONB NOT NULL,
    export_state TEXT NOT NULL DEFAULT 'pending'
        CHECK (export_state IN ('pending', 'exported')),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS source_records_export_state_id
    ON source_records (export_state, id);

CREATE TABLE IF NOT EXISTS analysis_results (
    original_record_id TEXT PRIMARY KEY,
    analysis JSONB NOT NULL,
    model TEXT,
    source_object TEXT,
    imported_at TIMESTAMPTZ NOT NULL
);
"#;

/// Open a connection pool.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
        .map_err(|e| map_sqlx_error("connect", e))
}

/// Create tables and indexes that do not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;
    info!("database schema ready");
    Ok(())
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            match code.as_str() {
                "40001" | "40P01" => StoreError::Unavailable(msg),
                c if c.starts_with("08") || c.starts_with("57P") => StoreError::Unavailable(msg),
                _ => StoreError::Query(msg),
            }
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => {
            StoreError::Unavailable(format!("connection failure in {}: {}", operation, err))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Corrupt(format!("undecodable row in {}: {}", operation, err))
        }
        _ => StoreError::Query(format!("sqlx error in {}: {}", operation, err)),
    }
}
