//! Postgres connection pool, schema bootstrap and SQLx error mapping.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `UniqueViolation` |
//! | Database (foreign key violation) | `23503` | `ForeignKeyViolation` |
//! | Database (check constraint violation) | `23514` | `CheckViolation` |
//! | Database (deadlock, lock not available, serialization) | `40P01`, `55P03`, `40001` | `LockContention` |
//! | Database (other) | Any other | `Query` |
//! | PoolClosed | N/A | `Unavailable` |
//! | PoolTimedOut | N/A | `Timeout` |
//! | Io / Tls | N/A | `Connectivity` |
//! | RowNotFound | N/A | `NotFound` |

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::instrument;

use crate::config::DatabaseConfig;
use crate::error::StoreError;

/// Open a connection pool.
#[instrument(skip(config), fields(max_connections = config.max_connections), err)]
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.url)
        .await
        .map_err(|e| match map_sqlx_error("connect", e) {
            // A pool that never came up is unusable, not a transient blip.
            StoreError::Connectivity(msg) | StoreError::Query(msg) => StoreError::Unavailable(msg),
            other => other,
        })
}

/// Create every table the engine uses, if missing.
#[instrument(skip(pool), err)]
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    for (name, ddl) in SCHEMA {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error(name, e))?;
    }
    tracing::info!(statements = SCHEMA.len(), "schema ensured");
    Ok(())
}

const SCHEMA: &[(&str, &str)] = &[
    (
        "create_import_jobs",
        r#"
        CREATE TABLE IF NOT EXISTS import_jobs (
            id               BIGSERIAL PRIMARY KEY,
            uuid             UUID NOT NULL UNIQUE,
            kind             TEXT NOT NULL,
            status           TEXT NOT NULL,
            total_items      BIGINT NOT NULL DEFAULT 0,
            processed_items  BIGINT NOT NULL DEFAULT 0,
            succeeded_items  BIGINT NOT NULL DEFAULT 0,
            failed_items     BIGINT NOT NULL DEFAULT 0,
            created_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            started_at       TIMESTAMPTZ NULL,
            completed_at     TIMESTAMPTZ NULL,
            created_by       TEXT NULL,
            error_message    TEXT NULL,
            CONSTRAINT import_jobs_counters_check
                CHECK (processed_items = succeeded_items + failed_items
                       AND processed_items <= total_items)
        )
        "#,
    ),
    (
        "create_import_job_items",
        r#"
        CREATE TABLE IF NOT EXISTS import_job_items (
            id                  BIGSERIAL PRIMARY KEY,
            job_id              BIGINT NOT NULL REFERENCES import_jobs (id) ON DELETE CASCADE,
            source_code         TEXT NOT NULL,
            status              TEXT NOT NULL,
            retry_count         INTEGER NOT NULL DEFAULT 0,
            max_retries         INTEGER NOT NULL DEFAULT 3,
            last_error_type     TEXT NULL,
            last_error_message  TEXT NULL,
            source_row_number   BIGINT NOT NULL,
            first_attempted_at  TIMESTAMPTZ NULL,
            last_attempted_at   TIMESTAMPTZ NULL,
            succeeded_at        TIMESTAMPTZ NULL,
            retry_after         TIMESTAMPTZ NULL,
            CONSTRAINT import_job_items_row_key UNIQUE (job_id, source_row_number),
            CONSTRAINT import_job_items_retry_cap CHECK (retry_count <= max_retries)
        )
        "#,
    ),
    (
        "create_sync_queue",
        r#"
        CREATE TABLE IF NOT EXISTS sync_queue (
            id          BIGSERIAL PRIMARY KEY,
            subject_id  TEXT NOT NULL,
            event_type  TEXT NOT NULL,
            priority    TEXT NOT NULL DEFAULT 'NORMAL',
            status      TEXT NOT NULL DEFAULT 'PENDING',
            event_data  JSONB NOT NULL DEFAULT '{}'::jsonb,
            created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            retries     INTEGER NOT NULL DEFAULT 0 CHECK (retries >= 0)
        )
        "#,
    ),
    (
        "add_sync_queue_retries",
        "ALTER TABLE sync_queue ADD COLUMN IF NOT EXISTS retries INTEGER NOT NULL DEFAULT 0",
    ),
    (
        "create_sync_queue_index",
        "CREATE INDEX IF NOT EXISTS sync_queue_pending_idx ON sync_queue (status, priority, created_at)",
    ),
    (
        "create_products",
        r#"
        CREATE TABLE IF NOT EXISTS products (
            id           BIGSERIAL PRIMARY KEY,
            name         TEXT NOT NULL UNIQUE,
            description  TEXT NULL,
            brand        TEXT NULL,
            updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "create_items",
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id               BIGSERIAL PRIMARY KEY,
            item_code        TEXT NOT NULL UNIQUE,
            name             TEXT NOT NULL,
            unit_of_measure  TEXT NULL,
            product_id       BIGINT NOT NULL REFERENCES products (id),
            updated_at       TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "create_item_attributes",
        r#"
        CREATE TABLE IF NOT EXISTS item_attributes (
            id          BIGSERIAL PRIMARY KEY,
            item_id     BIGINT NOT NULL UNIQUE REFERENCES items (id) ON DELETE CASCADE,
            list_price  DOUBLE PRECISION NULL,
            weight_kg   DOUBLE PRECISION NULL,
            length_mm   DOUBLE PRECISION NULL,
            width_mm    DOUBLE PRECISION NULL,
            height_mm   DOUBLE PRECISION NULL,
            color       TEXT NULL,
            material    TEXT NULL,
            updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "create_content_sections",
        r#"
        CREATE TABLE IF NOT EXISTS content_sections (
            id          BIGSERIAL PRIMARY KEY,
            item_id     BIGINT NOT NULL REFERENCES items (id) ON DELETE CASCADE,
            section     TEXT NOT NULL,
            body        TEXT NOT NULL,
            updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            CONSTRAINT content_sections_key UNIQUE (item_id, section)
        )
        "#,
    ),
    (
        "create_item_categories",
        r#"
        CREATE TABLE IF NOT EXISTS item_categories (
            item_id   BIGINT NOT NULL REFERENCES items (id) ON DELETE CASCADE,
            category  TEXT NOT NULL,
            PRIMARY KEY (item_id, category)
        )
        "#,
    ),
    (
        "create_item_tags",
        r#"
        CREATE TABLE IF NOT EXISTS item_tags (
            item_id  BIGINT NOT NULL REFERENCES items (id) ON DELETE CASCADE,
            tag      TEXT NOT NULL,
            PRIMARY KEY (item_id, tag)
        )
        "#,
    ),
    (
        "create_item_relations",
        r#"
        CREATE TABLE IF NOT EXISTS item_relations (
            item_id            BIGINT NOT NULL REFERENCES items (id) ON DELETE CASCADE,
            related_item_code  TEXT NOT NULL,
            PRIMARY KEY (item_id, related_item_code)
        )
        "#,
    ),
];

/// Map SQLx errors to StoreError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                Some("23505") => StoreError::UniqueViolation(msg),
                Some("23503") => StoreError::ForeignKeyViolation(msg),
                Some("23514") => StoreError::CheckViolation(msg),
                // deadlock_detected, lock_not_available, serialization_failure
                Some("40P01") | Some("55P03") | Some("40001") => StoreError::LockContention(msg),
                // admin_shutdown, cannot_connect_now
                Some("57P01") | Some("57P03") => StoreError::Connectivity(msg),
                _ => StoreError::Query(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => StoreError::Timeout(Duration::ZERO),
        sqlx::Error::Io(e) => StoreError::Connectivity(format!("io error in {}: {}", operation, e)),
        sqlx::Error::Tls(e) => StoreError::Connectivity(format!("tls error in {}: {}", operation, e)),
        sqlx::Error::RowNotFound => {
            StoreError::NotFound(format!("unexpected row not found in {}", operation))
        }
        _ => StoreError::Query(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Read a typed column, turning decode failures into `StoreError::Query`.
pub(crate) fn column<'r, T>(row: &'r sqlx::postgres::PgRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    use sqlx::Row;
    row.try_get(name)
        .map_err(|e| StoreError::Query(format!("failed to read {}: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_are_classified() {
        assert!(matches!(
            map_sqlx_error("find", sqlx::Error::PoolClosed),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            map_sqlx_error("find", sqlx::Error::PoolTimedOut),
            StoreError::Timeout(_)
        ));
        assert!(matches!(
            map_sqlx_error("find", sqlx::Error::RowNotFound),
            StoreError::NotFound(_)
        ));
    }

    #[test]
    fn schema_declares_natural_key_constraints() {
        let ddl: String = SCHEMA.iter().map(|(_, sql)| *sql).collect();
        assert!(ddl.contains("name         TEXT NOT NULL UNIQUE"));
        assert!(ddl.contains("item_code        TEXT NOT NULL UNIQUE"));
        assert!(ddl.contains("UNIQUE (job_id, source_row_number)"));
        assert!(ddl.contains("ON DELETE CASCADE"));
    }
}
