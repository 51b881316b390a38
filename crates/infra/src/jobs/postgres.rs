//! Postgres-backed job store (`import_jobs` / `import_job_items`).
//!
//! Status transitions are validated in Rust and then applied with a
//! compare-and-set on the current status, so two writers racing on the
//! same job cannot both win.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use catalogsync_core::{ItemId, JobId};

use super::store::{check_counters, JobFilter, JobStore, JobStoreError};
use super::types::{
    Item, ItemStats, ItemStatus, Job, JobCounters, JobOutcome, JobStatus, NewItem, NewJob,
};
use crate::db::{column, map_sqlx_error};
use crate::error::StoreError;

const JOB_COLUMNS: &str = "id, uuid, kind, status, total_items, processed_items, succeeded_items, \
     failed_items, created_at, started_at, completed_at, created_by, error_message";

const ITEM_COLUMNS: &str = "id, job_id, source_code, status, retry_count, max_retries, \
     last_error_type, last_error_message, source_row_number, first_attempted_at, \
     last_attempted_at, succeeded_at, retry_after";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn current_status(&self, id: JobId) -> Result<JobStatus, JobStoreError> {
        let row = sqlx::query("SELECT status FROM import_jobs WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_status", e))?
            .ok_or(JobStoreError::NotFound(id))?;
        parse(column::<String>(&row, "status")?)
    }
}

fn parse<T>(raw: String) -> Result<T, JobStoreError>
where
    T: core::str::FromStr<Err = catalogsync_core::DomainError>,
{
    raw.parse()
        .map_err(|e: catalogsync_core::DomainError| StoreError::Query(e.to_string()).into())
}

fn to_u64(value: i64) -> u64 {
    value.max(0) as u64
}

/// `LIMIT` bind value; no limit and oversized limits both mean "all rows".
fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map_or(i64::MAX, |l| i64::try_from(l).unwrap_or(i64::MAX))
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    Ok(Job {
        id: JobId::new(column(row, "id")?),
        uuid: column(row, "uuid")?,
        kind: parse(column(row, "kind")?)?,
        status: parse(column(row, "status")?)?,
        total_items: to_u64(column(row, "total_items")?),
        processed_items: to_u64(column(row, "processed_items")?),
        succeeded_items: to_u64(column(row, "succeeded_items")?),
        failed_items: to_u64(column(row, "failed_items")?),
        created_at: column(row, "created_at")?,
        started_at: column(row, "started_at")?,
        completed_at: column(row, "completed_at")?,
        created_by: column(row, "created_by")?,
        error_message: column(row, "error_message")?,
    })
}

fn item_from_row(row: &PgRow) -> Result<Item, JobStoreError> {
    let last_error_type: Option<String> = column(row, "last_error_type")?;
    Ok(Item {
        id: ItemId::new(column(row, "id")?),
        job_id: JobId::new(column(row, "job_id")?),
        source_code: column(row, "source_code")?,
        status: parse(column(row, "status")?)?,
        retry_count: column::<i32>(row, "retry_count")?.max(0) as u32,
        max_retries: column::<i32>(row, "max_retries")?.max(0) as u32,
        last_error_type: last_error_type.map(parse::<crate::retry::ErrorKind>).transpose()?,
        last_error_message: column(row, "last_error_message")?,
        source_row_number: to_u64(column(row, "source_row_number")?),
        first_attempted_at: column::<Option<DateTime<Utc>>>(row, "first_attempted_at")?,
        last_attempted_at: column(row, "last_attempted_at")?,
        succeeded_at: column(row, "succeeded_at")?,
        retry_after: column(row, "retry_after")?,
    })
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, new), fields(kind = %new.kind, total = new.total_items), err)]
    async fn create_job(&self, new: NewJob) -> Result<Job, JobStoreError> {
        let sql = format!(
            "INSERT INTO import_jobs (uuid, kind, status, total_items, created_by) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::now_v7())
            .bind(new.kind.as_str())
            .bind(JobStatus::Pending.as_str())
            .bind(new.total_items as i64)
            .bind(&new.created_by)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_job", e))?;
        job_from_row(&row)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get_job(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM import_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_job_by_uuid(&self, uuid: Uuid) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM import_jobs WHERE uuid = $1");
        let row = sqlx::query(&sql)
            .bind(uuid)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_job_by_uuid", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM import_jobs \
             WHERE ($1::text IS NULL OR kind = $1) AND ($2::text IS NULL OR status = $2) \
             ORDER BY created_at DESC, id DESC LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(filter.kind.map(|k| k.as_str()))
            .bind(filter.status.map(|s| s.as_str()))
            .bind(sql_limit(filter.limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), fields(job_id = %id, to = %next), err)]
    async fn transition_job(&self, id: JobId, next: JobStatus) -> Result<Job, JobStoreError> {
        let from = self.current_status(id).await?;
        if !from.can_transition_to(next) {
            return Err(JobStoreError::InvalidTransition { id, from, to: next });
        }

        let sql = format!(
            "UPDATE import_jobs SET status = $2, \
                 started_at = CASE WHEN $2 = 'processing' THEN COALESCE(started_at, NOW()) ELSE started_at END, \
                 completed_at = CASE WHEN $4 THEN NOW() ELSE completed_at END \
             WHERE id = $1 AND status = $3 RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.get())
            .bind(next.as_str())
            .bind(from.as_str())
            .bind(next.is_terminal())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("transition_job", e))?;

        match row {
            Some(row) => job_from_row(&row),
            // Someone else moved the job between our read and write.
            None => Err(JobStoreError::InvalidTransition {
                id,
                from: self.current_status(id).await?,
                to: next,
            }),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn save_counters(&self, id: JobId, counters: JobCounters) -> Result<(), JobStoreError> {
        check_counters(id, &counters)?;
        let result = sqlx::query(
            r#"
            UPDATE import_jobs
            SET total_items = $2, processed_items = $3, succeeded_items = $4, failed_items = $5
            WHERE id = $1
            "#,
        )
        .bind(id.get())
        .bind(counters.total as i64)
        .bind(counters.processed as i64)
        .bind(counters.succeeded as i64)
        .bind(counters.failed as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_counters", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self, outcome), fields(job_id = %id, status = %outcome.status), err)]
    async fn finish_job(&self, id: JobId, outcome: JobOutcome) -> Result<Job, JobStoreError> {
        check_counters(id, &outcome.counters)?;
        let from = self.current_status(id).await?;
        if !outcome.status.is_terminal() || !from.can_transition_to(outcome.status) {
            return Err(JobStoreError::InvalidTransition { id, from, to: outcome.status });
        }

        let sql = format!(
            "UPDATE import_jobs SET status = $2, total_items = $4, processed_items = $5, \
                 succeeded_items = $6, failed_items = $7, error_message = $8, completed_at = NOW() \
             WHERE id = $1 AND status = $3 RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.get())
            .bind(outcome.status.as_str())
            .bind(from.as_str())
            .bind(outcome.counters.total as i64)
            .bind(outcome.counters.processed as i64)
            .bind(outcome.counters.succeeded as i64)
            .bind(outcome.counters.failed as i64)
            .bind(&outcome.error_message)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("finish_job", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(JobStoreError::InvalidTransition {
                id,
                from: self.current_status(id).await?,
                to: outcome.status,
            }),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn delete_job(&self, id: JobId) -> Result<bool, JobStoreError> {
        let result = sqlx::query("DELETE FROM import_jobs WHERE id = $1")
            .bind(id.get())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_job", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, items), fields(job_id = %job_id, count = items.len()), err)]
    async fn add_items(&self, job_id: JobId, items: Vec<NewItem>) -> Result<Vec<Item>, JobStoreError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let codes: Vec<String> = items.iter().map(|i| i.source_code.clone()).collect();
        let rows: Vec<i64> = items.iter().map(|i| i.source_row_number as i64).collect();
        let caps: Vec<i32> = items.iter().map(|i| i.max_retries as i32).collect();

        let sql = format!(
            "INSERT INTO import_job_items (job_id, source_code, status, source_row_number, max_retries) \
             SELECT $1, code, $2, row_number, cap \
             FROM UNNEST($3::text[], $4::bigint[], $5::int[]) AS t(code, row_number, cap) \
             RETURNING {ITEM_COLUMNS}"
        );
        let inserted = sqlx::query(&sql)
            .bind(job_id.get())
            .bind(ItemStatus::Pending.as_str())
            .bind(&codes)
            .bind(&rows)
            .bind(&caps)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| match map_sqlx_error("add_items", e) {
                StoreError::ForeignKeyViolation(_) => JobStoreError::NotFound(job_id),
                StoreError::UniqueViolation(msg) => {
                    tracing::warn!(job_id = %job_id, error = %msg, "duplicate item row");
                    JobStoreError::DuplicateRow {
                        job_id,
                        row: rows.first().copied().unwrap_or_default().max(0) as u64,
                    }
                }
                other => other.into(),
            })?;

        let mut created: Vec<Item> = inserted.iter().map(item_from_row).collect::<Result<_, _>>()?;
        created.sort_by_key(|i| i.source_row_number);
        Ok(created)
    }

    #[instrument(skip(self), fields(item_id = %id), err)]
    async fn get_item(&self, id: ItemId) -> Result<Option<Item>, JobStoreError> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM import_job_items WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_item", e))?;
        row.as_ref().map(item_from_row).transpose()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn find_item_by_row(&self, job_id: JobId, row: u64) -> Result<Option<Item>, JobStoreError> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM import_job_items WHERE job_id = $1 AND source_row_number = $2"
        );
        let found = sqlx::query(&sql)
            .bind(job_id.get())
            .bind(row as i64)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_item_by_row", e))?;
        found.as_ref().map(item_from_row).transpose()
    }

    #[instrument(skip(self, item), fields(item_id = %item.id, status = %item.status), err)]
    async fn update_item(&self, item: &Item) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE import_job_items
            SET status = $2,
                retry_count = $3,
                last_error_type = $4,
                last_error_message = $5,
                first_attempted_at = $6,
                last_attempted_at = $7,
                succeeded_at = $8,
                retry_after = $9
            WHERE id = $1
            "#,
        )
        .bind(item.id.get())
        .bind(item.status.as_str())
        .bind(item.retry_count as i32)
        .bind(item.last_error_type.map(|k| k.as_str()))
        .bind(&item.last_error_message)
        .bind(item.first_attempted_at)
        .bind(item.last_attempted_at)
        .bind(item.succeeded_at)
        .bind(item.retry_after)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_item", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::ItemNotFound(item.id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn list_items(
        &self,
        job_id: JobId,
        status: Option<ItemStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Item>, JobStoreError> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM import_job_items \
             WHERE job_id = $1 AND ($2::text IS NULL OR status = $2) \
             ORDER BY source_row_number ASC LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(job_id.get())
            .bind(status.map(|s| s.as_str()))
            .bind(sql_limit(limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_items", e))?;
        rows.iter().map(item_from_row).collect()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn item_stats(&self, job_id: JobId) -> Result<ItemStats, JobStoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM import_job_items WHERE job_id = $1 GROUP BY status",
        )
        .bind(job_id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("item_stats", e))?;

        let mut stats = ItemStats::default();
        for row in &rows {
            let status: ItemStatus = parse(column(row, "status")?)?;
            stats.add(status, to_u64(column(row, "count")?));
        }
        Ok(stats)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn resume_cursor(&self, job_id: JobId) -> Result<u64, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(source_row_number), 0) AS cursor
            FROM import_job_items
            WHERE job_id = $1 AND status NOT IN ('pending', 'processing')
            "#,
        )
        .bind(job_id.get())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("resume_cursor", e))?;
        Ok(to_u64(column(&row, "cursor")?))
    }
}
