//! Postgres-backed sync queue (`sync_queue`).
//!
//! Rows are decoded into [`QueueEntryRow`] by column name and converted into
//! typed entries before leaving this module, so callers never see driver
//! rows or positional tuples.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use catalogsync_core::QueueEntryId;

use super::store::{QueueError, SyncQueue};
use super::types::{NewQueueEntry, QueueEntry, QueueStatus};
use crate::db::map_sqlx_error;

const ENTRY_COLUMNS: &str = "id, subject_id, event_type, priority, status, event_data, created_at, retries";

#[derive(Debug, Clone)]
pub struct PostgresSyncQueue {
    pool: Arc<PgPool>,
}

impl PostgresSyncQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[derive(Debug)]
struct QueueEntryRow {
    id: i64,
    subject_id: String,
    event_type: String,
    priority: String,
    status: String,
    event_data: serde_json::Value,
    created_at: DateTime<Utc>,
    retries: i32,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for QueueEntryRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(QueueEntryRow {
            id: row.try_get("id")?,
            subject_id: row.try_get("subject_id")?,
            event_type: row.try_get("event_type")?,
            priority: row.try_get("priority")?,
            status: row.try_get("status")?,
            event_data: row.try_get("event_data")?,
            created_at: row.try_get("created_at")?,
            retries: row.try_get("retries")?,
        })
    }
}

impl TryFrom<QueueEntryRow> for QueueEntry {
    type Error = QueueError;

    fn try_from(row: QueueEntryRow) -> Result<Self, Self::Error> {
        let malformed = |e: catalogsync_core::DomainError| QueueError::Malformed(format!("entry {}: {e}", row.id));
        let retries = u32::try_from(row.retries)
            .map_err(|_| QueueError::Malformed(format!("entry {}: negative retries {}", row.id, row.retries)))?;
        Ok(QueueEntry {
            id: QueueEntryId::new(row.id),
            priority: row.priority.parse().map_err(malformed)?,
            status: row.status.parse().map_err(malformed)?,
            subject_id: row.subject_id,
            event_type: row.event_type,
            event_data: row.event_data,
            created_at: row.created_at,
            retries,
        })
    }
}

fn decode(row: &sqlx::postgres::PgRow) -> Result<QueueEntry, QueueError> {
    let row = QueueEntryRow::from_row(row).map_err(|e| QueueError::Malformed(e.to_string()))?;
    QueueEntry::try_from(row)
}

#[async_trait]
impl SyncQueue for PostgresSyncQueue {
    #[instrument(skip(self, entry), fields(subject_id = %entry.subject_id, priority = %entry.priority), err)]
    async fn enqueue(&self, entry: NewQueueEntry) -> Result<QueueEntry, QueueError> {
        let sql = format!(
            "INSERT INTO sync_queue (subject_id, event_type, priority, status, event_data) \
             VALUES ($1, $2, $3, 'PENDING', $4) RETURNING {ENTRY_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(&entry.subject_id)
            .bind(&entry.event_type)
            .bind(entry.priority.as_str())
            .bind(&entry.event_data)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("enqueue", e))?;
        decode(&row)
    }

    async fn get(&self, id: QueueEntryId) -> Result<Option<QueueEntry>, QueueError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM sync_queue WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("queue_get", e))?;
        row.as_ref().map(decode).transpose()
    }

    #[instrument(skip(self), err)]
    async fn pending(&self, limit: usize) -> Result<Vec<QueueEntry>, QueueError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM sync_queue WHERE status = 'PENDING' \
             ORDER BY CASE priority WHEN 'HIGH' THEN 0 WHEN 'NORMAL' THEN 1 WHEN 'LOW' THEN 2 ELSE 3 END, \
             created_at ASC, id ASC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("queue_pending", e))?;
        rows.iter().map(decode).collect()
    }

    #[instrument(skip(self), fields(id = %id, from = %from, to = %to), err)]
    async fn set_status(
        &self,
        id: QueueEntryId,
        from: QueueStatus,
        to: QueueStatus,
    ) -> Result<QueueEntry, QueueError> {
        if !from.can_transition_to(to) {
            return Err(QueueError::InvalidTransition { id, from, to });
        }

        let sql = format!(
            "UPDATE sync_queue SET status = $2 WHERE id = $1 AND status = $3 RETURNING {ENTRY_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.get())
            .bind(to.as_str())
            .bind(from.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("queue_set_status", e))?;

        match row {
            Some(row) => decode(&row),
            None => match self.get(id).await? {
                Some(current) => Err(QueueError::Conflict {
                    id,
                    expected: from,
                    actual: current.status,
                }),
                None => Err(QueueError::NotFound(id)),
            },
        }
    }

    #[instrument(skip(self), fields(id = %id), err)]
    async fn requeue(&self, id: QueueEntryId) -> Result<QueueEntry, QueueError> {
        let sql = format!(
            "UPDATE sync_queue SET status = 'PENDING', retries = retries + 1 \
             WHERE id = $1 AND status = 'PROCESSING' RETURNING {ENTRY_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("queue_requeue", e))?;

        match row {
            Some(row) => decode(&row),
            None => match self.get(id).await? {
                Some(current) => Err(QueueError::Conflict {
                    id,
                    expected: QueueStatus::Processing,
                    actual: current.status,
                }),
                None => Err(QueueError::NotFound(id)),
            },
        }
    }
}
