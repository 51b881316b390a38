//! Sync queue storage and the in-memory implementation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use catalogsync_core::QueueEntryId;

use super::types::{dequeue_order, NewQueueEntry, QueueEntry, QueueStatus};
use crate::error::StoreError;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue entry not found: {0}")]
    NotFound(QueueEntryId),
    #[error("queue entry {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: QueueEntryId,
        from: QueueStatus,
        to: QueueStatus,
    },
    /// The entry was no longer in the expected status (claimed elsewhere).
    #[error("queue entry {id} is {actual}, expected {expected}")]
    Conflict {
        id: QueueEntryId,
        expected: QueueStatus,
        actual: QueueStatus,
    },
    /// A stored row could not be read back as an entry.
    #[error("malformed queue row: {0}")]
    Malformed(String),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl QueueError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, QueueError::Storage(e) if e.is_unavailable())
    }
}

/// Storage of queue entries.
///
/// Only the dequeuer changes entry status; producers only `enqueue`.
#[async_trait]
pub trait SyncQueue: Send + Sync {
    async fn enqueue(&self, entry: NewQueueEntry) -> Result<QueueEntry, QueueError>;

    async fn get(&self, id: QueueEntryId) -> Result<Option<QueueEntry>, QueueError>;

    /// Up to `limit` PENDING entries: HIGH before NORMAL before LOW, oldest
    /// first within a priority.
    async fn pending(&self, limit: usize) -> Result<Vec<QueueEntry>, QueueError>;

    /// Compare-and-set `from -> to`.
    async fn set_status(
        &self,
        id: QueueEntryId,
        from: QueueStatus,
        to: QueueStatus,
    ) -> Result<QueueEntry, QueueError>;

    /// Release a PROCESSING entry back to PENDING and count one retry.
    async fn requeue(&self, id: QueueEntryId) -> Result<QueueEntry, QueueError>;
}

#[async_trait]
impl<Q> SyncQueue for Arc<Q>
where
    Q: SyncQueue + ?Sized,
{
    async fn enqueue(&self, entry: NewQueueEntry) -> Result<QueueEntry, QueueError> {
        (**self).enqueue(entry).await
    }

    async fn get(&self, id: QueueEntryId) -> Result<Option<QueueEntry>, QueueError> {
        (**self).get(id).await
    }

    async fn pending(&self, limit: usize) -> Result<Vec<QueueEntry>, QueueError> {
        (**self).pending(limit).await
    }

    async fn set_status(
        &self,
        id: QueueEntryId,
        from: QueueStatus,
        to: QueueStatus,
    ) -> Result<QueueEntry, QueueError> {
        (**self).set_status(id, from, to).await
    }

    async fn requeue(&self, id: QueueEntryId) -> Result<QueueEntry, QueueError> {
        (**self).requeue(id).await
    }
}

/// Validate and apply a status change on a loaded entry.
pub(crate) fn apply_transition(
    entry: &mut QueueEntry,
    from: QueueStatus,
    to: QueueStatus,
) -> Result<(), QueueError> {
    if !from.can_transition_to(to) {
        return Err(QueueError::InvalidTransition { id: entry.id, from, to });
    }
    if entry.status != from {
        return Err(QueueError::Conflict {
            id: entry.id,
            expected: from,
            actual: entry.status,
        });
    }
    entry.status = to;
    Ok(())
}

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    entries: BTreeMap<QueueEntryId, QueueEntry>,
}

/// In-memory sync queue for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySyncQueue {
    state: Mutex<State>,
}

impl InMemorySyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("sync queue lock poisoned".into()).into())
    }

    /// Enqueue with an explicit creation time.
    pub fn enqueue_at(&self, entry: NewQueueEntry, created_at: DateTime<Utc>) -> Result<QueueEntry, QueueError> {
        let mut state = self.lock()?;
        state.next_id += 1;
        let entry = QueueEntry {
            id: QueueEntryId::new(state.next_id),
            subject_id: entry.subject_id,
            event_type: entry.event_type,
            priority: entry.priority,
            status: QueueStatus::Pending,
            event_data: entry.event_data,
            created_at,
            retries: 0,
        };
        state.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    pub fn count(&self, status: QueueStatus) -> usize {
        self.lock()
            .map(|s| s.entries.values().filter(|e| e.status == status).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SyncQueue for InMemorySyncQueue {
    async fn enqueue(&self, entry: NewQueueEntry) -> Result<QueueEntry, QueueError> {
        self.enqueue_at(entry, Utc::now())
    }

    async fn get(&self, id: QueueEntryId) -> Result<Option<QueueEntry>, QueueError> {
        Ok(self.lock()?.entries.get(&id).cloned())
    }

    async fn pending(&self, limit: usize) -> Result<Vec<QueueEntry>, QueueError> {
        let state = self.lock()?;
        let mut pending: Vec<QueueEntry> = state
            .entries
            .values()
            .filter(|e| e.status == QueueStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(dequeue_order);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn set_status(
        &self,
        id: QueueEntryId,
        from: QueueStatus,
        to: QueueStatus,
    ) -> Result<QueueEntry, QueueError> {
        let mut state = self.lock()?;
        let entry = state.entries.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        apply_transition(entry, from, to)?;
        Ok(entry.clone())
    }

    async fn requeue(&self, id: QueueEntryId) -> Result<QueueEntry, QueueError> {
        let mut state = self.lock()?;
        let entry = state.entries.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        apply_transition(entry, QueueStatus::Processing, QueueStatus::Pending)?;
        entry.retries = entry.retries.saturating_add(1);
        Ok(entry.clone())
    }
}
