//! Sync queue of ERP-origin change events and the priority dequeuer.

pub mod postgres;
pub mod store;
pub mod types;

use std::future::Future;
use std::time::Duration;

use tracing::instrument;

use catalogsync_core::QueueEntryId;

use crate::error::StoreError;

pub use postgres::PostgresSyncQueue;
pub use store::{InMemorySyncQueue, QueueError, SyncQueue};
pub use types::{dequeue_order, NewQueueEntry, Priority, QueueEntry, QueueStatus};

/// Selects pending entries by priority then age, and owns every status
/// change of an entry. Every queue call is bounded by `timeout`.
#[derive(Debug, Clone)]
pub struct PriorityDequeuer<Q> {
    queue: Q,
    timeout: Duration,
}

impl<Q: SyncQueue> PriorityDequeuer<Q> {
    pub fn new(queue: Q, timeout: Duration) -> Self {
        Self { queue, timeout }
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T, QueueError>>) -> Result<T, QueueError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| QueueError::Storage(StoreError::Timeout(self.timeout)))?
    }

    /// Up to `limit` PENDING entries, HIGH before NORMAL before LOW and
    /// oldest first within a priority. Entries are not claimed.
    #[instrument(skip(self), err)]
    pub async fn get_next_batch(&self, limit: usize) -> Result<Vec<QueueEntry>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let batch = self.bounded(self.queue.pending(limit)).await?;
        tracing::debug!(count = batch.len(), "dequeued sync batch");
        Ok(batch)
    }

    /// Move an entry to `status` from wherever it legally can be.
    pub async fn update_status(&self, id: QueueEntryId, status: QueueStatus) -> Result<QueueEntry, QueueError> {
        let current = self
            .bounded(self.queue.get(id))
            .await?
            .ok_or(QueueError::NotFound(id))?;
        if current.status == status {
            return Ok(current);
        }
        self.bounded(self.queue.set_status(id, current.status, status)).await
    }

    /// Claim a PENDING entry; fails with `Conflict` if someone else did.
    pub async fn claim(&self, id: QueueEntryId) -> Result<QueueEntry, QueueError> {
        self.bounded(
            self.queue
                .set_status(id, QueueStatus::Pending, QueueStatus::Processing),
        )
        .await
    }

    /// Hand a claimed entry back for a later batch after a retryable failure.
    pub async fn requeue(&self, id: QueueEntryId) -> Result<QueueEntry, QueueError> {
        self.bounded(self.queue.requeue(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use proptest::prelude::*;
    use serde_json::json;

    const TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

    fn entry(subject: &str, priority: Priority) -> NewQueueEntry {
        NewQueueEntry::new(subject, "item.updated", json!({ "item_code": subject })).with_priority(priority)
    }

    #[tokio::test]
    async fn priority_dominates_age() {
        let queue = InMemorySyncQueue::new();
        let t1 = Utc.with_ymd_and_hms(2026, 1, 1, 8, 0, 0).unwrap();
        let t2 = t1 + ChronoDuration::minutes(5);
        queue.enqueue_at(entry("LOW-OLD", Priority::Low), t1).unwrap();
        queue.enqueue_at(entry("HIGH-NEW", Priority::High), t2).unwrap();

        let dequeuer = PriorityDequeuer::new(queue, TIMEOUT);
        let batch = dequeuer.get_next_batch(10).await.unwrap();
        let subjects: Vec<&str> = batch.iter().map(|e| e.subject_id.as_str()).collect();
        assert_eq!(subjects, vec!["HIGH-NEW", "LOW-OLD"]);
    }

    #[tokio::test]
    async fn batch_respects_limit() {
        let queue = InMemorySyncQueue::new();
        for i in 0..5 {
            queue.enqueue(entry(&format!("A-{i}"), Priority::Normal)).await.unwrap();
        }
        let dequeuer = PriorityDequeuer::new(queue, TIMEOUT);
        assert_eq!(dequeuer.get_next_batch(3).await.unwrap().len(), 3);
        assert!(dequeuer.get_next_batch(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dequeued_entries_are_plain_records() {
        let queue = InMemorySyncQueue::new();
        queue.enqueue(entry("A-1", Priority::High)).await.unwrap();
        let dequeuer = PriorityDequeuer::new(queue, TIMEOUT);

        let batch = dequeuer.get_next_batch(1).await.unwrap();
        let value = serde_json::to_value(&batch[0]).unwrap();
        let object = value.as_object().expect("entry serializes as an object");
        for key in ["id", "subject_id", "event_type", "priority", "status", "event_data", "created_at"] {
            assert!(object.contains_key(key), "missing field {key}");
        }
        assert!(object["id"].is_i64());
        assert_eq!(object["priority"], json!("HIGH"));
        assert_eq!(object["status"], json!("PENDING"));
        assert!(object["event_data"].is_object());
        assert!(!value.is_array());
    }

    #[tokio::test]
    async fn update_status_walks_the_lifecycle() {
        let queue = InMemorySyncQueue::new();
        let e = queue.enqueue(entry("A-1", Priority::Normal)).await.unwrap();
        let dequeuer = PriorityDequeuer::new(queue, TIMEOUT);

        dequeuer.claim(e.id).await.unwrap();
        assert!(matches!(dequeuer.claim(e.id).await, Err(QueueError::Conflict { .. })));
        let done = dequeuer.update_status(e.id, QueueStatus::Done).await.unwrap();
        assert_eq!(done.status, QueueStatus::Done);
        assert!(matches!(
            dequeuer.update_status(e.id, QueueStatus::Pending).await,
            Err(QueueError::InvalidTransition { .. })
        ));
        assert!(dequeuer.get_next_batch(10).await.unwrap().is_empty());
    }

    /// A queue whose calls never return.
    struct StalledQueue;

    #[async_trait::async_trait]
    impl SyncQueue for StalledQueue {
        async fn enqueue(&self, _entry: NewQueueEntry) -> Result<QueueEntry, QueueError> {
            std::future::pending().await
        }

        async fn get(&self, _id: QueueEntryId) -> Result<Option<QueueEntry>, QueueError> {
            std::future::pending().await
        }

        async fn pending(&self, _limit: usize) -> Result<Vec<QueueEntry>, QueueError> {
            std::future::pending().await
        }

        async fn set_status(
            &self,
            _id: QueueEntryId,
            _from: QueueStatus,
            _to: QueueStatus,
        ) -> Result<QueueEntry, QueueError> {
            std::future::pending().await
        }

        async fn requeue(&self, _id: QueueEntryId) -> Result<QueueEntry, QueueError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn stalled_queue_calls_time_out() {
        let timeout = std::time::Duration::from_millis(20);
        let dequeuer = PriorityDequeuer::new(StalledQueue, timeout);
        let id = QueueEntryId::new(1);

        for result in [
            dequeuer.claim(id).await,
            dequeuer.update_status(id, QueueStatus::Done).await,
            dequeuer.requeue(id).await,
        ] {
            assert_eq!(result.unwrap_err(), QueueError::Storage(StoreError::Timeout(timeout)));
        }
        assert!(matches!(
            dequeuer.get_next_batch(5).await,
            Err(QueueError::Storage(StoreError::Timeout(_)))
        ));
    }

    fn arb_priority() -> impl Strategy<Value = Priority> {
        prop_oneof![Just(Priority::High), Just(Priority::Normal), Just(Priority::Low)]
    }

    proptest! {
        #[test]
        fn batches_are_sorted_by_priority_then_age(
            specs in prop::collection::vec((arb_priority(), 0i64..10_000), 1..40),
            limit in 1usize..50,
        ) {
            let queue = InMemorySyncQueue::new();
            let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
            for (i, (priority, offset)) in specs.iter().enumerate() {
                queue
                    .enqueue_at(entry(&format!("S-{i}"), *priority), base + ChronoDuration::seconds(*offset))
                    .unwrap();
            }

            let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
            let batch = rt.block_on(PriorityDequeuer::new(queue, TIMEOUT).get_next_batch(limit)).unwrap();

            prop_assert_eq!(batch.len(), limit.min(specs.len()));
            for pair in batch.windows(2) {
                prop_assert!(pair[0].priority <= pair[1].priority);
                if pair[0].priority == pair[1].priority {
                    prop_assert!(pair[0].created_at <= pair[1].created_at);
                }
            }
            // Nothing skipped: every omitted entry sorts after the last one returned.
            if let Some(last) = batch.last() {
                let higher_left_out = specs.len() > batch.len()
                    && specs.iter().filter(|(p, _)| *p < last.priority).count()
                        > batch.iter().filter(|e| e.priority < last.priority).count();
                prop_assert!(!higher_left_out);
            }
        }
    }
}
