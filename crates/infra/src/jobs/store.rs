//! Job/Item store abstraction and the in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use catalogsync_core::{DomainError, ItemId, JobId};

use super::types::{
    Item, ItemStats, ItemStatus, Job, JobCounters, JobKind, JobOutcome, JobStatus, NewItem, NewJob,
};
use crate::error::StoreError;

/// Filter for [`JobStore::list_jobs`]. Newest jobs come first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub kind: Option<JobKind>,
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

/// Persistence of jobs and the items they own.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, new: NewJob) -> Result<Job, JobStoreError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    async fn find_job_by_uuid(&self, uuid: Uuid) -> Result<Option<Job>, JobStoreError>;

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, JobStoreError>;

    /// Move a job to `next`, enforcing the lifecycle.
    async fn transition_job(&self, id: JobId, next: JobStatus) -> Result<Job, JobStoreError>;

    /// Persist in-flight counters without touching the status.
    async fn save_counters(&self, id: JobId, counters: JobCounters) -> Result<(), JobStoreError>;

    /// Write final counters and a terminal status in one step.
    async fn finish_job(&self, id: JobId, outcome: JobOutcome) -> Result<Job, JobStoreError>;

    /// Delete a job and (cascading) its items. Returns whether it existed.
    async fn delete_job(&self, id: JobId) -> Result<bool, JobStoreError>;

    async fn add_items(&self, job_id: JobId, items: Vec<NewItem>) -> Result<Vec<Item>, JobStoreError>;

    async fn get_item(&self, id: ItemId) -> Result<Option<Item>, JobStoreError>;

    async fn find_item_by_row(&self, job_id: JobId, row: u64) -> Result<Option<Item>, JobStoreError>;

    async fn update_item(&self, item: &Item) -> Result<(), JobStoreError>;

    /// Items of a job in row order, optionally filtered by status.
    async fn list_items(
        &self,
        job_id: JobId,
        status: Option<ItemStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Item>, JobStoreError>;

    async fn item_stats(&self, job_id: JobId) -> Result<ItemStats, JobStoreError>;

    /// Highest row number whose item is settled (0 when none is).
    async fn resume_cursor(&self, job_id: JobId) -> Result<u64, JobStoreError>;
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("item not found: {0}")]
    ItemNotFound(ItemId),
    #[error("job {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("job {id}: {reason}")]
    InvalidCounters { id: JobId, reason: String },
    #[error("job {job_id} already has an item for row {row}")]
    DuplicateRow { job_id: JobId, row: u64 },
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl JobStoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, JobStoreError::Storage(e) if e.is_unavailable())
    }
}

/// Validate a counter update against the job's invariant.
pub(crate) fn check_counters(id: JobId, counters: &JobCounters) -> Result<(), JobStoreError> {
    counters.check().map_err(|e| JobStoreError::InvalidCounters {
        id,
        reason: match e {
            DomainError::InvariantViolation(msg) => msg,
            other => other.to_string(),
        },
    })
}

#[derive(Debug, Default)]
struct State {
    next_job_id: i64,
    next_item_id: i64,
    jobs: HashMap<JobId, Job>,
    items: HashMap<ItemId, Item>,
    /// Row-ordered item index per job.
    rows: HashMap<JobId, BTreeMap<u64, ItemId>>,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: RwLock<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, JobStoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Unavailable("job store lock poisoned".into()).into())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, JobStoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Unavailable("job store lock poisoned".into()).into())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, new: NewJob) -> Result<Job, JobStoreError> {
        let mut state = self.write()?;
        state.next_job_id += 1;
        let job = Job::new(JobId::new(state.next_job_id), new, Utc::now());
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    async fn find_job_by_uuid(&self, uuid: Uuid) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.values().find(|j| j.uuid == uuid).cloned())
    }

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let state = self.read()?;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| filter.kind.is_none_or(|k| j.kind == k))
            .filter(|j| filter.status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn transition_job(&self, id: JobId, next: JobStatus) -> Result<Job, JobStoreError> {
        let mut state = self.write()?;
        let job = state.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        let from = job.status;
        job.transition(next, Utc::now())
            .map_err(|_| JobStoreError::InvalidTransition { id, from, to: next })?;
        Ok(job.clone())
    }

    async fn save_counters(&self, id: JobId, counters: JobCounters) -> Result<(), JobStoreError> {
        check_counters(id, &counters)?;
        let mut state = self.write()?;
        let job = state.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        job.set_counters(counters);
        Ok(())
    }

    async fn finish_job(&self, id: JobId, outcome: JobOutcome) -> Result<Job, JobStoreError> {
        check_counters(id, &outcome.counters)?;
        let mut state = self.write()?;
        let job = state.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        let from = job.status;
        if !outcome.status.is_terminal() {
            return Err(JobStoreError::InvalidTransition { id, from, to: outcome.status });
        }
        job.transition(outcome.status, Utc::now())
            .map_err(|_| JobStoreError::InvalidTransition { id, from, to: outcome.status })?;
        job.set_counters(outcome.counters);
        job.error_message = outcome.error_message;
        Ok(job.clone())
    }

    async fn delete_job(&self, id: JobId) -> Result<bool, JobStoreError> {
        let mut state = self.write()?;
        let existed = state.jobs.remove(&id).is_some();
        if let Some(rows) = state.rows.remove(&id) {
            for item_id in rows.values() {
                state.items.remove(item_id);
            }
        }
        Ok(existed)
    }

    async fn add_items(&self, job_id: JobId, items: Vec<NewItem>) -> Result<Vec<Item>, JobStoreError> {
        let mut state = self.write()?;
        if !state.jobs.contains_key(&job_id) {
            return Err(JobStoreError::NotFound(job_id));
        }

        // Reject the whole batch before writing anything.
        let existing = state.rows.get(&job_id);
        let mut seen = std::collections::HashSet::new();
        for new in &items {
            let taken = existing.is_some_and(|rows| rows.contains_key(&new.source_row_number));
            if taken || !seen.insert(new.source_row_number) {
                return Err(JobStoreError::DuplicateRow {
                    job_id,
                    row: new.source_row_number,
                });
            }
        }

        let mut created = Vec::with_capacity(items.len());
        for new in items {
            state.next_item_id += 1;
            let item = Item::new(
                ItemId::new(state.next_item_id),
                job_id,
                new.source_code,
                new.source_row_number,
                new.max_retries,
            );
            state
                .rows
                .entry(job_id)
                .or_default()
                .insert(item.source_row_number, item.id);
            state.items.insert(item.id, item.clone());
            created.push(item);
        }
        Ok(created)
    }

    async fn get_item(&self, id: ItemId) -> Result<Option<Item>, JobStoreError> {
        Ok(self.read()?.items.get(&id).cloned())
    }

    async fn find_item_by_row(&self, job_id: JobId, row: u64) -> Result<Option<Item>, JobStoreError> {
        let state = self.read()?;
        Ok(state
            .rows
            .get(&job_id)
            .and_then(|rows| rows.get(&row))
            .and_then(|id| state.items.get(id))
            .cloned())
    }

    async fn update_item(&self, item: &Item) -> Result<(), JobStoreError> {
        if item.retry_count > item.max_retries {
            return Err(StoreError::CheckViolation(format!(
                "item {}: retry_count {} exceeds max_retries {}",
                item.id, item.retry_count, item.max_retries
            ))
            .into());
        }
        let mut state = self.write()?;
        let slot = state
            .items
            .get_mut(&item.id)
            .ok_or(JobStoreError::ItemNotFound(item.id))?;
        *slot = item.clone();
        Ok(())
    }

    async fn list_items(
        &self,
        job_id: JobId,
        status: Option<ItemStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Item>, JobStoreError> {
        let state = self.read()?;
        let Some(rows) = state.rows.get(&job_id) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .values()
            .filter_map(|id| state.items.get(id))
            .filter(|item| status.is_none_or(|s| item.status == s))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn item_stats(&self, job_id: JobId) -> Result<ItemStats, JobStoreError> {
        let state = self.read()?;
        let mut stats = ItemStats::default();
        if let Some(rows) = state.rows.get(&job_id) {
            for item in rows.values().filter_map(|id| state.items.get(id)) {
                stats.add(item.status, 1);
            }
        }
        Ok(stats)
    }

    async fn resume_cursor(&self, job_id: JobId) -> Result<u64, JobStoreError> {
        let state = self.read()?;
        Ok(state
            .rows
            .get(&job_id)
            .into_iter()
            .flat_map(|rows| rows.values())
            .filter_map(|id| state.items.get(id))
            .filter(|item| item.status.is_settled())
            .map(|item| item.source_row_number)
            .max()
            .unwrap_or(0))
    }
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn create_job(&self, new: NewJob) -> Result<Job, JobStoreError> {
        (**self).create_job(new).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get_job(id).await
    }

    async fn find_job_by_uuid(&self, uuid: Uuid) -> Result<Option<Job>, JobStoreError> {
        (**self).find_job_by_uuid(uuid).await
    }

    async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_jobs(filter).await
    }

    async fn transition_job(&self, id: JobId, next: JobStatus) -> Result<Job, JobStoreError> {
        (**self).transition_job(id, next).await
    }

    async fn save_counters(&self, id: JobId, counters: JobCounters) -> Result<(), JobStoreError> {
        (**self).save_counters(id, counters).await
    }

    async fn finish_job(&self, id: JobId, outcome: JobOutcome) -> Result<Job, JobStoreError> {
        (**self).finish_job(id, outcome).await
    }

    async fn delete_job(&self, id: JobId) -> Result<bool, JobStoreError> {
        (**self).delete_job(id).await
    }

    async fn add_items(&self, job_id: JobId, items: Vec<NewItem>) -> Result<Vec<Item>, JobStoreError> {
        (**self).add_items(job_id, items).await
    }

    async fn get_item(&self, id: ItemId) -> Result<Option<Item>, JobStoreError> {
        (**self).get_item(id).await
    }

    async fn find_item_by_row(&self, job_id: JobId, row: u64) -> Result<Option<Item>, JobStoreError> {
        (**self).find_item_by_row(job_id, row).await
    }

    async fn update_item(&self, item: &Item) -> Result<(), JobStoreError> {
        (**self).update_item(item).await
    }

    async fn list_items(
        &self,
        job_id: JobId,
        status: Option<ItemStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Item>, JobStoreError> {
        (**self).list_items(job_id, status, limit).await
    }

    async fn item_stats(&self, job_id: JobId) -> Result<ItemStats, JobStoreError> {
        (**self).item_stats(job_id).await
    }

    async fn resume_cursor(&self, job_id: JobId) -> Result<u64, JobStoreError> {
        (**self).resume_cursor(job_id).await
    }
}
