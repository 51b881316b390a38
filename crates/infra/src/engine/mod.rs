//! Job Processing Engine.
//!
//! Wires the row transformer, upsert executor, progress tracker, job store
//! and priority dequeuer into three kinds of run:
//!
//! - **import**: one item per input row, processed in row order
//! - **retry**: re-attempts the retryable failures of a finished import
//! - **sync**: one item per dequeued queue entry
//!
//! Rows within a run are processed sequentially in chunks of
//! `EngineConfig::batch_size`. Between chunks the run checks the tracker:
//! a paused job waits, a cancelled job stops and is persisted as cancelled.
//! Only the run loop writes job status while a run is active; `pause`,
//! `resume` and `cancel` act on the tracker alone.

mod error;
mod report;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tracing::instrument;

use catalogsync_catalog::{
    check_headers, find_duplicate_codes, transform_isolated, verify_mapping, CatalogTransformer, Field, RawRow,
    RowTransform,
};
use catalogsync_core::JobId;

use crate::config::EngineConfig;
use crate::error::StoreError;
use crate::executor::{CatalogStore, ExecutorError, UpsertExecutor};
use crate::jobs::{
    Item, ItemStatus, Job, JobCounters, JobKind, JobMeta, JobOutcome, JobProgress, JobStatus, JobStore,
    JobStoreError, NewItem, NewJob, ProgressTracker, RowError, TrackerError,
};
use crate::queue::{PriorityDequeuer, QueueEntry, QueueError, QueueStatus, SyncQueue};
use crate::retry::{record_failure, ErrorKind, RetryPolicy};

pub use error::EngineError;
pub use report::{JobReport, RunSummary};
use report::{RowFailure, Warnings};

enum Checkpoint {
    Continue,
    Cancelled,
}

pub struct Engine<J, C, Q, T = CatalogTransformer> {
    jobs: Arc<J>,
    tracker: ProgressTracker<Arc<J>>,
    executor: UpsertExecutor<C>,
    dequeuer: PriorityDequeuer<Q>,
    transformer: T,
    config: EngineConfig,
    policy: RetryPolicy,
}

impl<J, C, Q> Engine<J, C, Q, CatalogTransformer>
where
    J: JobStore,
    C: CatalogStore,
    Q: SyncQueue,
{
    pub fn new(jobs: Arc<J>, catalog: C, queue: Q, config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_transformer(jobs, catalog, queue, CatalogTransformer::new(), config)
    }
}

impl<J, C, Q, T> Engine<J, C, Q, T>
where
    J: JobStore,
    C: CatalogStore,
    Q: SyncQueue,
    T: RowTransform,
{
    /// Build an engine; fails if the field mapping or config is inconsistent.
    pub fn with_transformer(
        jobs: Arc<J>,
        catalog: C,
        queue: Q,
        transformer: T,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        verify_mapping()?;
        config
            .validate()
            .map_err(|e| EngineError::InvalidInput(e.to_string()))?;

        Ok(Self {
            tracker: ProgressTracker::new(Arc::clone(&jobs)),
            jobs,
            executor: UpsertExecutor::new(catalog, config.op_timeout),
            dequeuer: PriorityDequeuer::new(queue, config.op_timeout),
            transformer,
            policy: config.retry_policy(),
            config,
        })
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn tracker(&self) -> &ProgressTracker<Arc<J>> {
        &self.tracker
    }

    pub fn jobs(&self) -> &J {
        &self.jobs
    }

    pub fn executor(&self) -> &UpsertExecutor<C> {
        &self.executor
    }

    pub fn dequeuer(&self) -> &PriorityDequeuer<Q> {
        &self.dequeuer
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ---------------------------------------------------------------------
    // Import
    // ---------------------------------------------------------------------

    /// Create a pending import job with one item per row.
    #[instrument(skip(self, rows), fields(rows = rows.len()), err)]
    pub async fn submit_import(&self, rows: &[RawRow], created_by: Option<String>) -> Result<Job, EngineError> {
        let job = self
            .jobs
            .create_job(NewJob {
                kind: JobKind::Import,
                total_items: rows.len() as u64,
                created_by,
            })
            .await?;

        let items = rows
            .iter()
            .enumerate()
            .map(|(idx, row)| NewItem {
                source_code: row.value(Field::ItemCode).unwrap_or_default().to_string(),
                source_row_number: idx as u64 + 1,
                max_retries: self.policy.max_retries,
            })
            .collect();
        self.jobs.add_items(job.id, items).await?;

        tracing::info!(job_id = %job.id, uuid = %job.uuid, total = job.total_items, "import submitted");
        Ok(job)
    }

    /// Process every row of a pending import job.
    #[instrument(skip(self, rows), fields(job_id = %job_id), err)]
    pub async fn run_import(&self, job_id: JobId, rows: Vec<RawRow>) -> Result<RunSummary, EngineError> {
        let job = self.load_job(job_id, JobKind::Import).await?;
        if job.status != JobStatus::Pending {
            return Err(invalid_state(&job, "only pending jobs can be started"));
        }
        check_rows(&job, &rows)?;

        self.jobs.transition_job(job_id, JobStatus::Processing).await?;
        if !self.tracker.start(job_id, JobMeta::new(JobKind::Import, job.total_items)) {
            return Err(EngineError::AlreadyRunning(job_id));
        }

        let duplicates = duplicate_rows(&rows);
        self.drive_import(job_id, number_rows(rows), duplicates).await
    }

    /// Check headers, submit and run in one call.
    pub async fn import<S: AsRef<str>>(
        &self,
        headers: &[S],
        rows: Vec<RawRow>,
        created_by: Option<String>,
    ) -> Result<RunSummary, EngineError> {
        let check = check_headers(headers);
        if !check.is_complete() {
            let missing: Vec<&str> = check.missing_required.iter().map(|f| f.header()).collect();
            return Err(EngineError::InvalidInput(format!(
                "missing required column(s): {}",
                missing.join(", ")
            )));
        }
        let job = self.submit_import(&rows, created_by).await?;
        self.run_import(job.id, rows).await
    }

    /// Continue an interrupted or paused import after its resume cursor.
    ///
    /// `rows` must be the same input the job was submitted with; rows up to
    /// the cursor are not processed again.
    #[instrument(skip(self, rows), fields(job_id = %job_id), err)]
    pub async fn resume_import(&self, job_id: JobId, rows: Vec<RawRow>) -> Result<RunSummary, EngineError> {
        let job = self.load_job(job_id, JobKind::Import).await?;
        check_rows(&job, &rows)?;
        match job.status {
            JobStatus::Pending => return self.run_import(job_id, rows).await,
            JobStatus::Processing | JobStatus::Paused => {}
            _ => return Err(invalid_state(&job, "finished jobs cannot be resumed")),
        }

        let cursor = self.jobs.resume_cursor(job_id).await?;
        let mut counters = self.jobs.item_stats(job_id).await?.counters();
        counters.total = job.total_items;

        if job.status == JobStatus::Paused {
            self.jobs.transition_job(job_id, JobStatus::Processing).await?;
        }
        if !self
            .tracker
            .start(job_id, JobMeta::resuming(JobKind::Import, counters, cursor))
        {
            return Err(EngineError::AlreadyRunning(job_id));
        }
        tracing::info!(job_id = %job_id, cursor, processed = counters.processed, "resuming import");

        let duplicates = duplicate_rows(&rows);
        let remaining = number_rows(rows)
            .into_iter()
            .filter(|(row, _)| *row > cursor)
            .collect();
        self.drive_import(job_id, remaining, duplicates).await
    }

    /// Re-attempt the retryable failures of a finished import, in row order.
    ///
    /// Items whose backoff has not elapsed are left for a later pass. Items
    /// stranded as `processing` by a storage outage are retried as well.
    #[instrument(skip(self, rows), fields(job_id = %job_id), err)]
    pub async fn retry_failed(&self, job_id: JobId, rows: Vec<RawRow>) -> Result<RunSummary, EngineError> {
        let job = self.load_job(job_id, JobKind::Import).await?;
        if !job.status.is_terminal() {
            return Err(invalid_state(&job, "only finished jobs can be retried"));
        }
        check_rows(&job, &rows)?;

        let mut candidates = self
            .jobs
            .list_items(job_id, Some(ItemStatus::FailedRetryable), None)
            .await?;
        candidates.extend(
            self.jobs
                .list_items(job_id, Some(ItemStatus::Processing), None)
                .await?,
        );
        candidates.sort_by_key(|item| item.source_row_number);

        let now = Utc::now();
        let warnings = Warnings::default();
        let mut errors = Vec::new();
        let mut attempted = 0usize;

        for mut item in candidates {
            let row = item.source_row_number;
            if item.status == ItemStatus::FailedRetryable && !item.is_due(now) {
                let due = item.retry_after.map(|at| at.to_rfc3339()).unwrap_or_default();
                warnings.push(format!("row {row}: retry deferred until {due}"));
                continue;
            }
            let Some(raw) = rows.get(row.saturating_sub(1) as usize) else {
                continue;
            };

            attempted += 1;
            match self.attempt(&mut item, raw, &warnings).await {
                Ok(()) => tracing::info!(job_id = %job_id, row, "retry succeeded"),
                Err(failure) if failure.fatal => {
                    self.save_job_counters(&job).await?;
                    return Err(EngineError::StorageUnavailable(failure.message));
                }
                Err(failure) => errors.push(RowError {
                    row,
                    error: failure.message,
                }),
            }
        }

        let counters = self.save_job_counters(&job).await?;
        let job = self
            .jobs
            .get_job(job_id)
            .await?
            .ok_or(EngineError::NotFound(job_id))?;
        tracing::info!(
            job_id = %job_id,
            attempted,
            still_failing = errors.len(),
            succeeded = counters.succeeded,
            "retry pass finished"
        );
        Ok(RunSummary {
            job,
            counters,
            errors,
            warnings: warnings.take(),
            cancelled: false,
        })
    }

    async fn drive_import(
        &self,
        job_id: JobId,
        rows: Vec<(u64, RawRow)>,
        duplicates: HashMap<u64, String>,
    ) -> Result<RunSummary, EngineError> {
        let warnings = Warnings::default();
        let duplicates = &duplicates;
        let sink = &warnings;
        self.drive(job_id, rows, &warnings, move |row, raw| {
            self.import_row(job_id, row, raw, duplicates, sink)
        })
        .await
    }

    async fn import_row(
        &self,
        job_id: JobId,
        row: u64,
        raw: RawRow,
        duplicates: &HashMap<u64, String>,
        warnings: &Warnings,
    ) -> Result<(), RowFailure> {
        let mut item = self.item_for_row(job_id, row).await?;
        if let Some(reason) = duplicates.get(&row) {
            item.mark_skipped(reason.clone(), Utc::now());
            self.save_item(&item).await?;
            return Err(RowFailure::row(reason.clone()));
        }
        self.attempt(&mut item, &raw, warnings).await
    }

    // ---------------------------------------------------------------------
    // Sync
    // ---------------------------------------------------------------------

    /// Process up to `limit` pending queue entries as one sync job.
    ///
    /// Returns `None` when the queue has nothing pending.
    #[instrument(skip(self), err)]
    pub async fn run_sync(&self, limit: usize, created_by: Option<String>) -> Result<Option<RunSummary>, EngineError> {
        let entries = self.dequeuer.get_next_batch(limit).await?;
        if entries.is_empty() {
            return Ok(None);
        }

        let job = self
            .jobs
            .create_job(NewJob {
                kind: JobKind::Sync,
                total_items: entries.len() as u64,
                created_by,
            })
            .await?;
        let items = entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| NewItem {
                source_code: entry.subject_id.clone(),
                source_row_number: idx as u64 + 1,
                max_retries: self.policy.max_retries,
            })
            .collect();
        self.jobs.add_items(job.id, items).await?;
        self.jobs.transition_job(job.id, JobStatus::Processing).await?;
        self.tracker.start(job.id, JobMeta::new(JobKind::Sync, job.total_items));
        tracing::info!(job_id = %job.id, entries = job.total_items, "sync run started");

        let job_id = job.id;
        let warnings = Warnings::default();
        let sink = &warnings;
        let summary = self
            .drive(job_id, number_rows(entries), &warnings, move |row, entry| {
                self.sync_entry(job_id, row, entry, sink)
            })
            .await?;
        Ok(Some(summary))
    }

    async fn sync_entry(
        &self,
        job_id: JobId,
        row: u64,
        entry: QueueEntry,
        warnings: &Warnings,
    ) -> Result<(), RowFailure> {
        let mut item = self.item_for_row(job_id, row).await?;
        // Retries charged by earlier sync runs count toward this item's cap.
        item.retry_count = entry.retries.min(item.max_retries);

        match self.dequeuer.claim(entry.id).await {
            Ok(_) => {}
            Err(QueueError::Conflict { actual, .. }) => {
                let reason = format!("queue entry {} is already {actual}", entry.id);
                item.mark_skipped(reason.clone(), Utc::now());
                self.save_item(&item).await?;
                return Err(RowFailure::row(reason));
            }
            Err(e) if e.is_unavailable() => return Err(RowFailure::fatal(e.to_string())),
            Err(e) => {
                item.begin_attempt(Utc::now());
                return self.fail_item(&mut item, ErrorKind::Storage, e.to_string()).await;
            }
        }

        let result = match RawRow::from_json(&entry.event_data) {
            Ok(raw) => self.attempt(&mut item, &raw, warnings).await,
            Err(e) => {
                item.begin_attempt(Utc::now());
                self.fail_item(&mut item, ErrorKind::Validation, format!("queue entry {}: {e}", entry.id))
                    .await
            }
        };

        // Retryable failures go back to the queue for a later run; an
        // interrupted attempt is released without counting a retry.
        let (next, settled) = match &result {
            Ok(()) => (QueueStatus::Done, self.dequeuer.update_status(entry.id, QueueStatus::Done).await),
            Err(failure) if failure.fatal => (
                QueueStatus::Pending,
                self.dequeuer.update_status(entry.id, QueueStatus::Pending).await,
            ),
            Err(_) if item.status == ItemStatus::FailedRetryable => {
                (QueueStatus::Pending, self.dequeuer.requeue(entry.id).await)
            }
            Err(_) => (
                QueueStatus::Failed,
                self.dequeuer.update_status(entry.id, QueueStatus::Failed).await,
            ),
        };
        if let Err(e) = settled {
            tracing::error!(entry_id = %entry.id, status = %next, error = %e, "could not settle queue entry");
            if e.is_unavailable() {
                return Err(RowFailure::fatal(e.to_string()));
            }
        }
        result
    }

    // ---------------------------------------------------------------------
    // Control and queries
    // ---------------------------------------------------------------------

    pub fn pause(&self, job_id: JobId) -> Result<JobProgress, EngineError> {
        Ok(self.tracker.pause(job_id)?)
    }

    pub fn resume(&self, job_id: JobId) -> Result<JobProgress, EngineError> {
        Ok(self.tracker.resume(job_id)?)
    }

    /// Stop a running job before its next row; the run persists it as
    /// cancelled.
    pub fn cancel(&self, job_id: JobId) -> Result<JobProgress, EngineError> {
        Ok(self.tracker.cancel(job_id)?)
    }

    pub async fn job_report(&self, job_id: JobId) -> Result<JobReport, EngineError> {
        let job = self
            .jobs
            .get_job(job_id)
            .await?
            .ok_or(EngineError::NotFound(job_id))?;
        let items = self.jobs.item_stats(job_id).await?;
        let failures = self
            .jobs
            .list_items(job_id, None, None)
            .await?
            .into_iter()
            .filter(|item| item.status.is_failure())
            .collect();
        Ok(JobReport {
            job,
            items,
            failures,
            progress: self.tracker.snapshot(job_id),
        })
    }

    // ---------------------------------------------------------------------
    // Run loop
    // ---------------------------------------------------------------------

    async fn drive<R, F, Fut>(
        &self,
        job_id: JobId,
        rows: Vec<(u64, R)>,
        warnings: &Warnings,
        mut processor: F,
    ) -> Result<RunSummary, EngineError>
    where
        F: FnMut(u64, R) -> Fut,
        Fut: Future<Output = Result<(), RowFailure>>,
    {
        let result = match self.drive_rows(job_id, rows, &mut processor).await {
            Ok((errors, cancelled)) => self.finish_run(job_id, errors, cancelled, warnings).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.fail_run(job_id, e).await;
        }
        result
    }

    async fn drive_rows<R, F, Fut>(
        &self,
        job_id: JobId,
        mut rows: Vec<(u64, R)>,
        processor: &mut F,
    ) -> Result<(Vec<RowError>, bool), EngineError>
    where
        F: FnMut(u64, R) -> Fut,
        Fut: Future<Output = Result<(), RowFailure>>,
    {
        let mut errors = Vec::new();
        loop {
            if let Checkpoint::Cancelled = self.checkpoint(job_id).await? {
                return Ok((errors, true));
            }
            if rows.is_empty() {
                return Ok((errors, false));
            }

            let rest = rows.split_off(self.config.batch_size.min(rows.len()));
            let chunk = std::mem::replace(&mut rows, rest);
            match self.tracker.process_numbered(job_id, chunk, &mut *processor).await {
                Ok(batch) => {
                    errors.extend(batch.errors);
                    if batch.interrupted {
                        return Ok((errors, true));
                    }
                }
                Err(TrackerError::NotTracked(_)) => return Ok((errors, true)),
                Err(TrackerError::Aborted { row, reason, .. }) => {
                    return Err(EngineError::StorageUnavailable(format!("row {row}: {reason}")));
                }
                Err(e) => return Err(e.into()),
            }

            if let Some(progress) = self.tracker.snapshot(job_id) {
                self.jobs.save_counters(job_id, counters_of(&progress)).await?;
            }
        }
    }

    /// Wait out a pause; report whether the job was cancelled.
    async fn checkpoint(&self, job_id: JobId) -> Result<Checkpoint, EngineError> {
        let mut paused = false;
        loop {
            match self.tracker.status(job_id) {
                None => return Ok(Checkpoint::Cancelled),
                Some(JobStatus::Paused) => {
                    if !paused {
                        self.jobs.transition_job(job_id, JobStatus::Paused).await?;
                        paused = true;
                        tracing::info!(job_id = %job_id, "run paused");
                    }
                    tokio::time::sleep(self.config.pause_poll_interval).await;
                }
                Some(_) => {
                    if paused {
                        self.jobs.transition_job(job_id, JobStatus::Processing).await?;
                        tracing::info!(job_id = %job_id, "run resumed");
                    }
                    return Ok(Checkpoint::Continue);
                }
            }
        }
    }

    async fn finish_run(
        &self,
        job_id: JobId,
        errors: Vec<RowError>,
        cancelled: bool,
        warnings: &Warnings,
    ) -> Result<RunSummary, EngineError> {
        if !cancelled {
            if let Some(counters) = self.tracker.snapshot(job_id).map(|p| counters_of(&p)) {
                if let Some(job) = self.tracker.complete(job_id, counters).await? {
                    return Ok(RunSummary {
                        job,
                        counters,
                        errors,
                        warnings: warnings.take(),
                        cancelled: false,
                    });
                }
            }
        }

        let job = self.persist_cancelled(job_id).await?;
        Ok(RunSummary {
            counters: job.counters(),
            job,
            errors,
            warnings: warnings.take(),
            cancelled: true,
        })
    }

    async fn persist_cancelled(&self, job_id: JobId) -> Result<Job, EngineError> {
        let job = self
            .jobs
            .get_job(job_id)
            .await?
            .ok_or(EngineError::NotFound(job_id))?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        let mut counters = self.jobs.item_stats(job_id).await?.counters();
        counters.total = job.total_items;
        let job = self
            .jobs
            .finish_job(
                job_id,
                JobOutcome {
                    status: JobStatus::Cancelled,
                    counters,
                    error_message: None,
                },
            )
            .await?;
        tracing::info!(job_id = %job_id, processed = counters.processed, "cancelled run persisted");
        Ok(job)
    }

    async fn fail_run(&self, job_id: JobId, error: &EngineError) {
        if !self.tracker.is_tracked(job_id) {
            return;
        }
        match self.tracker.fail(job_id, error.to_string()).await {
            Ok(_) => tracing::error!(job_id = %job_id, error = %error, "run failed"),
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "could not persist job failure");
                self.tracker.cancel(job_id).ok();
            }
        }
    }

    /// Recompute a job's counters from its items and persist them.
    async fn save_job_counters(&self, job: &Job) -> Result<JobCounters, EngineError> {
        let mut counters = self.jobs.item_stats(job.id).await?.counters();
        counters.total = job.total_items;
        self.jobs.save_counters(job.id, counters).await?;
        Ok(counters)
    }

    // ---------------------------------------------------------------------
    // Items
    // ---------------------------------------------------------------------

    /// Transform and execute one row for `item`, recording the outcome.
    ///
    /// An unreachable catalog store leaves the item `processing` and is
    /// returned as fatal.
    async fn attempt(&self, item: &mut Item, raw: &RawRow, warnings: &Warnings) -> Result<(), RowFailure> {
        let row = item.source_row_number;
        item.begin_attempt(Utc::now());
        self.save_item(item).await?;

        let mut outcome = transform_isolated(&self.transformer, raw, row);
        warnings.extend(std::mem::take(&mut outcome.warnings));
        if !outcome.errors.is_empty() {
            let kind = if outcome.crashed {
                ErrorKind::Transformation
            } else {
                ErrorKind::Validation
            };
            return self.fail_item(item, kind, outcome.errors.join("; ")).await;
        }

        let report = match self.executor.execute(&outcome.operations).await {
            Ok(report) => report,
            Err(ExecutorError::Unavailable(reason)) => {
                return Err(RowFailure::fatal(format!("row {row}: {reason}")));
            }
        };
        if let Some((result, failure)) = report.first_failure() {
            let message = format!("row {row}: {} failed: {}", result.operation, failure.message);
            return self.fail_item(item, failure.kind, message).await;
        }

        item.mark_succeeded(Utc::now());
        self.save_item(item).await
    }

    async fn fail_item(&self, item: &mut Item, kind: ErrorKind, message: String) -> Result<(), RowFailure> {
        let class = record_failure(item, kind, message.clone(), &self.policy, Utc::now());
        tracing::debug!(
            job_id = %item.job_id,
            row = item.source_row_number,
            kind = %kind,
            class = ?class,
            retry_count = item.retry_count,
            "item failed"
        );
        self.save_item(item).await?;
        Err(RowFailure::row(message))
    }

    /// Run a job-store call on the item path under `op_timeout`.
    async fn bounded<R>(&self, call: impl Future<Output = Result<R, JobStoreError>>) -> Result<R, RowFailure> {
        let timeout = self.config.op_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result.map_err(store_failure),
            Err(_) => Err(store_failure(StoreError::Timeout(timeout).into())),
        }
    }

    async fn item_for_row(&self, job_id: JobId, row: u64) -> Result<Item, RowFailure> {
        self.bounded(self.jobs.find_item_by_row(job_id, row))
            .await?
            .ok_or_else(|| RowFailure::row(format!("row {row}: no item recorded for this row")))
    }

    async fn save_item(&self, item: &Item) -> Result<(), RowFailure> {
        self.bounded(self.jobs.update_item(item)).await
    }

    async fn load_job(&self, job_id: JobId, kind: JobKind) -> Result<Job, EngineError> {
        let job = self
            .jobs
            .get_job(job_id)
            .await?
            .ok_or(EngineError::NotFound(job_id))?;
        if job.kind != kind {
            return Err(invalid_state(&job, &format!("not a {kind} job")));
        }
        if self.tracker.is_tracked(job_id) {
            return Err(EngineError::AlreadyRunning(job_id));
        }
        Ok(job)
    }
}

fn store_failure(err: JobStoreError) -> RowFailure {
    if err.is_unavailable() {
        RowFailure::fatal(err.to_string())
    } else {
        RowFailure::row(err.to_string())
    }
}

fn invalid_state(job: &Job, reason: &str) -> EngineError {
    EngineError::InvalidState {
        job_id: job.id,
        status: job.status,
        reason: reason.to_string(),
    }
}

fn check_rows(job: &Job, rows: &[RawRow]) -> Result<(), EngineError> {
    if rows.len() as u64 != job.total_items {
        return Err(EngineError::InvalidInput(format!(
            "job {} has {} items but {} rows were given",
            job.id,
            job.total_items,
            rows.len()
        )));
    }
    Ok(())
}

/// Row number → skip reason for rows repeating an earlier item code.
fn duplicate_rows(rows: &[RawRow]) -> HashMap<u64, String> {
    find_duplicate_codes(rows)
        .into_iter()
        .map(|dup| {
            let reason = format!(
                "row {}: duplicate item code {} (first seen on row {})",
                dup.row, dup.code, dup.first_row
            );
            (dup.row, reason)
        })
        .collect()
}

fn number_rows<R>(rows: Vec<R>) -> Vec<(u64, R)> {
    rows.into_iter()
        .enumerate()
        .map(|(idx, row)| (idx as u64 + 1, row))
        .collect()
}

fn counters_of(progress: &JobProgress) -> JobCounters {
    JobCounters {
        total: progress.total,
        processed: progress.processed,
        succeeded: progress.succeeded,
        failed: progress.failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InMemoryCatalogStore;
    use crate::jobs::InMemoryJobStore;
    use crate::queue::InMemorySyncQueue;

    type TestEngine = Engine<InMemoryJobStore, Arc<InMemoryCatalogStore>, Arc<InMemorySyncQueue>>;

    fn engine() -> TestEngine {
        Engine::new(
            InMemoryJobStore::arc(),
            Arc::new(InMemoryCatalogStore::new()),
            Arc::new(InMemorySyncQueue::new()),
            EngineConfig::default(),
        )
        .unwrap()
    }

    fn row(code: &str) -> RawRow {
        RawRow::from_pairs([
            ("item_code", code),
            ("product_name", "Hose"),
            ("item_name", "Hose 25m"),
        ])
    }

    #[test]
    fn duplicates_are_keyed_by_later_row() {
        let dups = duplicate_rows(&[row("A"), row("B"), row("A")]);
        assert_eq!(dups.len(), 1);
        assert!(dups[&3].contains("first seen on row 1"));
    }

    #[tokio::test]
    async fn submit_creates_one_pending_item_per_row() {
        let engine = engine();
        let job = engine.submit_import(&[row("A"), row("B")], None).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let items = engine.jobs().list_items(job.id, None, None).await.unwrap();
        let rows: Vec<(u64, &str)> = items
            .iter()
            .map(|i| (i.source_row_number, i.source_code.as_str()))
            .collect();
        assert_eq!(rows, vec![(1, "A"), (2, "B")]);
        assert!(items.iter().all(|i| i.status == ItemStatus::Pending && i.max_retries == 3));
    }

    #[tokio::test]
    async fn run_requires_the_submitted_rows() {
        let engine = engine();
        let job = engine.submit_import(&[row("A"), row("B")], None).await.unwrap();
        let err = engine.run_import(job.id, vec![row("A")]).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));

        let err = engine.run_import(JobId::new(404), Vec::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn finished_jobs_are_not_rerun() {
        let engine = engine();
        let summary = engine.import(&["item_code", "product_name", "item_name"], vec![row("A")], None).await.unwrap();
        assert_eq!(summary.job.status, JobStatus::Completed);

        let err = engine.run_import(summary.job.id, vec![row("A")]).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
        let err = engine.resume_import(summary.job.id, vec![row("A")]).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn import_rejects_missing_required_headers() {
        let engine = engine();
        let err = engine.import(&["item_code", "item_name"], vec![row("A")], None).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(msg) if msg.contains("product_name")));
    }

    #[tokio::test]
    async fn control_on_unknown_job_is_not_tracked() {
        let engine = engine();
        let err = engine.cancel(JobId::new(999)).unwrap_err();
        assert!(err.is_not_tracked());
        assert!(err.to_string().contains("not being tracked"));
    }
}
