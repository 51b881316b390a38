//! Progress Tracker: in-memory state of running jobs.
//!
//! The tracker is an explicitly constructed registry keyed by job id; each
//! engine owns one. Listeners registered for a job are called synchronously
//! on every progress change. A failing or panicking listener is logged and
//! skipped, it never affects the update or the other listeners.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use catalogsync_core::JobId;

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobCounters, JobKind, JobOutcome, JobStatus};

/// Static facts about a job, given when tracking starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMeta {
    pub kind: JobKind,
    /// Counters to start from (non-zero when resuming).
    pub counters: JobCounters,
    /// Last row already handled.
    pub current_row: u64,
}

impl JobMeta {
    pub fn new(kind: JobKind, total: u64) -> Self {
        Self {
            kind,
            counters: JobCounters::with_total(total),
            current_row: 0,
        }
    }

    pub fn resuming(kind: JobKind, counters: JobCounters, current_row: u64) -> Self {
        Self {
            kind,
            counters,
            current_row,
        }
    }
}

/// Absolute values to merge into a tracked job. `None` leaves a field as is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub total: Option<u64>,
    pub processed: Option<u64>,
    pub succeeded: Option<u64>,
    pub failed: Option<u64>,
    pub current_row: Option<u64>,
}

impl ProgressUpdate {
    pub fn counters(counters: JobCounters) -> Self {
        Self {
            total: Some(counters.total),
            processed: Some(counters.processed),
            succeeded: Some(counters.succeeded),
            failed: Some(counters.failed),
            current_row: None,
        }
    }
}

/// Snapshot handed to listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub job_id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub current_row: u64,
    pub progress_percent: f64,
    pub estimated_time_remaining: Option<Duration>,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatistics {
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub remaining: u64,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub elapsed: Duration,
}

/// Observer of job progress.
pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, progress: &JobProgress) -> anyhow::Result<()>;
}

impl<F> ProgressListener for F
where
    F: Fn(&JobProgress) -> anyhow::Result<()> + Send + Sync,
{
    fn on_progress(&self, progress: &JobProgress) -> anyhow::Result<()> {
        self(progress)
    }
}

/// Handle returned by [`ProgressTracker::register`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A failed row inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowError {
    pub row: u64,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub errors: Vec<RowError>,
    /// The job stopped being tracked (cancelled) before the batch finished.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub interrupted: bool,
}

/// Error produced by a batch processor for one row.
pub trait BatchError: core::fmt::Display {
    /// Stop the whole batch instead of recording a row failure.
    fn aborts_batch(&self) -> bool {
        false
    }
}

impl BatchError for String {}
impl BatchError for &str {}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("job {0} is not being tracked")]
    NotTracked(JobId),

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error("job {job_id}: batch aborted at row {row}: {reason}")]
    Aborted {
        job_id: JobId,
        row: u64,
        reason: String,
    },
}

struct TrackedJob {
    kind: JobKind,
    status: JobStatus,
    counters: JobCounters,
    current_row: u64,
    /// Processed count when tracking started; the ETA uses this run only.
    baseline: u64,
    started: Instant,
    started_at: DateTime<Utc>,
    last_update: DateTime<Utc>,
    paused_at: Option<DateTime<Utc>>,
    resumed_at: Option<DateTime<Utc>>,
    listeners: Vec<(ListenerId, Arc<dyn ProgressListener>)>,
}

impl TrackedJob {
    fn snapshot(&self, job_id: JobId) -> JobProgress {
        let JobCounters {
            total,
            processed,
            succeeded,
            failed,
        } = self.counters;

        let progress_percent = if total == 0 {
            0.0
        } else {
            processed as f64 / total as f64 * 100.0
        };

        let run_processed = processed.saturating_sub(self.baseline);
        let estimated_time_remaining = (run_processed > 0).then(|| {
            let remaining = total.saturating_sub(processed) as f64;
            self.started.elapsed().mul_f64(remaining / run_processed as f64)
        });

        JobProgress {
            job_id,
            kind: self.kind,
            status: self.status,
            total,
            processed,
            succeeded,
            failed,
            current_row: self.current_row,
            progress_percent,
            estimated_time_remaining,
            started_at: self.started_at,
            last_update: self.last_update,
            paused_at: self.paused_at,
            resumed_at: self.resumed_at,
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn ProgressListener>> {
        self.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
    }
}

/// Registry of running jobs.
pub struct ProgressTracker<S> {
    store: S,
    jobs: RwLock<HashMap<JobId, TrackedJob>>,
    next_listener: AtomicU64,
}

impl<S: JobStore> core::fmt::Debug for ProgressTracker<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("active_jobs", &self.read().len())
            .finish()
    }
}

impl<S: JobStore> ProgressTracker<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            jobs: RwLock::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    // A panicking listener never runs under the lock, so poisoning only
    // follows a bug in this module; the map itself stays consistent.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, TrackedJob>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, TrackedJob>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a job as processing. Returns `false` (and changes nothing)
    /// if the job is already tracked.
    pub fn start(&self, job_id: JobId, meta: JobMeta) -> bool {
        let mut jobs = self.write();
        if jobs.contains_key(&job_id) {
            tracing::debug!(job_id = %job_id, "job already tracked; start ignored");
            return false;
        }
        let now = Utc::now();
        jobs.insert(
            job_id,
            TrackedJob {
                kind: meta.kind,
                status: JobStatus::Processing,
                counters: meta.counters,
                current_row: meta.current_row,
                baseline: meta.counters.processed,
                started: Instant::now(),
                started_at: now,
                last_update: now,
                paused_at: None,
                resumed_at: None,
                listeners: Vec::new(),
            },
        );
        tracing::info!(job_id = %job_id, kind = %meta.kind, total = meta.counters.total, "tracking job");
        true
    }

    pub fn is_tracked(&self, job_id: JobId) -> bool {
        self.read().contains_key(&job_id)
    }

    pub fn status(&self, job_id: JobId) -> Option<JobStatus> {
        self.read().get(&job_id).map(|job| job.status)
    }

    pub fn snapshot(&self, job_id: JobId) -> Option<JobProgress> {
        self.read().get(&job_id).map(|job| job.snapshot(job_id))
    }

    pub fn active_jobs(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Merge counters and notify listeners. Untracked jobs are ignored with
    /// a warning.
    pub fn update(&self, job_id: JobId, update: ProgressUpdate) -> Option<JobProgress> {
        self.mutate(job_id, |job| {
            let counters = &mut job.counters;
            if let Some(total) = update.total {
                counters.total = total;
            }
            if let Some(processed) = update.processed {
                // Progress never moves backwards.
                counters.processed = counters.processed.max(processed);
            }
            if counters.total > 0 {
                counters.processed = counters.processed.min(counters.total);
            }
            if let Some(succeeded) = update.succeeded {
                counters.succeeded = succeeded;
            }
            if let Some(failed) = update.failed {
                counters.failed = failed;
            }
            if let Some(row) = update.current_row {
                job.current_row = row;
            }
        })
    }

    fn advance(&self, job_id: JobId, row: u64, succeeded: bool) -> Option<JobProgress> {
        self.mutate(job_id, |job| {
            if succeeded {
                job.counters.record_success();
            } else {
                job.counters.record_failure();
            }
            job.current_row = row;
        })
    }

    fn mutate(&self, job_id: JobId, apply: impl FnOnce(&mut TrackedJob)) -> Option<JobProgress> {
        let (progress, listeners) = {
            let mut jobs = self.write();
            let Some(job) = jobs.get_mut(&job_id) else {
                tracing::warn!(job_id = %job_id, "progress update for untracked job ignored");
                return None;
            };
            apply(job);
            job.last_update = Utc::now();
            (job.snapshot(job_id), job.listeners())
        };
        notify(&progress, &listeners);
        Some(progress)
    }

    pub fn pause(&self, job_id: JobId) -> Result<JobProgress, TrackerError> {
        self.toggle(job_id, JobStatus::Processing, JobStatus::Paused)
    }

    pub fn resume(&self, job_id: JobId) -> Result<JobProgress, TrackerError> {
        self.toggle(job_id, JobStatus::Paused, JobStatus::Processing)
    }

    fn toggle(&self, job_id: JobId, from: JobStatus, to: JobStatus) -> Result<JobProgress, TrackerError> {
        let (progress, listeners) = {
            let mut jobs = self.write();
            let job = jobs.get_mut(&job_id).ok_or(TrackerError::NotTracked(job_id))?;
            if job.status != from {
                return Err(TrackerError::InvalidTransition {
                    job_id,
                    from: job.status,
                    to,
                });
            }
            let now = Utc::now();
            job.status = to;
            job.last_update = now;
            match to {
                JobStatus::Paused => job.paused_at = Some(now),
                _ => job.resumed_at = Some(now),
            }
            (job.snapshot(job_id), job.listeners())
        };
        tracing::info!(job_id = %job_id, status = %to, "job status toggled");
        notify(&progress, &listeners);
        Ok(progress)
    }

    /// Drop the job and its listeners from the registry. Work already handed
    /// to storage finishes; the batch loop stops before its next row.
    pub fn cancel(&self, job_id: JobId) -> Result<JobProgress, TrackerError> {
        let job = self
            .write()
            .remove(&job_id)
            .ok_or(TrackerError::NotTracked(job_id))?;
        tracing::info!(job_id = %job_id, processed = job.counters.processed, "job cancelled");
        let mut progress = job.snapshot(job_id);
        progress.status = JobStatus::Cancelled;
        Ok(progress)
    }

    /// Persist final counters as completed, then stop tracking the job.
    pub async fn complete(&self, job_id: JobId, counters: JobCounters) -> Result<Option<Job>, TrackerError> {
        self.finish(
            job_id,
            JobOutcome {
                status: JobStatus::Completed,
                counters,
                error_message: None,
            },
        )
        .await
    }

    /// Persist the job as failed with its current counters, then stop
    /// tracking it.
    pub async fn fail(&self, job_id: JobId, error: impl Into<String>) -> Result<Option<Job>, TrackerError> {
        let Some(progress) = self.snapshot(job_id) else {
            tracing::warn!(job_id = %job_id, "fail called for untracked job");
            return Ok(None);
        };
        let counters = JobCounters {
            total: progress.total,
            processed: progress.processed,
            succeeded: progress.succeeded,
            failed: progress.failed,
        };
        self.finish(
            job_id,
            JobOutcome {
                status: JobStatus::Failed,
                counters,
                error_message: Some(error.into()),
            },
        )
        .await
    }

    async fn finish(&self, job_id: JobId, outcome: JobOutcome) -> Result<Option<Job>, TrackerError> {
        if !self.is_tracked(job_id) {
            tracing::warn!(job_id = %job_id, status = %outcome.status, "finish called for untracked job");
            return Ok(None);
        }

        let status = outcome.status;
        let counters = outcome.counters;
        let job = self.store.finish_job(job_id, outcome).await?;

        let removed = self.write().remove(&job_id);
        if let Some(mut tracked) = removed {
            tracked.status = status;
            tracked.counters = counters;
            tracked.last_update = Utc::now();
            notify(&tracked.snapshot(job_id), &tracked.listeners());
        }
        tracing::info!(
            job_id = %job_id,
            status = %status,
            succeeded = counters.succeeded,
            failed = counters.failed,
            "job finished"
        );
        Ok(Some(job))
    }

    pub fn register<L>(&self, job_id: JobId, listener: L) -> Result<ListenerId, TrackerError>
    where
        L: ProgressListener + 'static,
    {
        let mut jobs = self.write();
        let job = jobs.get_mut(&job_id).ok_or(TrackerError::NotTracked(job_id))?;
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        job.listeners.push((id, Arc::new(listener)));
        Ok(id)
    }

    pub fn unregister(&self, job_id: JobId, listener: ListenerId) -> bool {
        let mut jobs = self.write();
        let Some(job) = jobs.get_mut(&job_id) else {
            return false;
        };
        let before = job.listeners.len();
        job.listeners.retain(|(id, _)| *id != listener);
        job.listeners.len() != before
    }

    pub fn get_statistics(&self, job_id: JobId) -> Option<JobStatistics> {
        let jobs = self.read();
        let job = jobs.get(&job_id)?;
        let JobCounters {
            total,
            processed,
            succeeded,
            failed,
        } = job.counters;
        let rate = |n: u64| {
            if processed == 0 {
                0.0
            } else {
                n as f64 / processed as f64 * 100.0
            }
        };
        Some(JobStatistics {
            total,
            processed,
            succeeded,
            failed,
            remaining: total.saturating_sub(processed),
            success_rate: rate(succeeded),
            failure_rate: rate(failed),
            elapsed: job.started.elapsed(),
        })
    }

    /// Process rows numbered from the job's current row + 1.
    pub async fn process_batch<R, F, Fut, E>(
        &self,
        job_id: JobId,
        rows: Vec<R>,
        processor: F,
    ) -> Result<BatchResult, TrackerError>
    where
        F: FnMut(u64, R) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: BatchError,
    {
        let first = self
            .read()
            .get(&job_id)
            .map(|job| job.current_row + 1)
            .ok_or(TrackerError::NotTracked(job_id))?;
        let numbered = rows
            .into_iter()
            .enumerate()
            .map(|(idx, row)| (first + idx as u64, row))
            .collect();
        self.process_numbered(job_id, numbered, processor).await
    }

    /// Process rows one at a time, in order, updating progress after each.
    ///
    /// Stops early (with `interrupted` set) once the job is no longer
    /// tracked. A processor error that aborts the batch is returned as
    /// [`TrackerError::Aborted`] and its row is not counted.
    pub async fn process_numbered<R, F, Fut, E>(
        &self,
        job_id: JobId,
        rows: Vec<(u64, R)>,
        mut processor: F,
    ) -> Result<BatchResult, TrackerError>
    where
        F: FnMut(u64, R) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: BatchError,
    {
        if !self.is_tracked(job_id) {
            return Err(TrackerError::NotTracked(job_id));
        }

        let mut result = BatchResult::default();
        for (row, input) in rows {
            if !self.is_tracked(job_id) {
                tracing::info!(job_id = %job_id, row, "job no longer tracked; stopping batch");
                result.interrupted = true;
                break;
            }

            match processor(row, input).await {
                Ok(()) => {
                    result.processed += 1;
                    result.succeeded += 1;
                    self.advance(job_id, row, true);
                }
                Err(e) if e.aborts_batch() => {
                    return Err(TrackerError::Aborted {
                        job_id,
                        row,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    tracing::debug!(job_id = %job_id, row, error = %e, "row failed");
                    result.processed += 1;
                    result.failed += 1;
                    result.errors.push(RowError {
                        row,
                        error: e.to_string(),
                    });
                    self.advance(job_id, row, false);
                }
            }
        }
        Ok(result)
    }
}

fn notify(progress: &JobProgress, listeners: &[Arc<dyn ProgressListener>]) {
    for listener in listeners {
        match catch_unwind(AssertUnwindSafe(|| listener.on_progress(progress))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(job_id = %progress.job_id, error = %e, "progress listener failed");
            }
            Err(_) => {
                tracing::error!(job_id = %progress.job_id, "progress listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::NewJob;
    use proptest::prelude::*;
    use std::sync::Mutex;

    fn tracker() -> ProgressTracker<Arc<InMemoryJobStore>> {
        ProgressTracker::new(InMemoryJobStore::arc())
    }

    async fn running_job(tracker: &ProgressTracker<Arc<InMemoryJobStore>>, total: u64) -> JobId {
        let job = tracker
            .store()
            .create_job(NewJob {
                kind: JobKind::Import,
                total_items: total,
                created_by: None,
            })
            .await
            .unwrap();
        tracker
            .store()
            .transition_job(job.id, JobStatus::Processing)
            .await
            .unwrap();
        tracker.start(job.id, JobMeta::new(JobKind::Import, total));
        job.id
    }

    #[test]
    fn start_does_not_overwrite_existing_job() {
        let tracker = tracker();
        let id = JobId::new(7);
        assert!(tracker.start(id, JobMeta::new(JobKind::Import, 10)));
        tracker.update(id, ProgressUpdate { processed: Some(4), ..Default::default() });

        assert!(!tracker.start(id, JobMeta::new(JobKind::Import, 99)));
        let progress = tracker.snapshot(id).unwrap();
        assert_eq!(progress.total, 10);
        assert_eq!(progress.processed, 4);
    }

    #[test]
    fn update_computes_percent_and_eta() {
        let tracker = tracker();
        let id = JobId::new(1);
        tracker.start(id, JobMeta::new(JobKind::Import, 4));

        let fresh = tracker.snapshot(id).unwrap();
        assert_eq!(fresh.progress_percent, 0.0);
        assert!(fresh.estimated_time_remaining.is_none());

        let progress = tracker
            .update(
                id,
                ProgressUpdate {
                    processed: Some(1),
                    succeeded: Some(1),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(progress.progress_percent, 25.0);
        assert!(progress.estimated_time_remaining.is_some());
    }

    #[test]
    fn zero_total_reports_zero_percent() {
        let tracker = tracker();
        let id = JobId::new(1);
        tracker.start(id, JobMeta::new(JobKind::Sync, 0));
        let progress = tracker
            .update(id, ProgressUpdate { processed: Some(3), ..Default::default() })
            .unwrap();
        assert_eq!(progress.progress_percent, 0.0);
    }

    #[test]
    fn update_on_untracked_job_is_a_no_op() {
        let tracker = tracker();
        assert!(tracker
            .update(JobId::new(42), ProgressUpdate { processed: Some(1), ..Default::default() })
            .is_none());
        assert!(tracker.get_statistics(JobId::new(42)).is_none());
    }

    #[test]
    fn pause_then_resume_toggles_status() {
        let tracker = tracker();
        let id = JobId::new(3);
        tracker.start(id, JobMeta::new(JobKind::Import, 5));

        let seen = Arc::new(Mutex::new(vec![tracker.status(id).unwrap()]));
        let sink = Arc::clone(&seen);
        tracker
            .register(id, move |p: &JobProgress| -> anyhow::Result<()> {
                sink.lock().unwrap().push(p.status);
                Ok(())
            })
            .unwrap();

        let paused = tracker.pause(id).unwrap();
        assert!(paused.paused_at.is_some());
        let resumed = tracker.resume(id).unwrap();
        assert!(resumed.resumed_at.is_some());

        assert_eq!(
            *seen.lock().unwrap(),
            vec![JobStatus::Processing, JobStatus::Paused, JobStatus::Processing]
        );
    }

    #[test]
    fn toggles_are_strict() {
        let tracker = tracker();
        let id = JobId::new(3);
        tracker.start(id, JobMeta::new(JobKind::Import, 5));

        assert!(matches!(
            tracker.resume(id),
            Err(TrackerError::InvalidTransition { from: JobStatus::Processing, .. })
        ));
        tracker.pause(id).unwrap();
        assert!(matches!(
            tracker.pause(id),
            Err(TrackerError::InvalidTransition { from: JobStatus::Paused, .. })
        ));
    }

    #[test]
    fn control_on_untracked_job_fails() {
        let tracker = tracker();
        let err = tracker.cancel(JobId::new(999)).unwrap_err();
        assert!(err.to_string().contains("not being tracked"));
        assert!(matches!(tracker.pause(JobId::new(999)), Err(TrackerError::NotTracked(_))));
        assert!(matches!(tracker.resume(JobId::new(999)), Err(TrackerError::NotTracked(_))));
    }

    #[test]
    fn cancel_drops_job_and_listeners() {
        let tracker = tracker();
        let id = JobId::new(5);
        tracker.start(id, JobMeta::new(JobKind::Import, 5));
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        tracker
            .register(id, move |_: &JobProgress| -> anyhow::Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let progress = tracker.cancel(id).unwrap();
        assert_eq!(progress.status, JobStatus::Cancelled);
        assert!(!tracker.is_tracked(id));

        tracker.update(id, ProgressUpdate { processed: Some(1), ..Default::default() });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failing_listeners_do_not_block_others() {
        let tracker = tracker();
        let id = JobId::new(9);
        tracker.start(id, JobMeta::new(JobKind::Import, 2));

        tracker
            .register(id, |_: &JobProgress| -> anyhow::Result<()> { anyhow::bail!("listener down") })
            .unwrap();
        tracker
            .register(id, |_: &JobProgress| -> anyhow::Result<()> { panic!("listener exploded") })
            .unwrap();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        tracker
            .register(id, move |_: &JobProgress| -> anyhow::Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let progress = tracker.update(id, ProgressUpdate { processed: Some(1), ..Default::default() });
        assert_eq!(progress.map(|p| p.processed), Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregistered_listeners_stop_receiving() {
        let tracker = tracker();
        let id = JobId::new(2);
        tracker.start(id, JobMeta::new(JobKind::Import, 2));
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let handle = tracker
            .register(id, move |_: &JobProgress| -> anyhow::Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert!(tracker.unregister(id, handle));
        assert!(!tracker.unregister(id, handle));
        tracker.update(id, ProgressUpdate { processed: Some(1), ..Default::default() });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn process_batch_collects_row_errors() {
        let tracker = tracker();
        let id = running_job(&tracker, 3).await;

        let result = tracker
            .process_batch(id, vec!["a", "b", "c"], |_row, value| async move {
                if value == "b" {
                    Err(format!("rejected {value}"))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(result.processed, 3);
        assert_eq!(result.succeeded, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(
            result.errors,
            vec![RowError {
                row: 2,
                error: "rejected b".into()
            }]
        );

        let stats = tracker.get_statistics(id).unwrap();
        assert_eq!(stats.remaining, 0);
        assert!((stats.success_rate - 200.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn process_batch_requires_tracking() {
        let tracker = tracker();
        let err = tracker
            .process_batch(JobId::new(77), vec![1], |_, _| async { Ok::<(), String>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::NotTracked(_)));
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_batch() {
        let tracker = Arc::new(tracker());
        let id = running_job(&tracker, 4).await;

        let handle = Arc::clone(&tracker);
        let result = tracker
            .process_batch(id, vec![1, 2, 3, 4], move |row, _| {
                if row == 2 {
                    handle.cancel(id).unwrap();
                }
                async { Ok::<(), String>(()) }
            })
            .await
            .unwrap();

        // Row 2 was already submitted when the cancel landed.
        assert_eq!(result.processed, 2);
        assert!(result.interrupted);
    }

    #[tokio::test]
    async fn complete_persists_and_untracks() {
        let tracker = tracker();
        let id = running_job(&tracker, 2).await;
        let counters = JobCounters { total: 2, processed: 2, succeeded: 2, failed: 0 };

        let job = tracker.complete(id, counters).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.succeeded_items, 2);
        assert!(!tracker.is_tracked(id));

        // Second call is a logged no-op.
        assert!(tracker.complete(id, counters).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fail_records_the_error() {
        let tracker = tracker();
        let id = running_job(&tracker, 2).await;

        let job = tracker.fail(id, "storage unavailable").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("storage unavailable"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn processed_is_monotonic(values in prop::collection::vec(0u64..50, 1..30)) {
            let tracker = tracker();
            let id = JobId::new(1);
            tracker.start(id, JobMeta::new(JobKind::Import, 40));

            let mut last = 0;
            for value in values {
                let progress = tracker
                    .update(id, ProgressUpdate { processed: Some(value), ..Default::default() })
                    .unwrap();
                prop_assert!(progress.processed >= last);
                prop_assert!(progress.processed <= 40);
                last = progress.processed;
            }
        }
    }
}
