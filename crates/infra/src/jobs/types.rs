//! Job and item records and their lifecycles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use catalogsync_core::{DomainError, ItemId, JobId};

use crate::retry::ErrorKind;

/// What a job ingests.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// A bulk tabular import (CSV rows).
    Import,
    /// A run over queued ERP change events.
    Sync,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Import => "import",
            JobKind::Sync => "sync",
        }
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "import" => Ok(JobKind::Import),
            "sync" => Ok(JobKind::Sync),
            other => Err(DomainError::validation(format!("unknown job kind '{other}'"))),
        }
    }
}

/// Job lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Allowed moves: pending → processing → {paused ⇄ processing} →
    /// {completed | failed | cancelled}. Terminal states are final.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Paused)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Paused, Processing)
                | (Paused, Failed)
                | (Paused, Cancelled)
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => JobStatus::Pending,
            "processing" => JobStatus::Processing,
            "paused" => JobStatus::Paused,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            other => return Err(DomainError::validation(format!("unknown job status '{other}'"))),
        })
    }
}

/// Aggregate item counters of a job.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl JobCounters {
    pub fn with_total(total: u64) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    /// `processed = succeeded + failed ≤ total`.
    pub fn check(&self) -> Result<(), DomainError> {
        if self.succeeded + self.failed != self.processed {
            return Err(DomainError::invariant(format!(
                "processed ({}) != succeeded ({}) + failed ({})",
                self.processed, self.succeeded, self.failed
            )));
        }
        if self.processed > self.total {
            return Err(DomainError::invariant(format!(
                "processed ({}) exceeds total ({})",
                self.processed, self.total
            )));
        }
        Ok(())
    }

    pub fn record_success(&mut self) {
        self.processed += 1;
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self) {
        self.processed += 1;
        self.failed += 1;
    }
}

/// One submitted batch of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// External-facing identifier.
    pub uuid: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub total_items: u64,
    pub processed_items: u64,
    pub succeeded_items: u64,
    pub failed_items: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub error_message: Option<String>,
}

impl Job {
    pub fn new(id: JobId, new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            uuid: Uuid::now_v7(),
            kind: new.kind,
            status: JobStatus::Pending,
            total_items: new.total_items,
            processed_items: 0,
            succeeded_items: 0,
            failed_items: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            created_by: new.created_by,
            error_message: None,
        }
    }

    pub fn counters(&self) -> JobCounters {
        JobCounters {
            total: self.total_items,
            processed: self.processed_items,
            succeeded: self.succeeded_items,
            failed: self.failed_items,
        }
    }

    pub fn set_counters(&mut self, counters: JobCounters) {
        self.total_items = counters.total;
        self.processed_items = counters.processed;
        self.succeeded_items = counters.succeeded;
        self.failed_items = counters.failed;
    }

    /// Apply a status change, stamping `started_at`/`completed_at`.
    pub fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::illegal_transition(self.status, next));
        }
        if next == JobStatus::Processing && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub kind: JobKind,
    pub total_items: u64,
    pub created_by: Option<String>,
}

/// Final state written when a job leaves the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub counters: JobCounters,
    pub error_message: Option<String>,
}

/// Item lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    Success,
    FailedRetryable,
    FailedPermanent,
    Skipped,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 6] = [
        ItemStatus::Pending,
        ItemStatus::Processing,
        ItemStatus::Success,
        ItemStatus::FailedRetryable,
        ItemStatus::FailedPermanent,
        ItemStatus::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Success => "success",
            ItemStatus::FailedRetryable => "failed_retryable",
            ItemStatus::FailedPermanent => "failed_permanent",
            ItemStatus::Skipped => "skipped",
        }
    }

    /// The item has been attempted and an outcome recorded.
    pub fn is_settled(&self) -> bool {
        !matches!(self, ItemStatus::Pending | ItemStatus::Processing)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ItemStatus::FailedRetryable | ItemStatus::FailedPermanent | ItemStatus::Skipped
        )
    }
}

impl core::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ItemStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ItemStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown item status '{s}'")))
    }
}

/// One unit of work within a job (an input row or a queued change).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub job_id: JobId,
    /// Natural identifier from the source (item code or queue subject).
    pub source_code: String,
    pub status: ItemStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error_type: Option<ErrorKind>,
    pub last_error_message: Option<String>,
    /// 1-based position in the input; unique within the job.
    pub source_row_number: u64,
    pub first_attempted_at: Option<DateTime<Utc>>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub succeeded_at: Option<DateTime<Utc>>,
    pub retry_after: Option<DateTime<Utc>>,
}

impl Item {
    pub fn new(
        id: ItemId,
        job_id: JobId,
        source_code: impl Into<String>,
        source_row_number: u64,
        max_retries: u32,
    ) -> Self {
        Self {
            id,
            job_id,
            source_code: source_code.into(),
            status: ItemStatus::Pending,
            retry_count: 0,
            max_retries,
            last_error_type: None,
            last_error_message: None,
            source_row_number,
            first_attempted_at: None,
            last_attempted_at: None,
            succeeded_at: None,
            retry_after: None,
        }
    }

    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        self.status = ItemStatus::Processing;
        self.first_attempted_at.get_or_insert(now);
        self.last_attempted_at = Some(now);
    }

    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) {
        self.status = ItemStatus::Success;
        self.succeeded_at = Some(now);
        self.last_attempted_at = Some(now);
        self.retry_after = None;
    }

    pub fn mark_skipped(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = ItemStatus::Skipped;
        self.last_error_type = Some(ErrorKind::Validation);
        self.last_error_message = Some(reason.into());
        self.last_attempted_at = Some(now);
    }

    /// A retryable item whose backoff has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ItemStatus::FailedRetryable && self.retry_after.is_none_or(|at| at <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    pub source_code: String,
    pub source_row_number: u64,
    pub max_retries: u32,
}

/// Item counts per status for one job.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ItemStats {
    pub pending: u64,
    pub processing: u64,
    pub success: u64,
    pub failed_retryable: u64,
    pub failed_permanent: u64,
    pub skipped: u64,
}

impl ItemStats {
    pub fn add(&mut self, status: ItemStatus, count: u64) {
        match status {
            ItemStatus::Pending => self.pending += count,
            ItemStatus::Processing => self.processing += count,
            ItemStatus::Success => self.success += count,
            ItemStatus::FailedRetryable => self.failed_retryable += count,
            ItemStatus::FailedPermanent => self.failed_permanent += count,
            ItemStatus::Skipped => self.skipped += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending
            + self.processing
            + self.success
            + self.failed_retryable
            + self.failed_permanent
            + self.skipped
    }

    /// Job counters implied by settled items.
    pub fn counters(&self) -> JobCounters {
        let failed = self.failed_retryable + self.failed_permanent + self.skipped;
        JobCounters {
            total: self.total(),
            processed: self.success + failed,
            succeeded: self.success,
            failed,
        }
    }
}
