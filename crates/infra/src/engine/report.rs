use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use crate::jobs::{BatchError, Item, ItemStats, Job, JobCounters, JobProgress, RowError};

/// Result of one engine run over a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// The job as persisted at the end of the run.
    pub job: Job,
    pub counters: JobCounters,
    pub errors: Vec<RowError>,
    pub warnings: Vec<String>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn progress_percent(&self) -> f64 {
        if self.counters.total == 0 {
            0.0
        } else {
            self.counters.processed as f64 / self.counters.total as f64 * 100.0
        }
    }
}

/// Persisted state of a job plus its live progress, if running.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job: Job,
    pub items: ItemStats,
    /// Failed and skipped items, in row order.
    pub failures: Vec<Item>,
    pub progress: Option<JobProgress>,
}

/// Why a row did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RowFailure {
    pub message: String,
    /// A store is unreachable; the whole run stops.
    pub fatal: bool,
}

impl RowFailure {
    pub fn row(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }
}

impl core::fmt::Display for RowFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.message)
    }
}

impl BatchError for RowFailure {
    fn aborts_batch(&self) -> bool {
        self.fatal
    }
}

/// Warnings gathered while a run is in flight.
#[derive(Debug, Default)]
pub(crate) struct Warnings(Mutex<Vec<String>>);

impl Warnings {
    pub fn extend(&self, warnings: impl IntoIterator<Item = String>) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(warnings);
    }

    pub fn push(&self, warning: String) {
        self.extend([warning]);
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
