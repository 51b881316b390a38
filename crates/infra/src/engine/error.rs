use thiserror::Error;

use catalogsync_catalog::MappingError;
use catalogsync_core::JobId;

use crate::jobs::{JobStatus, JobStoreError, TrackerError};
use crate::queue::QueueError;

/// Errors surfaced to the engine's caller.
///
/// Per-row and per-item problems never show up here; they are recorded on
/// the items and summarised in the run result.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("job {0} is already running")]
    AlreadyRunning(JobId),

    #[error("job {job_id} is {status}: {reason}")]
    InvalidState {
        job_id: JobId,
        status: JobStatus,
        reason: String,
    },

    /// A store could not be reached at all; the running job was failed.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Jobs(JobStoreError),

    #[error(transparent)]
    Tracker(TrackerError),

    #[error(transparent)]
    Queue(QueueError),
}

impl EngineError {
    /// Control operation on a job the tracker does not know.
    pub fn is_not_tracked(&self) -> bool {
        matches!(self, EngineError::Tracker(TrackerError::NotTracked(_)))
    }
}

impl From<JobStoreError> for EngineError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => EngineError::NotFound(id),
            e if e.is_unavailable() => EngineError::StorageUnavailable(e.to_string()),
            e => EngineError::Jobs(e),
        }
    }
}

impl From<TrackerError> for EngineError {
    fn from(err: TrackerError) -> Self {
        match err {
            TrackerError::Store(e) => e.into(),
            e => EngineError::Tracker(e),
        }
    }
}

impl From<QueueError> for EngineError {
    fn from(err: QueueError) -> Self {
        if err.is_unavailable() {
            EngineError::StorageUnavailable(err.to_string())
        } else {
            EngineError::Queue(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    #[test]
    fn unavailable_stores_collapse_into_one_variant() {
        let err: EngineError = JobStoreError::Storage(StoreError::Unavailable("down".into())).into();
        assert!(matches!(err, EngineError::StorageUnavailable(_)));

        let err: EngineError = QueueError::Storage(StoreError::Unavailable("down".into())).into();
        assert!(matches!(err, EngineError::StorageUnavailable(_)));

        let err: EngineError = QueueError::NotFound(catalogsync_core::QueueEntryId::new(1)).into();
        assert!(matches!(err, EngineError::Queue(_)));
    }

    #[test]
    fn tracker_errors_keep_their_message() {
        let err: EngineError = TrackerError::NotTracked(JobId::new(999)).into();
        assert!(err.is_not_tracked());
        assert!(err.to_string().contains("not being tracked"));

        let err: EngineError = TrackerError::Store(JobStoreError::NotFound(JobId::new(4))).into();
        assert!(matches!(err, EngineError::NotFound(id) if id == JobId::new(4)));
    }
}
