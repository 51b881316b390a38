//! Jobs, their items, and the progress of running jobs.
//!
//! ## Components
//!
//! - `Job` / `Item`: persisted records and their lifecycles
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `ProgressTracker`: registry of running jobs with listeners and
//!   pause/resume/cancel control

pub mod postgres;
pub mod store;
pub mod tracker;
pub mod types;

pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobFilter, JobStore, JobStoreError};
pub use tracker::{
    BatchError, BatchResult, JobMeta, JobProgress, JobStatistics, ListenerId, ProgressListener,
    ProgressTracker, ProgressUpdate, RowError, TrackerError,
};
pub use types::{
    Item, ItemStats, ItemStatus, Job, JobCounters, JobKind, JobOutcome, JobStatus, NewItem, NewJob,
};
