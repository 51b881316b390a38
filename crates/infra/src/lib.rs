//! Infrastructure layer: storage, jobs, the sync queue and the engine that
//! drives import and sync runs.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod queue;
pub mod retry;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, DatabaseConfig, EngineConfig};
pub use engine::{Engine, EngineError, JobReport, RunSummary};
pub use error::StoreError;
pub use executor::{CatalogStore, ExecutionReport, InMemoryCatalogStore, PostgresCatalogStore, UpsertExecutor};
pub use jobs::{InMemoryJobStore, JobStore, PostgresJobStore, ProgressTracker};
pub use queue::{InMemorySyncQueue, PostgresSyncQueue, PriorityDequeuer, SyncQueue};
pub use retry::{ErrorKind, FailureClass, RetryPolicy};
