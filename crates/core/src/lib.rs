//! `catalogsync-core`: shared building blocks for the ingestion pipeline.
//!
//! This crate contains **pure** primitives (no IO, no async).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{ItemId, JobId, QueueEntryId, RecordId};
