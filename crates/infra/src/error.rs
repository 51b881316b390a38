//! Storage-layer error shared by the catalog store, the job store and the
//! sync queue.

use std::time::Duration;

use thiserror::Error;

use crate::retry::ErrorKind;

/// Error returned by any storage backend (in-memory or Postgres).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// A natural-key (unique) constraint rejected the write.
    #[error("unique violation: {0}")]
    UniqueViolation(String),

    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("check constraint violation: {0}")]
    CheckViolation(String),

    /// Deadlock, lock timeout or serialization failure.
    #[error("lock contention: {0}")]
    LockContention(String),

    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),

    /// A single call could not reach the database.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// The storage backend is gone entirely (pool closed, store shut down).
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("query failed: {0}")]
    Query(String),
}

impl StoreError {
    /// Failure kind used by the retry classifier.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::UniqueViolation(_)
            | StoreError::ForeignKeyViolation(_)
            | StoreError::CheckViolation(_) => ErrorKind::ConstraintViolation,
            StoreError::LockContention(_) => ErrorKind::LockContention,
            StoreError::Timeout(_) => ErrorKind::Timeout,
            StoreError::Connectivity(_) | StoreError::Unavailable(_) => ErrorKind::Connectivity,
            StoreError::NotFound(_) | StoreError::Query(_) => ErrorKind::Storage,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{classify, FailureClass};

    #[test]
    fn constraint_errors_are_permanent() {
        for err in [
            StoreError::UniqueViolation("products_name_key".into()),
            StoreError::ForeignKeyViolation("items_product_id_fkey".into()),
            StoreError::CheckViolation("price_positive".into()),
        ] {
            assert_eq!(classify(err.kind()), FailureClass::Permanent, "{err}");
        }
    }

    #[test]
    fn transient_errors_are_retryable() {
        for err in [
            StoreError::LockContention("deadlock detected".into()),
            StoreError::Timeout(Duration::from_secs(1)),
            StoreError::Connectivity("connection reset".into()),
        ] {
            assert_eq!(classify(err.kind()), FailureClass::Retryable, "{err}");
        }
    }
}
