//! Catalog storage abstraction used by the upsert executor.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use catalogsync_catalog::{Fields, LinkTable, NaturalKey, Table};
use catalogsync_core::RecordId;

use crate::error::StoreError;

/// A stored catalog row: its id and the non-null columns it holds.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: RecordId,
    pub fields: Fields,
}

/// Row-level access to the catalog tables.
///
/// Every table carries a unique constraint on its natural key; `insert`
/// reports a clash as [`StoreError::UniqueViolation`].
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn find(&self, table: Table, key: &NaturalKey) -> Result<Option<StoredRecord>, StoreError>;

    /// Insert a row with its key columns and `fields`; returns the new id.
    async fn insert(&self, table: Table, key: &NaturalKey, fields: &Fields) -> Result<RecordId, StoreError>;

    /// Overwrite the given columns of an existing row.
    async fn update(&self, table: Table, id: RecordId, fields: &Fields) -> Result<(), StoreError>;

    async fn links(&self, link: LinkTable, owner: RecordId) -> Result<BTreeSet<String>, StoreError>;

    async fn add_links(&self, link: LinkTable, owner: RecordId, values: &BTreeSet<String>) -> Result<(), StoreError>;

    async fn remove_links(&self, link: LinkTable, owner: RecordId, values: &BTreeSet<String>) -> Result<(), StoreError>;

    /// Cheap liveness check.
    async fn ping(&self) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> CatalogStore for Arc<S>
where
    S: CatalogStore + ?Sized,
{
    async fn find(&self, table: Table, key: &NaturalKey) -> Result<Option<StoredRecord>, StoreError> {
        (**self).find(table, key).await
    }

    async fn insert(&self, table: Table, key: &NaturalKey, fields: &Fields) -> Result<RecordId, StoreError> {
        (**self).insert(table, key, fields).await
    }

    async fn update(&self, table: Table, id: RecordId, fields: &Fields) -> Result<(), StoreError> {
        (**self).update(table, id, fields).await
    }

    async fn links(&self, link: LinkTable, owner: RecordId) -> Result<BTreeSet<String>, StoreError> {
        (**self).links(link, owner).await
    }

    async fn add_links(&self, link: LinkTable, owner: RecordId, values: &BTreeSet<String>) -> Result<(), StoreError> {
        (**self).add_links(link, owner, values).await
    }

    async fn remove_links(&self, link: LinkTable, owner: RecordId, values: &BTreeSet<String>) -> Result<(), StoreError> {
        (**self).remove_links(link, owner, values).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        (**self).ping().await
    }
}
