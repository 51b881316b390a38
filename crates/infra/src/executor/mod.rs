//! Storage Upsert Executor: applies an operation list with natural-key
//! upsert semantics.
//!
//! Operations run in order and each outcome is recorded on its own: a
//! failure does not stop the list, but children of a failed (or never
//! written) parent fail as `missing_parent` instead of writing a dangling
//! reference. Every storage call is bounded by the executor's timeout.
//!
//! The only error `execute` itself returns is [`ExecutorError::Unavailable`]:
//! with the store gone there is nothing useful left to record per operation.

pub mod memory;
pub mod postgres;
pub mod store;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use catalogsync_catalog::{ContentSection, FieldValue, Fields, LinkTable, NaturalKey, Operation, Table};
use catalogsync_core::RecordId;

use crate::error::StoreError;
use crate::retry::ErrorKind;

pub use memory::{FaultPoint, InMemoryCatalogStore, WriteStats};
pub use postgres::PostgresCatalogStore;
pub use store::{CatalogStore, StoredRecord};

/// What an operation did to storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum OpEffect {
    Inserted { id: RecordId },
    Updated { id: RecordId, columns: usize },
    /// The stored row already matched.
    Unchanged { id: RecordId },
    Synced { added: usize, removed: usize },
}

impl OpEffect {
    pub fn is_write(&self) -> bool {
        match self {
            OpEffect::Inserted { .. } | OpEffect::Updated { .. } => true,
            OpEffect::Unchanged { .. } => false,
            OpEffect::Synced { added, removed } => added + removed > 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationFailure {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip)]
    unavailable: bool,
}

impl OperationFailure {
    fn missing_parent(message: String) -> Self {
        Self {
            kind: ErrorKind::MissingParent,
            message,
            unavailable: false,
        }
    }
}

impl From<StoreError> for OperationFailure {
    fn from(err: StoreError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            unavailable: err.is_unavailable(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationResult {
    pub index: usize,
    /// Human-readable operation, e.g. `upsert items[A-1]`.
    pub operation: String,
    pub target: &'static str,
    pub outcome: Result<OpEffect, OperationFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<OperationResult>,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn first_failure(&self) -> Option<(&OperationResult, &OperationFailure)> {
        self.results
            .iter()
            .find_map(|r| r.outcome.as_ref().err().map(|f| (r, f)))
    }

    /// Operations that changed stored data.
    pub fn writes(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(&r.outcome, Ok(effect) if effect.is_write()))
            .count()
    }

    fn push(&mut self, index: usize, operation: &Operation, outcome: Result<OpEffect, OperationFailure>) {
        if outcome.is_ok() {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        self.results.push(OperationResult {
            index,
            operation: operation.to_string(),
            target: operation.target(),
            outcome,
        });
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Readability of one stored field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum FieldProbe {
    Populated,
    /// The row was read and the field holds no data.
    EmptyButAccessible,
    RecordMissing,
    /// The field could not be read at all.
    QueryFailed(String),
}

/// Ids resolved so far in one operation list.
#[derive(Debug, Default)]
struct Context {
    products: HashMap<String, Result<RecordId, String>>,
    items: HashMap<String, Result<RecordId, String>>,
}

impl Context {
    fn product(&self, name: &str) -> Result<RecordId, OperationFailure> {
        match self.products.get(name) {
            Some(Ok(id)) => Ok(*id),
            Some(Err(reason)) => Err(OperationFailure::missing_parent(format!(
                "product '{name}' failed: {reason}"
            ))),
            None => Err(OperationFailure::missing_parent(format!(
                "product '{name}' was not written before its item"
            ))),
        }
    }

    fn item(&self, code: &str) -> Result<RecordId, OperationFailure> {
        match self.items.get(code) {
            Some(Ok(id)) => Ok(*id),
            Some(Err(reason)) => Err(OperationFailure::missing_parent(format!(
                "item '{code}' failed: {reason}"
            ))),
            None => Err(OperationFailure::missing_parent(format!(
                "item '{code}' was not written before its dependents"
            ))),
        }
    }
}

/// Applies operation lists against a [`CatalogStore`].
#[derive(Debug, Clone)]
pub struct UpsertExecutor<C> {
    store: C,
    timeout: Duration,
}

impl<C: CatalogStore> UpsertExecutor<C> {
    pub fn new(store: C, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn store(&self) -> &C {
        &self.store
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T, StoreError>>) -> Result<T, StoreError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }

    /// Check the store is reachable at all.
    pub async fn ping(&self) -> Result<(), ExecutorError> {
        match self.bounded(self.store.ping()).await {
            Ok(()) => Ok(()),
            Err(e) => Err(ExecutorError::Unavailable(e.to_string())),
        }
    }

    pub async fn execute(&self, operations: &[Operation]) -> Result<ExecutionReport, ExecutorError> {
        let mut report = ExecutionReport::default();
        let mut context = Context::default();

        for (index, operation) in operations.iter().enumerate() {
            let outcome = self.apply(operation, &mut context).await;

            if let Err(failure) = &outcome {
                if failure.unavailable {
                    tracing::error!(operation = %operation, error = %failure.message, "catalog store unavailable");
                    return Err(ExecutorError::Unavailable(failure.message.clone()));
                }
                tracing::debug!(
                    operation = %operation,
                    kind = %failure.kind,
                    error = %failure.message,
                    "operation failed"
                );
            }
            report.push(index, operation, outcome);
        }

        Ok(report)
    }

    async fn apply(
        &self,
        operation: &Operation,
        context: &mut Context,
    ) -> Result<OpEffect, OperationFailure> {
        match operation {
            Operation::UpsertProduct { name, fields } => {
                let key = NaturalKey::single("name", FieldValue::text(name.as_str()));
                let result = self.upsert(Table::Products, &key, fields).await;
                context.products.insert(name.clone(), record_id(&result));
                result.map_err(OperationFailure::from)
            }
            Operation::UpsertItem {
                item_code,
                product_name,
                fields,
            } => {
                let result = match context.product(product_name) {
                    Ok(product_id) => {
                        let mut fields = fields.clone();
                        fields.insert("product_id", FieldValue::Reference(product_id));
                        let key = NaturalKey::single("item_code", FieldValue::text(item_code.as_str()));
                        self.upsert(Table::Items, &key, &fields).await.map_err(OperationFailure::from)
                    }
                    Err(failure) => Err(failure),
                };
                context.items.insert(
                    item_code.clone(),
                    result.as_ref().map(effect_id).map_err(|f| f.message.clone()),
                );
                result
            }
            Operation::UpsertAttributes { item_code, fields } => {
                let item_id = context.item(item_code)?;
                let key = NaturalKey::single("item_id", FieldValue::Reference(item_id));
                Ok(self.upsert(Table::ItemAttributes, &key, fields).await?)
            }
            Operation::UpsertContent {
                item_code,
                section,
                body,
            } => {
                let item_id = context.item(item_code)?;
                let key = content_key(item_id, *section);
                let mut fields = Fields::new();
                fields.insert("body", FieldValue::text(body.as_str()));
                Ok(self.upsert(Table::ContentSections, &key, &fields).await?)
            }
            Operation::SyncLinks {
                item_code,
                link,
                values,
            } => {
                let item_id = context.item(item_code)?;
                Ok(self.sync_links(*link, item_id, values).await?)
            }
        }
    }

    /// Find by natural key, then update changed columns or insert.
    ///
    /// A unique violation on insert means a concurrent writer created the
    /// row first; it is re-read and treated as an update.
    async fn upsert(&self, table: Table, key: &NaturalKey, fields: &Fields) -> Result<OpEffect, StoreError> {
        if let Some(existing) = self.bounded(self.store.find(table, key)).await? {
            return self.update_changed(table, existing, fields).await;
        }

        match self.bounded(self.store.insert(table, key, fields)).await {
            Ok(id) => Ok(OpEffect::Inserted { id }),
            Err(StoreError::UniqueViolation(msg)) => {
                tracing::debug!(table = %table, key = %key, "insert raced with another writer; updating");
                match self.bounded(self.store.find(table, key)).await? {
                    Some(existing) => self.update_changed(table, existing, fields).await,
                    None => Err(StoreError::UniqueViolation(msg)),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn update_changed(
        &self,
        table: Table,
        existing: StoredRecord,
        fields: &Fields,
    ) -> Result<OpEffect, StoreError> {
        let changed: Fields = fields
            .iter()
            .filter(|(column, value)| existing.fields.get(*column) != Some(*value))
            .map(|(column, value)| (*column, value.clone()))
            .collect();

        if changed.is_empty() {
            return Ok(OpEffect::Unchanged { id: existing.id });
        }
        self.bounded(self.store.update(table, existing.id, &changed)).await?;
        Ok(OpEffect::Updated {
            id: existing.id,
            columns: changed.len(),
        })
    }

    async fn sync_links(
        &self,
        link: LinkTable,
        owner: RecordId,
        wanted: &BTreeSet<String>,
    ) -> Result<OpEffect, StoreError> {
        let current = self.bounded(self.store.links(link, owner)).await?;
        let to_add: BTreeSet<String> = wanted.difference(&current).cloned().collect();
        let to_remove: BTreeSet<String> = current.difference(wanted).cloned().collect();

        if !to_add.is_empty() {
            self.bounded(self.store.add_links(link, owner, &to_add)).await?;
        }
        if !to_remove.is_empty() {
            self.bounded(self.store.remove_links(link, owner, &to_remove)).await?;
        }
        Ok(OpEffect::Synced {
            added: to_add.len(),
            removed: to_remove.len(),
        })
    }

    /// Read `columns` of the row with `key`, telling an unreadable field
    /// apart from one that is readable but empty.
    pub async fn probe(
        &self,
        table: Table,
        key: &NaturalKey,
        columns: &[&'static str],
    ) -> BTreeMap<&'static str, FieldProbe> {
        let all = |probe: FieldProbe| -> BTreeMap<&'static str, FieldProbe> {
            columns.iter().map(|c| (*c, probe.clone())).collect()
        };

        match self.bounded(self.store.find(table, key)).await {
            Err(e) => {
                tracing::warn!(table = %table, key = %key, error = %e, "field probe failed");
                all(FieldProbe::QueryFailed(e.to_string()))
            }
            Ok(None) => all(FieldProbe::RecordMissing),
            Ok(Some(record)) => columns
                .iter()
                .map(|column| {
                    let probe = match record.fields.get(column) {
                        Some(value) if !value.is_blank() => FieldProbe::Populated,
                        _ => FieldProbe::EmptyButAccessible,
                    };
                    (*column, probe)
                })
                .collect(),
        }
    }
}

fn record_id(result: &Result<OpEffect, StoreError>) -> Result<RecordId, String> {
    match result {
        Ok(effect) => Ok(effect_id(effect)),
        Err(e) => Err(e.to_string()),
    }
}

fn effect_id(effect: &OpEffect) -> RecordId {
    match effect {
        OpEffect::Inserted { id } | OpEffect::Updated { id, .. } | OpEffect::Unchanged { id } => *id,
        // Link syncs never resolve a parent.
        OpEffect::Synced { .. } => RecordId::new(0),
    }
}

fn content_key(item_id: RecordId, section: ContentSection) -> NaturalKey {
    NaturalKey::pair(
        ("item_id", FieldValue::Reference(item_id)),
        ("section", FieldValue::text(section.as_str())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use catalogsync_catalog::{CatalogTransformer, RawRow, RowTransform};

    fn executor() -> (Arc<InMemoryCatalogStore>, UpsertExecutor<Arc<InMemoryCatalogStore>>) {
        let store = Arc::new(InMemoryCatalogStore::new());
        let executor = UpsertExecutor::new(Arc::clone(&store), Duration::from_secs(1));
        (store, executor)
    }

    fn operations(code: &str) -> Vec<Operation> {
        let row = RawRow::from_pairs([
            ("item_code", code),
            ("product_name", "Garden Hose"),
            ("item_name", "Garden Hose 25m"),
            ("list_price", "19.99"),
            ("overview", "Flexible hose."),
            ("categories", "garden, watering"),
        ]);
        CatalogTransformer::new().transform(&row, 1).operations
    }

    #[tokio::test]
    async fn inserts_then_threads_parent_ids() {
        let (store, executor) = executor();
        let report = executor.execute(&operations("A-1")).await.unwrap();

        assert!(report.is_success(), "{report:?}");
        assert_eq!(report.successful, 5);
        assert_eq!(store.row_count(Table::Products), 1);
        assert_eq!(store.row_count(Table::Items), 1);

        let product = store
            .record(Table::Products, &NaturalKey::single("name", FieldValue::text("Garden Hose")))
            .unwrap();
        let item = store
            .record(Table::Items, &NaturalKey::single("item_code", FieldValue::text("A-1")))
            .unwrap();
        assert_eq!(item.fields.get("product_id"), Some(&FieldValue::Reference(product.id)));
        assert_eq!(
            store.link_values(LinkTable::ItemCategories, item.id),
            BTreeSet::from(["garden".to_string(), "watering".to_string()])
        );
    }

    #[tokio::test]
    async fn second_run_writes_nothing() {
        let (store, executor) = executor();
        let ops = operations("A-1");
        executor.execute(&ops).await.unwrap();
        store.reset_stats();

        let report = executor.execute(&ops).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.writes(), 0);
        assert_eq!(store.stats().total(), 0);
    }

    #[tokio::test]
    async fn only_changed_columns_are_updated() {
        let (store, executor) = executor();
        executor.execute(&operations("A-1")).await.unwrap();

        let mut ops = operations("A-1");
        if let Operation::UpsertItem { fields, .. } = &mut ops[1] {
            fields.insert("name", FieldValue::text("Garden Hose 30m"));
        }
        let report = executor.execute(&ops).await.unwrap();

        let item_id = store
            .record(Table::Items, &NaturalKey::single("item_code", FieldValue::text("A-1")))
            .map(|r| r.id)
            .unwrap();
        assert_eq!(
            report.results[1].outcome,
            Ok(OpEffect::Updated { id: item_id, columns: 1 })
        );
        assert_eq!(report.results[0].outcome.as_ref().map(OpEffect::is_write), Ok(false));
    }

    #[tokio::test]
    async fn failed_parent_fails_children_as_missing_parent() {
        let (store, executor) = executor();
        store.push_fault(
            FaultPoint::Insert(Table::Products),
            StoreError::CheckViolation("products_name_check".into()),
        );

        let report = executor.execute(&operations("A-1")).await.unwrap();
        assert_eq!(report.successful, 0);
        assert_eq!(report.failed, 5);

        let kinds: Vec<ErrorKind> = report
            .results
            .iter()
            .filter_map(|r| r.outcome.as_ref().err().map(|f| f.kind))
            .collect();
        assert_eq!(kinds[0], ErrorKind::ConstraintViolation);
        assert!(kinds[1..].iter().all(|k| *k == ErrorKind::MissingParent));
        assert_eq!(store.row_count(Table::Items), 0);
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_siblings() {
        let (store, executor) = executor();
        store.push_fault(
            FaultPoint::Find(Table::ItemAttributes),
            StoreError::LockContention("deadlock detected".into()),
        );

        let report = executor.execute(&operations("A-1")).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.successful, 4);
        let (failed, failure) = report.first_failure().unwrap();
        assert_eq!(failed.target, "item_attributes");
        assert_eq!(failure.kind, ErrorKind::LockContention);
    }

    #[tokio::test]
    async fn concurrent_insert_becomes_update() {
        let (store, executor) = executor();
        let key = NaturalKey::single("name", FieldValue::text("Garden Hose"));
        store.plant_conflict(Table::Products, &key, Fields::new());

        let report = executor.execute(&operations("A-1")).await.unwrap();
        assert!(report.is_success(), "{report:?}");
        assert_eq!(store.row_count(Table::Products), 1);
        assert!(matches!(
            report.results[0].outcome,
            Ok(OpEffect::Unchanged { .. }) | Ok(OpEffect::Updated { .. })
        ));
    }

    #[tokio::test]
    async fn link_sync_adds_and_removes() {
        let (store, executor) = executor();
        executor.execute(&operations("A-1")).await.unwrap();

        let ops = vec![
            operations("A-1")[0].clone(),
            operations("A-1")[1].clone(),
            Operation::SyncLinks {
                item_code: "A-1".into(),
                link: LinkTable::ItemCategories,
                values: BTreeSet::from(["garden".to_string(), "outdoor".to_string()]),
            },
        ];
        let report = executor.execute(&ops).await.unwrap();
        assert_eq!(report.results[2].outcome, Ok(OpEffect::Synced { added: 1, removed: 1 }));

        let item = store
            .record(Table::Items, &NaturalKey::single("item_code", FieldValue::text("A-1")))
            .unwrap();
        assert_eq!(
            store.link_values(LinkTable::ItemCategories, item.id),
            BTreeSet::from(["garden".to_string(), "outdoor".to_string()])
        );
    }

    #[tokio::test]
    async fn slow_storage_times_out_as_retryable() {
        let store = Arc::new(InMemoryCatalogStore::new());
        store.set_latency(Some(Duration::from_millis(200)));
        let executor = UpsertExecutor::new(Arc::clone(&store), Duration::from_millis(20));

        let report = executor.execute(&operations("A-1")).await.unwrap();
        let (_, failure) = report.first_failure().unwrap();
        assert_eq!(failure.kind, ErrorKind::Timeout);
        assert_eq!(
            crate::retry::classify(failure.kind),
            crate::retry::FailureClass::Retryable
        );
    }

    #[tokio::test]
    async fn unreachable_store_aborts_the_list() {
        let (store, executor) = executor();
        store.set_unavailable(true);
        assert!(matches!(executor.ping().await, Err(ExecutorError::Unavailable(_))));
        assert!(matches!(
            executor.execute(&operations("A-1")).await,
            Err(ExecutorError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn probe_distinguishes_empty_from_unreadable() {
        let (store, executor) = executor();
        executor.execute(&operations("A-1")).await.unwrap();
        let key = NaturalKey::single("name", FieldValue::text("Garden Hose"));

        let probes = executor.probe(Table::Products, &key, &["name", "brand"]).await;
        assert_eq!(probes["name"], FieldProbe::Populated);
        assert_eq!(probes["brand"], FieldProbe::EmptyButAccessible);

        let missing = NaturalKey::single("name", FieldValue::text("Nope"));
        let probes = executor.probe(Table::Products, &missing, &["brand"]).await;
        assert_eq!(probes["brand"], FieldProbe::RecordMissing);

        store.push_fault(FaultPoint::Find(Table::Products), StoreError::Connectivity("reset".into()));
        let probes = executor.probe(Table::Products, &key, &["brand"]).await;
        assert!(matches!(probes["brand"], FieldProbe::QueryFailed(_)));
    }
}
