//! In-memory catalog store for tests/dev.
//!
//! Enforces the same natural-key uniqueness and item → product reference
//! as the Postgres schema, and can inject faults, latency and concurrent
//! writers to exercise the executor's failure paths.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use catalogsync_catalog::{FieldValue, Fields, LinkTable, NaturalKey, Table};
use catalogsync_core::RecordId;

use super::store::{CatalogStore, StoredRecord};
use crate::error::StoreError;

/// Write counters, for idempotence checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub inserts: u64,
    pub updates: u64,
    pub links_added: u64,
    pub links_removed: u64,
}

impl WriteStats {
    pub fn total(&self) -> u64 {
        self.inserts + self.updates + self.links_added + self.links_removed
    }
}

/// Where an injected fault fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    Find(Table),
    Insert(Table),
    Update(Table),
    Links(LinkTable),
    /// The next call of any kind.
    Any,
}

#[derive(Debug, Clone)]
struct Fault {
    point: FaultPoint,
    error: StoreError,
}

#[derive(Debug, Clone)]
struct Row {
    id: RecordId,
    fields: Fields,
}

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    tables: HashMap<Table, Vec<Row>>,
    links: HashMap<(LinkTable, RecordId), BTreeSet<String>>,
    /// Rows another writer will commit just before our next insert.
    planted: Vec<(Table, Fields)>,
    faults: VecDeque<Fault>,
    stats: WriteStats,
}

impl State {
    fn take_fault(&mut self, point: FaultPoint) -> Option<StoreError> {
        let idx = self
            .faults
            .iter()
            .position(|f| f.point == point || f.point == FaultPoint::Any)?;
        self.faults.remove(idx).map(|f| f.error)
    }

    fn allocate(&mut self) -> RecordId {
        self.next_id += 1;
        RecordId::new(self.next_id)
    }

    fn find(&self, table: Table, key: &NaturalKey) -> Option<&Row> {
        self.tables
            .get(&table)?
            .iter()
            .find(|row| matches_key(&row.fields, key))
    }

    fn exists(&self, table: Table, id: RecordId) -> bool {
        self.tables
            .get(&table)
            .is_some_and(|rows| rows.iter().any(|r| r.id == id))
    }
}

fn matches_key(fields: &Fields, key: &NaturalKey) -> bool {
    key.parts()
        .iter()
        .all(|(column, value)| fields.get(column) == Some(value))
}

#[derive(Debug, Default)]
pub struct InMemoryCatalogStore {
    state: Mutex<State>,
    latency: Mutex<Option<Duration>>,
    unavailable: AtomicBool,
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Make every call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next matching call with `error` (faults fire once, in order).
    pub fn push_fault(&self, point: FaultPoint, error: StoreError) {
        self.lock().faults.push_back(Fault { point, error });
    }

    /// Simulate a concurrent writer: the row is invisible to `find` until
    /// our next insert into `table` with the same key, which then hits the
    /// unique constraint.
    pub fn plant_conflict(&self, table: Table, key: &NaturalKey, fields: Fields) {
        let mut row = key.to_fields();
        row.extend(fields);
        self.lock().planted.push((table, row));
    }

    pub fn stats(&self) -> WriteStats {
        self.lock().stats
    }

    pub fn reset_stats(&self) {
        self.lock().stats = WriteStats::default();
    }

    pub fn row_count(&self, table: Table) -> usize {
        self.lock().tables.get(&table).map_or(0, Vec::len)
    }

    /// Stored fields of the row with `key`, if any.
    pub fn record(&self, table: Table, key: &NaturalKey) -> Option<StoredRecord> {
        self.lock().find(table, key).map(|row| StoredRecord {
            id: row.id,
            fields: row.fields.clone(),
        })
    }

    pub fn link_values(&self, link: LinkTable, owner: RecordId) -> BTreeSet<String> {
        self.lock().links.get(&(link, owner)).cloned().unwrap_or_default()
    }

    async fn enter(&self, point: FaultPoint) -> Result<(), StoreError> {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("catalog store is shut down".into()));
        }
        let fault = self.lock().take_fault(point);
        match fault {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CatalogStore for InMemoryCatalogStore {
    async fn find(&self, table: Table, key: &NaturalKey) -> Result<Option<StoredRecord>, StoreError> {
        self.enter(FaultPoint::Find(table)).await?;
        Ok(self.lock().find(table, key).map(|row| StoredRecord {
            id: row.id,
            fields: row.fields.clone(),
        }))
    }

    async fn insert(&self, table: Table, key: &NaturalKey, fields: &Fields) -> Result<RecordId, StoreError> {
        self.enter(FaultPoint::Insert(table)).await?;
        let mut state = self.lock();

        if let Some(idx) = state
            .planted
            .iter()
            .position(|(t, row)| *t == table && matches_key(row, key))
        {
            let (_, row) = state.planted.remove(idx);
            let id = state.allocate();
            state.tables.entry(table).or_default().push(Row { id, fields: row });
        }

        if state.find(table, key).is_some() {
            return Err(StoreError::UniqueViolation(format!("{table} ({key}) already exists")));
        }

        if let Some(FieldValue::Reference(product)) = fields.get("product_id") {
            if table == Table::Items && !state.exists(Table::Products, *product) {
                return Err(StoreError::ForeignKeyViolation(format!(
                    "items.product_id references missing product {product}"
                )));
            }
        }

        let mut row = key.to_fields();
        row.extend(fields.iter().map(|(c, v)| (*c, v.clone())));
        let id = state.allocate();
        state.tables.entry(table).or_default().push(Row { id, fields: row });
        state.stats.inserts += 1;
        Ok(id)
    }

    async fn update(&self, table: Table, id: RecordId, fields: &Fields) -> Result<(), StoreError> {
        self.enter(FaultPoint::Update(table)).await?;
        let mut state = self.lock();
        let row = state
            .tables
            .get_mut(&table)
            .and_then(|rows| rows.iter_mut().find(|r| r.id == id))
            .ok_or_else(|| StoreError::NotFound(format!("{table} #{id}")))?;
        row.fields.extend(fields.iter().map(|(c, v)| (*c, v.clone())));
        state.stats.updates += 1;
        Ok(())
    }

    async fn links(&self, link: LinkTable, owner: RecordId) -> Result<BTreeSet<String>, StoreError> {
        self.enter(FaultPoint::Links(link)).await?;
        Ok(self.link_values(link, owner))
    }

    async fn add_links(&self, link: LinkTable, owner: RecordId, values: &BTreeSet<String>) -> Result<(), StoreError> {
        self.enter(FaultPoint::Links(link)).await?;
        let mut state = self.lock();
        if !state.exists(Table::Items, owner) {
            return Err(StoreError::ForeignKeyViolation(format!(
                "{link}.item_id references missing item {owner}"
            )));
        }
        let set = state.links.entry((link, owner)).or_default();
        let before = set.len();
        set.extend(values.iter().cloned());
        let added = (set.len() - before) as u64;
        state.stats.links_added += added;
        Ok(())
    }

    async fn remove_links(&self, link: LinkTable, owner: RecordId, values: &BTreeSet<String>) -> Result<(), StoreError> {
        self.enter(FaultPoint::Links(link)).await?;
        let mut state = self.lock();
        let mut removed = 0;
        if let Some(set) = state.links.get_mut(&(link, owner)) {
            for value in values {
                if set.remove(value) {
                    removed += 1;
                }
            }
        }
        state.stats.links_removed += removed;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("catalog store is shut down".into()));
        }
        Ok(())
    }
}
