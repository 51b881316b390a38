//! Postgres-backed catalog store.
//!
//! Table and column names are spliced into SQL, but only ever from the
//! static schema enums; every column is checked against the table's
//! declared columns before a statement is built. Values are always bound.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};
use tracing::instrument;

use catalogsync_catalog::{ColumnKind, FieldValue, Fields, LinkTable, NaturalKey, Table};
use catalogsync_core::RecordId;

use super::store::{CatalogStore, StoredRecord};
use crate::db::{column, map_sqlx_error};
use crate::error::StoreError;

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

#[derive(Debug, Clone)]
pub struct PostgresCatalogStore {
    pool: Arc<PgPool>,
}

impl PostgresCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn bind_value<'q>(query: PgQuery<'q>, value: &FieldValue) -> PgQuery<'q> {
    match value {
        FieldValue::Text(s) => query.bind(s.clone()),
        FieldValue::Number(n) => query.bind(*n),
        FieldValue::Reference(id) => query.bind(id.get()),
    }
}

fn check_columns<'a>(table: Table, columns: impl IntoIterator<Item = &'a &'static str>) -> Result<(), StoreError> {
    for column in columns {
        if !table.key_columns().contains(column) && table.column_kind(column).is_none() {
            return Err(StoreError::Query(format!("unknown column {table}.{column}")));
        }
    }
    Ok(())
}

fn key_clause(key: &NaturalKey, first_param: usize) -> String {
    key.parts()
        .iter()
        .enumerate()
        .map(|(idx, (column, _))| format!("{column} = ${}", first_param + idx))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn decode_fields(table: Table, key: &NaturalKey, row: &PgRow) -> Result<Fields, StoreError> {
    let mut fields = key.to_fields();
    for (name, kind) in table.data_columns() {
        let value = match kind {
            ColumnKind::Text => column::<Option<String>>(row, name)?.map(FieldValue::Text),
            ColumnKind::Number => column::<Option<f64>>(row, name)?.map(FieldValue::Number),
            ColumnKind::Reference => column::<Option<i64>>(row, name)?
                .map(|id| FieldValue::Reference(RecordId::new(id))),
        };
        if let Some(value) = value {
            fields.insert(*name, value);
        }
    }
    Ok(fields)
}

#[async_trait]
impl CatalogStore for PostgresCatalogStore {
    #[instrument(skip(self, key), fields(table = %table, key = %key), err)]
    async fn find(&self, table: Table, key: &NaturalKey) -> Result<Option<StoredRecord>, StoreError> {
        let columns: Vec<&str> = table.data_columns().iter().map(|(c, _)| *c).collect();
        let sql = format!(
            "SELECT id, {} FROM {} WHERE {}",
            columns.join(", "),
            table.name(),
            key_clause(key, 1)
        );

        let mut query = sqlx::query(&sql);
        for (_, value) in key.parts() {
            query = bind_value(query, value);
        }
        let row = query
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("catalog_find", e))?;

        match row {
            Some(row) => Ok(Some(StoredRecord {
                id: RecordId::new(column(&row, "id")?),
                fields: decode_fields(table, key, &row)?,
            })),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, key, fields), fields(table = %table, key = %key), err)]
    async fn insert(&self, table: Table, key: &NaturalKey, fields: &Fields) -> Result<RecordId, StoreError> {
        let mut row = key.to_fields();
        row.extend(fields.iter().map(|(c, v)| (*c, v.clone())));
        check_columns(table, row.keys())?;

        let columns: Vec<&str> = row.keys().copied().collect();
        let params: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING id",
            table.name(),
            columns.join(", "),
            params.join(", ")
        );

        let mut query = sqlx::query(&sql);
        for value in row.values() {
            query = bind_value(query, value);
        }
        let inserted = query
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("catalog_insert", e))?;
        Ok(RecordId::new(column(&inserted, "id")?))
    }

    #[instrument(skip(self, fields), fields(table = %table, id = %id, columns = fields.len()), err)]
    async fn update(&self, table: Table, id: RecordId, fields: &Fields) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        check_columns(table, fields.keys())?;

        let assignments: Vec<String> = fields
            .keys()
            .enumerate()
            .map(|(idx, column)| format!("{column} = ${}", idx + 1))
            .collect();
        let sql = format!(
            "UPDATE {} SET {}, updated_at = NOW() WHERE id = ${}",
            table.name(),
            assignments.join(", "),
            fields.len() + 1
        );

        let mut query = sqlx::query(&sql);
        for value in fields.values() {
            query = bind_value(query, value);
        }
        let result = query
            .bind(id.get())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("catalog_update", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("{table} #{id}")));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(link = %link, owner = %owner), err)]
    async fn links(&self, link: LinkTable, owner: RecordId) -> Result<BTreeSet<String>, StoreError> {
        let sql = format!(
            "SELECT {} AS value FROM {} WHERE {} = $1",
            link.value_column(),
            link.name(),
            link.owner_column()
        );
        let rows = sqlx::query(&sql)
            .bind(owner.get())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("links", e))?;

        rows.iter().map(|row| column::<String>(row, "value")).collect()
    }

    #[instrument(skip(self, values), fields(link = %link, owner = %owner, count = values.len()), err)]
    async fn add_links(&self, link: LinkTable, owner: RecordId, values: &BTreeSet<String>) -> Result<(), StoreError> {
        if values.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "INSERT INTO {} ({}, {}) SELECT $1, UNNEST($2::text[]) ON CONFLICT DO NOTHING",
            link.name(),
            link.owner_column(),
            link.value_column()
        );
        let values: Vec<String> = values.iter().cloned().collect();
        sqlx::query(&sql)
            .bind(owner.get())
            .bind(values)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("add_links", e))?;
        Ok(())
    }

    #[instrument(skip(self, values), fields(link = %link, owner = %owner, count = values.len()), err)]
    async fn remove_links(&self, link: LinkTable, owner: RecordId, values: &BTreeSet<String>) -> Result<(), StoreError> {
        if values.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "DELETE FROM {} WHERE {} = $1 AND {} = ANY($2)",
            link.name(),
            link.owner_column(),
            link.value_column()
        );
        let values: Vec<String> = values.iter().cloned().collect();
        sqlx::query(&sql)
            .bind(owner.get())
            .bind(values)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("remove_links", e))?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ping", e))?;
        Ok(())
    }
}
