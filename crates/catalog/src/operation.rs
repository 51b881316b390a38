//! Operations: transient storage instructions derived from one input row.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::schema::{ContentSection, Fields, LinkTable, Table};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Upsert,
    Sync,
}

/// One instruction for the upsert executor.
///
/// Parents are referenced by natural key, never by row id: the executor
/// resolves ids as it walks the list, so a list produced by the transformer
/// is self-contained.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    UpsertProduct {
        name: String,
        fields: Fields,
    },
    UpsertItem {
        item_code: String,
        product_name: String,
        fields: Fields,
    },
    UpsertAttributes {
        item_code: String,
        fields: Fields,
    },
    UpsertContent {
        item_code: String,
        section: ContentSection,
        body: String,
    },
    /// Reconcile the full set of related values (additions and removals).
    SyncLinks {
        item_code: String,
        link: LinkTable,
        values: BTreeSet<String>,
    },
}

impl Operation {
    pub fn op_type(&self) -> OperationType {
        match self {
            Operation::SyncLinks { .. } => OperationType::Sync,
            _ => OperationType::Upsert,
        }
    }

    /// Name of the table the operation writes.
    pub fn target(&self) -> &'static str {
        match self {
            Operation::UpsertProduct { .. } => Table::Products.name(),
            Operation::UpsertItem { .. } => Table::Items.name(),
            Operation::UpsertAttributes { .. } => Table::ItemAttributes.name(),
            Operation::UpsertContent { .. } => Table::ContentSections.name(),
            Operation::SyncLinks { link, .. } => link.name(),
        }
    }

    /// Dependency rank; a valid list is non-decreasing in this value.
    pub fn stage(&self) -> u8 {
        match self {
            Operation::UpsertProduct { .. } => 1,
            Operation::UpsertItem { .. } => 2,
            Operation::UpsertAttributes { .. } => 3,
            Operation::UpsertContent { .. } => 4,
            Operation::SyncLinks { .. } => 5,
        }
    }

    /// Natural key of the written row (or of the owning item for child rows).
    pub fn subject(&self) -> &str {
        match self {
            Operation::UpsertProduct { name, .. } => name,
            Operation::UpsertItem { item_code, .. }
            | Operation::UpsertAttributes { item_code, .. }
            | Operation::UpsertContent { item_code, .. }
            | Operation::SyncLinks { item_code, .. } => item_code,
        }
    }
}

impl core::fmt::Display for Operation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Operation::UpsertContent { section, .. } => {
                write!(f, "upsert {}[{}:{}]", self.target(), self.subject(), section.as_str())
            }
            _ => write!(
                f,
                "{} {}[{}]",
                match self.op_type() {
                    OperationType::Upsert => "upsert",
                    OperationType::Sync => "sync",
                },
                self.target(),
                self.subject()
            ),
        }
    }
}
