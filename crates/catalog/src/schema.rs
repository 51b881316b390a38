//! Storage schema names used by operations and stores.
//!
//! Table and column names only ever come from these enums, so stores can
//! splice them into SQL without quoting user input.

use std::collections::BTreeMap;

use catalogsync_core::RecordId;
use serde::{Deserialize, Serialize};

/// Catalog tables written through natural-key upserts.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Products,
    Items,
    ItemAttributes,
    ContentSections,
}

impl Table {
    pub const ALL: [Table; 4] = [
        Table::Products,
        Table::Items,
        Table::ItemAttributes,
        Table::ContentSections,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Products => "products",
            Table::Items => "items",
            Table::ItemAttributes => "item_attributes",
            Table::ContentSections => "content_sections",
        }
    }

    /// Non-key columns stored for the table, with their value kinds.
    pub fn data_columns(&self) -> &'static [(&'static str, ColumnKind)] {
        use ColumnKind::{Number, Reference, Text};
        match self {
            Table::Products => &[("description", Text), ("brand", Text)],
            Table::Items => &[("name", Text), ("unit_of_measure", Text), ("product_id", Reference)],
            Table::ItemAttributes => &[
                ("list_price", Number),
                ("weight_kg", Number),
                ("length_mm", Number),
                ("width_mm", Number),
                ("height_mm", Number),
                ("color", Text),
                ("material", Text),
            ],
            Table::ContentSections => &[("body", Text)],
        }
    }

    pub fn column_kind(&self, column: &str) -> Option<ColumnKind> {
        self.data_columns()
            .iter()
            .find(|(c, _)| *c == column)
            .map(|(_, kind)| *kind)
    }

    /// Columns forming the natural key (backed by a unique constraint).
    pub fn key_columns(&self) -> &'static [&'static str] {
        match self {
            Table::Products => &["name"],
            Table::Items => &["item_code"],
            Table::ItemAttributes => &["item_id"],
            Table::ContentSections => &["item_id", "section"],
        }
    }
}

impl core::fmt::Display for Table {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Storage type of a column.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Number,
    Reference,
}

/// Many-valued relationships of an item, reconciled as whole sets.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkTable {
    ItemCategories,
    ItemTags,
    ItemRelations,
}

impl LinkTable {
    pub const ALL: [LinkTable; 3] = [
        LinkTable::ItemCategories,
        LinkTable::ItemTags,
        LinkTable::ItemRelations,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LinkTable::ItemCategories => "item_categories",
            LinkTable::ItemTags => "item_tags",
            LinkTable::ItemRelations => "item_relations",
        }
    }

    pub fn owner_column(&self) -> &'static str {
        "item_id"
    }

    pub fn value_column(&self) -> &'static str {
        match self {
            LinkTable::ItemCategories => "category",
            LinkTable::ItemTags => "tag",
            LinkTable::ItemRelations => "related_item_code",
        }
    }
}

impl core::fmt::Display for LinkTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Auxiliary content attached to an item, one row per section.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentSection {
    Overview,
    Specifications,
    InstallationNotes,
}

impl ContentSection {
    pub const ALL: [ContentSection; 3] = [
        ContentSection::Overview,
        ContentSection::Specifications,
        ContentSection::InstallationNotes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentSection::Overview => "overview",
            ContentSection::Specifications => "specifications",
            ContentSection::InstallationNotes => "installation_notes",
        }
    }
}

/// A typed column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Reference(RecordId),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Empty text counts as "no data" when probing stored fields.
    pub fn is_blank(&self) -> bool {
        matches!(self, FieldValue::Text(s) if s.trim().is_empty())
    }
}

impl core::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Number(n) => write!(f, "{n}"),
            FieldValue::Reference(id) => write!(f, "#{id}"),
        }
    }
}

/// Column name → value, ordered for deterministic SQL and diffs.
pub type Fields = BTreeMap<&'static str, FieldValue>;

/// Natural key of a catalog row: `(column, value)` pairs in key-column order.
#[derive(Debug, Clone, PartialEq)]
pub struct NaturalKey(Vec<(&'static str, FieldValue)>);

impl NaturalKey {
    pub fn single(column: &'static str, value: FieldValue) -> Self {
        Self(vec![(column, value)])
    }

    pub fn pair(first: (&'static str, FieldValue), second: (&'static str, FieldValue)) -> Self {
        Self(vec![first, second])
    }

    pub fn parts(&self) -> &[(&'static str, FieldValue)] {
        &self.0
    }

    /// Key columns folded into a field map (used when inserting).
    pub fn to_fields(&self) -> Fields {
        self.0.iter().cloned().collect()
    }
}

impl core::fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for (idx, (column, value)) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{column}={value}")?;
        }
        Ok(())
    }
}
