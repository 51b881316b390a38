//! Static mapping from input fields to storage targets.
//!
//! Every input column the importer understands is a `Field` variant; the
//! `match`es below are exhaustive, so adding a field without a target does
//! not compile. `verify_mapping` covers what the compiler cannot (distinct
//! headers and column targets) and runs once at engine start-up.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::{ContentSection, LinkTable, Table};

/// A named input field.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    ItemCode,
    ProductName,
    ItemName,
    ProductDescription,
    Brand,
    UnitOfMeasure,
    ListPrice,
    WeightKg,
    LengthMm,
    WidthMm,
    HeightMm,
    Color,
    Material,
    Overview,
    Specifications,
    InstallationNotes,
    Categories,
    Tags,
    RelatedItems,
}

/// Where a field's value ends up.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldTarget {
    Column { table: Table, column: &'static str },
    Content(ContentSection),
    Link(LinkTable),
}

impl Field {
    pub const ALL: [Field; 19] = [
        Field::ItemCode,
        Field::ProductName,
        Field::ItemName,
        Field::ProductDescription,
        Field::Brand,
        Field::UnitOfMeasure,
        Field::ListPrice,
        Field::WeightKg,
        Field::LengthMm,
        Field::WidthMm,
        Field::HeightMm,
        Field::Color,
        Field::Material,
        Field::Overview,
        Field::Specifications,
        Field::InstallationNotes,
        Field::Categories,
        Field::Tags,
        Field::RelatedItems,
    ];

    /// Natural-key fields; a row missing any of them is rejected as a whole.
    pub const REQUIRED: [Field; 3] = [Field::ItemCode, Field::ProductName, Field::ItemName];

    pub fn header(&self) -> &'static str {
        match self {
            Field::ItemCode => "item_code",
            Field::ProductName => "product_name",
            Field::ItemName => "item_name",
            Field::ProductDescription => "product_description",
            Field::Brand => "brand",
            Field::UnitOfMeasure => "unit_of_measure",
            Field::ListPrice => "list_price",
            Field::WeightKg => "weight_kg",
            Field::LengthMm => "length_mm",
            Field::WidthMm => "width_mm",
            Field::HeightMm => "height_mm",
            Field::Color => "color",
            Field::Material => "material",
            Field::Overview => "overview",
            Field::Specifications => "specifications",
            Field::InstallationNotes => "installation_notes",
            Field::Categories => "categories",
            Field::Tags => "tags",
            Field::RelatedItems => "related_items",
        }
    }

    pub fn target(&self) -> FieldTarget {
        use FieldTarget::{Column, Content, Link};
        match self {
            Field::ItemCode => Column { table: Table::Items, column: "item_code" },
            Field::ProductName => Column { table: Table::Products, column: "name" },
            Field::ItemName => Column { table: Table::Items, column: "name" },
            Field::ProductDescription => Column { table: Table::Products, column: "description" },
            Field::Brand => Column { table: Table::Products, column: "brand" },
            Field::UnitOfMeasure => Column { table: Table::Items, column: "unit_of_measure" },
            Field::ListPrice => Column { table: Table::ItemAttributes, column: "list_price" },
            Field::WeightKg => Column { table: Table::ItemAttributes, column: "weight_kg" },
            Field::LengthMm => Column { table: Table::ItemAttributes, column: "length_mm" },
            Field::WidthMm => Column { table: Table::ItemAttributes, column: "width_mm" },
            Field::HeightMm => Column { table: Table::ItemAttributes, column: "height_mm" },
            Field::Color => Column { table: Table::ItemAttributes, column: "color" },
            Field::Material => Column { table: Table::ItemAttributes, column: "material" },
            Field::Overview => Content(ContentSection::Overview),
            Field::Specifications => Content(ContentSection::Specifications),
            Field::InstallationNotes => Content(ContentSection::InstallationNotes),
            Field::Categories => Link(LinkTable::ItemCategories),
            Field::Tags => Link(LinkTable::ItemTags),
            Field::RelatedItems => Link(LinkTable::ItemRelations),
        }
    }

    pub fn is_required(&self) -> bool {
        Self::REQUIRED.contains(self)
    }

    /// Numeric fields are parsed leniently: unparsable values are dropped.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Field::ListPrice | Field::WeightKg | Field::LengthMm | Field::WidthMm | Field::HeightMm
        )
    }

    /// Resolve a header name (case-insensitive, surrounding whitespace ignored).
    pub fn from_header(header: &str) -> Option<Field> {
        let normalized = header.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|f| f.header() == normalized)
    }

    /// Fields stored as plain columns of `table`, in mapping order.
    pub fn columns_of(table: Table) -> impl Iterator<Item = (Field, &'static str)> {
        Self::ALL.into_iter().filter_map(move |f| match f.target() {
            FieldTarget::Column { table: t, column } if t == table => Some((f, column)),
            _ => None,
        })
    }
}

impl core::fmt::Display for Field {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.header())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("header '{0}' is mapped by more than one field")]
    DuplicateHeader(&'static str),
    #[error("column {table}.{column} is targeted by more than one field")]
    DuplicateColumn { table: Table, column: &'static str },
    #[error("required field {0} does not map to a natural-key column")]
    RequiredNotKeyed(Field),
}

/// Check the mapping table for internal consistency.
pub fn verify_mapping() -> Result<(), MappingError> {
    let mut headers = BTreeSet::new();
    let mut columns = BTreeSet::new();
    let mut content = BTreeSet::new();
    let mut links = BTreeSet::new();

    for field in Field::ALL {
        if !headers.insert(field.header()) {
            return Err(MappingError::DuplicateHeader(field.header()));
        }
        match field.target() {
            FieldTarget::Column { table, column } => {
                if !columns.insert((table, column)) {
                    return Err(MappingError::DuplicateColumn { table, column });
                }
            }
            FieldTarget::Content(section) => {
                if !content.insert(section) {
                    return Err(MappingError::DuplicateHeader(field.header()));
                }
            }
            FieldTarget::Link(link) => {
                if !links.insert(link) {
                    return Err(MappingError::DuplicateHeader(field.header()));
                }
            }
        }
    }

    // Required fields either are the natural key of their table or the
    // primary attribute of the item; both must land in a plain column.
    for field in Field::REQUIRED {
        if !matches!(field.target(), FieldTarget::Column { .. }) {
            return Err(MappingError::RequiredNotKeyed(field));
        }
    }

    Ok(())
}

/// Result of checking an input header row against the mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HeaderCheck {
    pub missing_required: Vec<Field>,
    pub unknown: Vec<String>,
}

impl HeaderCheck {
    pub fn is_complete(&self) -> bool {
        self.missing_required.is_empty()
    }
}

pub fn check_headers<S: AsRef<str>>(headers: &[S]) -> HeaderCheck {
    let known: BTreeSet<Field> = headers
        .iter()
        .filter_map(|h| Field::from_header(h.as_ref()))
        .collect();

    HeaderCheck {
        missing_required: Field::REQUIRED
            .into_iter()
            .filter(|f| !known.contains(f))
            .collect(),
        unknown: headers
            .iter()
            .map(|h| h.as_ref().trim().to_string())
            .filter(|h| Field::from_header(h).is_none())
            .collect(),
    }
}
