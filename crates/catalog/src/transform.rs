//! Row Transformer: one raw row → ordered operations.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::Serialize;

use crate::mapping::{Field, FieldTarget};
use crate::operation::Operation;
use crate::row::RawRow;
use crate::schema::{ContentSection, FieldValue, Fields, LinkTable, Table};

/// Result of transforming a single row.
///
/// Either `errors` is empty, or `operations` is: an invalid row never yields
/// a partial operation list.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransformOutcome {
    #[serde(skip)]
    pub operations: Vec<Operation>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Set when the transformer itself failed rather than the row's content.
    pub crashed: bool,
}

impl TransformOutcome {
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            operations: Vec::new(),
            errors: vec![error.into()],
            warnings: Vec::new(),
            crashed: false,
        }
    }

    pub fn is_rejected(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Maps an input row to storage operations.
pub trait RowTransform: Send + Sync {
    fn transform(&self, row: &RawRow, row_number: u64) -> TransformOutcome;
}

/// Run a transformer, turning a panic into a row-level error.
///
/// A misbehaving row must never abort the batch it belongs to.
pub fn transform_isolated<T>(transformer: &T, row: &RawRow, row_number: u64) -> TransformOutcome
where
    T: RowTransform + ?Sized,
{
    match catch_unwind(AssertUnwindSafe(|| transformer.transform(row, row_number))) {
        Ok(outcome) if outcome.is_rejected() => TransformOutcome {
            operations: Vec::new(),
            ..outcome
        },
        Ok(outcome) => outcome,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(row = row_number, reason = %reason, "row transformation panicked");
            TransformOutcome {
                crashed: true,
                ..TransformOutcome::rejected(format!(
                    "row {row_number}: transformation failed: {reason}"
                ))
            }
        }
    }
}

/// The catalog import transformer.
#[derive(Debug, Clone, Default)]
pub struct CatalogTransformer {
    /// Record a warning when a numeric cell cannot be parsed (the value is
    /// dropped either way).
    pub warn_on_unparsable_numbers: bool,
}

impl CatalogTransformer {
    pub fn new() -> Self {
        Self {
            warn_on_unparsable_numbers: true,
        }
    }

    fn column_fields(
        &self,
        row: &RawRow,
        row_number: u64,
        table: Table,
        warnings: &mut Vec<String>,
    ) -> Fields {
        let mut fields = Fields::new();
        for (field, column) in Field::columns_of(table) {
            // Natural keys travel on the operation itself.
            if table.key_columns().contains(&column) {
                continue;
            }
            let Some(raw) = row.value(field) else {
                continue;
            };
            if field.is_numeric() {
                match parse_number(raw) {
                    Some(n) => {
                        fields.insert(column, FieldValue::Number(n));
                    }
                    None if self.warn_on_unparsable_numbers => warnings.push(format!(
                        "row {row_number}: ignoring non-numeric {field} '{raw}'"
                    )),
                    None => {}
                }
            } else {
                fields.insert(column, FieldValue::text(raw));
            }
        }
        fields
    }
}

impl RowTransform for CatalogTransformer {
    fn transform(&self, row: &RawRow, row_number: u64) -> TransformOutcome {
        let missing: Vec<&str> = Field::REQUIRED
            .iter()
            .filter(|f| row.value(**f).is_none())
            .map(|f| f.header())
            .collect();
        if !missing.is_empty() {
            return TransformOutcome::rejected(format!(
                "row {row_number}: missing required field(s): {}",
                missing.join(", ")
            ));
        }

        // Presence was checked above; `unwrap_or_default` never triggers.
        let item_code = row.value(Field::ItemCode).unwrap_or_default().to_string();
        let product_name = row.value(Field::ProductName).unwrap_or_default().to_string();

        let mut warnings = Vec::new();
        let mut operations = Vec::new();

        operations.push(Operation::UpsertProduct {
            name: product_name.clone(),
            fields: self.column_fields(row, row_number, Table::Products, &mut warnings),
        });

        operations.push(Operation::UpsertItem {
            item_code: item_code.clone(),
            product_name,
            fields: self.column_fields(row, row_number, Table::Items, &mut warnings),
        });

        let attributes = self.column_fields(row, row_number, Table::ItemAttributes, &mut warnings);
        if !attributes.is_empty() {
            operations.push(Operation::UpsertAttributes {
                item_code: item_code.clone(),
                fields: attributes,
            });
        }

        for section in ContentSection::ALL {
            let field = content_field(section);
            if let Some(body) = row.value(field) {
                operations.push(Operation::UpsertContent {
                    item_code: item_code.clone(),
                    section,
                    body: body.to_string(),
                });
            }
        }

        for link in LinkTable::ALL {
            let field = link_field(link);
            // An absent column leaves the relationship alone; a present but
            // empty one clears it.
            if !row.has(field) {
                continue;
            }
            let mut values = split_list(row.value(field).unwrap_or_default());
            if link == LinkTable::ItemRelations && values.remove(&item_code) {
                warnings.push(format!(
                    "row {row_number}: item {item_code} cannot be related to itself"
                ));
            }
            operations.push(Operation::SyncLinks {
                item_code: item_code.clone(),
                link,
                values,
            });
        }

        TransformOutcome {
            operations,
            errors: Vec::new(),
            warnings,
            crashed: false,
        }
    }
}

fn content_field(section: ContentSection) -> Field {
    Field::ALL
        .into_iter()
        .find(|f| f.target() == FieldTarget::Content(section))
        .unwrap_or(Field::Overview)
}

fn link_field(link: LinkTable) -> Field {
    Field::ALL
        .into_iter()
        .find(|f| f.target() == FieldTarget::Link(link))
        .unwrap_or(Field::Categories)
}

/// Lenient numeric parse: surrounding whitespace and a single decimal comma
/// are accepted. A comma followed by exactly three digits reads as a
/// thousands separator and is rejected, as is anything non-finite.
fn parse_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    let normalized = match trimmed.split_once(',') {
        None => trimmed.to_string(),
        Some((whole, fraction)) => {
            if trimmed.contains('.') || fraction.contains(',') || fraction.len() == 3 {
                return None;
            }
            format!("{whole}.{fraction}")
        }
    };
    normalized.parse::<f64>().ok().filter(|n| n.is_finite())
}

fn split_list(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}
