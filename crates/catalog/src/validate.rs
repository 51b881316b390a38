//! Pre-flight validation of a whole input batch.

use std::collections::HashMap;

use serde::Serialize;

use crate::mapping::{check_headers, Field};
use crate::row::RawRow;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    /// 1-based data row, `None` for batch-level issues (headers).
    pub row: Option<u64>,
    pub message: String,
}

impl ValidationIssue {
    fn batch(message: impl Into<String>) -> Self {
        Self {
            row: None,
            message: message.into(),
        }
    }

    fn row(row: u64, message: impl Into<String>) -> Self {
        Self {
            row: Some(row),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub row_count: usize,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

/// An item code seen more than once in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateCode {
    pub code: String,
    pub row: u64,
    pub first_row: u64,
}

/// Rows (1-based) whose item code repeats an earlier row's.
pub fn find_duplicate_codes(rows: &[RawRow]) -> Vec<DuplicateCode> {
    let mut first_seen: HashMap<&str, u64> = HashMap::new();
    let mut duplicates = Vec::new();

    for (idx, row) in rows.iter().enumerate() {
        let row_number = idx as u64 + 1;
        let Some(code) = row.value(Field::ItemCode) else {
            continue;
        };
        match first_seen.get(code) {
            Some(&first_row) => duplicates.push(DuplicateCode {
                code: code.to_string(),
                row: row_number,
                first_row,
            }),
            None => {
                first_seen.insert(code, row_number);
            }
        }
    }

    duplicates
}

/// Validate headers, required fields and item-code uniqueness.
pub fn validate_batch<S: AsRef<str>>(headers: &[S], rows: &[RawRow]) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let header_check = check_headers(headers);
    for field in &header_check.missing_required {
        errors.push(ValidationIssue::batch(format!(
            "missing required column: {field}"
        )));
    }
    for unknown in &header_check.unknown {
        warnings.push(ValidationIssue::batch(format!(
            "unknown column ignored: {unknown}"
        )));
    }

    if rows.is_empty() {
        errors.push(ValidationIssue::batch("batch contains no data rows"));
    }

    // Per-row checks only make sense when the columns exist.
    if header_check.is_complete() {
        for (idx, row) in rows.iter().enumerate() {
            let row_number = idx as u64 + 1;
            let missing: Vec<&str> = Field::REQUIRED
                .iter()
                .filter(|f| row.value(**f).is_none())
                .map(|f| f.header())
                .collect();
            if !missing.is_empty() {
                errors.push(ValidationIssue::row(
                    row_number,
                    format!("missing required field(s): {}", missing.join(", ")),
                ));
            }
        }
    }

    for dup in find_duplicate_codes(rows) {
        errors.push(ValidationIssue::row(
            dup.row,
            format!(
                "duplicate item code {} (first seen on row {})",
                dup.code, dup.first_row
            ),
        ));
    }

    ValidationReport {
        is_valid: errors.is_empty(),
        row_count: rows.len(),
        errors,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADERS: [&str; 3] = ["item_code", "product_name", "item_name"];

    fn row(code: &str) -> RawRow {
        RawRow::from_pairs([
            ("item_code", code),
            ("product_name", "Valve"),
            ("item_name", "Valve 1/2in"),
        ])
    }

    #[test]
    fn clean_batch_is_valid() {
        let report = validate_batch(&HEADERS, &[row("1354-6543"), row("1354-6544")]);
        assert!(report.is_valid);
        assert_eq!(report.row_count, 2);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn duplicate_item_code_invalidates_batch() {
        let rows = [row("1354-6543"), row("2000-0001"), row("1354-6543")];
        let report = validate_batch(&HEADERS, &rows);

        assert!(!report.is_valid);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].row, Some(3));
        assert!(report.errors[0].message.contains("duplicate item code 1354-6543"));
        assert!(report.errors[0].message.contains("row 1"));
    }

    #[test]
    fn missing_columns_are_batch_errors() {
        let report = validate_batch(&["item_code", "notes"], &[row("1")]);
        assert!(!report.is_valid);
        assert!(report.errors.iter().all(|e| e.row.is_none()));
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn serializes_with_is_valid_flag() {
        let report = validate_batch(&HEADERS, &[row("1"), row("1")]);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["isValid"], serde_json::json!(false));
    }
}
