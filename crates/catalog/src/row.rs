//! Raw input rows.

use std::collections::BTreeMap;

use catalogsync_core::DomainError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mapping::Field;

/// One input record: a flat mapping of header name → cell text.
///
/// Header names are normalized (trimmed, lowercased) on insert so lookups by
/// `Field` are insensitive to how the source spelled them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRow(BTreeMap<String, String>);

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut row = Self::new();
        for (k, v) in pairs {
            row.insert(k, v);
        }
        row
    }

    pub fn insert(&mut self, header: impl AsRef<str>, value: impl Into<String>) {
        self.0
            .insert(header.as_ref().trim().to_ascii_lowercase(), value.into());
    }

    pub fn with(mut self, header: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.insert(header, value);
        self
    }

    pub fn remove(&mut self, header: &str) -> Option<String> {
        self.0.remove(&header.trim().to_ascii_lowercase())
    }

    /// Whether the column exists in the row at all (even if empty).
    pub fn has(&self, field: Field) -> bool {
        self.0.contains_key(field.header())
    }

    /// Trimmed, non-empty value of a field.
    pub fn value(&self, field: Field) -> Option<&str> {
        self.0
            .get(field.header())
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn headers(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|v| v.trim().is_empty())
    }

    /// Build a row from a queued event payload.
    ///
    /// The payload must be a JSON object of scalars; numbers and booleans are
    /// rendered as text, `null` becomes an empty cell and arrays of scalars are
    /// joined with commas (the list format of relationship fields).
    pub fn from_json(value: &Value) -> Result<Self, DomainError> {
        let object = value
            .as_object()
            .ok_or_else(|| DomainError::validation("event_data must be a JSON object"))?;

        let mut row = Self::new();
        for (key, v) in object {
            let text = match v {
                Value::Null => String::new(),
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                Value::Array(items) => {
                    let mut parts = Vec::with_capacity(items.len());
                    for item in items {
                        match item {
                            Value::String(s) => parts.push(s.clone()),
                            Value::Number(n) => parts.push(n.to_string()),
                            _ => {
                                return Err(DomainError::validation(format!(
                                    "event_data.{key} contains a non-scalar list element"
                                )));
                            }
                        }
                    }
                    parts.join(",")
                }
                Value::Object(_) => {
                    return Err(DomainError::validation(format!(
                        "event_data.{key} is a nested object"
                    )));
                }
            };
            row.insert(key, text);
        }
        Ok(row)
    }
}
