//! `catalogsync-catalog`: the catalog side of the ingestion pipeline.
//!
//! Pure code only: the static field mapping, storage schema names, the
//! `Operation` instruction set and the Row Transformer that turns one raw
//! input row into an ordered list of operations.

pub mod mapping;
pub mod operation;
pub mod row;
pub mod schema;
pub mod transform;
pub mod validate;

pub use mapping::{check_headers, verify_mapping, Field, FieldTarget, HeaderCheck, MappingError};
pub use operation::{Operation, OperationType};
pub use row::RawRow;
pub use schema::{ColumnKind, ContentSection, FieldValue, Fields, LinkTable, NaturalKey, Table};
pub use transform::{transform_isolated, CatalogTransformer, RowTransform, TransformOutcome};
pub use validate::{find_duplicate_codes, validate_batch, DuplicateCode, ValidationIssue, ValidationReport};
