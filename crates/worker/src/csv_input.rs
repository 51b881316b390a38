//! CSV input files.

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};

use catalogsync_catalog::RawRow;

/// Header row plus data rows of one input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvInput {
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
}

pub fn read_path(path: &Path) -> Result<CsvInput> {
    let file = std::fs::File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    read(file).with_context(|| format!("cannot read {}", path.display()))
}

/// Parse CSV with a header row. Cells are trimmed; blank lines are dropped.
pub fn read<R: Read>(source: R) -> Result<CsvInput> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(source);

    let headers: Vec<String> = reader
        .headers()
        .context("missing header row")?
        .iter()
        .map(str::to_string)
        .collect();

    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("malformed record {}", idx + 1))?;
        let row = RawRow::from_pairs(headers.iter().zip(record.iter()));
        if !row.is_empty() {
            rows.push(row);
        }
    }
    Ok(CsvInput { headers, rows })
}
