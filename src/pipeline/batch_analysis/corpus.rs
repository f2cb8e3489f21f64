//! Loading the input corpus. Record order in the file is record identity.

use std::path::Path;

use serde_json::Value;

use super::error::BatchError;
use super::types::SourceRecord;

/// Read a JSON array of objects, or JSONL with one object per line.
pub fn load_records(path: &Path) -> Result<Vec<SourceRecord>, BatchError> {
    let raw = std::fs::read_to_string(path)?;
    let records = parse_records(&raw)?;
    tracing::info!(path = %path.display(), records = records.len(), "Corpus loaded");
    Ok(records)
}

pub fn parse_records(raw: &str) -> Result<Vec<SourceRecord>, BatchError> {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('[') {
        let values: Vec<Value> = serde_json::from_str(trimmed)?;
        return values
            .into_iter()
            .enumerate()
            .map(|(i, v)| to_record(v, i + 1))
            .collect();
    }

    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| to_record(serde_json::from_str(line)?, i + 1))
        .collect()
}

fn to_record(value: Value, position: usize) -> Result<SourceRecord, BatchError> {
    SourceRecord::from_value(value).ok_or_else(|| {
        BatchError::ResponseParsing(format!("corpus entry {position} is not a JSON object"))
    })
}
