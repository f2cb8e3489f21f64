//! ResultParser: turn downloaded result lines into a `ResultMap`.
//!
//! The correlation id is read before anything else so that a line with a
//! failed status or invalid content is still attributed to its record.

use std::collections::HashSet;
use std::path::Path;

use serde_json::Value;

use super::error::BatchError;
use super::request::parse_correlation_id;
use super::schema;
use super::types::*;
use super::vocabulary::Vocabulary;

const SUCCESS_STATUS: u64 = 200;

/// Parsed contents of one shard's output artifact.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedShard {
    /// Valid values only.
    pub results: ResultMap,
    /// Attributed lines whose value was rejected (status, decoding, vocabulary).
    pub rejected: Vec<usize>,
    /// Lines that could not be mapped back to a record of this type.
    pub unattributed: usize,
    /// Indices answered by more than one line; the last line wins.
    pub duplicates: Vec<usize>,
    pub lines: usize,
}

pub struct ResultParser<'a> {
    vocabulary: &'a Vocabulary,
}

impl<'a> ResultParser<'a> {
    pub fn new(vocabulary: &'a Vocabulary) -> Self {
        Self { vocabulary }
    }

    /// Parse one output line. Fails only when the line cannot be attributed
    /// to a record of `analysis_type`.
    pub fn parse_line(&self, analysis_type: AnalysisType, line: &str) -> Result<ResultRecord, BatchError> {
        let raw: Value = serde_json::from_str(line)?;
        let (line_type, index) = attribute(&raw)?;
        if line_type != analysis_type {
            return Err(BatchError::InvalidCorrelationId(format!(
                "{} line in {} results",
                line_type, analysis_type
            )));
        }

        let value = message_content(&raw)
            .and_then(|content| schema::validate(analysis_type, content, self.vocabulary));

        Ok(ResultRecord {
            index,
            analysis_type,
            value,
        })
    }

    /// Parse a whole output artifact.
    pub fn parse_file(&self, path: &Path, analysis_type: AnalysisType) -> Result<ParsedShard, BatchError> {
        if !path.exists() {
            return Err(BatchError::MissingArtifact(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path)?;
        let mut parsed = ParsedShard::default();

        let mut seen = HashSet::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            parsed.lines += 1;
            let record = match self.parse_line(analysis_type, line) {
                Ok(record) => record,
                Err(e) => {
                    tracing::debug!(analysis_type = analysis_type.as_str(), error = %e, "Unattributable result line");
                    parsed.unattributed += 1;
                    continue;
                }
            };

            let index = record.index;
            if !seen.insert(index) {
                tracing::warn!(
                    analysis_type = analysis_type.as_str(),
                    index,
                    path = %path.display(),
                    "Duplicate result line in shard, keeping the last one"
                );
                parsed.duplicates.push(index);
                parsed.results.remove(&index);
                parsed.rejected.retain(|&i| i != index);
            }

            match record.value {
                Some(value) => {
                    parsed.results.insert(index, value);
                }
                None => {
                    tracing::debug!(analysis_type = analysis_type.as_str(), index, "Result rejected");
                    parsed.rejected.push(index);
                }
            }
        }

        if parsed.lines > 0 && parsed.unattributed == parsed.lines {
            return Err(BatchError::ResponseParsing(format!(
                "no line of {} could be attributed",
                path.display()
            )));
        }

        tracing::info!(
            analysis_type = analysis_type.as_str(),
            path = %path.display(),
            valid = parsed.results.len(),
            rejected = parsed.rejected.len(),
            unattributed = parsed.unattributed,
            duplicates = parsed.duplicates.len(),
            "Result file parsed"
        );
        Ok(parsed)
    }

    /// Indices named by an error artifact, sorted and deduplicated.
    pub fn parse_error_file(&self, path: &Path, analysis_type: AnalysisType) -> Result<Vec<usize>, BatchError> {
        if !path.exists() {
            return Err(BatchError::MissingArtifact(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path)?;
        let mut indices: Vec<usize> = raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|v| attribute(&v).ok())
            .filter(|(t, _)| *t == analysis_type)
            .map(|(_, index)| index)
            .collect();
        indices.sort_unstable();
        indices.dedup();
        Ok(indices)
    }
}

fn attribute(raw: &Value) -> Result<(AnalysisType, usize), BatchError> {
    let custom_id = raw
        .get("custom_id")
        .and_then(Value::as_str)
        .ok_or_else(|| BatchError::InvalidCorrelationId("missing custom_id".into()))?;
    parse_correlation_id(custom_id)
}

/// Message content of a successful line, `None` for any failed or malformed response.
fn message_content(raw: &Value) -> Option<&str> {
    if raw.get("error").is_some_and(|e| !e.is_null()) {
        return None;
    }
    let response = raw.get("response")?;
    if response.get("status_code").and_then(Value::as_u64) != Some(SUCCESS_STATUS) {
        return None;
    }
    response
        .get("body")?
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
}
