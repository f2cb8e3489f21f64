//! RequestBuilder: one request per (record, analysis type).
//!
//! The correlation id encodes the record's zero-based position:
//! `sentiment_polarity_000042` is record 42. Parsing the id is the only way a
//! result line is mapped back to its record.

use std::sync::LazyLock;

use regex::Regex;

use super::error::BatchError;
use super::types::*;
use super::vocabulary::Vocabulary;
use crate::config::BatchConfig;

/// Minimum digits of the zero-padded index.
const INDEX_WIDTH: usize = 6;

static CORRELATION_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z_]+)_(\d+)$").unwrap());

pub fn correlation_id(analysis_type: AnalysisType, index: usize) -> String {
    format!("{}_{:0width$}", analysis_type.as_str(), index, width = INDEX_WIDTH)
}

/// Recover the analysis type and record index from a correlation id.
pub fn parse_correlation_id(id: &str) -> Result<(AnalysisType, usize), BatchError> {
    let caps = CORRELATION_ID
        .captures(id.trim())
        .ok_or_else(|| BatchError::InvalidCorrelationId(id.to_string()))?;
    let analysis_type = AnalysisType::from_str(&caps[1])
        .ok_or_else(|| BatchError::UnknownAnalysisType(caps[1].to_string()))?;
    let index = caps[2]
        .parse::<usize>()
        .map_err(|_| BatchError::InvalidCorrelationId(id.to_string()))?;
    Ok((analysis_type, index))
}

/// Builds request payloads. Deterministic: same records in the same order
/// always produce the same requests.
pub struct RequestBuilder<'a> {
    vocabulary: &'a Vocabulary,
    model: String,
    temperature: f32,
    max_tokens: u32,
    text_field: String,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(config: &BatchConfig, vocabulary: &'a Vocabulary) -> Self {
        Self {
            vocabulary,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            text_field: config.text_field.clone(),
        }
    }

    pub fn build(&self, records: &[SourceRecord], analysis_type: AnalysisType) -> Vec<AnalysisRequest> {
        let system = self.vocabulary.system_prompt(analysis_type);
        records
            .iter()
            .enumerate()
            .map(|(index, record)| AnalysisRequest {
                correlation_id: correlation_id(analysis_type, index),
                analysis_type,
                payload: RequestBody {
                    model: self.model.clone(),
                    messages: vec![
                        ChatMessage {
                            role: "system".to_string(),
                            content: system.clone(),
                        },
                        ChatMessage {
                            role: "user".to_string(),
                            content: record.text(&self.text_field).to_string(),
                        },
                    ],
                    temperature: self.temperature,
                    max_tokens: self.max_tokens,
                },
            })
            .collect()
    }
}
