//! Per-type result schemas.
//!
//! `validate` turns the raw message content of one result line into a typed
//! `AnalysisValue`, or `None` when the content does not fit the type's schema
//! or names labels outside the vocabulary. `conforms` checks the output
//! representation of a value (as written into an enriched record).

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::types::{AnalysisType, AnalysisValue, TopicPair};
use super::vocabulary::Vocabulary;

/// Markdown code fence wrapping the whole answer.
static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^```[A-Za-z]*\s*(.*?)\s*```$").unwrap());

/// Strip surrounding whitespace and a code fence around the whole content.
pub fn normalize_content(raw: &str) -> &str {
    let trimmed = raw.trim();
    match CODE_FENCE.captures(trimmed).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim(),
        None => trimmed,
    }
}

pub fn validate(analysis_type: AnalysisType, content: &str, vocab: &Vocabulary) -> Option<AnalysisValue> {
    let content = normalize_content(content);
    match analysis_type {
        AnalysisType::SentimentPolarity => validate_polarity(content),
        AnalysisType::SentimentAttribute => {
            validate_labels(content, |l| vocab.is_attribute(l)).map(AnalysisValue::Attributes)
        }
        AnalysisType::TopicAnalysis => validate_topics(content, vocab),
        AnalysisType::PublisherAnalysis => vocab
            .is_publisher(content)
            .then(|| AnalysisValue::Publisher(content.to_string())),
        AnalysisType::BeliefCategory => vocab
            .is_belief(content)
            .then(|| AnalysisValue::Belief(content.to_string())),
        AnalysisType::IdentityClassification => {
            validate_labels(content, |l| vocab.is_identity(l)).map(AnalysisValue::Identities)
        }
    }
}

fn validate_polarity(content: &str) -> Option<AnalysisValue> {
    if content.is_empty() || !content.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let score: u8 = content.parse().ok()?;
    (1..=5).contains(&score).then_some(AnalysisValue::Polarity(score))
}

/// JSON array of strings, filtered to known labels. Duplicates collapse.
fn validate_labels(content: &str, known: impl Fn(&str) -> bool) -> Option<Vec<String>> {
    let items: Vec<Value> = serde_json::from_str(content).ok()?;
    let mut labels: Vec<String> = Vec::new();
    for label in items.iter().filter_map(Value::as_str) {
        if known(label) && !labels.iter().any(|l| l == label) {
            labels.push(label.to_string());
        }
    }
    (!labels.is_empty()).then_some(labels)
}

fn validate_topics(content: &str, vocab: &Vocabulary) -> Option<AnalysisValue> {
    let items: Vec<Value> = serde_json::from_str(content).ok()?;
    let mut pairs: Vec<TopicPair> = Vec::new();
    for item in &items {
        let (Some(parent), Some(sub)) = (
            item.get("parent_topic").and_then(Value::as_str),
            item.get("sub_topic").and_then(Value::as_str),
        ) else {
            continue;
        };
        if !vocab.is_topic(parent, sub) {
            continue;
        }
        let pair = TopicPair {
            parent_topic: parent.to_string(),
            sub_topic: sub.to_string(),
        };
        if !pairs.contains(&pair) {
            pairs.push(pair);
        }
    }
    (!pairs.is_empty()).then_some(AnalysisValue::Topics(pairs))
}

/// Structural rule for a field value inside an enriched record.
pub fn conforms(analysis_type: AnalysisType, value: &Value) -> bool {
    match analysis_type {
        AnalysisType::SentimentPolarity => value.as_u64().is_some_and(|v| (1..=5).contains(&v)),
        AnalysisType::SentimentAttribute | AnalysisType::IdentityClassification => value
            .as_array()
            .is_some_and(|a| !a.is_empty() && a.iter().all(Value::is_string)),
        AnalysisType::TopicAnalysis => value.as_array().is_some_and(|a| {
            !a.is_empty()
                && a.iter().all(|t| {
                    t.get("parent_topic").is_some_and(Value::is_string)
                        && t.get("sub_topic").is_some_and(Value::is_string)
                })
        }),
        AnalysisType::PublisherAnalysis | AnalysisType::BeliefCategory => {
            value.as_str().is_some_and(|s| !s.trim().is_empty())
        }
    }
}
