//! CompletenessValidator: audit the enriched output field by field.
//!
//! Works on the JSON form of enriched records, so it checks exactly what is
//! written to disk. Under-threshold fields become issue strings, not errors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::integrator::completeness_rate;
use super::schema;
use super::types::{AnalysisType, EnrichedRecord};

/// Fields below this valid-value percentage are reported.
pub const COMPLETENESS_THRESHOLD: f64 = 50.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCompleteness {
    /// Records where the field is non-null.
    pub present: usize,
    /// Records where the field is non-null and structurally valid.
    pub valid: usize,
    pub completeness_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletenessReport {
    pub total_records: usize,
    pub fields: BTreeMap<AnalysisType, FieldCompleteness>,
    pub issues: Vec<String>,
}

impl CompletenessReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

pub struct CompletenessValidator {
    fields: Vec<AnalysisType>,
    threshold: f64,
}

impl CompletenessValidator {
    pub fn new(fields: &[AnalysisType]) -> Self {
        Self {
            fields: fields.to_vec(),
            threshold: COMPLETENESS_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn validate_enriched(&self, records: &[EnrichedRecord]) -> CompletenessReport {
        let values: Vec<Value> = records.iter().map(EnrichedRecord::to_json).collect();
        self.validate(&values)
    }

    pub fn validate(&self, records: &[Value]) -> CompletenessReport {
        let total = records.len();
        let mut report = CompletenessReport {
            total_records: total,
            ..Default::default()
        };

        for &field in &self.fields {
            let mut present = 0;
            let mut valid = 0;
            let mut missing_key = 0;
            for record in records {
                match record.get(field.as_str()) {
                    None => missing_key += 1,
                    Some(Value::Null) => {}
                    Some(value) => {
                        present += 1;
                        if schema::conforms(field, value) {
                            valid += 1;
                        }
                    }
                }
            }

            let rate = completeness_rate(valid, total);
            if missing_key > 0 {
                report
                    .issues
                    .push(format!("{field}: key absent from {missing_key} of {total} records"));
            }
            if present > valid {
                report
                    .issues
                    .push(format!("{field}: {} values fail the structural check", present - valid));
            }
            if total > 0 && rate < self.threshold {
                tracing::warn!(
                    field = field.as_str(),
                    rate,
                    threshold = self.threshold,
                    "Field completeness below threshold"
                );
                report.issues.push(format!(
                    "{field}: completeness {rate:.2}% is below {:.0}%",
                    self.threshold
                ));
            }

            report.fields.insert(
                field,
                FieldCompleteness {
                    present,
                    valid,
                    completeness_rate: rate,
                },
            );
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn counts_present_and_valid_values() {
        let records = vec![
            json!({"text": "a", "sentiment_polarity": 4, "publisher_analysis": "ngo"}),
            json!({"text": "b", "sentiment_polarity": 9, "publisher_analysis": null}),
            json!({"text": "c", "sentiment_polarity": null, "publisher_analysis": "individual"}),
            json!({"text": "d", "sentiment_polarity": 2, "publisher_analysis": "news_media"}),
        ];
        let report = CompletenessValidator::new(&[AnalysisType::SentimentPolarity, AnalysisType::PublisherAnalysis])
            .validate(&records);

        let polarity = &report.fields[&AnalysisType::SentimentPolarity];
        assert_eq!(polarity.present, 3);
        assert_eq!(polarity.valid, 2);
        assert_eq!(polarity.completeness_rate, 50.0);
        let publisher = &report.fields[&AnalysisType::PublisherAnalysis];
        assert_eq!(publisher.valid, 3);
        assert_eq!(publisher.completeness_rate, 75.0);

        assert_eq!(report.issues.len(), 1, "{:?}", report.issues);
        assert!(report.issues[0].contains("structural"));
    }

    #[test]
    fn under_threshold_field_is_an_issue() {
        let records = vec![
            json!({"topic_analysis": null}),
            json!({"topic_analysis": null}),
            json!({"topic_analysis": [{"parent_topic": "Politics", "sub_topic": "Elections"}]}),
        ];
        let report = CompletenessValidator::new(&[AnalysisType::TopicAnalysis]).validate(&records);
        assert!(!report.is_clean());
        assert!(report.issues[0].starts_with("topic_analysis: completeness 33.33%"));
    }

    #[test]
    fn absent_key_is_reported() {
        let records = vec![json!({"text": "x"})];
        let report = CompletenessValidator::new(&[AnalysisType::BeliefCategory])
            .with_threshold(0.0)
            .validate(&records);
        assert_eq!(report.issues, vec!["belief_category: key absent from 1 of 1 records".to_string()]);
    }

    #[test]
    fn empty_corpus_has_no_threshold_issue() {
        let report = CompletenessValidator::new(&[AnalysisType::SentimentPolarity]).validate(&[]);
        assert!(report.is_clean());
        assert_eq!(report.total_records, 0);
    }
}
