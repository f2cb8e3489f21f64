//! Integrator: join merged result maps back onto the ordered corpus.
//!
//! Position in the corpus is the join key. Every output record carries one
//! slot per requested analysis type, `None` when no valid result exists.

use std::collections::BTreeMap;

use super::types::*;

#[derive(Debug, Clone)]
pub struct IntegrationOutput {
    pub records: Vec<EnrichedRecord>,
    pub completeness: BTreeMap<AnalysisType, TypeCompleteness>,
}

impl IntegrationOutput {
    /// Whether at least one analysis type produced results to integrate.
    pub fn any_processed(&self) -> bool {
        self.completeness
            .values()
            .any(|c| matches!(c, TypeCompleteness::Processed(_)))
    }
}

pub struct Integrator {
    missing_indices_limit: usize,
}

impl Integrator {
    pub fn new(missing_indices_limit: usize) -> Self {
        Self { missing_indices_limit }
    }

    /// `maps` holds `None` for a type with no result files at all.
    pub fn integrate(
        &self,
        records: &[SourceRecord],
        maps: &BTreeMap<AnalysisType, Option<ResultMap>>,
    ) -> IntegrationOutput {
        let enriched = records
            .iter()
            .enumerate()
            .map(|(i, record)| EnrichedRecord {
                record: record.clone(),
                analyses: maps
                    .iter()
                    .map(|(t, map)| (*t, map.as_ref().and_then(|m| m.get(&i)).cloned()))
                    .collect(),
            })
            .collect();

        let completeness = maps
            .iter()
            .map(|(t, map)| {
                let status = match map {
                    Some(map) => TypeCompleteness::Processed(self.stats(records.len(), map)),
                    None => TypeCompleteness::NotProcessed,
                };
                match &status {
                    TypeCompleteness::Processed(stats) => tracing::info!(
                        analysis_type = t.as_str(),
                        processed = stats.processed_posts,
                        total = stats.total_posts,
                        rate = stats.completeness_rate,
                        "Integrated results"
                    ),
                    TypeCompleteness::NotProcessed => {
                        tracing::info!(analysis_type = t.as_str(), "No results, marked not processed")
                    }
                }
                (*t, status)
            })
            .collect();

        IntegrationOutput {
            records: enriched,
            completeness,
        }
    }

    /// Only indices inside the corpus count as processed.
    pub fn stats(&self, total: usize, map: &ResultMap) -> IntegrationStats {
        let stray = map.range(total..).count();
        if stray > 0 {
            tracing::warn!(total, stray, "Results for indices beyond the corpus ignored");
        }
        let processed = (0..total).filter(|i| map.contains_key(i)).count();
        let missing: Vec<usize> = (0..total).filter(|i| !map.contains_key(i)).collect();
        IntegrationStats {
            total_posts: total,
            processed_posts: processed,
            missing_count: missing.len(),
            missing_indices: missing.into_iter().take(self.missing_indices_limit).collect(),
            completeness_rate: completeness_rate(processed, total),
        }
    }
}

/// Percentage rounded to two decimals; 0.0 for an empty corpus.
pub fn completeness_rate(processed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let rate = processed as f64 / total as f64 * 100.0;
    (rate * 100.0).round() / 100.0
}
