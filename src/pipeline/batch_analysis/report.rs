//! Human-readable integration report (Markdown).

use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::{AnalysisType, TypeCompleteness};
use super::validator::CompletenessReport;

/// Everything written to `integration_summary.json`.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrationSummary {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub total_records: usize,
    pub completeness: BTreeMap<AnalysisType, TypeCompleteness>,
    /// Failure reason per analysis type that could not be processed.
    pub failures: BTreeMap<AnalysisType, String>,
    pub merge_collisions: BTreeMap<AnalysisType, Vec<usize>>,
    /// Indices named by downloaded error artifacts.
    pub failed_requests: BTreeMap<AnalysisType, Vec<usize>>,
    pub validation: CompletenessReport,
}

pub fn render_markdown(summary: &IntegrationSummary) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = writeln!(out, "# Integration Report\n");
    let _ = writeln!(out, "- Run: `{}`", summary.run_id);
    let _ = writeln!(out, "- Generated: {}", summary.generated_at.to_rfc3339());
    let _ = writeln!(out, "- Records: {}\n", summary.total_records);

    let _ = writeln!(out, "## Completeness\n");
    let _ = writeln!(out, "| Analysis | Status | Processed | Missing | Rate |");
    let _ = writeln!(out, "|---|---|---|---|---|");
    for (analysis_type, completeness) in &summary.completeness {
        match completeness {
            TypeCompleteness::Processed(stats) => {
                let _ = writeln!(
                    out,
                    "| {} | processed | {}/{} | {} | {:.2}% |",
                    analysis_type, stats.processed_posts, stats.total_posts, stats.missing_count, stats.completeness_rate
                );
            }
            TypeCompleteness::NotProcessed => {
                let _ = writeln!(out, "| {analysis_type} | not processed | - | - | - |");
            }
        }
    }

    let with_missing: Vec<_> = summary
        .completeness
        .iter()
        .filter_map(|(t, c)| c.stats().map(|s| (t, s)))
        .filter(|(_, s)| s.missing_count > 0)
        .collect();
    if !with_missing.is_empty() {
        let _ = writeln!(out, "\n## Missing Records\n");
        for (analysis_type, stats) in with_missing {
            let listed = stats
                .missing_indices
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            let more = stats.missing_count.saturating_sub(stats.missing_indices.len());
            if more > 0 {
                let _ = writeln!(out, "- **{analysis_type}**: {listed} (and {more} more)");
            } else {
                let _ = writeln!(out, "- **{analysis_type}**: {listed}");
            }
        }
    }

    if !summary.failures.is_empty() {
        let _ = writeln!(out, "\n## Failures\n");
        for (analysis_type, reason) in &summary.failures {
            let _ = writeln!(out, "- **{analysis_type}**: {reason}");
        }
    }

    let failed: Vec<_> = summary.failed_requests.iter().filter(|(_, f)| !f.is_empty()).collect();
    if !failed.is_empty() {
        let _ = writeln!(out, "\n## Failed Requests\n");
        for (analysis_type, indices) in failed {
            let _ = writeln!(out, "- **{analysis_type}**: {} requests reported failed by the endpoint", indices.len());
        }
    }

    let collisions: Vec<_> = summary.merge_collisions.iter().filter(|(_, c)| !c.is_empty()).collect();
    if !collisions.is_empty() {
        let _ = writeln!(out, "\n## Merge Collisions\n");
        for (analysis_type, indices) in collisions {
            let _ = writeln!(out, "- **{analysis_type}**: {} duplicate indices {:?}", indices.len(), indices);
        }
    }

    let _ = writeln!(out, "\n## Field Validation\n");
    if summary.validation.fields.is_empty() {
        let _ = writeln!(out, "No fields validated.");
    } else {
        let _ = writeln!(out, "| Field | Present | Valid | Rate |");
        let _ = writeln!(out, "|---|---|---|---|");
        for (field, stats) in &summary.validation.fields {
            let _ = writeln!(
                out,
                "| {field} | {} | {} | {:.2}% |",
                stats.present, stats.valid, stats.completeness_rate
            );
        }
    }
    if summary.validation.issues.is_empty() {
        let _ = writeln!(out, "\nNo issues found.");
    } else {
        let _ = writeln!(out, "\n### Issues\n");
        for issue in &summary.validation.issues {
            let _ = writeln!(out, "- {issue}");
        }
    }

    out
}
