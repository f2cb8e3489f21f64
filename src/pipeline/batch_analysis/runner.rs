//! BatchPipeline: orchestrates the full batch analysis run.
//!
//! prepare → submit → track → fetch → parse/merge → integrate → validate.
//! Runs on the caller's thread. Every stage persists its state under the
//! work directory, so a run interrupted during tracking can be resumed from
//! the job registry without resubmitting.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use uuid::Uuid;

use super::error::BatchError;
use super::fetcher::{FetchFailure, FetchReport, ResultFetcher};
use super::integrator::{IntegrationOutput, Integrator};
use super::merger::Merger;
use super::parser::ResultParser;
use super::report::{render_markdown, IntegrationSummary};
use super::request::RequestBuilder;
use super::retry::with_retry;
use super::sharder::{inventory_entry, Sharder};
use super::state::{write_atomic, write_json_atomic, JobRegistry, StateStore, save_enriched_records};
use super::submitter::{BatchSubmitter, ShardFailure};
use super::tracker::{CancellationToken, JobTracker, TickReport, TrackingOutcome};
use super::traits::BatchEndpoint;
use super::types::*;
use super::validator::{CompletenessReport, CompletenessValidator};
use super::vocabulary::Vocabulary;
use crate::config::BatchConfig;

pub const ENRICHED_RECORDS_FILE: &str = "enriched_records.json";
pub const INTEGRATION_SUMMARY_FILE: &str = "integration_summary.json";
pub const INTEGRATION_REPORT_FILE: &str = "integration_report.md";

/// Jobs created by the submit stage plus the shards that could not be submitted.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub jobs: Vec<Job>,
    pub failures: Vec<ShardFailure>,
}

/// Parsed and merged results of every requested analysis type.
#[derive(Debug, Clone, Default)]
pub struct CollectedResults {
    /// `None` for a type with no usable result files.
    pub maps: BTreeMap<AnalysisType, Option<ResultMap>>,
    pub failures: BTreeMap<AnalysisType, String>,
    pub collisions: BTreeMap<AnalysisType, Vec<usize>>,
    pub failed_requests: BTreeMap<AnalysisType, Vec<usize>>,
}

/// What a run (or resume) did, returned even when some types failed.
#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub run_id: String,
    pub total_records: usize,
    pub submit_failures: Vec<ShardFailure>,
    pub tracking: TrackingOutcome,
    pub fetch_failures: Vec<FetchFailure>,
    pub type_failures: BTreeMap<AnalysisType, String>,
    pub completeness: BTreeMap<AnalysisType, TypeCompleteness>,
    pub validation: CompletenessReport,
    /// Set when the enriched records were written.
    pub output_path: Option<PathBuf>,
    pub duration_ms: u64,
}

pub struct BatchPipeline<'a> {
    endpoint: &'a dyn BatchEndpoint,
    config: BatchConfig,
    vocabulary: Vocabulary,
    store: StateStore,
    run_id: String,
}

impl<'a> BatchPipeline<'a> {
    pub fn new(endpoint: &'a dyn BatchEndpoint, config: BatchConfig, vocabulary: Vocabulary) -> Self {
        let store = StateStore::new(config.state_dir());
        Self {
            endpoint,
            config,
            vocabulary,
            store,
            run_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Full run over `records` for the given analysis types.
    pub fn run(
        &self,
        records: &[SourceRecord],
        types: &[AnalysisType],
        cancel: &CancellationToken,
        progress_fn: Option<&dyn Fn(PipelineEvent)>,
    ) -> Result<PipelineSummary, BatchError> {
        let start = Instant::now();
        tracing::info!(
            run_id = %self.run_id,
            records = records.len(),
            types = ?types.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
            "Batch analysis run started"
        );

        let prepared = self.prepare(records, types, progress_fn)?;
        let submission = self.submit(&prepared, progress_fn)?;
        self.finish(records, types, submission, start, cancel, progress_fn)
    }

    /// Continue from the persisted job registry: track, fetch and integrate
    /// the jobs of an earlier run without resubmitting anything.
    pub fn resume(
        &self,
        records: &[SourceRecord],
        cancel: &CancellationToken,
        progress_fn: Option<&dyn Fn(PipelineEvent)>,
    ) -> Result<PipelineSummary, BatchError> {
        let start = Instant::now();
        let registry = self.store.load_job_registry()?;
        if registry.is_empty() {
            return Err(BatchError::Config(format!(
                "no jobs to resume in {}",
                self.store.dir().display()
            )));
        }
        let jobs = registry.jobs();
        let types: Vec<AnalysisType> = jobs
            .iter()
            .map(|j| j.shard.analysis_type)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        tracing::info!(run_id = %self.run_id, jobs = jobs.len(), "Resuming batch analysis run");
        let submission = Submission {
            jobs,
            failures: Vec::new(),
        };
        self.finish(records, &types, submission, start, cancel, progress_fn)
    }

    fn finish(
        &self,
        records: &[SourceRecord],
        types: &[AnalysisType],
        submission: Submission,
        start: Instant,
        cancel: &CancellationToken,
        progress_fn: Option<&dyn Fn(PipelineEvent)>,
    ) -> Result<PipelineSummary, BatchError> {
        let tracking = self.track(submission.jobs, cancel, progress_fn)?;
        let fetched = self.fetch(&tracking.completed, progress_fn)?;
        let collected = self.collect_results(types, &fetched, progress_fn);
        let (output, validation, output_path) = self.integrate(records, &collected, progress_fn)?;

        let duration_ms = start.elapsed().as_millis() as u64;
        if let Some(progress) = progress_fn {
            progress(PipelineEvent::Completed { duration_ms });
        }
        tracing::info!(
            run_id = %self.run_id,
            duration_ms,
            completed_jobs = tracking.completed.len(),
            failed_jobs = tracking.failed.len(),
            outstanding_jobs = tracking.outstanding.len(),
            "Batch analysis run finished"
        );

        Ok(PipelineSummary {
            run_id: self.run_id.clone(),
            total_records: records.len(),
            submit_failures: submission.failures,
            tracking,
            fetch_failures: fetched.failures,
            type_failures: collected.failures,
            completeness: output.completeness,
            validation,
            output_path,
            duration_ms,
        })
    }

    // ═══════════════════════════════════════════
    // Stages
    // ═══════════════════════════════════════════

    /// Build requests and write shard files for each type. Records the shard inventory.
    pub fn prepare(
        &self,
        records: &[SourceRecord],
        types: &[AnalysisType],
        progress_fn: Option<&dyn Fn(PipelineEvent)>,
    ) -> Result<BTreeMap<AnalysisType, Vec<Shard>>, BatchError> {
        let builder = RequestBuilder::new(&self.config, &self.vocabulary);
        let sharder = Sharder::from_config(&self.config);
        let shards_dir = self.config.shards_dir();
        let mut inventory = self.store.load_shard_inventory()?;
        let mut prepared = BTreeMap::new();

        for &analysis_type in types {
            let requests = builder.build(records, analysis_type);
            let request_count = requests.len();
            let base = shards_dir.join(format!("{}.jsonl", analysis_type.as_str()));
            let shards = sharder.shard(requests, &base)?;

            inventory.insert(analysis_type.as_str().to_string(), inventory_entry(&shards)?);
            tracing::info!(
                analysis_type = analysis_type.as_str(),
                requests = request_count,
                shards = shards.len(),
                "Shards prepared"
            );
            if let Some(progress) = progress_fn {
                progress(PipelineEvent::Prepared {
                    analysis_type,
                    requests: request_count,
                    shards: shards.len(),
                });
            }
            prepared.insert(analysis_type, shards);
        }

        self.store.save_shard_inventory(&inventory)?;
        Ok(prepared)
    }

    /// Submit every prepared shard. Fails only on a fatal rejection; jobs
    /// created before it stay in the registry.
    pub fn submit(
        &self,
        prepared: &BTreeMap<AnalysisType, Vec<Shard>>,
        progress_fn: Option<&dyn Fn(PipelineEvent)>,
    ) -> Result<Submission, BatchError> {
        let submitter = BatchSubmitter::new(self.endpoint, self.config.retry.clone());
        let mut registry = self.store.load_job_registry()?;
        let mut submission = Submission::default();

        for (&analysis_type, shards) in prepared {
            registry.clear_type(analysis_type);
            let report = match submitter.submit(analysis_type, shards) {
                Ok(report) => report,
                Err(e) => {
                    tracing::error!(analysis_type = analysis_type.as_str(), error = %e, "Submission rejected, aborting run");
                    self.store.save_job_registry(&registry)?;
                    return Err(e);
                }
            };

            for job in &report.jobs {
                registry.upsert(job, &self.run_id);
            }
            self.store.save_job_registry(&registry)?;

            tracing::info!(
                analysis_type = analysis_type.as_str(),
                jobs = report.jobs.len(),
                failures = report.failures.len(),
                "Shards submitted"
            );
            if let Some(progress) = progress_fn {
                progress(PipelineEvent::Submitted {
                    analysis_type,
                    jobs: report.jobs.len(),
                    failures: report.failures.len(),
                });
            }
            submission.jobs.extend(report.jobs);
            submission.failures.extend(report.failures);
        }

        Ok(submission)
    }

    /// Poll until every job is terminal or the run is cancelled. The registry
    /// is rewritten whenever a job changes status.
    pub fn track(
        &self,
        jobs: Vec<Job>,
        cancel: &CancellationToken,
        progress_fn: Option<&dyn Fn(PipelineEvent)>,
    ) -> Result<TrackingOutcome, BatchError> {
        let mut registry = self.store.load_job_registry()?;
        let store = &self.store;
        let run_id = self.run_id.as_str();

        let mut on_tick = |report: &TickReport<'_>| {
            if !report.changed.is_empty() {
                persist_jobs(store, &mut registry, report.changed, run_id);
            }
            if let Some(progress) = progress_fn {
                progress(PipelineEvent::Polling {
                    resolved: report.resolved,
                    total: report.total,
                });
            }
        };

        let outcome = JobTracker::from_config(self.endpoint, jobs, &self.config).run(cancel, Some(&mut on_tick));
        Ok(outcome)
    }

    /// Request cancellation of jobs still running. Returns the job ids the
    /// endpoint accepted a cancel for.
    pub fn cancel_outstanding(&self, jobs: &[Job]) -> Vec<String> {
        let mut cancelled = Vec::new();
        for job in jobs.iter().filter(|j| !j.status.is_terminal()) {
            match with_retry(&self.config.retry, "cancel_job", || self.endpoint.cancel_job(&job.remote_job_id)) {
                Ok(()) => {
                    tracing::info!(job_id = %job.remote_job_id, shard = job.shard.label(), "Job cancellation requested");
                    cancelled.push(job.remote_job_id.clone());
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.remote_job_id, error = %e, "Job cancellation failed");
                }
            }
        }
        cancelled
    }

    /// Download artifacts of completed jobs and record them in the manifest.
    pub fn fetch(
        &self,
        completed: &[Job],
        progress_fn: Option<&dyn Fn(PipelineEvent)>,
    ) -> Result<FetchReport, BatchError> {
        let fetcher = ResultFetcher::new(self.endpoint, self.config.results_dir(), self.config.retry.clone());
        let report = fetcher.fetch(completed);

        let mut manifest = self.store.load_download_manifest()?;
        report.record_into(&mut manifest);
        self.store.save_download_manifest(&manifest)?;

        if let Some(progress) = progress_fn {
            let types: BTreeSet<AnalysisType> = report.artifacts.iter().map(|a| a.shard.analysis_type).collect();
            for analysis_type in types {
                progress(PipelineEvent::Downloaded {
                    analysis_type,
                    artifacts: report.for_type(analysis_type).len(),
                });
            }
        }
        Ok(report)
    }

    /// Parse and merge each type's artifacts. A file that cannot be read or
    /// decoded aborts that shard; a type whose every output file failed is
    /// reported as failed and left unprocessed. Never fails as a whole.
    pub fn collect_results(
        &self,
        types: &[AnalysisType],
        fetched: &FetchReport,
        progress_fn: Option<&dyn Fn(PipelineEvent)>,
    ) -> CollectedResults {
        let parser = ResultParser::new(&self.vocabulary);
        let mut collected = CollectedResults::default();

        for &analysis_type in types {
            let artifacts = fetched.for_type(analysis_type);
            if artifacts.is_empty() {
                collected.maps.insert(analysis_type, None);
                continue;
            }

            let mut shard_maps = Vec::new();
            let mut errors = Vec::new();
            let mut failed_indices = Vec::new();
            let mut outputs = 0;

            for artifact in &artifacts {
                if let Some(path) = &artifact.output_path {
                    outputs += 1;
                    match parser.parse_file(path, analysis_type) {
                        Ok(parsed) => shard_maps.push(parsed.results),
                        Err(e) => {
                            tracing::error!(
                                analysis_type = analysis_type.as_str(),
                                shard = artifact.shard.label(),
                                error = %e,
                                "Result file unusable, skipping shard"
                            );
                            errors.push(format!("{}: {e}", artifact.shard.label()));
                        }
                    }
                }
                if let Some(path) = &artifact.error_path {
                    match parser.parse_error_file(path, analysis_type) {
                        Ok(indices) => failed_indices.extend(indices),
                        Err(e) => tracing::warn!(
                            shard = artifact.shard.label(),
                            error = %e,
                            "Error artifact unreadable"
                        ),
                    }
                }
            }

            if !failed_indices.is_empty() {
                tracing::warn!(
                    analysis_type = analysis_type.as_str(),
                    failed = failed_indices.len(),
                    "Endpoint reported failed requests"
                );
                failed_indices.sort_unstable();
                collected.failed_requests.insert(analysis_type, failed_indices);
            }

            if !errors.is_empty() {
                let reason = errors.join("; ");
                if let Some(progress) = progress_fn {
                    progress(PipelineEvent::Failed {
                        analysis_type,
                        error: reason.clone(),
                    });
                }
                collected.failures.insert(analysis_type, reason);
            }

            if outputs > 0 && shard_maps.is_empty() {
                collected.maps.insert(analysis_type, None);
                continue;
            }

            let merged = Merger::merge(analysis_type, shard_maps);
            if !merged.collisions.is_empty() {
                collected.collisions.insert(analysis_type, merged.collisions);
            }
            collected.maps.insert(analysis_type, Some(merged.map));
        }

        collected
    }

    /// Join results onto the corpus and write the output artifacts when at
    /// least one type was processed.
    pub fn integrate(
        &self,
        records: &[SourceRecord],
        collected: &CollectedResults,
        progress_fn: Option<&dyn Fn(PipelineEvent)>,
    ) -> Result<(IntegrationOutput, CompletenessReport, Option<PathBuf>), BatchError> {
        let output = Integrator::new(self.config.missing_indices_limit).integrate(records, &collected.maps);

        if let Some(progress) = progress_fn {
            for (analysis_type, completeness) in &output.completeness {
                progress(PipelineEvent::Integrated {
                    analysis_type: *analysis_type,
                    completeness: completeness.clone(),
                });
            }
        }

        let processed: Vec<AnalysisType> = output
            .completeness
            .iter()
            .filter(|(_, c)| c.stats().is_some())
            .map(|(t, _)| *t)
            .collect();
        let validation = CompletenessValidator::new(&processed).validate_enriched(&output.records);

        if !output.any_processed() {
            tracing::warn!(run_id = %self.run_id, "No analysis type produced results, nothing written");
            return Ok((output, validation, None));
        }

        let output_dir = self.config.output_dir();
        let records_path = output_dir.join(ENRICHED_RECORDS_FILE);
        save_enriched_records(&records_path, &output.records)?;

        let summary = IntegrationSummary {
            run_id: self.run_id.clone(),
            generated_at: Utc::now(),
            total_records: records.len(),
            completeness: output.completeness.clone(),
            failures: collected.failures.clone(),
            merge_collisions: collected.collisions.clone(),
            failed_requests: collected.failed_requests.clone(),
            validation: validation.clone(),
        };
        write_json_atomic(&output_dir.join(INTEGRATION_SUMMARY_FILE), &summary)?;
        write_atomic(
            &output_dir.join(INTEGRATION_REPORT_FILE),
            render_markdown(&summary).as_bytes(),
        )?;

        tracing::info!(
            path = %records_path.display(),
            records = output.records.len(),
            issues = validation.issues.len(),
            "Enriched records written"
        );
        Ok((output, validation, Some(records_path)))
    }
}

/// Upsert jobs into the registry and save it. Persistence failures during
/// tracking are logged; tracking goes on.
fn persist_jobs(store: &StateStore, registry: &mut JobRegistry, jobs: &[Job], run_id: &str) {
    for job in jobs {
        registry.upsert(job, run_id);
    }
    if let Err(e) = store.save_job_registry(registry) {
        tracing::warn!(error = %e, "Failed to persist job registry");
    }
}
