//! ResultFetcher: download output and error artifacts of completed jobs.
//!
//! Paths are deterministic: `{results_dir}/{shard label}_results.jsonl` and
//! `{shard label}_errors.jsonl`. The error artifact is best-effort.

use std::path::{Path, PathBuf};

use chrono::Utc;

use super::error::BatchError;
use super::retry::{with_retry, RetryPolicy};
use super::state::{DownloadManifest, DownloadRecord};
use super::traits::BatchEndpoint;
use super::types::*;

#[derive(Debug, Clone)]
pub struct FetchedArtifact {
    pub shard: ShardRef,
    pub batch_id: String,
    pub output_path: Option<PathBuf>,
    pub error_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct FetchFailure {
    pub shard: ShardRef,
    pub batch_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    pub artifacts: Vec<FetchedArtifact>,
    pub failures: Vec<FetchFailure>,
}

impl FetchReport {
    /// Artifacts of one analysis type, in shard order.
    pub fn for_type(&self, analysis_type: AnalysisType) -> Vec<&FetchedArtifact> {
        let mut artifacts: Vec<&FetchedArtifact> = self
            .artifacts
            .iter()
            .filter(|a| a.shard.analysis_type == analysis_type)
            .collect();
        artifacts.sort_by_key(|a| a.shard.index);
        artifacts
    }

    /// Record every fetched artifact in `manifest`, keyed by shard label.
    pub fn record_into(&self, manifest: &mut DownloadManifest) {
        let now = Utc::now();
        for artifact in &self.artifacts {
            manifest.insert(
                artifact.shard.label(),
                DownloadRecord {
                    analysis_type: artifact.shard.analysis_type,
                    shard_index: artifact.shard.index,
                    shard_total: artifact.shard.total,
                    batch_id: artifact.batch_id.clone(),
                    output_path: artifact.output_path.clone(),
                    error_path: artifact.error_path.clone(),
                    downloaded_at: now,
                },
            );
        }
    }
}

pub struct ResultFetcher<'a> {
    endpoint: &'a dyn BatchEndpoint,
    results_dir: PathBuf,
    retry: RetryPolicy,
}

impl<'a> ResultFetcher<'a> {
    pub fn new(endpoint: &'a dyn BatchEndpoint, results_dir: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            endpoint,
            results_dir: results_dir.into(),
            retry,
        }
    }

    pub fn output_path(&self, shard: &ShardRef) -> PathBuf {
        self.results_dir.join(format!("{}_results.jsonl", shard.label()))
    }

    pub fn error_path(&self, shard: &ShardRef) -> PathBuf {
        self.results_dir.join(format!("{}_errors.jsonl", shard.label()))
    }

    /// Download artifacts of every completed job. A failed output download is
    /// recorded for that shard only; siblings are still fetched.
    pub fn fetch(&self, jobs: &[Job]) -> FetchReport {
        let mut report = FetchReport::default();

        for job in jobs.iter().filter(|j| j.status == JobStatus::Completed) {
            let label = job.shard.label();

            let output_path = match job.output_file_id.as_deref() {
                Some(file_id) => {
                    let dest = self.output_path(&job.shard);
                    match self.download(file_id, &dest) {
                        Ok(()) => Some(dest),
                        Err(e) => {
                            tracing::warn!(
                                shard = label,
                                job_id = %job.remote_job_id,
                                error = %e,
                                "Output artifact download failed"
                            );
                            report.failures.push(FetchFailure {
                                shard: job.shard.clone(),
                                batch_id: job.remote_job_id.clone(),
                                error: e.to_string(),
                            });
                            continue;
                        }
                    }
                }
                None => {
                    tracing::warn!(shard = label, job_id = %job.remote_job_id, "Completed job has no output file");
                    None
                }
            };

            let error_path = job.error_file_id.as_deref().and_then(|file_id| {
                let dest = self.error_path(&job.shard);
                match self.download(file_id, &dest) {
                    Ok(()) => Some(dest),
                    Err(e) => {
                        tracing::warn!(
                            shard = label,
                            job_id = %job.remote_job_id,
                            error = %e,
                            "Error artifact download failed, continuing without it"
                        );
                        None
                    }
                }
            });

            if output_path.is_none() && error_path.is_none() {
                continue;
            }

            tracing::debug!(shard = label, has_output = output_path.is_some(), has_errors = error_path.is_some(), "Artifacts fetched");
            report.artifacts.push(FetchedArtifact {
                shard: job.shard.clone(),
                batch_id: job.remote_job_id.clone(),
                output_path,
                error_path,
            });
        }

        tracing::info!(
            artifacts = report.artifacts.len(),
            failures = report.failures.len(),
            "Result download finished"
        );
        report
    }

    fn download(&self, file_id: &str, dest: &Path) -> Result<(), BatchError> {
        with_retry(&self.retry, "download_file", || self.endpoint.download_file(file_id, dest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::batch_analysis::client::{JobScript, MockBatchEndpoint};

    fn completed_jobs(mock: &MockBatchEndpoint, dir: &Path, n: usize) -> Vec<Job> {
        (0..n)
            .map(|i| {
                let path = dir.join(format!("topic_analysis_part{}.jsonl", i + 1));
                std::fs::write(&path, format!("{{\"custom_id\":\"topic_analysis_{i:06}\"}}\n")).unwrap();
                let file_id = mock.upload(&path).unwrap();
                let job_id = mock.create_job(&file_id).unwrap();
                let mut job = Job::new(
                    ShardRef {
                        analysis_type: AnalysisType::TopicAnalysis,
                        index: i,
                        total: n,
                        path,
                        request_count: 1,
                    },
                    job_id.clone(),
                    file_id,
                );
                while !job.status.is_terminal() {
                    job.apply(mock.get_status(&job_id).unwrap());
                }
                job
            })
            .collect()
    }

    #[test]
    fn downloads_output_per_shard_label() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockBatchEndpoint::default();
        let jobs = completed_jobs(&mock, dir.path(), 2);
        let results = dir.path().join("results");

        let report = ResultFetcher::new(&mock, &results, RetryPolicy::immediate(1)).fetch(&jobs);
        assert_eq!(report.artifacts.len(), 2);
        assert!(report.failures.is_empty());
        assert_eq!(
            report.artifacts[1].output_path.as_deref(),
            Some(results.join("topic_analysis_part2_results.jsonl").as_path())
        );
        assert!(results.join("topic_analysis_part1_results.jsonl").exists());
        assert!(report.artifacts[0].error_path.is_none());
    }

    #[test]
    fn error_only_job_yields_error_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockBatchEndpoint::default().with_script(
            0,
            JobScript {
                statuses: vec![JobStatus::Completed],
                produce_output: false,
            },
        );
        let jobs = completed_jobs(&mock, dir.path(), 1);

        let report = ResultFetcher::new(&mock, dir.path(), RetryPolicy::immediate(1)).fetch(&jobs);
        assert_eq!(report.artifacts.len(), 1);
        assert!(report.artifacts[0].output_path.is_none());
        assert!(report.artifacts[0].error_path.as_ref().unwrap().exists());
    }

    #[test]
    fn failed_error_artifact_download_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockBatchEndpoint::default()
            .with_script(
                0,
                JobScript {
                    statuses: vec![JobStatus::Completed],
                    produce_output: false,
                },
            )
            .with_failing_download("file-err-0");
        let jobs = completed_jobs(&mock, dir.path(), 2);

        let report = ResultFetcher::new(&mock, dir.path(), RetryPolicy::immediate(1)).fetch(&jobs);
        assert!(report.failures.is_empty());
        assert_eq!(report.artifacts.len(), 1, "shard with nothing downloadable is skipped");
        assert_eq!(report.artifacts[0].shard.index, 1);
    }

    #[test]
    fn failed_output_download_is_recorded_per_shard() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockBatchEndpoint::default().with_failing_download("file-out-0");
        let jobs = completed_jobs(&mock, dir.path(), 2);

        let report = ResultFetcher::new(&mock, dir.path(), RetryPolicy::immediate(1)).fetch(&jobs);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].batch_id, "batch-0");
        assert_eq!(report.artifacts.len(), 1);
        assert_eq!(report.artifacts[0].batch_id, "batch-1");
    }

    #[test]
    fn non_completed_jobs_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockBatchEndpoint::default();
        let mut jobs = completed_jobs(&mock, dir.path(), 1);
        jobs[0].status = JobStatus::Expired;

        let report = ResultFetcher::new(&mock, dir.path(), RetryPolicy::immediate(1)).fetch(&jobs);
        assert!(report.artifacts.is_empty());
        assert!(report.failures.is_empty());
    }

    #[test]
    fn manifest_records_are_keyed_by_label() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockBatchEndpoint::default();
        let jobs = completed_jobs(&mock, dir.path(), 2);
        let report = ResultFetcher::new(&mock, dir.path(), RetryPolicy::immediate(1)).fetch(&jobs);

        let mut manifest = DownloadManifest::new();
        report.record_into(&mut manifest);
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest["topic_analysis_part2"].batch_id, "batch-1");
        assert_eq!(report.for_type(AnalysisType::TopicAnalysis).len(), 2);
        assert!(report.for_type(AnalysisType::SentimentPolarity).is_empty());
    }
}
