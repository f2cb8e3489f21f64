//! BatchSubmitter: upload each shard and create one job per shard.
//!
//! A shard whose upload or job creation fails (after retries) is recorded
//! as a failure and the remaining shards are still submitted. A rejection
//! by the endpoint is fatal and returned immediately.

use serde::Serialize;

use super::error::BatchError;
use super::retry::{with_retry, RetryPolicy};
use super::traits::BatchEndpoint;
use super::types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStage {
    Upload,
    CreateJob,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardFailure {
    pub shard: ShardRef,
    pub stage: SubmitStage,
    pub error: String,
}

/// Jobs created for one analysis type, plus the shards that could not be submitted.
#[derive(Debug, Clone)]
pub struct SubmissionReport {
    pub analysis_type: AnalysisType,
    pub jobs: Vec<Job>,
    pub failures: Vec<ShardFailure>,
}

pub struct BatchSubmitter<'a> {
    endpoint: &'a dyn BatchEndpoint,
    retry: RetryPolicy,
}

impl<'a> BatchSubmitter<'a> {
    pub fn new(endpoint: &'a dyn BatchEndpoint, retry: RetryPolicy) -> Self {
        Self { endpoint, retry }
    }

    pub fn submit(
        &self,
        analysis_type: AnalysisType,
        shards: &[Shard],
    ) -> Result<SubmissionReport, BatchError> {
        let total = shards.len();
        let mut report = SubmissionReport {
            analysis_type,
            jobs: Vec::with_capacity(total),
            failures: Vec::new(),
        };

        for shard in shards {
            let shard_ref = shard.shard_ref(total);

            let file_id = match with_retry(&self.retry, "upload", || self.endpoint.upload(&shard.path)) {
                Ok(id) => id,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        shard = shard_ref.label(),
                        error = %e,
                        "Shard upload failed, continuing with remaining shards"
                    );
                    report.failures.push(ShardFailure {
                        shard: shard_ref,
                        stage: SubmitStage::Upload,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            let job_id = match with_retry(&self.retry, "create_job", || self.endpoint.create_job(&file_id)) {
                Ok(id) => id,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        shard = shard_ref.label(),
                        file_id,
                        error = %e,
                        "Job creation failed, continuing with remaining shards"
                    );
                    report.failures.push(ShardFailure {
                        shard: shard_ref,
                        stage: SubmitStage::CreateJob,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            tracing::info!(
                shard = shard_ref.label(),
                job_id,
                requests = shard_ref.request_count,
                "Batch job created"
            );
            report.jobs.push(Job::new(shard_ref, job_id, file_id));
        }

        Ok(report)
    }
}
