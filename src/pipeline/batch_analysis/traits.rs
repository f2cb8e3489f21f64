//! Trait definitions for the batch analysis pipeline.
//!
//! The remote inference endpoint is the only external collaborator; the rest
//! of the pipeline talks to it through `BatchEndpoint` and never depends on a
//! concrete HTTP client.

use std::path::Path;

use super::error::BatchError;
use super::types::JobSnapshot;

/// Contract of the remote batch endpoint.
pub trait BatchEndpoint {
    /// Upload a shard file. Returns the remote file id.
    fn upload(&self, path: &Path) -> Result<String, BatchError>;

    /// Create a batch job over an uploaded file. Returns the remote job id.
    fn create_job(&self, file_id: &str) -> Result<String, BatchError>;

    /// Current status, request counts and artifact ids of a job.
    fn get_status(&self, job_id: &str) -> Result<JobSnapshot, BatchError>;

    /// Download a remote file to `dest`.
    fn download_file(&self, file_id: &str, dest: &Path) -> Result<(), BatchError>;

    /// Ask the endpoint to cancel a job. The job moves through `cancelling`.
    fn cancel_job(&self, job_id: &str) -> Result<(), BatchError>;
}
