//! HTTP client for an OpenAI-compatible batch endpoint, plus a scripted mock.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::BatchError;
use super::state::write_atomic;
use super::traits::BatchEndpoint;
use super::types::{JobSnapshot, JobStatus, RequestCounts};
use crate::config::BatchConfig;

/// Blocking client for `/files` and `/batches`.
pub struct OpenAiBatchClient {
    base_url: String,
    api_key: String,
    endpoint_path: String,
    completion_window: String,
    client: reqwest::blocking::Client,
}

impl OpenAiBatchClient {
    /// Build a client from configuration. Fails if no API key was injected.
    pub fn new(config: &BatchConfig) -> Result<Self, BatchError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| BatchError::Config("no API key configured".into()))?;

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| BatchError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            endpoint_path: config.endpoint_path.clone(),
            completion_window: config.completion_window.clone(),
            client,
        })
    }

    fn send(
        &self,
        operation: &str,
        request: reqwest::blocking::RequestBuilder,
    ) -> Result<reqwest::blocking::Response, BatchError> {
        let response = request
            .bearer_auth(&self.api_key)
            .send()
            .map_err(|e| map_send_error(operation, e))?;
        check_status(operation, response)
    }
}

fn map_send_error(operation: &str, e: reqwest::Error) -> BatchError {
    if e.is_timeout() || e.is_connect() {
        BatchError::transient(operation, e.to_string())
    } else {
        BatchError::HttpClient(e.to_string())
    }
}

/// 429 and 5xx are transient; any other non-success status is a rejection.
fn check_status(
    operation: &str,
    response: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response, BatchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(classify_status(operation, status.as_u16(), body))
}

fn classify_status(operation: &str, status: u16, body: String) -> BatchError {
    if status == 429 || status >= 500 {
        BatchError::transient(operation, format!("status {status}: {body}"))
    } else {
        BatchError::Rejected { status, body }
    }
}

#[derive(Deserialize)]
struct FileObject {
    id: String,
}

#[derive(Serialize)]
struct CreateBatchRequest<'a> {
    input_file_id: &'a str,
    endpoint: &'a str,
    completion_window: &'a str,
}

#[derive(Deserialize)]
struct RemoteRequestCounts {
    #[serde(default)]
    total: u64,
    #[serde(default)]
    completed: u64,
    #[serde(default)]
    failed: u64,
}

/// Response body of `/batches` endpoints.
#[derive(Deserialize)]
struct BatchObject {
    id: String,
    status: String,
    #[serde(default)]
    request_counts: Option<RemoteRequestCounts>,
    #[serde(default)]
    output_file_id: Option<String>,
    #[serde(default)]
    error_file_id: Option<String>,
    #[serde(default)]
    created_at: Option<i64>,
    #[serde(default)]
    completed_at: Option<i64>,
}

impl BatchObject {
    fn into_snapshot(self) -> Result<JobSnapshot, BatchError> {
        let status = JobStatus::from_str(&self.status).ok_or_else(|| {
            BatchError::ResponseParsing(format!("job {} has unknown status '{}'", self.id, self.status))
        })?;
        let request_counts = self
            .request_counts
            .map(|c| RequestCounts {
                total: c.total,
                completed: c.completed,
                failed: c.failed,
            })
            .unwrap_or_default();
        Ok(JobSnapshot {
            status,
            request_counts,
            output_file_id: self.output_file_id,
            error_file_id: self.error_file_id,
            created_at: self.created_at.and_then(|s| DateTime::<Utc>::from_timestamp(s, 0)),
            completed_at: self.completed_at.and_then(|s| DateTime::<Utc>::from_timestamp(s, 0)),
        })
    }
}

impl BatchEndpoint for OpenAiBatchClient {
    fn upload(&self, path: &Path) -> Result<String, BatchError> {
        let form = reqwest::blocking::multipart::Form::new()
            .text("purpose", "batch")
            .file("file", path)?;
        let response = self.send(
            "upload",
            self.client
                .post(format!("{}/files", self.base_url))
                .multipart(form),
        )?;
        let file: FileObject = response
            .json()
            .map_err(|e| BatchError::ResponseParsing(e.to_string()))?;
        Ok(file.id)
    }

    fn create_job(&self, file_id: &str) -> Result<String, BatchError> {
        let body = CreateBatchRequest {
            input_file_id: file_id,
            endpoint: &self.endpoint_path,
            completion_window: &self.completion_window,
        };
        let response = self.send(
            "create_job",
            self.client
                .post(format!("{}/batches", self.base_url))
                .json(&body),
        )?;
        let batch: BatchObject = response
            .json()
            .map_err(|e| BatchError::ResponseParsing(e.to_string()))?;
        Ok(batch.id)
    }

    fn get_status(&self, job_id: &str) -> Result<JobSnapshot, BatchError> {
        let response = self.send(
            "get_status",
            self.client.get(format!("{}/batches/{job_id}", self.base_url)),
        )?;
        let batch: BatchObject = response
            .json()
            .map_err(|e| BatchError::ResponseParsing(e.to_string()))?;
        batch.into_snapshot()
    }

    fn download_file(&self, file_id: &str, dest: &Path) -> Result<(), BatchError> {
        let response = self.send(
            "download_file",
            self.client
                .get(format!("{}/files/{file_id}/content", self.base_url)),
        )?;
        let bytes = response
            .bytes()
            .map_err(|e| map_send_error("download_file", e))?;
        write_atomic(dest, &bytes)?;
        Ok(())
    }

    fn cancel_job(&self, job_id: &str) -> Result<(), BatchError> {
        self.send(
            "cancel_job",
            self.client
                .post(format!("{}/batches/{job_id}/cancel", self.base_url)),
        )?;
        Ok(())
    }
}

// ═══════════════════════════════════════════
// Mock endpoint
// ═══════════════════════════════════════════

/// Reply the mock generates for one request line.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Successful response with this message content.
    Content(String),
    /// Response line carrying a non-success status code.
    HttpError(u16),
}

/// Scripted lifecycle of one mock job, selected by creation order.
#[derive(Debug, Clone)]
pub struct JobScript {
    /// Status reported on each successive poll; the last one repeats.
    pub statuses: Vec<JobStatus>,
    /// When false, every request of the job lands in the error artifact.
    pub produce_output: bool,
}

impl Default for JobScript {
    fn default() -> Self {
        Self {
            statuses: vec![JobStatus::InProgress, JobStatus::Completed],
            produce_output: true,
        }
    }
}

/// Failure injected into mock uploads.
#[derive(Debug, Clone, Copy)]
pub enum MockFailure {
    /// Fail with a transient error this many times, then succeed.
    Transient { times: usize },
    Rejected,
}

struct MockJob {
    input_file_id: String,
    script: JobScript,
    polls: usize,
    artifacts: Option<(Option<String>, Option<String>, RequestCounts)>,
}

#[derive(Default)]
struct MockState {
    files: HashMap<String, String>,
    jobs: HashMap<String, MockJob>,
    job_order: Vec<String>,
    uploads: usize,
    status_calls: usize,
    scripts: HashMap<usize, JobScript>,
    upload_failures: HashMap<String, MockFailure>,
    failing_downloads: HashSet<String>,
    cancel_requests: Vec<String>,
}

/// In-memory endpoint that reads uploaded shards and fabricates result files.
///
/// Ids are deterministic: uploads are `file-in-{n}`, jobs `batch-{n}`, and the
/// artifacts of job `n` are `file-out-{n}` and `file-err-{n}`.
pub struct MockBatchEndpoint {
    state: RefCell<MockState>,
    responder: Box<dyn Fn(&str) -> MockReply>,
}

impl Default for MockBatchEndpoint {
    fn default() -> Self {
        Self::new(|_| MockReply::Content("3".to_string()))
    }
}

impl MockBatchEndpoint {
    /// `responder` maps a request's custom_id to the reply for that line.
    pub fn new(responder: impl Fn(&str) -> MockReply + 'static) -> Self {
        Self {
            state: RefCell::new(MockState::default()),
            responder: Box::new(responder),
        }
    }

    /// Script the job created `ordinal`-th (zero-based).
    pub fn with_script(self, ordinal: usize, script: JobScript) -> Self {
        self.state.borrow_mut().scripts.insert(ordinal, script);
        self
    }

    /// Fail uploads of the file with this name.
    pub fn with_upload_failure(self, file_name: &str, failure: MockFailure) -> Self {
        self.state
            .borrow_mut()
            .upload_failures
            .insert(file_name.to_string(), failure);
        self
    }

    /// Make downloads of this remote file id fail.
    pub fn with_failing_download(self, file_id: &str) -> Self {
        self.state
            .borrow_mut()
            .failing_downloads
            .insert(file_id.to_string());
        self
    }

    pub fn uploaded_count(&self) -> usize {
        self.state.borrow().files.keys().filter(|k| k.starts_with("file-in-")).count()
    }

    pub fn status_calls(&self) -> usize {
        self.state.borrow().status_calls
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.state.borrow().job_order.clone()
    }

    pub fn cancel_requests(&self) -> Vec<String> {
        self.state.borrow().cancel_requests.clone()
    }

    fn fabricate_artifacts(
        &self,
        ordinal: usize,
        input: &str,
        produce_output: bool,
    ) -> (Option<(String, String)>, Option<(String, String)>, RequestCounts) {
        let mut out_lines = Vec::new();
        let mut err_lines = Vec::new();
        let mut counts = RequestCounts::default();

        for (n, line) in input.lines().filter(|l| !l.trim().is_empty()).enumerate() {
            counts.total += 1;
            let custom_id = serde_json::from_str::<serde_json::Value>(line)
                .ok()
                .and_then(|v| v.get("custom_id").and_then(|c| c.as_str()).map(String::from))
                .unwrap_or_default();

            if !produce_output {
                counts.failed += 1;
                err_lines.push(serde_json::json!({
                    "id": format!("batch_req_{ordinal}_{n}"),
                    "custom_id": custom_id,
                    "response": null,
                    "error": {"code": "server_error", "message": "request failed"},
                }));
                continue;
            }

            match (self.responder)(&custom_id) {
                MockReply::Content(content) => {
                    counts.completed += 1;
                    out_lines.push(serde_json::json!({
                        "id": format!("batch_req_{ordinal}_{n}"),
                        "custom_id": custom_id,
                        "response": {
                            "status_code": 200,
                            "body": {"choices": [{"index": 0, "message": {"role": "assistant", "content": content}}]},
                        },
                        "error": null,
                    }));
                }
                MockReply::HttpError(code) => {
                    counts.failed += 1;
                    out_lines.push(serde_json::json!({
                        "id": format!("batch_req_{ordinal}_{n}"),
                        "custom_id": custom_id,
                        "response": {"status_code": code, "body": {"error": {"message": "rejected"}}},
                        "error": null,
                    }));
                }
            }
        }

        let render = |lines: Vec<serde_json::Value>| {
            lines.iter().map(|l| l.to_string()).collect::<Vec<_>>().join("\n") + "\n"
        };
        let output = (!out_lines.is_empty())
            .then(|| (format!("file-out-{ordinal}"), render(out_lines)));
        let errors = (!err_lines.is_empty())
            .then(|| (format!("file-err-{ordinal}"), render(err_lines)));
        (output, errors, counts)
    }
}

impl BatchEndpoint for MockBatchEndpoint {
    fn upload(&self, path: &Path) -> Result<String, BatchError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut state = self.state.borrow_mut();

        if let Some(failure) = state.upload_failures.get_mut(&name) {
            match failure {
                MockFailure::Rejected => {
                    return Err(BatchError::Rejected { status: 400, body: format!("invalid file {name}") });
                }
                MockFailure::Transient { times } if *times > 0 => {
                    *times -= 1;
                    return Err(BatchError::transient("upload", "status 429: rate limited"));
                }
                MockFailure::Transient { .. } => {}
            }
        }

        let contents = std::fs::read_to_string(path)?;
        let id = format!("file-in-{}", state.uploads);
        state.uploads += 1;
        state.files.insert(id.clone(), contents);
        Ok(id)
    }

    fn create_job(&self, file_id: &str) -> Result<String, BatchError> {
        let mut state = self.state.borrow_mut();
        if !state.files.contains_key(file_id) {
            return Err(BatchError::Rejected { status: 404, body: format!("no file {file_id}") });
        }
        let ordinal = state.job_order.len();
        let id = format!("batch-{ordinal}");
        let script = state.scripts.get(&ordinal).cloned().unwrap_or_default();
        state.jobs.insert(
            id.clone(),
            MockJob {
                input_file_id: file_id.to_string(),
                script,
                polls: 0,
                artifacts: None,
            },
        );
        state.job_order.push(id.clone());
        Ok(id)
    }

    fn get_status(&self, job_id: &str) -> Result<JobSnapshot, BatchError> {
        let (ordinal, input, status, produce_output, needs_artifacts) = {
            let mut state = self.state.borrow_mut();
            state.status_calls += 1;
            let ordinal = state
                .job_order
                .iter()
                .position(|j| j == job_id)
                .ok_or_else(|| BatchError::Rejected { status: 404, body: format!("no job {job_id}") })?;
            let job = state.jobs.get_mut(job_id).ok_or_else(|| BatchError::Rejected {
                status: 404,
                body: format!("no job {job_id}"),
            })?;
            job.polls += 1;
            let step = job.polls.min(job.script.statuses.len()).saturating_sub(1);
            let status = job.script.statuses.get(step).copied().unwrap_or(JobStatus::Completed);
            let produce_output = job.script.produce_output;
            let needs_artifacts = status.is_terminal() && job.artifacts.is_none();
            let input_id = job.input_file_id.clone();
            let input = state.files.get(&input_id).cloned().unwrap_or_default();
            (ordinal, input, status, produce_output, needs_artifacts)
        };

        if needs_artifacts {
            let (output, errors, counts) = if status == JobStatus::Completed {
                self.fabricate_artifacts(ordinal, &input, produce_output)
            } else {
                (None, None, RequestCounts::default())
            };
            let mut state = self.state.borrow_mut();
            let output_id = output.map(|(id, body)| {
                state.files.insert(id.clone(), body);
                id
            });
            let error_id = errors.map(|(id, body)| {
                state.files.insert(id.clone(), body);
                id
            });
            if let Some(job) = state.jobs.get_mut(job_id) {
                job.artifacts = Some((output_id, error_id, counts));
            }
        }

        let state = self.state.borrow();
        let job = state.jobs.get(job_id).ok_or_else(|| BatchError::Rejected {
            status: 404,
            body: format!("no job {job_id}"),
        })?;
        let (output_file_id, error_file_id, request_counts) = match &job.artifacts {
            Some((out, err, counts)) => (out.clone(), err.clone(), *counts),
            None => (None, None, RequestCounts::default()),
        };
        Ok(JobSnapshot {
            status,
            request_counts,
            output_file_id,
            error_file_id,
            created_at: Some(Utc::now()),
            completed_at: status.is_terminal().then(Utc::now),
        })
    }

    fn download_file(&self, file_id: &str, dest: &Path) -> Result<(), BatchError> {
        let state = self.state.borrow();
        if state.failing_downloads.contains(file_id) {
            return Err(BatchError::Rejected { status: 404, body: format!("no file {file_id}") });
        }
        let body = state.files.get(file_id).ok_or_else(|| BatchError::Rejected {
            status: 404,
            body: format!("no file {file_id}"),
        })?;
        write_atomic(dest, body.as_bytes())?;
        Ok(())
    }

    fn cancel_job(&self, job_id: &str) -> Result<(), BatchError> {
        self.state.borrow_mut().cancel_requests.push(job_id.to_string());
        Ok(())
    }
}
