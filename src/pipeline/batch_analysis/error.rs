//! Error types for the batch analysis pipeline.
//!
//! Validation failures on individual result lines are never errors: they
//! become `None` values for the affected index. Only endpoint, filesystem
//! and structural problems surface here.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {
    /// Rate limits, concurrency limits, 5xx responses, timeouts. Retryable.
    #[error("Transient endpoint error during {operation}: {message}")]
    Transient { operation: String, message: String },

    /// Non-retryable rejection (malformed shard payload, bad request).
    #[error("Endpoint rejected request (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Malformed endpoint response: {0}")]
    ResponseParsing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid correlation id: {0}")]
    InvalidCorrelationId(String),

    #[error("Unknown analysis type: {0}")]
    UnknownAnalysisType(String),

    #[error("Artifact not found: {0}")]
    MissingArtifact(PathBuf),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BatchError {
    /// Whether the call that produced this error may be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Fatal errors abort the run instead of being recorded per shard.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    pub fn transient(operation: &str, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(BatchError::transient("upload", "429 Too Many Requests").is_transient());
        assert!(!BatchError::Rejected { status: 400, body: "bad".into() }.is_transient());
        assert!(!BatchError::Config("x".into()).is_transient());
    }

    #[test]
    fn rejection_is_fatal() {
        assert!(BatchError::Rejected { status: 400, body: String::new() }.is_fatal());
        assert!(!BatchError::transient("poll", "timeout").is_fatal());
    }

    #[test]
    fn display_includes_operation() {
        let err = BatchError::transient("create_job", "503");
        assert_eq!(err.to_string(), "Transient endpoint error during create_job: 503");
    }
}
