use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::pipeline::batch_analysis::error::BatchError;
use crate::pipeline::batch_analysis::retry::RetryPolicy;

/// Application-level constants
pub const APP_NAME: &str = "PostBatch";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable holding the endpoint API key.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Log filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "warn,postbatch_lib=info"
}

/// Get the application data directory (~/PostBatch/).
/// Falls back to the current directory when no home directory is known.
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

// ═══════════════════════════════════════════
// Batch Configuration
// ═══════════════════════════════════════════

/// Configuration for one pipeline run. Credentials are injected here and
/// nowhere else.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Bearer token for the batch endpoint. Never serialized.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    /// Endpoint path each request line targets (the `url` field).
    pub endpoint_path: String,
    pub completion_window: String,
    pub max_requests_per_shard: usize,
    /// Soft byte budget per shard file.
    pub max_shard_bytes: u64,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    /// Upper bound on tracking time. None = track until every job is terminal.
    pub max_wait_secs: Option<u64>,
    pub retry: RetryPolicy,
    pub work_dir: PathBuf,
    /// Record field holding the post text.
    pub text_field: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Prefix length of missing indices kept in integration stats.
    pub missing_indices_limit: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            endpoint_path: "/v1/chat/completions".to_string(),
            completion_window: "24h".to_string(),
            max_requests_per_shard: 50_000,
            max_shard_bytes: 190 * 1024 * 1024,
            poll_interval_secs: 60,
            request_timeout_secs: 120,
            max_wait_secs: None,
            retry: RetryPolicy::default(),
            work_dir: app_data_dir(),
            text_field: "text".to_string(),
            temperature: 0.0,
            max_tokens: 200,
            missing_indices_limit: 100,
        }
    }
}

impl std::fmt::Debug for BatchConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("endpoint_path", &self.endpoint_path)
            .field("completion_window", &self.completion_window)
            .field("max_requests_per_shard", &self.max_requests_per_shard)
            .field("max_shard_bytes", &self.max_shard_bytes)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_wait_secs", &self.max_wait_secs)
            .field("retry", &self.retry)
            .field("work_dir", &self.work_dir)
            .field("text_field", &self.text_field)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("missing_indices_limit", &self.missing_indices_limit)
            .finish()
    }
}

impl BatchConfig {
    /// Defaults plus the API key from the environment.
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty()),
            ..Self::default()
        }
    }

    /// Load from a JSON file. The API key is always taken from the environment.
    pub fn load(path: &Path) -> Result<Self, BatchError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&raw)?;
        config.api_key = std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty());
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BatchError> {
        if self.max_requests_per_shard == 0 {
            return Err(BatchError::Config("max_requests_per_shard must be > 0".into()));
        }
        if self.max_shard_bytes == 0 {
            return Err(BatchError::Config("max_shard_bytes must be > 0".into()));
        }
        if self.base_url.trim().is_empty() {
            return Err(BatchError::Config("base_url is empty".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(BatchError::Config("retry.max_attempts must be > 0".into()));
        }
        Ok(())
    }

    pub fn shards_dir(&self) -> PathBuf {
        self.work_dir.join("shards")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.work_dir.join("results")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.work_dir.join("state")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.work_dir.join("output")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_data_dir_ends_with_app_name() {
        assert!(app_data_dir().ends_with("PostBatch"));
    }

    #[test]
    fn default_config_is_valid() {
        BatchConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_shard_limit_rejected() {
        let config = BatchConfig {
            max_requests_per_shard: 0,
            ..BatchConfig::default()
        };
        assert!(matches!(config.validate(), Err(BatchError::Config(_))));
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = BatchConfig {
            api_key: Some("sk-secret-value".into()),
            ..BatchConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-secret-value"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn api_key_never_serialized() {
        let config = BatchConfig {
            api_key: Some("sk-secret-value".into()),
            ..BatchConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("sk-secret-value"));
    }

    #[test]
    fn load_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"max_requests_per_shard": 2, "work_dir": "/tmp/pb"}"#).unwrap();

        let config = BatchConfig::load(&path).unwrap();
        assert_eq!(config.max_requests_per_shard, 2);
        assert_eq!(config.shards_dir(), PathBuf::from("/tmp/pb/shards"));
        assert_eq!(config.model, "gpt-4o-mini");
    }
}
