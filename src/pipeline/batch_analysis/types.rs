//! Core types for the batch analysis pipeline.
//!
//! These types model the full lifecycle:
//! Record → Request → Shard → Job → Result line → ResultMap → Enriched record.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ═══════════════════════════════════════════
// Analysis Type
// ═══════════════════════════════════════════

/// The classification tasks a record can be submitted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    SentimentPolarity,
    SentimentAttribute,
    TopicAnalysis,
    PublisherAnalysis,
    BeliefCategory,
    IdentityClassification,
}

impl AnalysisType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SentimentPolarity => "sentiment_polarity",
            Self::SentimentAttribute => "sentiment_attribute",
            Self::TopicAnalysis => "topic_analysis",
            Self::PublisherAnalysis => "publisher_analysis",
            Self::BeliefCategory => "belief_category",
            Self::IdentityClassification => "identity_classification",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "sentiment_polarity" => Some(Self::SentimentPolarity),
            "sentiment_attribute" => Some(Self::SentimentAttribute),
            "topic_analysis" => Some(Self::TopicAnalysis),
            "publisher_analysis" => Some(Self::PublisherAnalysis),
            "belief_category" => Some(Self::BeliefCategory),
            "identity_classification" => Some(Self::IdentityClassification),
            _ => None,
        }
    }

    pub fn all() -> &'static [AnalysisType] {
        &[
            Self::SentimentPolarity,
            Self::SentimentAttribute,
            Self::TopicAnalysis,
            Self::PublisherAnalysis,
            Self::BeliefCategory,
            Self::IdentityClassification,
        ]
    }

    /// The four types every full run covers.
    pub fn core() -> &'static [AnalysisType] {
        &[
            Self::SentimentPolarity,
            Self::SentimentAttribute,
            Self::TopicAnalysis,
            Self::PublisherAnalysis,
        ]
    }
}

impl std::fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════
// Source Records
// ═══════════════════════════════════════════

/// One record of the input corpus. Fields are kept verbatim; position in the
/// corpus is the record's identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceRecord {
    fields: Map<String, Value>,
}

impl SourceRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Build a record from a JSON value. Only objects are records.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Text content used for the request payload. Missing or non-string
    /// fields yield an empty string so the record still gets a request.
    pub fn text(&self, field: &str) -> &str {
        self.fields.get(field).and_then(|v| v.as_str()).unwrap_or("")
    }
}

// ═══════════════════════════════════════════
// Requests
// ═══════════════════════════════════════════

/// A chat message inside a request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Request body sent to the inference endpoint for one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// One classification request for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    pub correlation_id: String,
    pub analysis_type: AnalysisType,
    pub payload: RequestBody,
}

// ═══════════════════════════════════════════
// Shards
// ═══════════════════════════════════════════

/// An ordered slice of one analysis type's request stream, written to `path`.
#[derive(Debug, Clone)]
pub struct Shard {
    pub analysis_type: AnalysisType,
    /// Zero-based position among this type's shards.
    pub index: usize,
    pub path: PathBuf,
    pub requests: Vec<AnalysisRequest>,
    pub byte_size: u64,
}

impl Shard {
    pub fn shard_ref(&self, total: usize) -> ShardRef {
        ShardRef {
            analysis_type: self.analysis_type,
            index: self.index,
            total,
            path: self.path.clone(),
            request_count: self.requests.len(),
        }
    }
}

/// Lightweight reference to a shard that outlives the shard's request list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRef {
    pub analysis_type: AnalysisType,
    pub index: usize,
    pub total: usize,
    pub path: PathBuf,
    pub request_count: usize,
}

impl ShardRef {
    /// Label used for artifact names and registry keys:
    /// `sentiment_polarity` for a single shard, `sentiment_polarity_part2` otherwise.
    pub fn label(&self) -> String {
        if self.total <= 1 {
            self.analysis_type.as_str().to_string()
        } else {
            format!("{}_part{}", self.analysis_type.as_str(), self.index + 1)
        }
    }
}

// ═══════════════════════════════════════════
// Jobs
// ═══════════════════════════════════════════

/// Remote job status as reported by the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Validating,
    InProgress,
    Finalizing,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::InProgress => "in_progress",
            Self::Finalizing => "finalizing",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "validating" => Some(Self::Validating),
            "in_progress" => Some(Self::InProgress),
            "finalizing" => Some(Self::Finalizing),
            "cancelling" => Some(Self::Cancelling),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// No further transition happens from a terminal status.
    /// `cancelling` is not terminal: the job stays polled until `cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCounts {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
}

impl RequestCounts {
    pub fn add(&mut self, other: &RequestCounts) {
        self.total += other.total;
        self.completed += other.completed;
        self.failed += other.failed;
    }
}

/// What `get_status` returns for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub request_counts: RequestCounts,
    pub output_file_id: Option<String>,
    pub error_file_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A submitted batch job. Owned by the tracker while it is being polled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub shard: ShardRef,
    pub remote_job_id: String,
    pub input_file_id: String,
    pub status: JobStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub request_counts: RequestCounts,
    pub output_file_id: Option<String>,
    pub error_file_id: Option<String>,
}

impl Job {
    pub fn new(shard: ShardRef, remote_job_id: String, input_file_id: String) -> Self {
        Self {
            shard,
            remote_job_id,
            input_file_id,
            status: JobStatus::Validating,
            created_at: Some(Utc::now()),
            completed_at: None,
            request_counts: RequestCounts::default(),
            output_file_id: None,
            error_file_id: None,
        }
    }

    /// Apply a status report. Returns true if the status changed.
    pub fn apply(&mut self, snapshot: JobSnapshot) -> bool {
        let changed = self.status != snapshot.status;
        self.status = snapshot.status;
        self.request_counts = snapshot.request_counts;
        self.output_file_id = snapshot.output_file_id.filter(|id| !id.is_empty());
        self.error_file_id = snapshot.error_file_id.filter(|id| !id.is_empty());
        if snapshot.created_at.is_some() {
            self.created_at = snapshot.created_at;
        }
        if snapshot.completed_at.is_some() {
            self.completed_at = snapshot.completed_at;
        }
        changed
    }
}

// ═══════════════════════════════════════════
// Results
// ═══════════════════════════════════════════

/// A (parent, sub) topic assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicPair {
    pub parent_topic: String,
    pub sub_topic: String,
}

/// A validated result for one record, one variant per analysis type.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisValue {
    /// Sentiment polarity on a 1–5 scale.
    Polarity(u8),
    Attributes(Vec<String>),
    Topics(Vec<TopicPair>),
    Publisher(String),
    Belief(String),
    Identities(Vec<String>),
}

impl AnalysisValue {
    pub fn analysis_type(&self) -> AnalysisType {
        match self {
            Self::Polarity(_) => AnalysisType::SentimentPolarity,
            Self::Attributes(_) => AnalysisType::SentimentAttribute,
            Self::Topics(_) => AnalysisType::TopicAnalysis,
            Self::Publisher(_) => AnalysisType::PublisherAnalysis,
            Self::Belief(_) => AnalysisType::BeliefCategory,
            Self::Identities(_) => AnalysisType::IdentityClassification,
        }
    }

    /// Output representation of the value inside an enriched record.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Polarity(score) => Value::from(*score),
            Self::Attributes(labels) | Self::Identities(labels) => Value::Array(
                labels.iter().map(|l| Value::String(l.clone())).collect(),
            ),
            Self::Topics(pairs) => Value::Array(
                pairs
                    .iter()
                    .map(|p| {
                        let mut obj = Map::new();
                        obj.insert("parent_topic".into(), Value::String(p.parent_topic.clone()));
                        obj.insert("sub_topic".into(), Value::String(p.sub_topic.clone()));
                        Value::Object(obj)
                    })
                    .collect(),
            ),
            Self::Publisher(label) | Self::Belief(label) => Value::String(label.clone()),
        }
    }
}

/// One parsed result line.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub index: usize,
    pub analysis_type: AnalysisType,
    /// `None` when the line failed status, decoding or validation.
    pub value: Option<AnalysisValue>,
}

/// Record index → validated value, for one analysis type.
pub type ResultMap = BTreeMap<usize, AnalysisValue>;

// ═══════════════════════════════════════════
// Enriched Records
// ═══════════════════════════════════════════

/// The original record plus one slot per analysis type.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedRecord {
    pub record: SourceRecord,
    pub analyses: BTreeMap<AnalysisType, Option<AnalysisValue>>,
}

impl EnrichedRecord {
    pub fn value(&self, analysis_type: AnalysisType) -> Option<&AnalysisValue> {
        self.analyses.get(&analysis_type).and_then(|v| v.as_ref())
    }

    /// Original fields followed by one field per analysis type (`null` when absent).
    pub fn to_json(&self) -> Value {
        let mut obj = self.record.fields().clone();
        for (analysis_type, value) in &self.analyses {
            obj.insert(
                analysis_type.as_str().to_string(),
                value.as_ref().map(AnalysisValue::to_json).unwrap_or(Value::Null),
            );
        }
        Value::Object(obj)
    }
}

impl Serialize for EnrichedRecord {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

// ═══════════════════════════════════════════
// Integration Statistics
// ═══════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationStats {
    pub total_posts: usize,
    pub processed_posts: usize,
    /// Full count of missing indices; `missing_indices` holds only a prefix.
    pub missing_count: usize,
    pub missing_indices: Vec<usize>,
    /// Percentage, rounded to two decimals.
    pub completeness_rate: f64,
}

/// Per-type outcome of integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TypeCompleteness {
    Processed(IntegrationStats),
    /// No result files existed for this type.
    NotProcessed,
}

impl TypeCompleteness {
    pub fn stats(&self) -> Option<&IntegrationStats> {
        match self {
            Self::Processed(stats) => Some(stats),
            Self::NotProcessed => None,
        }
    }
}

// ═══════════════════════════════════════════
// Pipeline Events
// ═══════════════════════════════════════════

/// Progress events delivered to an optional callback while the pipeline runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    Prepared {
        analysis_type: AnalysisType,
        requests: usize,
        shards: usize,
    },
    Submitted {
        analysis_type: AnalysisType,
        jobs: usize,
        failures: usize,
    },
    Polling {
        resolved: usize,
        total: usize,
    },
    Downloaded {
        analysis_type: AnalysisType,
        artifacts: usize,
    },
    Integrated {
        analysis_type: AnalysisType,
        completeness: TypeCompleteness,
    },
    Failed {
        analysis_type: AnalysisType,
        error: String,
    },
    Completed {
        duration_ms: u64,
    },
}
