//! Persisted pipeline state: shard inventory, job registry, download manifest.
//!
//! Every file is replaced atomically (temp file in the same directory, then
//! rename) so an interrupted write never leaves a truncated file under the
//! final name.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::error::BatchError;
use super::types::{AnalysisType, EnrichedRecord, Job, JobStatus, RequestCounts, ShardRef};

const SHARD_INVENTORY_FILE: &str = "shard_inventory.json";
const JOB_REGISTRY_FILE: &str = "job_registry.json";
const DOWNLOAD_MANIFEST_FILE: &str = "download_manifest.json";

/// Write `bytes` to `path` through a temp file and an atomic rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), BatchError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| BatchError::Io(e.error))?;
    Ok(())
}

pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), BatchError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T, BatchError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

// ═══════════════════════════════════════════
// Shard Inventory
// ═══════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardFileRecord {
    pub path: PathBuf,
    pub requests: usize,
    pub bytes: u64,
    /// SHA-256 of the file contents, base64.
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardInventoryEntry {
    pub file_count: usize,
    pub total_requests: usize,
    pub total_bytes: u64,
    pub files: Vec<ShardFileRecord>,
    pub created_at: DateTime<Utc>,
}

/// Analysis type name → shard files written for it.
pub type ShardInventory = BTreeMap<String, ShardInventoryEntry>;

// ═══════════════════════════════════════════
// Job Registry
// ═══════════════════════════════════════════

/// One registry entry per submitted shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRegistryEntry {
    pub batch_id: String,
    pub status: JobStatus,
    pub analysis_type: AnalysisType,
    pub shard_index: usize,
    pub shard_total: usize,
    pub shard_path: PathBuf,
    pub request_count: usize,
    pub input_file_id: String,
    pub output_file_id: Option<String>,
    pub error_file_id: Option<String>,
    pub request_counts: RequestCounts,
    pub created_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub run_id: String,
}

impl JobRegistryEntry {
    pub fn from_job(job: &Job, run_id: &str) -> Self {
        Self {
            batch_id: job.remote_job_id.clone(),
            status: job.status,
            analysis_type: job.shard.analysis_type,
            shard_index: job.shard.index,
            shard_total: job.shard.total,
            shard_path: job.shard.path.clone(),
            request_count: job.shard.request_count,
            input_file_id: job.input_file_id.clone(),
            output_file_id: job.output_file_id.clone(),
            error_file_id: job.error_file_id.clone(),
            request_counts: job.request_counts,
            created_at: job.created_at,
            completed_at: job.completed_at,
            run_id: run_id.to_string(),
        }
    }

    pub fn to_job(&self) -> Job {
        Job {
            shard: ShardRef {
                analysis_type: self.analysis_type,
                index: self.shard_index,
                total: self.shard_total,
                path: self.shard_path.clone(),
                request_count: self.request_count,
            },
            remote_job_id: self.batch_id.clone(),
            input_file_id: self.input_file_id.clone(),
            status: self.status,
            created_at: self.created_at,
            completed_at: self.completed_at,
            request_counts: self.request_counts,
            output_file_id: self.output_file_id.clone(),
            error_file_id: self.error_file_id.clone(),
        }
    }
}

/// Shard label (`sentiment_polarity`, `sentiment_polarity_part2`, ...) → entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobRegistry {
    entries: BTreeMap<String, JobRegistryEntry>,
}

impl JobRegistry {
    pub fn upsert(&mut self, job: &Job, run_id: &str) {
        self.entries
            .insert(job.shard.label(), JobRegistryEntry::from_job(job, run_id));
    }

    /// Drop every entry of one analysis type (before it is resubmitted).
    pub fn clear_type(&mut self, analysis_type: AnalysisType) {
        self.entries.retain(|_, e| e.analysis_type != analysis_type);
    }

    pub fn get(&self, label: &str) -> Option<&JobRegistryEntry> {
        self.entries.get(label)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Jobs in analysis-type then shard order.
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.entries.values().map(JobRegistryEntry::to_job).collect();
        jobs.sort_by_key(|j| (j.shard.analysis_type, j.shard.index));
        jobs
    }
}

// ═══════════════════════════════════════════
// Download Manifest
// ═══════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub analysis_type: AnalysisType,
    pub shard_index: usize,
    pub shard_total: usize,
    pub batch_id: String,
    pub output_path: Option<PathBuf>,
    pub error_path: Option<PathBuf>,
    pub downloaded_at: DateTime<Utc>,
}

/// Shard label → downloaded artifacts.
pub type DownloadManifest = BTreeMap<String, DownloadRecord>;

// ═══════════════════════════════════════════
// State Store
// ═══════════════════════════════════════════

/// Directory holding the state files of a run.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load_shard_inventory(&self) -> Result<ShardInventory, BatchError> {
        read_json_or_default(&self.dir.join(SHARD_INVENTORY_FILE))
    }

    pub fn save_shard_inventory(&self, inventory: &ShardInventory) -> Result<(), BatchError> {
        write_json_atomic(&self.dir.join(SHARD_INVENTORY_FILE), inventory)
    }

    pub fn load_job_registry(&self) -> Result<JobRegistry, BatchError> {
        read_json_or_default(&self.dir.join(JOB_REGISTRY_FILE))
    }

    pub fn save_job_registry(&self, registry: &JobRegistry) -> Result<(), BatchError> {
        write_json_atomic(&self.dir.join(JOB_REGISTRY_FILE), registry)
    }

    pub fn load_download_manifest(&self) -> Result<DownloadManifest, BatchError> {
        read_json_or_default(&self.dir.join(DOWNLOAD_MANIFEST_FILE))
    }

    pub fn save_download_manifest(&self, manifest: &DownloadManifest) -> Result<(), BatchError> {
        write_json_atomic(&self.dir.join(DOWNLOAD_MANIFEST_FILE), manifest)
    }
}

/// Write the enriched corpus as a JSON array.
pub fn save_enriched_records(path: &Path, records: &[EnrichedRecord]) -> Result<(), BatchError> {
    write_json_atomic(path, records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job(index: usize, total: usize) -> Job {
        Job::new(
            ShardRef {
                analysis_type: AnalysisType::TopicAnalysis,
                index,
                total,
                path: PathBuf::from(format!("topic_analysis_part{}.jsonl", index + 1)),
                request_count: 2,
            },
            format!("batch-{index}"),
            format!("file-{index}"),
        )
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");

        // No temp files left behind
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn missing_state_files_load_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.load_job_registry().unwrap().is_empty());
        assert!(store.load_shard_inventory().unwrap().is_empty());
        assert!(store.load_download_manifest().unwrap().is_empty());
    }

    #[test]
    fn registry_roundtrips_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let mut registry = JobRegistry::default();
        registry.upsert(&sample_job(1, 2), "run-1");
        registry.upsert(&sample_job(0, 2), "run-1");
        store.save_job_registry(&registry).unwrap();

        let loaded = store.load_job_registry().unwrap();
        assert_eq!(loaded, registry);
        let jobs = loaded.jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].shard.index, 0, "jobs come back in shard order");
        assert_eq!(jobs[1].remote_job_id, "batch-1");
    }

    #[test]
    fn registry_is_keyed_by_shard_label() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let mut registry = JobRegistry::default();
        registry.upsert(&sample_job(0, 1), "run-1");
        store.save_job_registry(&registry).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(JOB_REGISTRY_FILE)).unwrap())
                .unwrap();
        assert_eq!(raw["topic_analysis"]["batch_id"], "batch-0");
        assert_eq!(raw["topic_analysis"]["status"], "validating");
    }

    #[test]
    fn clear_type_only_drops_that_type() {
        let mut registry = JobRegistry::default();
        registry.upsert(&sample_job(0, 1), "run-1");
        let mut other = sample_job(0, 1);
        other.shard.analysis_type = AnalysisType::SentimentPolarity;
        registry.upsert(&other, "run-1");

        registry.clear_type(AnalysisType::TopicAnalysis);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("sentiment_polarity").is_some());
    }
}
