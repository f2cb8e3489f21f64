//! Sharder: greedy left-to-right packing of a request stream into JSONL files.
//!
//! A shard is flushed when the next request would exceed the item count or
//! the byte budget. The byte budget is soft: a single request larger than the
//! budget still gets a shard of its own.

use std::ops::Range;
use std::path::{Path, PathBuf};

use base64::Engine;
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::error::BatchError;
use super::state::{write_atomic, ShardFileRecord, ShardInventoryEntry};
use super::types::*;
use crate::config::BatchConfig;

/// One line of a shard file.
#[derive(Serialize)]
struct ShardLine<'a> {
    custom_id: &'a str,
    method: &'static str,
    url: &'a str,
    body: &'a RequestBody,
}

pub struct Sharder {
    max_count: usize,
    max_bytes: u64,
    url: String,
}

impl Sharder {
    pub fn new(max_count: usize, max_bytes: u64, url: impl Into<String>) -> Self {
        Self {
            max_count: max_count.max(1),
            max_bytes,
            url: url.into(),
        }
    }

    pub fn from_config(config: &BatchConfig) -> Self {
        Self::new(
            config.max_requests_per_shard,
            config.max_shard_bytes,
            config.endpoint_path.clone(),
        )
    }

    /// Serialize one request as a JSONL line (newline included).
    pub fn render_line(&self, request: &AnalysisRequest) -> Result<String, BatchError> {
        let line = ShardLine {
            custom_id: &request.correlation_id,
            method: "POST",
            url: &self.url,
            body: &request.payload,
        };
        let mut rendered = serde_json::to_string(&line)?;
        rendered.push('\n');
        Ok(rendered)
    }

    /// Split `requests` into shard files next to `base_path`.
    ///
    /// `base_path` names the single-shard file (e.g. `shards/topic_analysis.jsonl`);
    /// split streams get `topic_analysis_part1.jsonl`, `_part2`, ...
    pub fn shard(
        &self,
        requests: Vec<AnalysisRequest>,
        base_path: &Path,
    ) -> Result<Vec<Shard>, BatchError> {
        let lines = requests
            .iter()
            .map(|r| self.render_line(r))
            .collect::<Result<Vec<_>, _>>()?;
        let ranges = self.plan(&lines);
        let total = ranges.len();

        let mut shards = Vec::with_capacity(total);
        let mut remaining = requests.into_iter();
        for (index, range) in ranges.into_iter().enumerate() {
            let path = shard_path(base_path, index, total);
            let body: String = lines[range.clone()].concat();
            write_atomic(&path, body.as_bytes())?;

            let shard_requests: Vec<AnalysisRequest> = remaining.by_ref().take(range.len()).collect();
            let analysis_type = shard_requests
                .first()
                .map(|r| r.analysis_type)
                .unwrap_or(AnalysisType::SentimentPolarity);

            tracing::debug!(
                analysis_type = analysis_type.as_str(),
                shard = index + 1,
                total,
                requests = shard_requests.len(),
                bytes = body.len(),
                path = %path.display(),
                "Shard written"
            );

            shards.push(Shard {
                analysis_type,
                index,
                path,
                requests: shard_requests,
                byte_size: body.len() as u64,
            });
        }

        Ok(shards)
    }

    /// Greedy partition of rendered lines into index ranges.
    fn plan(&self, lines: &[String]) -> Vec<Range<usize>> {
        let mut ranges = Vec::new();
        let mut start = 0;
        let mut pending_bytes: u64 = 0;

        for (i, line) in lines.iter().enumerate() {
            let len = line.len() as u64;
            let pending = i - start;
            if pending > 0
                && (pending + 1 > self.max_count || pending_bytes + len > self.max_bytes)
            {
                ranges.push(start..i);
                start = i;
                pending_bytes = 0;
            }
            pending_bytes += len;
        }
        if start < lines.len() {
            ranges.push(start..lines.len());
        }
        ranges
    }
}

fn shard_path(base_path: &Path, index: usize, total: usize) -> PathBuf {
    if total <= 1 {
        return base_path.to_path_buf();
    }
    let stem = base_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "shard".to_string());
    let name = match base_path.extension() {
        Some(ext) => format!("{stem}_part{}.{}", index + 1, ext.to_string_lossy()),
        None => format!("{stem}_part{}", index + 1),
    };
    base_path.with_file_name(name)
}

/// SHA-256 of a file's contents, base64.
pub fn compute_content_hash(path: &Path) -> Result<String, BatchError> {
    let content = std::fs::read(path)?;
    let hash = Sha256::digest(&content);
    Ok(base64::engine::general_purpose::STANDARD.encode(hash))
}

/// Inventory entry describing the shard files of one analysis type.
pub fn inventory_entry(shards: &[Shard]) -> Result<ShardInventoryEntry, BatchError> {
    let files = shards
        .iter()
        .map(|s| {
            Ok(ShardFileRecord {
                path: s.path.clone(),
                requests: s.requests.len(),
                bytes: s.byte_size,
                sha256: compute_content_hash(&s.path)?,
            })
        })
        .collect::<Result<Vec<_>, BatchError>>()?;

    Ok(ShardInventoryEntry {
        file_count: files.len(),
        total_requests: files.iter().map(|f| f.requests).sum(),
        total_bytes: files.iter().map(|f| f.bytes).sum(),
        files,
        created_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::batch_analysis::request::RequestBuilder;
    use crate::pipeline::batch_analysis::vocabulary::Vocabulary;

    fn requests(n: usize) -> Vec<AnalysisRequest> {
        let vocab = Vocabulary::default();
        let records: Vec<SourceRecord> = (0..n)
            .map(|i| SourceRecord::from_value(serde_json::json!({"text": format!("post number {i}")})).unwrap())
            .collect();
        RequestBuilder::new(&BatchConfig::default(), &vocab).build(&records, AnalysisType::SentimentPolarity)
    }

    fn read_ids(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| {
                let v: serde_json::Value = serde_json::from_str(l).unwrap();
                v["custom_id"].as_str().unwrap().to_string()
            })
            .collect()
    }

    #[test]
    fn five_requests_max_two_gives_2_2_1() {
        let dir = tempfile::tempdir().unwrap();
        let sharder = Sharder::new(2, u64::MAX, "/v1/chat/completions");
        let shards = sharder
            .shard(requests(5), &dir.path().join("sentiment_polarity.jsonl"))
            .unwrap();

        let sizes: Vec<usize> = shards.iter().map(|s| s.requests.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(shards[0].path.ends_with("sentiment_polarity_part1.jsonl"));
        assert!(shards[2].path.ends_with("sentiment_polarity_part3.jsonl"));
    }

    #[test]
    fn concatenated_shards_preserve_order() {
        let dir = tempfile::tempdir().unwrap();
        let original = requests(11);
        let expected: Vec<String> = original.iter().map(|r| r.correlation_id.clone()).collect();
        let sharder = Sharder::new(3, u64::MAX, "/v1/chat/completions");
        let shards = sharder.shard(original, &dir.path().join("p.jsonl")).unwrap();

        let on_disk: Vec<String> = shards.iter().flat_map(|s| read_ids(&s.path)).collect();
        assert_eq!(on_disk, expected);
        assert!(shards.iter().all(|s| s.requests.len() <= 3));
    }

    #[test]
    fn single_shard_has_no_part_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("topic_analysis.jsonl");
        let shards = Sharder::new(100, u64::MAX, "/v1/chat/completions")
            .shard(requests(4), &base)
            .unwrap();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].path, base);
    }

    #[test]
    fn byte_budget_splits_and_tolerates_oversized_item() {
        let dir = tempfile::tempdir().unwrap();
        let reqs = requests(4);
        let sharder = Sharder::new(100, 1, "/v1/chat/completions");
        let line_len = sharder.render_line(&reqs[0]).unwrap().len() as u64;
        assert!(line_len > 1);

        let shards = sharder.shard(reqs, &dir.path().join("p.jsonl")).unwrap();
        assert_eq!(shards.len(), 4, "every oversized request gets its own shard");
        assert!(shards.iter().all(|s| s.requests.len() == 1));
    }

    #[test]
    fn byte_budget_packs_greedily() {
        let dir = tempfile::tempdir().unwrap();
        let reqs = requests(6);
        let sharder = Sharder::new(100, 0, "/v1/chat/completions");
        let line_len = sharder.render_line(&reqs[0]).unwrap().len() as u64;

        let sharder = Sharder::new(100, line_len * 2 + line_len / 2, "/v1/chat/completions");
        let shards = sharder.shard(reqs, &dir.path().join("p.jsonl")).unwrap();
        let sizes: Vec<usize> = shards.iter().map(|s| s.requests.len()).collect();
        assert_eq!(sizes, vec![2, 2, 2]);
        assert!(shards.iter().all(|s| s.byte_size <= line_len * 2 + line_len / 2));
    }

    #[test]
    fn empty_stream_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let shards = Sharder::new(2, u64::MAX, "/v1/chat/completions")
            .shard(Vec::new(), &dir.path().join("p.jsonl"))
            .unwrap();
        assert!(shards.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn shard_lines_match_batch_format() {
        let dir = tempfile::tempdir().unwrap();
        let shards = Sharder::new(10, u64::MAX, "/v1/chat/completions")
            .shard(requests(1), &dir.path().join("p.jsonl"))
            .unwrap();
        let raw = std::fs::read_to_string(&shards[0].path).unwrap();
        let line: serde_json::Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(line["custom_id"], "sentiment_polarity_000000");
        assert_eq!(line["method"], "POST");
        assert_eq!(line["url"], "/v1/chat/completions");
        assert_eq!(line["body"]["messages"][1]["content"], "post number 0");
    }

    #[test]
    fn inventory_counts_files_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let shards = Sharder::new(2, u64::MAX, "/v1/chat/completions")
            .shard(requests(3), &dir.path().join("p.jsonl"))
            .unwrap();
        let entry = inventory_entry(&shards).unwrap();
        assert_eq!(entry.file_count, 2);
        assert_eq!(entry.total_requests, 3);
        assert_eq!(
            entry.total_bytes,
            shards.iter().map(|s| std::fs::metadata(&s.path).unwrap().len()).sum::<u64>()
        );
        assert_ne!(entry.files[0].sha256, entry.files[1].sha256);
    }
}
