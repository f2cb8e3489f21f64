//! Merger: fold per-shard result maps of one analysis type into one map.
//!
//! Shards are applied in shard order and a later shard overwrites an earlier
//! value for the same index. Such collisions are a data-quality signal: they
//! are logged and reported, never raised.

use super::types::{AnalysisType, ResultMap};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    pub map: ResultMap,
    /// Indices defined by more than one shard, in the order they were seen.
    pub collisions: Vec<usize>,
}

pub struct Merger;

impl Merger {
    pub fn merge(analysis_type: AnalysisType, shards: Vec<ResultMap>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        for (shard_index, shard) in shards.into_iter().enumerate() {
            for (index, value) in shard {
                if outcome.map.insert(index, value).is_some() {
                    tracing::warn!(
                        analysis_type = analysis_type.as_str(),
                        index,
                        shard = shard_index + 1,
                        "Duplicate result across shards, keeping the later shard's value"
                    );
                    outcome.collisions.push(index);
                }
            }
        }

        outcome
    }
}
