//! Batch Analysis Pipeline
//!
//! Classifies an ordered corpus of social-media records through the remote
//! batch endpoint and joins the results back onto the records by position.
//!
//! ## Architecture
//!
//! ```text
//! RequestBuilder → Sharder → BatchSubmitter → JobTracker → ResultFetcher
//!     → ResultParser → Merger → Integrator → CompletenessValidator
//! ```
//!
//! `BatchPipeline` (runner) wires the stages and persists shard inventory,
//! job registry and download manifest so an interrupted run can be resumed.
//!
//! ## Guarantees
//! - Correlation ids encode the record index; results are never matched by order.
//! - Shard files concatenate back to the original request order.
//! - One shard or analysis type failing never blocks its siblings.
//! - Invalid model answers become `null`, never errors.

pub mod error;
pub mod types;
pub mod traits;
pub mod vocabulary;
pub mod retry;
pub mod state;
pub mod request;
pub mod sharder;
pub mod client;
pub mod submitter;
pub mod tracker;
pub mod fetcher;
pub mod schema;
pub mod parser;
pub mod merger;
pub mod integrator;
pub mod validator;
pub mod report;
pub mod corpus;
pub mod runner;

pub use error::BatchError;
pub use types::*;
pub use traits::BatchEndpoint;
pub use vocabulary::Vocabulary;
pub use retry::RetryPolicy;
pub use state::StateStore;
pub use request::{correlation_id, parse_correlation_id, RequestBuilder};
pub use sharder::Sharder;
pub use client::{MockBatchEndpoint, OpenAiBatchClient};
pub use submitter::BatchSubmitter;
pub use tracker::{CancellationToken, JobTracker, TrackingOutcome};
pub use fetcher::ResultFetcher;
pub use parser::ResultParser;
pub use merger::{MergeOutcome, Merger};
pub use integrator::Integrator;
pub use validator::{CompletenessReport, CompletenessValidator};
pub use corpus::load_records;
pub use runner::{BatchPipeline, PipelineSummary};
