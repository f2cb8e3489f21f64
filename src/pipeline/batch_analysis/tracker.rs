//! JobTracker: poll submitted jobs until every one is terminal.
//!
//! Polling is the only place the pipeline waits. The wait is sliced into
//! short sleeps so a cancellation is noticed quickly, and a cancelled run
//! returns the jobs resolved so far instead of an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use super::error::BatchError;
use super::traits::BatchEndpoint;
use super::types::*;
use crate::config::BatchConfig;

/// Sleep slice while waiting between ticks.
const SLEEP_GRANULARITY: Duration = Duration::from_millis(500);

/// Consecutive unreadable status reports tolerated before a job is given up.
const MAX_STATUS_ERRORS: u32 = 3;

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Passed to the tick callback after every polling round.
#[derive(Debug)]
pub struct TickReport<'a> {
    /// Jobs whose status changed during this tick.
    pub changed: &'a [Job],
    pub resolved: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TrackingOutcome {
    pub completed: Vec<Job>,
    /// Jobs that ended `failed`, `cancelled` or `expired`, or whose status the endpoint could not report.
    pub failed: Vec<Job>,
    /// Jobs still running when tracking stopped early.
    pub outstanding: Vec<Job>,
    pub cancelled: bool,
    pub timed_out: bool,
    pub request_counts: RequestCounts,
}

impl TrackingOutcome {
    pub fn all_jobs(&self) -> impl Iterator<Item = &Job> {
        self.completed
            .iter()
            .chain(self.failed.iter())
            .chain(self.outstanding.iter())
    }
}

pub struct JobTracker<'a> {
    endpoint: &'a dyn BatchEndpoint,
    outstanding: Vec<Job>,
    completed: Vec<Job>,
    failed: Vec<Job>,
    poll_interval: Duration,
    max_wait: Option<Duration>,
    /// Consecutive non-transient status errors per remote job id.
    status_errors: HashMap<String, u32>,
}

impl<'a> JobTracker<'a> {
    /// Jobs that are already terminal (e.g. reloaded from the registry) are
    /// sorted into their final set without being polled.
    pub fn new(endpoint: &'a dyn BatchEndpoint, jobs: Vec<Job>) -> Self {
        let mut tracker = Self {
            endpoint,
            outstanding: Vec::new(),
            completed: Vec::new(),
            failed: Vec::new(),
            poll_interval: Duration::from_secs(60),
            max_wait: None,
            status_errors: HashMap::new(),
        };
        for job in jobs {
            tracker.place(job);
        }
        tracker
    }

    pub fn from_config(endpoint: &'a dyn BatchEndpoint, jobs: Vec<Job>, config: &BatchConfig) -> Self {
        Self::new(endpoint, jobs)
            .with_poll_interval(Duration::from_secs(config.poll_interval_secs))
            .with_max_wait(config.max_wait_secs.map(Duration::from_secs))
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn total(&self) -> usize {
        self.outstanding.len() + self.completed.len() + self.failed.len()
    }

    pub fn resolved(&self) -> usize {
        self.completed.len() + self.failed.len()
    }

    pub fn outstanding(&self) -> &[Job] {
        &self.outstanding
    }

    fn place(&mut self, job: Job) {
        match job.status {
            JobStatus::Completed => self.completed.push(job),
            s if s.is_terminal() => self.failed.push(job),
            _ => self.outstanding.push(job),
        }
    }

    /// Query every outstanding job once. Returns the jobs whose status changed.
    pub fn tick(&mut self) -> Vec<Job> {
        let mut changed = Vec::new();
        let mut still_outstanding = Vec::with_capacity(self.outstanding.len());

        for mut job in std::mem::take(&mut self.outstanding) {
            match self.endpoint.get_status(&job.remote_job_id) {
                Ok(snapshot) => {
                    self.status_errors.remove(&job.remote_job_id);
                    let previous = job.status;
                    if job.apply(snapshot) {
                        tracing::debug!(
                            job_id = %job.remote_job_id,
                            shard = job.shard.label(),
                            from = previous.as_str(),
                            to = job.status.as_str(),
                            "Job status changed"
                        );
                        changed.push(job.clone());
                    }
                    if job.status.is_terminal() {
                        tracing::info!(
                            job_id = %job.remote_job_id,
                            shard = job.shard.label(),
                            status = job.status.as_str(),
                            completed = job.request_counts.completed,
                            failed = job.request_counts.failed,
                            "Job reached terminal state"
                        );
                        self.place(job);
                    } else {
                        still_outstanding.push(job);
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        job_id = %job.remote_job_id,
                        error = %e,
                        "Status query failed, will retry next tick"
                    );
                    still_outstanding.push(job);
                }
                Err(e) => {
                    let strikes = {
                        let count = self.status_errors.entry(job.remote_job_id.clone()).or_insert(0);
                        *count += 1;
                        *count
                    };
                    if e.is_fatal() || strikes >= MAX_STATUS_ERRORS {
                        self.give_up(&mut job, &e, strikes);
                        changed.push(job.clone());
                        self.failed.push(job);
                    } else {
                        tracing::warn!(
                            job_id = %job.remote_job_id,
                            error = %e,
                            strikes,
                            "Unreadable job status, will retry next tick"
                        );
                        still_outstanding.push(job);
                    }
                }
            }
        }

        self.outstanding = still_outstanding;
        changed
    }

    /// Mark a job the endpoint cannot report on as failed locally, so it is
    /// persisted as terminal and never polled again.
    fn give_up(&mut self, job: &mut Job, error: &BatchError, strikes: u32) {
        self.status_errors.remove(&job.remote_job_id);
        tracing::error!(
            job_id = %job.remote_job_id,
            shard = job.shard.label(),
            error = %error,
            strikes,
            "Job status cannot be read, giving up on job"
        );
        job.status = JobStatus::Failed;
        job.completed_at = Some(Utc::now());
    }

    /// Poll until every job is terminal, the token is cancelled, or `max_wait`
    /// elapses. Never fails; the outcome says why tracking stopped.
    pub fn run(
        mut self,
        cancel: &CancellationToken,
        mut on_tick: Option<&mut dyn FnMut(&TickReport<'_>)>,
    ) -> TrackingOutcome {
        let started = Instant::now();
        let total = self.total();
        let mut cancelled = false;
        let mut timed_out = false;

        tracing::info!(total, outstanding = self.outstanding.len(), "Tracking batch jobs");

        while !self.outstanding.is_empty() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let changed = self.tick();
            if let Some(callback) = on_tick.as_mut() {
                callback(&TickReport {
                    changed: &changed,
                    resolved: self.resolved(),
                    total,
                });
            }

            if self.outstanding.is_empty() {
                break;
            }
            if self.max_wait.is_some_and(|limit| started.elapsed() >= limit) {
                tracing::warn!(
                    outstanding = self.outstanding.len(),
                    "Tracking time limit reached with jobs still running"
                );
                timed_out = true;
                break;
            }
            if !self.wait(cancel) {
                cancelled = true;
                break;
            }
        }

        if cancelled {
            tracing::info!(
                resolved = self.resolved(),
                outstanding = self.outstanding.len(),
                "Tracking cancelled"
            );
        }

        let mut request_counts = RequestCounts::default();
        for job in self
            .completed
            .iter()
            .chain(self.failed.iter())
            .chain(self.outstanding.iter())
        {
            request_counts.add(&job.request_counts);
        }

        TrackingOutcome {
            completed: self.completed,
            failed: self.failed,
            outstanding: self.outstanding,
            cancelled,
            timed_out,
            request_counts,
        }
    }

    /// Sleep one poll interval in slices. Returns false if cancelled meanwhile.
    fn wait(&self, cancel: &CancellationToken) -> bool {
        let deadline = Instant::now() + self.poll_interval;
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_GRANULARITY.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::batch_analysis::client::{JobScript, MockBatchEndpoint};
    use std::cell::Cell;
    use std::path::{Path, PathBuf};

    /// Endpoint whose status queries always fail with the given error.
    struct UnreadableStatus {
        error: fn() -> BatchError,
        calls: Cell<usize>,
    }

    impl UnreadableStatus {
        fn new(error: fn() -> BatchError) -> Self {
            Self { error, calls: Cell::new(0) }
        }
    }

    impl BatchEndpoint for UnreadableStatus {
        fn upload(&self, _: &Path) -> Result<String, BatchError> {
            unreachable!()
        }
        fn create_job(&self, _: &str) -> Result<String, BatchError> {
            unreachable!()
        }
        fn get_status(&self, _: &str) -> Result<JobSnapshot, BatchError> {
            self.calls.set(self.calls.get() + 1);
            Err((self.error)())
        }
        fn download_file(&self, _: &str, _: &Path) -> Result<(), BatchError> {
            unreachable!()
        }
        fn cancel_job(&self, _: &str) -> Result<(), BatchError> {
            unreachable!()
        }
    }

    fn pending_job(id: &str) -> Job {
        Job::new(
            ShardRef {
                analysis_type: AnalysisType::SentimentPolarity,
                index: 0,
                total: 1,
                path: PathBuf::from("sentiment_polarity.jsonl"),
                request_count: 1,
            },
            id.to_string(),
            "file-in-0".to_string(),
        )
    }

    fn submit(mock: &MockBatchEndpoint, dir: &std::path::Path, n: usize) -> Vec<Job> {
        (0..n)
            .map(|i| {
                let path = dir.join(format!("s{i}.jsonl"));
                std::fs::write(&path, "{\"custom_id\":\"sentiment_polarity_000000\"}\n").unwrap();
                let file_id = mock.upload(&path).unwrap();
                let job_id = mock.create_job(&file_id).unwrap();
                Job::new(
                    ShardRef {
                        analysis_type: AnalysisType::SentimentPolarity,
                        index: i,
                        total: n,
                        path: PathBuf::from(&path),
                        request_count: 1,
                    },
                    job_id,
                    file_id,
                )
            })
            .collect()
    }

    fn script(statuses: &[JobStatus]) -> JobScript {
        JobScript {
            statuses: statuses.to_vec(),
            produce_output: true,
        }
    }

    #[test]
    fn runs_until_all_jobs_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockBatchEndpoint::default()
            .with_script(1, script(&[JobStatus::InProgress, JobStatus::Failed]))
            .with_script(2, script(&[JobStatus::Validating, JobStatus::InProgress, JobStatus::Expired]));
        let jobs = submit(&mock, dir.path(), 3);

        let mut progress = Vec::new();
        let mut record = |r: &TickReport<'_>| progress.push((r.resolved, r.total));
        let outcome = JobTracker::new(&mock, jobs)
            .with_poll_interval(Duration::ZERO)
            .run(&CancellationToken::new(), Some(&mut record));

        assert!(!outcome.cancelled);
        assert_eq!(outcome.completed.len(), 1);
        assert_eq!(outcome.failed.len(), 2);
        assert!(outcome.outstanding.is_empty());
        assert_eq!(progress, vec![(0, 3), (2, 3), (3, 3)]);
        assert_eq!(outcome.request_counts.completed, 1);
    }

    #[test]
    fn cancelling_job_stays_outstanding_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockBatchEndpoint::default().with_script(
            0,
            script(&[
                JobStatus::InProgress,
                JobStatus::Cancelling,
                JobStatus::Cancelling,
                JobStatus::Cancelled,
            ]),
        );
        let jobs = submit(&mock, dir.path(), 1);
        let mut tracker = JobTracker::new(&mock, jobs).with_poll_interval(Duration::ZERO);

        tracker.tick();
        tracker.tick();
        assert_eq!(tracker.outstanding().len(), 1);
        assert_eq!(tracker.outstanding()[0].status, JobStatus::Cancelling);
        tracker.tick();
        assert_eq!(tracker.outstanding().len(), 1);

        tracker.tick();
        assert!(tracker.outstanding().is_empty());
        let outcome = tracker.run(&CancellationToken::new(), None);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].status, JobStatus::Cancelled);
    }

    #[test]
    fn cancellation_mid_loop_returns_partial_sets() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockBatchEndpoint::default()
            .with_script(0, script(&[JobStatus::Completed]))
            .with_script(1, script(&[JobStatus::InProgress]));
        let jobs = submit(&mock, dir.path(), 2);

        let token = CancellationToken::new();
        let handle = token.clone();
        let mut cancel_after_first = |_: &TickReport<'_>| handle.cancel();
        let outcome = JobTracker::new(&mock, jobs)
            .with_poll_interval(Duration::from_secs(3600))
            .run(&token, Some(&mut cancel_after_first));

        assert!(outcome.cancelled);
        assert_eq!(outcome.completed.len(), 1);
        assert_eq!(outcome.completed[0].remote_job_id, "batch-0");
        assert_eq!(outcome.outstanding.len(), 1);
        assert_eq!(outcome.outstanding[0].remote_job_id, "batch-1");
        assert_eq!(mock.status_calls(), 2);
    }

    #[test]
    fn cancelled_before_start_polls_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockBatchEndpoint::default();
        let jobs = submit(&mock, dir.path(), 2);
        let token = CancellationToken::new();
        token.cancel();

        let outcome = JobTracker::new(&mock, jobs).run(&token, None);
        assert!(outcome.cancelled);
        assert_eq!(outcome.outstanding.len(), 2);
        assert_eq!(mock.status_calls(), 0);
    }

    #[test]
    fn max_wait_stops_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockBatchEndpoint::default().with_script(0, script(&[JobStatus::InProgress]));
        let jobs = submit(&mock, dir.path(), 1);

        let outcome = JobTracker::new(&mock, jobs)
            .with_poll_interval(Duration::ZERO)
            .with_max_wait(Some(Duration::ZERO))
            .run(&CancellationToken::new(), None);
        assert!(outcome.timed_out);
        assert!(!outcome.cancelled);
        assert_eq!(outcome.outstanding.len(), 1);
    }

    #[test]
    fn terminal_jobs_are_not_polled() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockBatchEndpoint::default();
        let mut jobs = submit(&mock, dir.path(), 1);
        jobs[0].status = JobStatus::Completed;

        let outcome = JobTracker::new(&mock, jobs).run(&CancellationToken::new(), None);
        assert_eq!(outcome.completed.len(), 1);
        assert_eq!(mock.status_calls(), 0);
    }

    #[test]
    fn unreadable_status_gives_up_after_repeated_errors() {
        let endpoint = UnreadableStatus::new(|| BatchError::ResponseParsing("job has unknown status 'paused'".into()));
        let mut tracker = JobTracker::new(&endpoint, vec![pending_job("batch-0")]);

        assert!(tracker.tick().is_empty());
        assert!(tracker.tick().is_empty());
        assert_eq!(tracker.outstanding().len(), 1);

        let changed = tracker.tick();
        assert!(tracker.outstanding().is_empty());
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].status, JobStatus::Failed);
        assert!(changed[0].completed_at.is_some());
    }

    #[test]
    fn unreadable_status_does_not_keep_run_polling() {
        let endpoint = UnreadableStatus::new(|| BatchError::HttpClient("error decoding response body".into()));
        let outcome = JobTracker::new(&endpoint, vec![pending_job("batch-0")])
            .with_poll_interval(Duration::ZERO)
            .run(&CancellationToken::new(), None);

        assert!(!outcome.timed_out);
        assert!(outcome.outstanding.is_empty());
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(endpoint.calls.get(), MAX_STATUS_ERRORS as usize);
    }

    #[test]
    fn rejected_status_fails_job_on_first_tick_and_reports_it_changed() {
        let endpoint = UnreadableStatus::new(|| BatchError::Rejected { status: 404, body: "no such batch".into() });
        let mut tracker = JobTracker::new(&endpoint, vec![pending_job("batch-0")]);

        let changed = tracker.tick();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].remote_job_id, "batch-0");
        assert_eq!(changed[0].status, JobStatus::Failed);
        assert_eq!(tracker.resolved(), 1);
    }

    #[test]
    fn transient_status_errors_keep_job_outstanding() {
        let endpoint = UnreadableStatus::new(|| BatchError::transient("get_status", "status 503"));
        let mut tracker = JobTracker::new(&endpoint, vec![pending_job("batch-0")]);

        for _ in 0..MAX_STATUS_ERRORS + 2 {
            assert!(tracker.tick().is_empty());
        }
        assert_eq!(tracker.outstanding().len(), 1);
        assert_eq!(tracker.outstanding()[0].status, JobStatus::Validating);
    }

    #[test]
    fn token_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
