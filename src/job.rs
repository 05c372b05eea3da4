//! Job model and the narrow interfaces backends implement.
//!
//! The orchestration core never talks to a concrete cloud API or container
//! runtime directly. Everything it needs from an execution backend is
//! expressed as four small traits ([`JobStarter`], [`JobReader`],
//! [`JobStopper`], [`JobWriter`]) plus the [`JobService`] umbrella that the
//! worker pool is generic over. The container adapter in
//! [`crate::container`] implements the same traits, so the lifecycle state
//! machine is identical for cloud and local runs; only the transport
//! differs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Tunnel;
use crate::report::TestStatus;

/// Asset name of a job's console output.
pub const CONSOLE_LOG_ASSET: &str = "console.log";

/// Errors surfaced by job backends.
///
/// A job that ran and failed is NOT an error; these describe transport and
/// lifecycle problems (couldn't start, couldn't poll, asset missing).
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to start job: {0}")]
    StartFailed(String),

    #[error("failed to read job {0}: {1}")]
    ReadFailed(String, String),

    #[error("failed to stop job {0}: {1}")]
    StopFailed(String, String),

    #[error("job {0} has no asset named '{1}'")]
    AssetMissing(String, String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Wire states a backend reports for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobState {
    #[default]
    New,
    Queued,
    InProgress,
    Complete,
    Error,
}

impl JobState {
    /// Whether the state is terminal from the backend's point of view.
    pub fn is_done(self) -> bool {
        matches!(self, JobState::Complete | JobState::Error)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::New => "new",
            JobState::Queued => "queued",
            JobState::InProgress => "in progress",
            JobState::Complete => "complete",
            JobState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Snapshot of a backend job as last observed by polling.
#[derive(Debug, Clone, Default)]
pub struct Job {
    /// Backend-assigned ID. Empty until the start call succeeds.
    pub id: String,

    pub status: JobState,

    /// Whether the backend judged the test run inside the job as passed.
    pub passed: bool,

    /// Set when the suite timeout elapsed before the job finished.
    pub timed_out: bool,

    /// Backend error description, when the job errored (as opposed to
    /// merely containing failing tests).
    pub error: String,

    /// Labels enriched by the backend, used on reports only.
    pub browser_short_version: String,
    pub platform_name: String,
    pub platform_version: String,
    pub device_name: String,
}

impl Job {
    /// Collapses the wire state plus pass/timeout flags into the status a
    /// report consumer cares about.
    pub fn total_status(&self) -> TestStatus {
        if self.timed_out {
            return TestStatus::TimedOut;
        }
        if !self.status.is_done() {
            return TestStatus::InProgress;
        }
        match self.status {
            JobState::Error => TestStatus::Errored,
            _ if self.passed => TestStatus::Passed,
            _ => TestStatus::Failed,
        }
    }
}

/// Everything a backend needs to start one suite attempt.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Suite name used for logging and reporting.
    pub display_name: String,

    /// Job name reported to the backend.
    pub name: String,

    /// Storage reference of the uploaded project bundle.
    pub app: String,
    pub other_apps: Vec<String>,

    pub suite: String,
    pub framework: String,

    pub browser_name: String,
    pub browser_version: String,
    pub platform_name: String,
    pub device_name: String,

    pub build: String,
    pub tags: Vec<String>,
    pub tunnel: Tunnel,

    /// Environment injected into the job.
    pub env: HashMap<String, String>,

    /// Spec files this attempt runs. Narrowed by the sharder.
    pub specs: Vec<String>,

    /// Individual test cases to run, set by the selective retrier. Empty
    /// means the whole suite.
    pub tests_to_run: Vec<String>,

    /// Per-suite timeout enforced by the lifecycle driver.
    pub timeout: Duration,

    /// Zero-based attempt counter.
    pub attempt: usize,
    pub retries: usize,
    pub pass_threshold: usize,
}

impl StartOptions {
    /// Human-readable `attempt of allowed` string for log lines.
    pub fn attempt_label(&self) -> String {
        format!("{} of {}", self.attempt + 1, self.retries + 1)
    }
}

/// Starts jobs on a backend.
#[async_trait]
pub trait JobStarter: Send + Sync {
    async fn start_job(&self, opts: &StartOptions) -> Result<String, BackendError>;
}

/// Reads job state and assets from a backend.
#[async_trait]
pub trait JobReader: Send + Sync {
    /// Polls the job at `interval` until it reaches a done state or
    /// `timeout` elapses. On timeout the returned job has `timed_out` set;
    /// the caller decides whether to stop the job.
    async fn poll_job(
        &self,
        id: &str,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Job, BackendError>;

    /// Fetches the content of a named job asset (console log, junit.xml).
    async fn job_asset(&self, id: &str, name: &str) -> Result<Vec<u8>, BackendError>;
}

/// Stops a running job.
#[async_trait]
pub trait JobStopper: Send + Sync {
    async fn stop_job(&self, id: &str) -> Result<Job, BackendError>;
}

/// Attaches assets to an existing job.
#[async_trait]
pub trait JobWriter: Send + Sync {
    async fn upload_asset(
        &self,
        id: &str,
        name: &str,
        content_type: &str,
        body: &[u8],
    ) -> Result<(), BackendError>;
}

/// The full set of job capabilities the worker pool drives.
pub trait JobService: JobStarter + JobReader + JobStopper + JobWriter {}

impl<T: JobStarter + JobReader + JobStopper + JobWriter> JobService for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_status_mapping() {
        let cases = [
            (JobState::Complete, true, false, TestStatus::Passed),
            (JobState::Complete, false, false, TestStatus::Failed),
            (JobState::Error, false, false, TestStatus::Errored),
            (JobState::Complete, false, true, TestStatus::TimedOut),
            // Timeout wins even if the backend claims a pass.
            (JobState::Complete, true, true, TestStatus::TimedOut),
            (JobState::InProgress, false, false, TestStatus::InProgress),
            (JobState::Queued, false, false, TestStatus::InProgress),
        ];

        for (status, passed, timed_out, want) in cases {
            let job = Job {
                id: "j1".into(),
                status,
                passed,
                timed_out,
                ..Job::default()
            };
            assert_eq!(job.total_status(), want, "{status:?}/{passed}/{timed_out}");
        }
    }

    #[test]
    fn done_states() {
        assert!(JobState::Complete.is_done());
        assert!(JobState::Error.is_done());
        assert!(!JobState::InProgress.is_done());
        assert!(!JobState::Queued.is_done());
        assert!(!JobState::New.is_done());
    }

    #[test]
    fn attempt_label_is_one_based() {
        let opts = StartOptions {
            attempt: 1,
            retries: 2,
            ..StartOptions::default()
        };
        assert_eq!(opts.attempt_label(), "2 of 3");
    }
}
