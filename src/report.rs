//! Result model and the reporter contract.
//!
//! Workers produce one [`TestResult`] per scheduled suite; the collector
//! hands each result to every configured [`Reporter`] via `add` and calls
//! `render` exactly once after the last result arrived. Reporters buffer
//! internally, so `add` must be cheap and safe to call from the collector
//! loop.

pub mod json;
pub mod junit;
pub mod table;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use json::JsonReporter;
pub use junit::JunitReporter;
pub use table::TableReporter;

/// Terminal (and one transient) statuses of a suite or attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TestStatus {
    Passed,
    Failed,
    /// The backend errored; the tests may never have run.
    Errored,
    /// The suite timeout elapsed before the job finished. Kept distinct
    /// from `Failed` so reports can tell "ran and failed" from "never
    /// finished".
    TimedOut,
    /// The suite was never dispatched (interrupt, fail-fast).
    Skipped,
    /// Async runs report this; the final outcome is unknown to us.
    InProgress,
}

impl TestStatus {
    /// Whether this status counts against the run verdict.
    ///
    /// In-progress jobs (async mode) have an unknown outcome and are not
    /// counted as failures.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            TestStatus::Failed | TestStatus::Errored | TestStatus::TimedOut
        )
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Errored => "errored",
            TestStatus::TimedOut => "timed out",
            TestStatus::Skipped => "skipped",
            TestStatus::InProgress => "in progress",
        };
        f.write_str(s)
    }
}

/// One execution of a suite. Immutable once terminal.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    /// 1-based attempt index.
    pub number: usize,

    /// Backend job ID. Empty when the start call failed.
    pub job_id: String,

    pub status: TestStatus,

    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration: Duration,

    /// Backend error description, when the attempt errored.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// The externally visible outcome of one scheduled suite.
///
/// Created when all attempts are exhausted (pass threshold met, or retries
/// used up); never mutated after it is handed to reporters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub name: String,

    /// Aggregated status: `Passed` iff the number of passed attempts
    /// reached the suite's pass threshold.
    pub status: TestStatus,

    /// Browser label including version, e.g. "chrome 121". Empty for
    /// mobile suites.
    pub browser: String,
    pub platform: String,
    pub device_name: String,

    /// Job detail URL of the last attempt, when the backend has one.
    pub url: String,

    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: Duration,

    /// All attempts in execution order.
    pub attempts: Vec<Attempt>,

    /// Retry budget the suite ran with.
    pub retries: usize,

    /// Artifacts downloaded for this suite, if any.
    pub artifacts: Vec<std::path::PathBuf>,
}

impl TestResult {
    pub fn passed(&self) -> bool {
        self.status == TestStatus::Passed
    }

    /// The last attempt, if any attempt was made at all.
    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }
}

/// A terminal collaborator that renders or ships finished results.
pub trait Reporter: Send + Sync {
    /// Buffers one finished result.
    fn add(&self, result: &TestResult);

    /// Renders everything buffered so far. Called once per run.
    fn render(&self);
}
