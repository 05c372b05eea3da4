//! Suite execution orchestration.
//!
//! The orchestrator is the top-level component of a run. It takes the
//! already-sharded suite list, bounds in-flight attempts to the effective
//! concurrency, drives every suite through the job lifecycle and retry
//! policy, and streams finished results to the configured reporters.
//!
//! # Execution Flow
//!
//! ```text
//!  Vec<Suite> ──sort──► bounded queue (len = suite count)
//!                              │
//!              ┌───────────────┼───────────────┐
//!              ▼               ▼               ▼
//!          Worker 1        Worker 2  ...   Worker C        (C = effective ccy)
//!              │               │               │
//!       LifecycleDriver  LifecycleDriver  LifecycleDriver
//!         + Retrier        + Retrier        + Retrier
//!              │               │               │
//!              └───────────────┼───────────────┘
//!                              ▼
//!                       results channel ──► collector ──► Reporters
//!                                              │
//!                                      artifact policy
//! ```
//!
//! Results complete out of order relative to dispatch; the collector drains
//! exactly one result per scheduled suite and the run verdict is an
//! order-independent AND over terminal statuses. Cancellation (interrupt,
//! global timeout, fail-fast) stops dispatch of *new* suites; in-flight
//! attempts finish or are actively stopped, and un-started suites surface
//! as skipped results.

pub mod driver;
pub mod pool;

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::artifact::{ArtifactDownloader, should_download, suite_directory};
use crate::config::{LaunchOrder, Project, Region, Suite};
use crate::job::{CONSOLE_LOG_ASSET, JobService, StartOptions};
use crate::junit;
use crate::report::{Reporter, TestResult, TestStatus};
use crate::retry::Retrier;

pub use driver::{AttemptOutcome, DEFAULT_POLL_INTERVAL, LifecycleDriver};
pub use pool::{SuiteQueue, Worker};

/// Aggregated outcome of a run.
#[derive(Debug)]
pub struct RunResult {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Async-mode suites whose outcome is unknown to this process.
    pub in_progress: usize,
    pub duration: Duration,
    pub results: Vec<TestResult>,
}

impl RunResult {
    /// `true` when no suite reached a failure status. Skipped and
    /// in-progress suites have no known outcome and do not count against
    /// the verdict.
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    /// 0 when all suites passed, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.all_passed() { 0 } else { 1 }
    }
}

/// The concurrency-bounded scheduler.
///
/// Generic over the [`JobService`] so the same scheduling, retry, and
/// reporting logic drives cloud jobs and local containers alike.
pub struct Orchestrator<S> {
    project: Project,
    service: Arc<S>,
    retrier: Box<dyn Retrier>,
    reporters: Vec<Box<dyn Reporter>>,
    downloader: Option<Box<dyn ArtifactDownloader>>,
    cancel: CancellationToken,
    region: Option<Region>,
    app: String,
    other_apps: Vec<String>,
    cli_flags: Option<serde_json::Value>,
    async_mode: bool,
    show_console_log: bool,
    poll_interval: Duration,
}

impl<S: JobService> Orchestrator<S> {
    pub fn new(project: Project, service: Arc<S>, retrier: Box<dyn Retrier>) -> Self {
        Self {
            project,
            service,
            retrier,
            reporters: Vec::new(),
            downloader: None,
            cancel: CancellationToken::new(),
            region: None,
            app: String::new(),
            other_apps: Vec::new(),
            cli_flags: None,
            async_mode: false,
            show_console_log: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_reporter(mut self, reporter: impl Reporter + 'static) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }

    pub fn with_downloader(mut self, downloader: impl ArtifactDownloader + 'static) -> Self {
        self.downloader = Some(Box::new(downloader));
        self
    }

    /// Uses an external cancellation token, so interrupts and global
    /// timeouts can be wired in by the caller.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Enables job detail URLs for backends that have a web UI.
    pub fn with_region(mut self, region: Region) -> Self {
        self.region = Some(region);
        self
    }

    /// Sets the uploaded project bundle references jobs run against.
    pub fn with_app(mut self, app: String, other_apps: Vec<String>) -> Self {
        self.app = app;
        self.other_apps = other_apps;
        self
    }

    /// Attaches a CLI flag snapshot to every started job.
    pub fn with_cli_flags(mut self, flags: serde_json::Value) -> Self {
        self.cli_flags = Some(flags);
        self
    }

    /// Fire-and-forget mode: suites are started but not awaited.
    pub fn with_async(mut self, async_mode: bool) -> Self {
        self.async_mode = async_mode;
        self
    }

    /// Prints job console output even for passing suites.
    pub fn with_show_console_log(mut self, show: bool) -> Self {
        self.show_console_log = show;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Handle for external cancellation wiring.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs all suites to completion, never exceeding `ccy` simultaneous
    /// in-flight attempts, and returns the aggregated result.
    pub async fn run_suites(&self, suites: Vec<Suite>, ccy: usize) -> RunResult {
        let clock = Instant::now();
        let expected = suites.len();

        if expected == 0 {
            warn!("no suites to run");
            return summarize(Vec::new(), clock.elapsed());
        }

        let suites = sort_by_launch_order(suites, self.project.stratus.launch_order);
        let ccy = ccy.clamp(1, expected);

        // Every suite is enqueued up front; the channel doubles as the
        // bounded work queue workers pull from.
        let (suite_tx, suite_rx) = mpsc::channel::<StartOptions>(expected);
        for suite in &suites {
            suite_tx
                .try_send(self.start_opts(suite))
                .expect("queue is sized to the suite count");
        }
        drop(suite_tx);
        let queue: SuiteQueue = Arc::new(Mutex::new(suite_rx));

        let (result_tx, result_rx) = mpsc::channel::<TestResult>(ccy);
        let collected: StdMutex<Vec<TestResult>> = StdMutex::new(Vec::new());

        info!(concurrency = ccy, suites = expected, "launching workers");

        tokio_scoped::scope(|scope| {
            for _ in 0..ccy {
                let queue = Arc::clone(&queue);
                let result_tx = result_tx.clone();
                scope.spawn(async move {
                    let driver = LifecycleDriver::new(
                        self.service.as_ref(),
                        &self.cancel,
                        self.poll_interval,
                        self.region,
                        self.async_mode,
                        &self.project.config_path,
                        self.cli_flags.as_ref(),
                    );
                    let worker = Worker::new(
                        driver,
                        self.retrier.as_ref(),
                        &self.cancel,
                        self.region,
                        self.async_mode,
                        self.project.stratus.fail_fast,
                    );
                    worker.run(queue, result_tx).await;
                });
            }
            drop(result_tx);

            scope.spawn(async {
                let results = self.collect_results(result_rx, expected).await;
                *collected.lock().expect("collector lock poisoned") = results;
            });
        });

        for reporter in &self.reporters {
            reporter.render();
        }

        let results = collected.into_inner().expect("collector lock poisoned");
        summarize(results, clock.elapsed())
    }

    /// Drains the results channel until one result per scheduled suite has
    /// arrived, applying the artifact policy and feeding reporters as
    /// results come in.
    async fn collect_results(
        &self,
        mut rx: mpsc::Receiver<TestResult>,
        expected: usize,
    ) -> Vec<TestResult> {
        let mut results: Vec<TestResult> = Vec::with_capacity(expected);
        let mut in_progress = expected;

        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick fires immediately

        while results.len() < expected {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(mut result) = maybe else { break };
                    in_progress -= 1;
                    self.finish_result(&mut result).await;
                    results.push(result);
                }
                _ = ticker.tick() => {
                    if !self.cancel.is_cancelled() {
                        info!(in_progress, "suites in progress");
                    }
                }
            }
        }

        results
    }

    async fn finish_result(&self, result: &mut TestResult) {
        let job_id = result
            .last_attempt()
            .map(|a| a.job_id.clone())
            .unwrap_or_default();
        let timed_out = result.status == TestStatus::TimedOut;

        if let Some(downloader) = &self.downloader
            && should_download(
                &job_id,
                result.passed(),
                timed_out,
                self.async_mode,
                &self.project.artifacts,
            )
        {
            let dest = suite_directory(&self.project.artifacts, &result.name);
            match downloader
                .download(&job_id, &dest, &self.project.artifacts.match_patterns)
                .await
            {
                Ok(files) => result.artifacts = files,
                Err(err) => {
                    warn!(suite = %result.name, error = %err, "failed to download artifacts");
                }
            }
        }

        self.log_suite(result).await;

        for reporter in &self.reporters {
            reporter.add(result);
        }
    }

    async fn log_suite(&self, result: &TestResult) {
        if result.status == TestStatus::Skipped {
            error!(suite = %result.name, "suite skipped");
            return;
        }

        let Some(last) = result.last_attempt() else {
            return;
        };

        if last.job_id.is_empty() {
            error!(suite = %result.name, error = %last.error, "failed to start suite");
            return;
        }

        if result.status == TestStatus::InProgress {
            info!(suite = %result.name, url = %result.url, "suite started (async)");
            return;
        }

        if result.passed() {
            info!(suite = %result.name, passed = true, url = %result.url, "suite finished");
        } else if last.error.is_empty() {
            error!(suite = %result.name, passed = false, url = %result.url, "suite finished");
        } else {
            error!(
                suite = %result.name,
                passed = false,
                url = %result.url,
                error = %last.error,
                "suite finished with error"
            );
        }

        self.log_suite_console(result).await;
    }

    /// Prints the console output of a finished suite. Passing suites stay
    /// quiet unless console logging was requested; jobs that errored have
    /// no assets worth fetching.
    async fn log_suite_console(&self, result: &TestResult) {
        if result.passed() && !self.show_console_log {
            return;
        }
        let Some(last) = result.last_attempt() else {
            return;
        };
        if !last.error.is_empty() {
            return;
        }

        if let Ok(content) = self
            .service
            .job_asset(&last.job_id, CONSOLE_LOG_ASSET)
            .await
        {
            info!(
                suite = %result.name,
                "console output:\n{}",
                String::from_utf8_lossy(&content)
            );
            return;
        }

        // Some frameworks only produce a junit.xml; summarize that instead.
        let Ok(content) = self
            .service
            .job_asset(&last.job_id, junit::JUNIT_FILE_NAME)
            .await
        else {
            warn!(suite = %result.name, "failed to retrieve the console output");
            return;
        };

        let Ok(report) = junit::parse(&content) else {
            warn!(suite = %result.name, "failed to parse junit report");
            return;
        };

        for suite in &report.suites {
            for case in suite.test_cases.iter().filter(|c| c.is_failing()) {
                let entry = case.failure.as_ref().or(case.error.as_ref());
                error!(
                    suite = %result.name,
                    test = %case.qualified_name(),
                    message = %entry.map(|e| e.message.as_str()).unwrap_or(""),
                    "test failed"
                );
            }
        }
    }

    /// Maps one sharded suite onto the options its attempts start with.
    fn start_opts(&self, suite: &Suite) -> StartOptions {
        StartOptions {
            display_name: suite.name.clone(),
            name: suite.name.clone(),
            app: self.app.clone(),
            other_apps: self.other_apps.clone(),
            suite: suite.name.clone(),
            framework: self.project.framework.clone(),
            browser_name: suite.browser.clone(),
            browser_version: suite.browser_version.clone(),
            platform_name: suite.platform.clone(),
            device_name: suite.device_name.clone(),
            build: self.project.stratus.metadata.build.clone(),
            tags: self.project.stratus.metadata.tags.clone(),
            tunnel: self.project.stratus.tunnel.clone(),
            env: suite.env.clone(),
            specs: suite.spec_pattern.clone(),
            tests_to_run: Vec::new(),
            timeout: suite.timeout(),
            attempt: 0,
            retries: suite.effective_retries(self.project.stratus.retries),
            pass_threshold: suite.pass_threshold,
        }
    }
}

/// Applies the configured launch order. A pure sort; dispatch and
/// concurrency are unaffected.
fn sort_by_launch_order(mut suites: Vec<Suite>, order: Option<LaunchOrder>) -> Vec<Suite> {
    match order {
        Some(LaunchOrder::FailRate) => {
            suites.sort_by(|a, b| {
                b.fail_rate
                    .partial_cmp(&a.fail_rate)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        None => {}
    }
    suites
}

fn summarize(results: Vec<TestResult>, duration: Duration) -> RunResult {
    let passed = results
        .iter()
        .filter(|r| r.status == TestStatus::Passed)
        .count();
    let failed = results.iter().filter(|r| r.status.is_failure()).count();
    let skipped = results
        .iter()
        .filter(|r| r.status == TestStatus::Skipped)
        .count();
    let in_progress = results
        .iter()
        .filter(|r| r.status == TestStatus::InProgress)
        .count();

    RunResult {
        total: results.len(),
        passed,
        failed,
        skipped,
        in_progress,
        duration,
        results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suite(name: &str, fail_rate: f64) -> Suite {
        let mut s: Suite = toml::from_str(&format!("name = \"{name}\"")).unwrap();
        s.fail_rate = fail_rate;
        s
    }

    #[test]
    fn launch_order_none_preserves_input() {
        let suites = vec![suite("a", 0.1), suite("b", 0.9)];
        let sorted = sort_by_launch_order(suites, None);
        assert_eq!(sorted[0].name, "a");
        assert_eq!(sorted[1].name, "b");
    }

    #[test]
    fn launch_order_fail_rate_puts_flaky_first() {
        let suites = vec![suite("stable", 0.0), suite("flaky", 0.7), suite("meh", 0.2)];
        let sorted = sort_by_launch_order(suites, Some(LaunchOrder::FailRate));
        assert_eq!(sorted[0].name, "flaky");
        assert_eq!(sorted[1].name, "meh");
        assert_eq!(sorted[2].name, "stable");
    }

    #[test]
    fn run_result_verdict() {
        let passed = summarize(
            vec![crate::report::testutil::result("a", TestStatus::Passed)],
            Duration::ZERO,
        );
        assert!(passed.all_passed());
        assert_eq!(passed.exit_code(), 0);

        let failed = summarize(
            vec![
                crate::report::testutil::result("a", TestStatus::Passed),
                crate::report::testutil::result("b", TestStatus::TimedOut),
            ],
            Duration::ZERO,
        );
        assert!(!failed.all_passed());
        assert_eq!(failed.exit_code(), 1);
        assert_eq!(failed.failed, 1);

        let skipped_only = summarize(
            vec![crate::report::testutil::result("a", TestStatus::Skipped)],
            Duration::ZERO,
        );
        assert!(skipped_only.all_passed());
        assert_eq!(skipped_only.skipped, 1);
    }
}
