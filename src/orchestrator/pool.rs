//! Worker pool internals.
//!
//! The scheduler runs `C` identical workers against one bounded suite
//! queue. Each worker pulls the next suite, drives its attempt/retry loop,
//! and emits exactly one terminal [`TestResult`]. Suites are never shared
//! between workers, so retries consume only the owning worker's slot and
//! the in-flight attempt count can never exceed `C`.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::driver::LifecycleDriver;
use crate::config::Region;
use crate::job::{Job, JobService, StartOptions};
use crate::report::{Attempt, TestResult, TestStatus};
use crate::retry::Retrier;

/// Shared handle to the bounded suite queue workers pull from.
pub type SuiteQueue = Arc<Mutex<mpsc::Receiver<StartOptions>>>;

/// One concurrency slot's worth of execution.
pub struct Worker<'a, S> {
    driver: LifecycleDriver<'a, S>,
    retrier: &'a dyn Retrier,
    cancel: &'a CancellationToken,
    region: Option<Region>,
    async_mode: bool,
    fail_fast: bool,
}

impl<'a, S: JobService> Worker<'a, S> {
    pub fn new(
        driver: LifecycleDriver<'a, S>,
        retrier: &'a dyn Retrier,
        cancel: &'a CancellationToken,
        region: Option<Region>,
        async_mode: bool,
        fail_fast: bool,
    ) -> Self {
        Self {
            driver,
            retrier,
            cancel,
            region,
            async_mode,
            fail_fast,
        }
    }

    /// Pulls suites until the queue is drained. Cancellation is observed at
    /// the top of each iteration: remaining suites still produce a result,
    /// marked skipped, so none disappears from the report.
    pub async fn run(&self, queue: SuiteQueue, results: mpsc::Sender<TestResult>) {
        loop {
            let next = { queue.lock().await.recv().await };
            let Some(opts) = next else { break };

            if self.cancel.is_cancelled() {
                let _ = results.send(skipped_result(&opts)).await;
                continue;
            }

            let result = self.run_suite(opts).await;

            if self.fail_fast && result.status.is_failure() {
                warn!("fail fast is enabled, skipping upcoming suites");
                self.cancel.cancel();
            }

            let _ = results.send(result).await;
        }
    }

    /// The per-suite loop: attempt, consult the retrier, repeat; then
    /// finalize one result from the accumulated attempts.
    async fn run_suite(&self, mut opts: StartOptions) -> TestResult {
        let start_time = Utc::now();
        let clock = Instant::now();

        let mut attempts: Vec<Attempt> = Vec::new();
        let mut job = Job::default();

        loop {
            let outcome = self.driver.run_attempt(&opts).await;
            attempts.push(outcome.attempt);
            job = outcome.job;

            // Async runs are one-shot, and an interrupt ends the loop with
            // whatever the in-flight attempt produced.
            if self.async_mode || self.cancel.is_cancelled() {
                break;
            }

            if self.retrier.should_retry(&mut opts, &attempts).await {
                opts.attempt += 1;
                continue;
            }
            break;
        }

        finalize(&opts, attempts, &job, self.region, start_time, clock)
    }
}

/// Collapses a suite's attempts into its terminal result. The aggregated
/// status is `Passed` iff the number of passed attempts reached the pass
/// threshold; otherwise the last attempt's status stands.
fn finalize(
    opts: &StartOptions,
    attempts: Vec<Attempt>,
    job: &Job,
    region: Option<Region>,
    start_time: chrono::DateTime<Utc>,
    clock: Instant,
) -> TestResult {
    let successes = attempts
        .iter()
        .filter(|a| a.status == TestStatus::Passed)
        .count();

    let last_status = attempts
        .last()
        .map(|a| a.status)
        .unwrap_or(TestStatus::Errored);

    let status = if last_status == TestStatus::InProgress {
        TestStatus::InProgress
    } else if successes >= opts.pass_threshold {
        TestStatus::Passed
    } else {
        last_status
    };

    let browser = if opts.browser_name.is_empty() {
        String::new()
    } else {
        format!("{} {}", opts.browser_name, job.browser_short_version)
            .trim()
            .to_string()
    };

    let platform = if job.platform_name.is_empty() {
        opts.platform_name.clone()
    } else if job.platform_version.is_empty() {
        job.platform_name.clone()
    } else {
        format!("{} {}", job.platform_name, job.platform_version)
    };

    let device_name = if job.device_name.is_empty() {
        opts.device_name.clone()
    } else {
        job.device_name.clone()
    };

    let url = match (region, attempts.iter().rev().find(|a| !a.job_id.is_empty())) {
        (Some(region), Some(attempt)) => region.job_url(&attempt.job_id),
        _ => String::new(),
    };

    TestResult {
        name: opts.display_name.clone(),
        status,
        browser,
        platform,
        device_name,
        url,
        start_time,
        end_time: Utc::now(),
        duration: clock.elapsed(),
        attempts,
        retries: opts.retries,
        artifacts: Vec::new(),
    }
}

/// Terminal record for a suite that was never dispatched.
pub(super) fn skipped_result(opts: &StartOptions) -> TestResult {
    let now = Utc::now();
    TestResult {
        name: opts.display_name.clone(),
        status: TestStatus::Skipped,
        browser: opts.browser_name.clone(),
        platform: opts.platform_name.clone(),
        device_name: opts.device_name.clone(),
        url: String::new(),
        start_time: now,
        end_time: now,
        duration: std::time::Duration::ZERO,
        attempts: Vec::new(),
        retries: opts.retries,
        artifacts: Vec::new(),
    }
}
