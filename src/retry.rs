//! Retry policies.
//!
//! A [`Retrier`] looks at the attempts made for one suite and decides
//! whether the worker should start another one. Policies may also narrow
//! the next attempt's [`StartOptions`]: the JUnit-based policy restricts
//! it to the test cases that actually failed.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::job::{JobReader, StartOptions};
use crate::junit;
use crate::report::{Attempt, TestStatus};

/// Decides whether a finished (failed) suite attempt should be retried.
#[async_trait]
pub trait Retrier: Send + Sync {
    /// `attempts` holds every attempt made so far, the last one being the
    /// attempt that just finished. Implementations may mutate `opts` to
    /// shape the next attempt.
    async fn should_retry(&self, opts: &mut StartOptions, attempts: &[Attempt]) -> bool;
}

fn successes(attempts: &[Attempt]) -> usize {
    attempts
        .iter()
        .filter(|a| a.status == TestStatus::Passed)
        .count()
}

/// The threshold rule shared by all policies: retry while the pass
/// threshold is unmet and the attempt budget remains.
fn below_threshold(opts: &StartOptions, attempts: &[Attempt]) -> bool {
    successes(attempts) < opts.pass_threshold && attempts.len() < opts.retries + 1
}

/// Whole-suite retry while the pass threshold is unmet.
pub struct ThresholdRetrier;

#[async_trait]
impl Retrier for ThresholdRetrier {
    async fn should_retry(&self, opts: &mut StartOptions, attempts: &[Attempt]) -> bool {
        let retry = below_threshold(opts, attempts);
        if retry {
            info!(suite = %opts.display_name, "retrying suite");
        }
        retry
    }
}

/// Retries only the failed test cases of the previous attempt, based on its
/// `junit.xml` asset. Falls back to a whole-suite retry when the asset is
/// missing or unparsable.
pub struct JunitRetrier<R> {
    reader: Arc<R>,
}

impl<R: JobReader> JunitRetrier<R> {
    pub fn new(reader: Arc<R>) -> Self {
        Self { reader }
    }

    async fn narrow_to_failed(&self, opts: &mut StartOptions, previous: &Attempt) {
        let content = match self
            .reader
            .job_asset(&previous.job_id, junit::JUNIT_FILE_NAME)
            .await
        {
            Ok(content) => content,
            Err(err) => {
                debug!(error = %err, "unable to fetch junit report, retrying whole suite");
                opts.tests_to_run.clear();
                return;
            }
        };

        let report = match junit::parse(&content) {
            Ok(report) => report,
            Err(err) => {
                debug!(error = %err, "unable to parse junit report, retrying whole suite");
                opts.tests_to_run.clear();
                return;
            }
        };

        let failed = report.failed_tests();
        if failed.is_empty() {
            // The suite failed without a single failing case (e.g. the
            // runner died); only a full retry makes sense.
            opts.tests_to_run.clear();
            return;
        }

        info!(
            suite = %opts.display_name,
            tests = failed.join(","),
            "retrying failed tests only"
        );
        opts.tests_to_run = failed;
    }
}

#[async_trait]
impl<R: JobReader> Retrier for JunitRetrier<R> {
    async fn should_retry(&self, opts: &mut StartOptions, attempts: &[Attempt]) -> bool {
        if !below_threshold(opts, attempts) {
            return false;
        }

        match attempts.last() {
            // A failed attempt with a job behind it may have structured
            // results worth narrowing on. Attempts that never started or
            // errored have no usable report.
            Some(previous)
                if !previous.job_id.is_empty() && previous.status == TestStatus::Failed =>
            {
                self.narrow_to_failed(opts, previous).await;
            }
            _ => opts.tests_to_run.clear(),
        }

        true
    }
}
