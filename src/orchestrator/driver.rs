//! Job lifecycle driver.
//!
//! Drives one suite attempt from submission to a terminal status:
//!
//! ```text
//! Created ──► Starting ──► Running ──► { Passed, Failed, Errored, TimedOut }
//! ```
//!
//! `Starting` calls the injected [`JobStarter`](crate::job::JobStarter); a
//! start failure terminates the attempt as `Errored` without any polling.
//! `Running` polls the reader until the backend reports a done state or the
//! suite timeout elapses; on timeout the stopper is invoked best-effort and
//! the attempt ends `TimedOut`. The container adapter implements the same
//! traits by awaiting the container exec, so this state machine is the only
//! lifecycle implementation in the crate.
//!
//! Every attempt reaches exactly one terminal state; the driver never
//! returns without one.

use std::path::Path;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Region;
use crate::job::{Job, JobService, JobState, StartOptions};
use crate::report::{Attempt, TestStatus};

/// Default polling cadence against remote backends. High enough to not
/// oversaturate the job reader with requests.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// The attempt record plus the final job snapshot it was derived from.
#[derive(Debug)]
pub struct AttemptOutcome {
    pub attempt: Attempt,
    pub job: Job,
}

/// Runs single suite attempts against a [`JobService`].
pub struct LifecycleDriver<'a, S> {
    service: &'a S,
    cancel: &'a CancellationToken,
    poll_interval: Duration,
    region: Option<Region>,
    async_mode: bool,
    config_path: &'a Path,
    cli_flags: Option<&'a serde_json::Value>,
}

impl<'a, S: JobService> LifecycleDriver<'a, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service: &'a S,
        cancel: &'a CancellationToken,
        poll_interval: Duration,
        region: Option<Region>,
        async_mode: bool,
        config_path: &'a Path,
        cli_flags: Option<&'a serde_json::Value>,
    ) -> Self {
        Self {
            service,
            cancel,
            poll_interval,
            region,
            async_mode,
            config_path,
            cli_flags,
        }
    }

    /// Runs one attempt to a terminal state.
    pub async fn run_attempt(&self, opts: &StartOptions) -> AttemptOutcome {
        let started_at = Utc::now();
        let clock = Instant::now();

        info!(
            suite = %opts.display_name,
            attempt = %opts.attempt_label(),
            "starting suite"
        );

        let job_id = match self.service.start_job(opts).await {
            Ok(id) => id,
            Err(err) => {
                error!(suite = %opts.display_name, error = %err, "failed to start suite");
                return self.errored(opts, String::new(), err.to_string(), started_at, clock);
            }
        };

        self.attach_run_assets(&job_id).await;

        match self.region {
            Some(region) => info!(
                suite = %opts.display_name,
                url = %region.job_url(&job_id),
                "suite started"
            ),
            None => info!(suite = %opts.display_name, job = %job_id, "suite started"),
        }

        // Async mode: fire and forget. The job keeps running remotely; its
        // final outcome is unknown to this process.
        if self.async_mode {
            let job = Job {
                id: job_id.clone(),
                status: JobState::InProgress,
                ..Job::default()
            };
            let attempt = Attempt {
                number: opts.attempt + 1,
                job_id,
                status: TestStatus::InProgress,
                started_at,
                ended_at: Utc::now(),
                duration: clock.elapsed(),
                error: String::new(),
            };
            return AttemptOutcome { attempt, job };
        }

        let mut job = tokio::select! {
            polled = self.service.poll_job(&job_id, self.poll_interval, opts.timeout) => {
                match polled {
                    Ok(job) => job,
                    Err(err) => {
                        error!(
                            suite = %opts.display_name,
                            error = %err,
                            "failed to retrieve job status"
                        );
                        return self.errored(opts, job_id, err.to_string(), started_at, clock);
                    }
                }
            }
            _ = self.cancel.cancelled() => {
                // Soft shutdown: actively stop the in-flight job and record
                // whatever state the backend reports back.
                info!(suite = %opts.display_name, "stopping suite");
                match self.service.stop_job(&job_id).await {
                    Ok(job) => job,
                    Err(err) => {
                        warn!(suite = %opts.display_name, error = %err, "unable to stop suite");
                        Job {
                            id: job_id.clone(),
                            status: JobState::Error,
                            error: err.to_string(),
                            ..Job::default()
                        }
                    }
                }
            }
        };

        if job.timed_out {
            warn!(
                suite = %opts.display_name,
                timeout = ?opts.timeout,
                "suite has reached timeout"
            );
            if let Err(err) = self.service.stop_job(&job_id).await {
                warn!(suite = %opts.display_name, error = %err, "failed to stop suite");
            }
            job.passed = false;
        }

        let attempt = Attempt {
            number: opts.attempt + 1,
            job_id,
            status: job.total_status(),
            started_at,
            ended_at: Utc::now(),
            duration: clock.elapsed(),
            error: job.error.clone(),
        };

        AttemptOutcome { attempt, job }
    }

    fn errored(
        &self,
        opts: &StartOptions,
        job_id: String,
        error: String,
        started_at: chrono::DateTime<Utc>,
        clock: Instant,
    ) -> AttemptOutcome {
        let job = Job {
            id: job_id.clone(),
            status: JobState::Error,
            error: error.clone(),
            ..Job::default()
        };
        let attempt = Attempt {
            number: opts.attempt + 1,
            job_id,
            status: TestStatus::Errored,
            started_at,
            ended_at: Utc::now(),
            duration: clock.elapsed(),
            error,
        };
        AttemptOutcome { attempt, job }
    }

    /// Attaches the project config and a CLI flag snapshot to the job, so a
    /// run can be reproduced from its assets. Best-effort.
    async fn attach_run_assets(&self, job_id: &str) {
        match tokio::fs::read(self.config_path).await {
            Ok(content) => {
                let name = self
                    .config_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "config.toml".to_string());
                if let Err(err) = self
                    .service
                    .upload_asset(job_id, &name, "text/plain", &content)
                    .await
                {
                    warn!(error = %err, "failed to attach configuration");
                }
            }
            Err(err) => warn!(error = %err, "failed to read configuration"),
        }

        if let Some(flags) = self.cli_flags {
            match serde_json::to_vec(flags) {
                Ok(encoded) => {
                    if let Err(err) = self
                        .service
                        .upload_asset(job_id, "flags.json", "text/plain", &encoded)
                        .await
                    {
                        warn!(error = %err, "failed to report CLI flags");
                    }
                }
                Err(err) => warn!(error = %err, "failed to encode CLI flags"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{BackendError, JobReader, JobStarter, JobStopper, JobWriter};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeService {
        fail_start: bool,
        timed_out: bool,
        passed: bool,
        polls: AtomicUsize,
        stops: AtomicUsize,
        assets: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobStarter for FakeService {
        async fn start_job(&self, _opts: &StartOptions) -> Result<String, BackendError> {
            if self.fail_start {
                return Err(BackendError::StartFailed("no capacity".into()));
            }
            Ok("job-1".to_string())
        }
    }

    #[async_trait]
    impl JobReader for FakeService {
        async fn poll_job(
            &self,
            id: &str,
            _interval: Duration,
            _timeout: Duration,
        ) -> Result<Job, BackendError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(Job {
                id: id.to_string(),
                status: JobState::Complete,
                passed: self.passed,
                timed_out: self.timed_out,
                ..Job::default()
            })
        }

        async fn job_asset(&self, id: &str, name: &str) -> Result<Vec<u8>, BackendError> {
            Err(BackendError::AssetMissing(id.into(), name.into()))
        }
    }

    #[async_trait]
    impl JobStopper for FakeService {
        async fn stop_job(&self, id: &str) -> Result<Job, BackendError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(Job {
                id: id.to_string(),
                status: JobState::Complete,
                ..Job::default()
            })
        }
    }

    #[async_trait]
    impl JobWriter for FakeService {
        async fn upload_asset(
            &self,
            _id: &str,
            name: &str,
            _content_type: &str,
            _body: &[u8],
        ) -> Result<(), BackendError> {
            self.assets.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    fn driver<'a>(
        service: &'a FakeService,
        cancel: &'a CancellationToken,
        async_mode: bool,
    ) -> LifecycleDriver<'a, FakeService> {
        LifecycleDriver::new(
            service,
            cancel,
            Duration::from_millis(1),
            None,
            async_mode,
            Path::new("/nonexistent/stratus.toml"),
            None,
        )
    }

    fn opts() -> StartOptions {
        StartOptions {
            display_name: "suite".into(),
            timeout: Duration::from_secs(5),
            ..StartOptions::default()
        }
    }

    #[tokio::test]
    async fn passing_attempt() {
        let service = FakeService {
            passed: true,
            ..FakeService::default()
        };
        let cancel = CancellationToken::new();

        let outcome = driver(&service, &cancel, false).run_attempt(&opts()).await;
        assert_eq!(outcome.attempt.status, TestStatus::Passed);
        assert_eq!(outcome.attempt.number, 1);
        assert_eq!(outcome.attempt.job_id, "job-1");
        assert_eq!(service.polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_failure_skips_polling() {
        let service = FakeService {
            fail_start: true,
            ..FakeService::default()
        };
        let cancel = CancellationToken::new();

        let outcome = driver(&service, &cancel, false).run_attempt(&opts()).await;
        assert_eq!(outcome.attempt.status, TestStatus::Errored);
        assert!(outcome.attempt.job_id.is_empty());
        assert!(!outcome.attempt.error.is_empty());
        assert_eq!(service.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timeout_stops_the_job() {
        let service = FakeService {
            timed_out: true,
            passed: true, // a backend pass does not rescue a timeout
            ..FakeService::default()
        };
        let cancel = CancellationToken::new();

        let outcome = driver(&service, &cancel, false).run_attempt(&opts()).await;
        assert_eq!(outcome.attempt.status, TestStatus::TimedOut);
        assert_eq!(service.stops.load(Ordering::SeqCst), 1);
        assert!(!outcome.job.passed);
    }

    #[tokio::test]
    async fn async_mode_returns_without_polling() {
        let service = FakeService {
            passed: true,
            ..FakeService::default()
        };
        let cancel = CancellationToken::new();

        let outcome = driver(&service, &cancel, true).run_attempt(&opts()).await;
        assert_eq!(outcome.attempt.status, TestStatus::InProgress);
        assert_eq!(outcome.job.status, JobState::InProgress);
        assert_eq!(service.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_stops_the_job_mid_poll() {
        struct SlowService(FakeService);

        #[async_trait]
        impl JobStarter for SlowService {
            async fn start_job(&self, opts: &StartOptions) -> Result<String, BackendError> {
                self.0.start_job(opts).await
            }
        }

        #[async_trait]
        impl JobReader for SlowService {
            async fn poll_job(
                &self,
                _id: &str,
                _interval: Duration,
                _timeout: Duration,
            ) -> Result<Job, BackendError> {
                // Simulates a job that never finishes on its own.
                tokio::time::sleep(Duration::from_secs(600)).await;
                unreachable!()
            }

            async fn job_asset(&self, id: &str, name: &str) -> Result<Vec<u8>, BackendError> {
                self.0.job_asset(id, name).await
            }
        }

        #[async_trait]
        impl JobStopper for SlowService {
            async fn stop_job(&self, id: &str) -> Result<Job, BackendError> {
                self.0.stop_job(id).await
            }
        }

        #[async_trait]
        impl JobWriter for SlowService {
            async fn upload_asset(
                &self,
                id: &str,
                name: &str,
                content_type: &str,
                body: &[u8],
            ) -> Result<(), BackendError> {
                self.0.upload_asset(id, name, content_type, body).await
            }
        }

        let service = SlowService(FakeService::default());
        let cancel = CancellationToken::new();

        let driver = LifecycleDriver::new(
            &service,
            &cancel,
            Duration::from_millis(1),
            None,
            false,
            Path::new("/nonexistent/stratus.toml"),
            None,
        );

        cancel.cancel();
        let outcome = driver.run_attempt(&opts()).await;
        assert_eq!(service.0.stops.load(Ordering::SeqCst), 1);
        // The stopped job reported complete/not-passed.
        assert_eq!(outcome.attempt.status, TestStatus::Failed);
    }
}
