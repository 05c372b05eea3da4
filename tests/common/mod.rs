//! Instrumented fake backend shared by the integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use stratus::config::Project;
use stratus::job::{
    BackendError, Job, JobReader, JobStarter, JobState, JobStopper, JobWriter, StartOptions,
};

/// Scripted outcome of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pass,
    Fail,
    /// The start call itself fails; no job ID is ever assigned.
    StartError,
    Timeout,
}

/// A cloud backend double that replays scripted outcomes per suite and
/// records the in-flight attempt high-water mark.
pub struct FakeCloudService {
    outcomes: Mutex<HashMap<String, VecDeque<Outcome>>>,
    jobs: Mutex<HashMap<String, (String, Outcome)>>,
    junit_assets: Mutex<HashMap<String, Vec<u8>>>,
    started: Mutex<Vec<StartOptions>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    stops: AtomicUsize,
    counter: AtomicUsize,
    base_delay: Duration,
}

impl FakeCloudService {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            outcomes: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            junit_assets: Mutex::new(HashMap::new()),
            started: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            counter: AtomicUsize::new(0),
            base_delay,
        }
    }

    /// Scripts the attempt outcomes for one suite. Unscripted suites (and
    /// exhausted scripts) pass.
    pub fn script(&self, suite: &str, outcomes: &[Outcome]) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(suite.to_string(), outcomes.iter().copied().collect());
    }

    /// Serves a junit asset for every job of `suite`.
    pub fn set_junit(&self, suite: &str, xml: &str) {
        self.junit_assets
            .lock()
            .unwrap()
            .insert(suite.to_string(), xml.as_bytes().to_vec());
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> Vec<StartOptions> {
        self.started.lock().unwrap().clone()
    }

    fn next_outcome(&self, suite: &str) -> Outcome {
        self.outcomes
            .lock()
            .unwrap()
            .get_mut(suite)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Outcome::Pass)
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Deterministic but staggered per-attempt delay, so results complete
    /// out of dispatch order.
    fn attempt_delay(&self) -> Duration {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.base_delay + Duration::from_millis((n as u64 * 7) % 23)
    }
}

#[async_trait]
impl JobStarter for FakeCloudService {
    async fn start_job(&self, opts: &StartOptions) -> Result<String, BackendError> {
        self.started.lock().unwrap().push(opts.clone());

        let outcome = self.next_outcome(&opts.display_name);
        if outcome == Outcome::StartError {
            return Err(BackendError::StartFailed("no capacity".into()));
        }

        self.enter();
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let job_id = format!("job-{n}");
        self.jobs
            .lock()
            .unwrap()
            .insert(job_id.clone(), (opts.display_name.clone(), outcome));
        Ok(job_id)
    }
}

#[async_trait]
impl JobReader for FakeCloudService {
    async fn poll_job(
        &self,
        id: &str,
        _interval: Duration,
        _timeout: Duration,
    ) -> Result<Job, BackendError> {
        let (_, outcome) = self
            .jobs
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| BackendError::ReadFailed(id.into(), "unknown job".into()))?;

        tokio::time::sleep(self.attempt_delay()).await;
        self.leave();

        let job = match outcome {
            Outcome::Pass => Job {
                id: id.to_string(),
                status: JobState::Complete,
                passed: true,
                ..Job::default()
            },
            Outcome::Fail => Job {
                id: id.to_string(),
                status: JobState::Complete,
                passed: false,
                ..Job::default()
            },
            Outcome::Timeout => Job {
                id: id.to_string(),
                status: JobState::InProgress,
                timed_out: true,
                ..Job::default()
            },
            Outcome::StartError => unreachable!("start errors never reach polling"),
        };
        Ok(job)
    }

    async fn job_asset(&self, id: &str, name: &str) -> Result<Vec<u8>, BackendError> {
        let suite = self
            .jobs
            .lock()
            .unwrap()
            .get(id)
            .map(|(suite, _)| suite.clone())
            .ok_or_else(|| BackendError::ReadFailed(id.into(), "unknown job".into()))?;

        if name == "junit.xml"
            && let Some(content) = self.junit_assets.lock().unwrap().get(&suite)
        {
            return Ok(content.clone());
        }
        Err(BackendError::AssetMissing(id.into(), name.into()))
    }
}

#[async_trait]
impl JobStopper for FakeCloudService {
    async fn stop_job(&self, id: &str) -> Result<Job, BackendError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(Job {
            id: id.to_string(),
            status: JobState::Complete,
            passed: false,
            ..Job::default()
        })
    }
}

#[async_trait]
impl JobWriter for FakeCloudService {
    async fn upload_asset(
        &self,
        _id: &str,
        _name: &str,
        _content_type: &str,
        _body: &[u8],
    ) -> Result<(), BackendError> {
        Ok(())
    }
}

/// A minimal project with `n` suites named `suite-1..n`.
pub fn project_with_suites(n: usize) -> Project {
    let mut toml = String::from(
        r#"
        [stratus]
        concurrency = 2

        [backend]
        type = "container"
        image = "runner:latest"
        run_command = "run {suite}"
    "#,
    );
    for i in 1..=n {
        toml.push_str(&format!(
            r#"
            [[suites]]
            name = "suite-{i}"
            browser = "chrome"
            timeout_secs = 30
        "#
        ));
    }
    toml::from_str(&toml).expect("fixture config is valid")
}
