//! Container execution backend.
//!
//! Adapts a container runtime to the job traits so the lifecycle driver
//! can treat local containers exactly like cloud jobs. "Polling" a
//! container job degenerates to awaiting the container exec and reading
//! its exit code; the state machine above it is unchanged.
//!
//! The runtime itself is behind the [`ContainerBackend`] capability;
//! [`docker::DockerBackend`] is the bundled implementation.

pub mod docker;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use globset::{Glob, GlobSetBuilder};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::artifact::ArtifactDownloader;
use crate::concurrency::CcyReader;
use crate::config::ContainerBackendConfig;
use crate::job::{
    BackendError, CONSOLE_LOG_ASSET, Job, JobReader, JobStarter, JobState, JobStopper, JobWriter,
    StartOptions,
};

/// What it takes to create one job container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub volumes: Vec<String>,
    pub network_mode: String,
}

/// Captured output of a finished container exec.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// Low-level container runtime operations the adapter is built on.
#[async_trait]
pub trait ContainerBackend: Send + Sync + 'static {
    async fn pull_image(&self, image: &str) -> Result<(), BackendError>;

    /// Creates a container and returns its runtime ID.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, BackendError>;

    async fn start_container(&self, id: &str) -> Result<(), BackendError>;

    /// Runs `cmd` inside the container and waits for it to exit.
    async fn exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        env: Vec<String>,
    ) -> Result<ExecOutput, BackendError>;

    async fn stop_container(&self, id: &str) -> Result<(), BackendError>;

    async fn remove_container(&self, id: &str) -> Result<(), BackendError>;

    /// Copies `src` (a path inside the container) into `dest` on the host
    /// and returns the files written.
    async fn copy_from(&self, id: &str, src: &str, dest: &Path)
    -> Result<Vec<PathBuf>, BackendError>;
}

struct JobEntry {
    container_id: String,
    exec: Option<JoinHandle<Result<ExecOutput, BackendError>>>,
    output: Option<ExecOutput>,
    assets: HashMap<String, Vec<u8>>,
}

/// Implements the job traits on top of a [`ContainerBackend`].
///
/// One job is one container: `start_job` creates and starts it and kicks
/// off the suite command; `poll_job` awaits that command with the suite
/// timeout; `stop_job` kills the container. Containers are only removed by
/// [`teardown`](Self::teardown), after artifacts had a chance to be
/// collected.
pub struct ContainerJobService<B> {
    backend: Arc<B>,
    config: ContainerBackendConfig,
    jobs: Mutex<HashMap<String, JobEntry>>,
    pulled: tokio::sync::OnceCell<()>,
}

impl<B: ContainerBackend> ContainerJobService<B> {
    pub fn new(backend: B, config: ContainerBackendConfig) -> Self {
        Self {
            backend: Arc::new(backend),
            config,
            jobs: Mutex::new(HashMap::new()),
            pulled: tokio::sync::OnceCell::new(),
        }
    }

    /// Suite command with `{suite}`/`{specs}` placeholders substituted,
    /// split into argv form.
    fn build_command(&self, opts: &StartOptions) -> Result<Vec<String>, BackendError> {
        let rendered = self
            .config
            .run_command
            .replace("{suite}", &opts.suite)
            .replace("{specs}", &opts.specs.join(" "));
        shell_words::split(&rendered)
            .map_err(|err| BackendError::StartFailed(format!("bad run_command: {err}")))
    }

    fn build_env(&self, opts: &StartOptions) -> Vec<String> {
        let mut env: Vec<String> = self
            .config
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        for (k, v) in &opts.env {
            env.push(format!("{k}={v}"));
        }
        env.push(format!("STRATUS_SUITE={}", opts.suite));
        if !opts.tests_to_run.is_empty() {
            // Lets runners narrow a retry to the failed cases.
            env.push(format!("STRATUS_TESTS={}", opts.tests_to_run.join(",")));
        }
        env
    }

    /// Removes every container this service created. Call once after the
    /// run, when artifacts have been collected.
    pub async fn teardown(&self) {
        let entries: Vec<(String, String)> = {
            let mut jobs = self.jobs.lock().expect("job table lock poisoned");
            jobs.drain()
                .map(|(job_id, entry)| (job_id, entry.container_id))
                .collect()
        };

        for (job_id, container_id) in entries {
            debug!(job = %job_id, "removing container");
            if let Err(err) = self.backend.remove_container(&container_id).await {
                warn!(job = %job_id, error = %err, "failed to remove container");
            }
        }
    }

    fn container_id(&self, job_id: &str) -> Result<String, BackendError> {
        let jobs = self.jobs.lock().expect("job table lock poisoned");
        jobs.get(job_id)
            .map(|e| e.container_id.clone())
            .ok_or_else(|| BackendError::ReadFailed(job_id.into(), "unknown job".into()))
    }
}

#[async_trait]
impl<B: ContainerBackend> JobStarter for ContainerJobService<B> {
    async fn start_job(&self, opts: &StartOptions) -> Result<String, BackendError> {
        if self.config.pull {
            self.pulled
                .get_or_try_init(|| async {
                    info!(image = %self.config.image, "pulling image");
                    self.backend.pull_image(&self.config.image).await
                })
                .await?;
        }

        let job_id = format!("stratus-{}", uuid::Uuid::new_v4());
        let spec = ContainerSpec {
            name: job_id.clone(),
            image: self.config.image.clone(),
            env: self.build_env(opts),
            working_dir: self.config.working_dir.clone(),
            volumes: self.config.volumes.clone(),
            network_mode: self.config.network_mode.clone(),
        };

        let container_id = self.backend.create_container(&spec).await?;
        self.backend.start_container(&container_id).await?;

        let cmd = self.build_command(opts)?;
        let env = self.build_env(opts);

        // The suite command runs in the background; poll_job awaits it.
        let backend = Arc::clone(&self.backend);
        let exec_container = container_id.clone();
        let exec = tokio::spawn(async move { backend.exec(&exec_container, cmd, env).await });

        let mut jobs = self.jobs.lock().expect("job table lock poisoned");
        jobs.insert(
            job_id.clone(),
            JobEntry {
                container_id,
                exec: Some(exec),
                output: None,
                assets: HashMap::new(),
            },
        );

        Ok(job_id)
    }
}

#[async_trait]
impl<B: ContainerBackend> JobReader for ContainerJobService<B> {
    async fn poll_job(
        &self,
        id: &str,
        _interval: Duration,
        timeout: Duration,
    ) -> Result<Job, BackendError> {
        let exec = {
            let mut jobs = self.jobs.lock().expect("job table lock poisoned");
            let entry = jobs
                .get_mut(id)
                .ok_or_else(|| BackendError::ReadFailed(id.into(), "unknown job".into()))?;
            entry.exec.take()
        };

        let Some(mut exec) = exec else {
            // Already polled to completion once.
            let jobs = self.jobs.lock().expect("job table lock poisoned");
            let entry = jobs
                .get(id)
                .ok_or_else(|| BackendError::ReadFailed(id.into(), "unknown job".into()))?;
            return Ok(finished_job(id, entry.output.as_ref()));
        };

        match tokio::time::timeout(timeout, &mut exec).await {
            Ok(joined) => {
                let output = joined
                    .map_err(|err| BackendError::ReadFailed(id.into(), err.to_string()))??;

                let mut jobs = self.jobs.lock().expect("job table lock poisoned");
                if let Some(entry) = jobs.get_mut(id) {
                    entry
                        .assets
                        .entry(CONSOLE_LOG_ASSET.to_string())
                        .or_insert_with(|| {
                            format!("{}{}", output.stdout, output.stderr).into_bytes()
                        });
                    entry.output = Some(output.clone());
                }

                Ok(Job {
                    id: id.to_string(),
                    status: JobState::Complete,
                    passed: output.exit_code == 0,
                    ..Job::default()
                })
            }
            Err(_) => {
                // Hand the still-running exec back so stop_job can abort it.
                let mut jobs = self.jobs.lock().expect("job table lock poisoned");
                if let Some(entry) = jobs.get_mut(id) {
                    entry.exec = Some(exec);
                }
                Ok(Job {
                    id: id.to_string(),
                    status: JobState::InProgress,
                    timed_out: true,
                    ..Job::default()
                })
            }
        }
    }

    async fn job_asset(&self, id: &str, name: &str) -> Result<Vec<u8>, BackendError> {
        {
            let jobs = self.jobs.lock().expect("job table lock poisoned");
            if let Some(content) = jobs.get(id).and_then(|e| e.assets.get(name)) {
                return Ok(content.clone());
            }
        }

        // Not attached in-process; try the results directory inside the
        // container.
        let container_id = self.container_id(id)?;
        let tmp = tempfile::tempdir()?;
        let src = format!("{}/{}", self.config.results_dir.trim_end_matches('/'), name);
        let files = self.backend.copy_from(&container_id, &src, tmp.path()).await?;

        match files.first() {
            Some(file) => Ok(std::fs::read(file)?),
            None => Err(BackendError::AssetMissing(id.into(), name.into())),
        }
    }
}

#[async_trait]
impl<B: ContainerBackend> JobStopper for ContainerJobService<B> {
    async fn stop_job(&self, id: &str) -> Result<Job, BackendError> {
        let (container_id, exec) = {
            let mut jobs = self.jobs.lock().expect("job table lock poisoned");
            let entry = jobs
                .get_mut(id)
                .ok_or_else(|| BackendError::StopFailed(id.into(), "unknown job".into()))?;
            (entry.container_id.clone(), entry.exec.take())
        };

        if let Some(exec) = exec {
            exec.abort();
        }
        self.backend.stop_container(&container_id).await?;

        Ok(Job {
            id: id.to_string(),
            status: JobState::Complete,
            passed: false,
            ..Job::default()
        })
    }
}

#[async_trait]
impl<B: ContainerBackend> JobWriter for ContainerJobService<B> {
    async fn upload_asset(
        &self,
        id: &str,
        name: &str,
        _content_type: &str,
        body: &[u8],
    ) -> Result<(), BackendError> {
        let mut jobs = self.jobs.lock().expect("job table lock poisoned");
        let entry = jobs
            .get_mut(id)
            .ok_or_else(|| BackendError::ReadFailed(id.into(), "unknown job".into()))?;
        entry.assets.insert(name.to_string(), body.to_vec());
        Ok(())
    }
}

#[async_trait]
impl<B: ContainerBackend> ArtifactDownloader for ContainerJobService<B> {
    async fn download(
        &self,
        job_id: &str,
        dest: &Path,
        patterns: &[String],
    ) -> anyhow::Result<Vec<PathBuf>> {
        let container_id = self.container_id(job_id)?;

        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern)?);
        }
        let matcher = builder.build()?;

        let staging = tempfile::tempdir()?;
        let files = self
            .backend
            .copy_from(&container_id, &self.config.results_dir, staging.path())
            .await?;

        std::fs::create_dir_all(dest)?;
        let mut kept = Vec::new();
        for file in files {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if !matcher.is_match(&name) {
                continue;
            }
            let target = dest.join(&name);
            std::fs::copy(&file, &target)?;
            kept.push(target);
        }

        Ok(kept)
    }
}

/// The container backend has no account-level quota; the requested
/// concurrency is always granted.
pub struct ContainerCcyReader;

#[async_trait]
impl CcyReader for ContainerCcyReader {
    async fn read_allowed_ccy(&self) -> anyhow::Result<usize> {
        Ok(usize::MAX)
    }
}

fn finished_job(id: &str, output: Option<&ExecOutput>) -> Job {
    Job {
        id: id.to_string(),
        status: JobState::Complete,
        passed: output.map(|o| o.exit_code == 0).unwrap_or(false),
        ..Job::default()
    }
}
