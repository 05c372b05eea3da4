//! Docker implementation of the container backend.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, DownloadFromContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use futures::StreamExt;

use super::{ContainerBackend, ContainerSpec, ExecOutput};
use crate::job::BackendError;

/// Talks to a Docker daemon via the Docker API.
pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    /// Connects to `docker_host`, or the local daemon when `None`.
    pub fn new(docker_host: Option<&str>) -> Result<Self, BackendError> {
        let docker = match docker_host {
            Some(host) => Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| BackendError::Connection(e.to_string()))?,
            None => Docker::connect_with_local_defaults()
                .map_err(|e| BackendError::Connection(e.to_string()))?,
        };
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    async fn pull_image(&self, image: &str) -> Result<(), BackendError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = pull.next().await {
            progress.map_err(|e| BackendError::StartFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, BackendError> {
        let host_config = bollard::models::HostConfig {
            binds: Some(spec.volumes.clone()),
            network_mode: Some(spec.network_mode.clone()),
            ..Default::default()
        };

        let container_config = ContainerConfig {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            working_dir: spec.working_dir.clone(),
            host_config: Some(host_config),
            // Keep the container alive; the suite runs via exec.
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            tty: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: &spec.name,
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| BackendError::StartFailed(e.to_string()))?;

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), BackendError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| BackendError::StartFailed(e.to_string()))
    }

    async fn exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        env: Vec<String>,
    ) -> Result<ExecOutput, BackendError> {
        let exec_options = CreateExecOptions {
            cmd: Some(cmd),
            env: Some(env),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, exec_options)
            .await
            .map_err(|e| BackendError::ReadFailed(id.to_string(), e.to_string()))?;

        let output = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| BackendError::ReadFailed(id.to_string(), e.to_string()))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = output {
            while let Some(msg) = output.next().await {
                match msg {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| BackendError::ReadFailed(id.to_string(), e.to_string()))?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn stop_container(&self, id: &str) -> Result<(), BackendError> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: 10 }))
            .await
            .map_err(|e| BackendError::StopFailed(id.to_string(), e.to_string()))
    }

    async fn remove_container(&self, id: &str) -> Result<(), BackendError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| BackendError::StopFailed(id.to_string(), e.to_string()))
    }

    async fn copy_from(
        &self,
        id: &str,
        src: &str,
        dest: &Path,
    ) -> Result<Vec<PathBuf>, BackendError> {
        let mut stream = self.docker.download_from_container(
            id,
            Some(DownloadFromContainerOptions {
                path: src.to_string(),
            }),
        );

        let mut tar_data = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| BackendError::ReadFailed(id.to_string(), e.to_string()))?;
            tar_data.extend_from_slice(&chunk);
        }

        std::fs::create_dir_all(dest)?;
        let mut archive = tar::Archive::new(tar_data.as_slice());
        archive.unpack(dest)?;

        let mut files = Vec::new();
        collect_files(dest, &mut files)?;
        Ok(files)
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}
