//! stratus: a CLI orchestrator for browser and mobile test suites.
//!
//! Suites run either as jobs in a remote cloud testing service or inside
//! local containers; either way, the same bounded-concurrency scheduler
//! fans them out to workers, drives each through a submit → poll →
//! terminate → collect lifecycle, retries failures, and merges everything
//! into one exit code and report stream.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Config**: the immutable [`Project`] (suites, concurrency, policies)
//! - **Shard**: expands suites per spec file or concurrency slot
//! - **Orchestrator**: the worker pool, lifecycle driver, and collector
//! - **Retry**: threshold and junit-selective retry policies
//! - **Container**: job traits implemented on a container runtime (Docker)
//! - **Report**: console table, JUnit XML, and JSON reporters
//!
//! Cloud backends are consumed purely through the trait seams in
//! [`job`], [`storage`], [`tunnel`], [`concurrency`], and [`artifact`];
//! the crate ships no cloud HTTP client.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stratus::config::load_project;
//! use stratus::orchestrator::Orchestrator;
//! use stratus::retry::ThresholdRetrier;
//! use stratus::container::{ContainerJobService, docker::DockerBackend};
//! use stratus::config::BackendConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let project = load_project(std::path::Path::new("stratus.toml"))?;
//!     let BackendConfig::Container(backend_cfg) = project.backend.clone();
//!
//!     let backend = DockerBackend::new(None)?;
//!     let service = Arc::new(ContainerJobService::new(backend, backend_cfg));
//!
//!     let suites = project.suites.clone();
//!     let orchestrator = Orchestrator::new(project, service, Box::new(ThresholdRetrier));
//!     let result = orchestrator.run_suites(suites, 2).await;
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod artifact;
pub mod concurrency;
pub mod config;
pub mod container;
pub mod fleet;
pub mod job;
pub mod junit;
pub mod orchestrator;
pub mod report;
pub mod retry;
pub mod shard;
pub mod storage;
pub mod tunnel;

// Re-export commonly used types
pub use config::{Project, Suite, load_project};
pub use job::{Job, JobService, StartOptions};
pub use orchestrator::{Orchestrator, RunResult};
pub use report::{Reporter, TestResult};
