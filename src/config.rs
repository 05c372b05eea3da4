//! Project configuration schema and loading.
//!
//! A [`Project`] is the immutable input to a run: the ordered suite list,
//! the concurrency request, backend selection, and artifact/report policies.
//! It is deserialized once from a TOML file and never mutated by the
//! orchestration core.
//!
//! # TOML Structure
//!
//! ```toml
//! [stratus]
//! concurrency = 4
//! retries = 1
//! region = "us-west-1"
//!
//! [backend]
//! type = "container"
//! image = "cypress/included:13.6.0"
//! run_command = "npx cypress run --spec {specs}"
//!
//! [[suites]]
//! name = "chrome smoke"
//! browser = "chrome"
//! spec_pattern = ["cypress/e2e/**/*.cy.js"]
//! shard = "spec"
//!
//! [artifacts]
//! when = "fail"
//! directory = "artifacts"
//!
//! [report]
//! junit = true
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors produced while loading or validating a project configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The config file is not valid TOML or does not match the schema.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config parsed but describes an unusable project.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// A suite requested via `--select-suite` does not exist.
    #[error("no suite named '{0}' found")]
    SuiteNotFound(String),
}

/// Root project configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Project {
    /// Core run settings (concurrency, retries, region, tunnel).
    pub stratus: StratusConfig,

    /// Execution backend selection.
    pub backend: BackendConfig,

    /// Framework label forwarded to backends and reports (e.g. "cypress").
    /// The core never interprets it.
    #[serde(default)]
    pub framework: String,

    /// The ordered list of suites to run.
    pub suites: Vec<Suite>,

    /// Artifact download policy.
    #[serde(default)]
    pub artifacts: ArtifactDownload,

    /// Report output settings.
    #[serde(default)]
    pub report: ReportConfig,

    /// Root directory that suite spec patterns are resolved against.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Path the configuration was loaded from. Set by [`load_project`],
    /// attached to started jobs as an asset.
    #[serde(skip)]
    pub config_path: PathBuf,
}

/// Core run settings, the `[stratus]` table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StratusConfig {
    /// Requested concurrency. The effective concurrency is the minimum of
    /// this and the account's allowed concurrency.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Default retry count for suites that don't override it.
    #[serde(default)]
    pub retries: usize,

    /// Target region, used to build job detail URLs.
    #[serde(default)]
    pub region: Region,

    /// Tunnel to route suite traffic through, if any.
    #[serde(default)]
    pub tunnel: Tunnel,

    /// Optional dispatch ordering applied once before workers start.
    #[serde(default)]
    pub launch_order: Option<LaunchOrder>,

    /// Stop dispatching new suites after the first failed one.
    #[serde(default)]
    pub fail_fast: bool,

    /// Retry only the failed test cases of the previous attempt, based on
    /// its junit report, instead of the whole suite.
    #[serde(default)]
    pub retry_failed_only: bool,

    /// Global wall-clock budget for the whole run, in seconds. Zero means
    /// unlimited.
    #[serde(default)]
    pub timeout_secs: u64,

    /// Build metadata attached to every started job.
    #[serde(default)]
    pub metadata: Metadata,
}

impl StratusConfig {
    /// Global run timeout, if one is configured.
    pub fn global_timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

impl Default for StratusConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            retries: 0,
            region: Region::default(),
            tunnel: Tunnel::default(),
            launch_order: None,
            fail_fast: false,
            retry_failed_only: false,
            timeout_secs: 0,
            metadata: Metadata::default(),
        }
    }
}

/// Build metadata forwarded to the backend.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Metadata {
    #[serde(default)]
    pub build: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Cloud region selection.
///
/// The core never talks to a region itself; it only uses the region to
/// render job detail URLs on reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum Region {
    #[default]
    #[serde(rename = "us-west-1")]
    UsWest1,
    #[serde(rename = "us-east-4")]
    UsEast4,
    #[serde(rename = "eu-central-1")]
    EuCentral1,
    #[serde(rename = "staging")]
    Staging,
}

impl Region {
    /// Base URL of the web UI for this region.
    pub fn app_base_url(&self) -> &'static str {
        match self {
            Region::UsWest1 => "https://app.us-west-1.stratus.dev",
            Region::UsEast4 => "https://app.us-east-4.stratus.dev",
            Region::EuCentral1 => "https://app.eu-central-1.stratus.dev",
            Region::Staging => "https://app.staging.stratus.dev",
        }
    }

    /// Detail page for a finished or running job.
    pub fn job_url(&self, job_id: &str) -> String {
        format!("{}/tests/{}", self.app_base_url(), job_id)
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Region::UsWest1 => "us-west-1",
            Region::UsEast4 => "us-east-4",
            Region::EuCentral1 => "eu-central-1",
            Region::Staging => "staging",
        };
        f.write_str(name)
    }
}

/// Tunnel routing configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Tunnel {
    /// Tunnel name. Empty disables tunnel routing.
    #[serde(default)]
    pub name: String,

    /// Owner of a shared tunnel, when not owned by the current account.
    #[serde(default)]
    pub owner: String,
}

/// Dispatch ordering policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum LaunchOrder {
    /// Dispatch historically flaky suites first so failures surface early.
    #[serde(rename = "fail rate")]
    FailRate,
}

/// Suite sharding modes. See [`crate::shard`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardMode {
    /// Run the suite as configured.
    #[default]
    None,
    /// One shard per matched spec file.
    Spec,
    /// Partition matched files into one shard per concurrency slot.
    Concurrency,
}

/// One configured unit of test execution.
///
/// Suite names must be unique after sharding; the sharder suffixes shard
/// names to preserve that.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Suite {
    pub name: String,

    /// Browser/platform/device labels. Browser is empty for mobile suites.
    #[serde(default)]
    pub browser: String,
    #[serde(default)]
    pub browser_version: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub device_name: String,

    /// Glob patterns selecting this suite's spec files, relative to
    /// [`Project::root_dir`].
    #[serde(default)]
    pub spec_pattern: Vec<String>,

    /// Glob patterns removed from the match set before sharding.
    #[serde(default)]
    pub exclude_spec_pattern: Vec<String>,

    /// Per-suite timeout in seconds.
    #[serde(default = "default_suite_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub shard: ShardMode,

    /// Retry count override. Falls back to `[stratus].retries`.
    #[serde(default)]
    pub retries: Option<usize>,

    /// Minimum number of passed attempts for the suite to count as passed.
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: usize,

    /// Environment variables injected into the job.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Historical failure rate in `[0, 1]`, used by the `fail rate` launch
    /// order. Filled in by whoever assembles the project; never fetched by
    /// the core.
    #[serde(default)]
    pub fail_rate: f64,
}

impl Suite {
    /// Per-suite timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Effective retry count given the project default.
    pub fn effective_retries(&self, project_default: usize) -> usize {
        self.retries.unwrap_or(project_default)
    }
}

/// Execution backend selection, tagged by `type`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Run each suite in a local container.
    Container(ContainerBackendConfig),
}

/// Settings for the container backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContainerBackendConfig {
    /// Image that suites run in.
    pub image: String,

    /// Command executed inside the container for each suite. The `{suite}`
    /// and `{specs}` placeholders are substituted before execution.
    pub run_command: String,

    /// Pull the image before the first job. Defaults to true.
    #[serde(default = "default_true")]
    pub pull: bool,

    #[serde(default)]
    pub working_dir: Option<String>,

    /// Volume bindings in `host:container` form.
    #[serde(default)]
    pub volumes: Vec<String>,

    #[serde(default = "default_network_mode")]
    pub network_mode: String,

    /// Environment applied to every job, merged under suite env.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Directory inside the container that artifacts are collected from.
    #[serde(default = "default_results_dir")]
    pub results_dir: String,
}

/// Artifact download policy, the `[artifacts]` table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArtifactDownload {
    /// When to fetch artifacts for a finished attempt.
    #[serde(default)]
    pub when: When,

    /// Destination directory; a per-suite subdirectory is created inside.
    #[serde(default = "default_artifact_dir")]
    pub directory: PathBuf,

    /// Glob patterns selecting which artifacts to keep.
    #[serde(default = "default_match_all")]
    pub match_patterns: Vec<String>,
}

impl Default for ArtifactDownload {
    fn default() -> Self {
        Self {
            when: When::default(),
            directory: default_artifact_dir(),
            match_patterns: default_match_all(),
        }
    }
}

/// Artifact download conditions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum When {
    Always,
    #[default]
    Never,
    Pass,
    Fail,
}

/// Report output settings, the `[report]` table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory that file reports are written into.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Write a JUnit XML report.
    #[serde(default)]
    pub junit: bool,

    #[serde(default = "default_junit_file")]
    pub junit_file: String,

    /// Write a JSON report.
    #[serde(default)]
    pub json: bool,

    #[serde(default = "default_json_file")]
    pub json_file: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            junit: false,
            junit_file: default_junit_file(),
            json: false,
            json_file: default_json_file(),
        }
    }
}

fn default_concurrency() -> usize {
    2
}

fn default_suite_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_pass_threshold() -> usize {
    1
}

fn default_root_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_match_all() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}

fn default_json_file() -> String {
    "results.json".to_string()
}

fn default_network_mode() -> String {
    "bridge".to_string()
}

fn default_results_dir() -> String {
    "/home/stratus/results".to_string()
}

fn default_true() -> bool {
    true
}

/// Loads and validates a project configuration from a TOML file.
pub fn load_project(path: &Path) -> Result<Project, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut project: Project = toml::from_str(&raw)?;
    project.config_path = path.to_path_buf();
    validate(&project)?;
    Ok(project)
}

/// Validates project invariants that the schema alone cannot express.
pub fn validate(project: &Project) -> Result<(), ConfigError> {
    if project.suites.is_empty() {
        return Err(ConfigError::Invalid("no suites defined".into()));
    }

    if project.stratus.concurrency == 0 {
        return Err(ConfigError::Invalid(
            "concurrency must be at least 1".into(),
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for suite in &project.suites {
        if suite.name.trim().is_empty() {
            return Err(ConfigError::Invalid("suite with empty name".into()));
        }
        if !seen.insert(suite.name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "suite name '{}' is used more than once",
                suite.name
            )));
        }
        if suite.pass_threshold == 0 {
            return Err(ConfigError::Invalid(format!(
                "suite '{}': pass_threshold must be at least 1",
                suite.name
            )));
        }
        let retries = suite.effective_retries(project.stratus.retries);
        if suite.pass_threshold > retries + 1 {
            return Err(ConfigError::Invalid(format!(
                "suite '{}': pass_threshold {} cannot be met within {} attempts",
                suite.name,
                suite.pass_threshold,
                retries + 1
            )));
        }
    }

    Ok(())
}

/// Narrows the project to a single suite, selected by name.
pub fn select_suite(project: &mut Project, name: &str) -> Result<(), ConfigError> {
    let selected: Vec<Suite> = project
        .suites
        .iter()
        .filter(|s| s.name == name)
        .cloned()
        .collect();

    if selected.is_empty() {
        return Err(ConfigError::SuiteNotFound(name.to_string()));
    }

    project.suites = selected;
    Ok(())
}
