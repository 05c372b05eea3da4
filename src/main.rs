//! stratus CLI - cloud/container test suite orchestrator.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

use stratus::concurrency;
use stratus::config::{self, BackendConfig, Project};
use stratus::container::{ContainerCcyReader, ContainerJobService, docker::DockerBackend};
use stratus::orchestrator::Orchestrator;
use stratus::report::{JsonReporter, JunitReporter, TableReporter};
use stratus::retry::{JunitRetrier, Retrier, ThresholdRetrier};
use stratus::shard::shard_suites;

/// Grace window between a soft shutdown request and the hard exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "stratus")]
#[command(about = "Run browser/mobile test suites in cloud or container backends", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "stratus.toml", global = true)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the project's suites
    Run {
        /// Override the requested concurrency
        #[arg(long)]
        ccy: Option<usize>,

        /// Stop dispatching new suites after the first failure
        #[arg(long)]
        fail_fast: bool,

        /// Start suites without waiting for their results
        #[arg(long = "async")]
        async_mode: bool,

        /// Resolve and print the plan without starting any suite
        #[arg(long)]
        dry_run: bool,

        /// Run a single suite, selected by name
        #[arg(long)]
        select_suite: Option<String>,

        /// Override the global run timeout, in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Print job console output even for passing suites
        #[arg(long)]
        show_console_log: bool,
    },

    /// Validate the configuration, including shard patterns
    Validate,

    /// List the suites that would run, after sharding
    Suites,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level.to_string())),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            ccy,
            fail_fast,
            async_mode,
            dry_run,
            select_suite,
            timeout,
            show_console_log,
        } => {
            run(
                &cli.config,
                RunArgs {
                    ccy,
                    fail_fast,
                    async_mode,
                    dry_run,
                    select_suite,
                    timeout,
                    show_console_log,
                },
            )
            .await
        }
        Commands::Validate => validate(&cli.config).await,
        Commands::Suites => suites(&cli.config).await,
    }
}

struct RunArgs {
    ccy: Option<usize>,
    fail_fast: bool,
    async_mode: bool,
    dry_run: bool,
    select_suite: Option<String>,
    timeout: Option<u64>,
    show_console_log: bool,
}

fn load(config_path: &Path) -> Result<Project> {
    config::load_project(config_path)
        .with_context(|| format!("failed to load project from {}", config_path.display()))
}

async fn run(config_path: &Path, args: RunArgs) -> Result<()> {
    let mut project = load(config_path)?;

    // CLI overrides take precedence over the config file.
    if let Some(ccy) = args.ccy {
        project.stratus.concurrency = ccy;
    }
    if args.fail_fast {
        project.stratus.fail_fast = true;
    }
    if let Some(timeout) = args.timeout {
        project.stratus.timeout_secs = timeout;
    }
    if let Some(name) = &args.select_suite {
        config::select_suite(&mut project, name)?;
    }

    info!(config = %config_path.display(), "project loaded");

    let BackendConfig::Container(backend_cfg) = project.backend.clone();

    // Setup phase: any failure here aborts before a single suite starts.
    let ccy = concurrency::effective(&ContainerCcyReader, project.stratus.concurrency).await?;
    let sharded = shard_suites(&project.root_dir, &project.suites, ccy)?;

    if args.dry_run {
        warn!("running in dry run mode");
        let names: Vec<&str> = sharded.iter().map(|s| s.name.as_str()).collect();
        info!("the following test suites would have run: [{}]", names.join(", "));
        return Ok(());
    }

    let backend = DockerBackend::new(None).context("failed to connect to the docker daemon")?;
    let service = Arc::new(ContainerJobService::new(backend, backend_cfg));

    let retrier: Box<dyn Retrier> = if project.stratus.retry_failed_only {
        Box::new(JunitRetrier::new(Arc::clone(&service)))
    } else {
        Box::new(ThresholdRetrier)
    };

    let cli_flags = serde_json::json!({
        "ccy": args.ccy,
        "failFast": args.fail_fast,
        "async": args.async_mode,
        "selectSuite": args.select_suite,
        "timeout": args.timeout,
    });

    let global_timeout = project.stratus.global_timeout();
    let report_cfg = project.report.clone();

    let mut orchestrator = Orchestrator::new(project, Arc::clone(&service), retrier)
        .with_async(args.async_mode)
        .with_show_console_log(args.show_console_log)
        .with_cli_flags(cli_flags)
        .with_downloader(ServiceDownloader(Arc::clone(&service)))
        .with_reporter(TableReporter::new(sharded.len()));

    if report_cfg.junit {
        orchestrator = orchestrator
            .with_reporter(JunitReporter::new(report_cfg.output_dir.join(&report_cfg.junit_file)));
    }
    if report_cfg.json {
        orchestrator = orchestrator
            .with_reporter(JsonReporter::new(report_cfg.output_dir.join(&report_cfg.json_file)));
    }

    let cancel = orchestrator.cancel_token();
    spawn_interrupt_handler(cancel.clone());
    if let Some(timeout) = global_timeout {
        spawn_global_timeout(cancel.clone(), timeout);
    }

    let result = orchestrator.run_suites(sharded, ccy).await;
    service.teardown().await;

    std::process::exit(result.exit_code());
}

/// Routes artifact downloads back to the job service, which implements
/// them for containers by copying the results directory out.
struct ServiceDownloader(Arc<ContainerJobService<DockerBackend>>);

#[async_trait::async_trait]
impl stratus::artifact::ArtifactDownloader for ServiceDownloader {
    async fn download(
        &self,
        job_id: &str,
        dest: &Path,
        patterns: &[String],
    ) -> Result<Vec<PathBuf>> {
        self.0.download(job_id, dest, patterns).await
    }
}

/// First interrupt requests a soft shutdown (finish in-flight suites, skip
/// the rest); a second one exits immediately.
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!(
            "\nStopping run. Waiting for in-progress suites to finish... \
             (press Ctrl-C again to exit without waiting)"
        );
        cancel.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(1);
        }
    });
}

/// The global timeout triggers the same soft shutdown as an interrupt and
/// hard-exits after a grace window.
fn spawn_global_timeout(cancel: CancellationToken, timeout: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        warn!(timeout = ?timeout, "global timeout reached, stopping run");
        cancel.cancel();

        tokio::time::sleep(SHUTDOWN_GRACE).await;
        warn!("shutdown grace window elapsed, exiting");
        std::process::exit(1);
    });
}

async fn validate(config_path: &Path) -> Result<()> {
    let project = load(config_path)?;

    // Shard patterns are part of the config contract; a pattern matching
    // zero files must fail here, not at run time.
    let ccy = concurrency::effective(&ContainerCcyReader, project.stratus.concurrency).await?;
    let sharded = shard_suites(&project.root_dir, &project.suites, ccy)?;

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Concurrency: {}", project.stratus.concurrency);
    println!("  Retries:     {}", project.stratus.retries);
    println!("  Region:      {}", project.stratus.region);
    println!(
        "  Suites:      {} ({} after sharding)",
        project.suites.len(),
        sharded.len()
    );

    let BackendConfig::Container(backend) = &project.backend;
    println!("  Backend:     container ({})", backend.image);

    Ok(())
}

async fn suites(config_path: &Path) -> Result<()> {
    let project = load(config_path)?;

    let ccy = concurrency::effective(&ContainerCcyReader, project.stratus.concurrency).await?;
    let sharded = shard_suites(&project.root_dir, &project.suites, ccy)?;

    println!("{} suites would run:", sharded.len());
    for suite in &sharded {
        println!("  {}", suite.name);
    }

    Ok(())
}
