use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use secrecy::SecretString;

use task_bridge::config::{WorkerConfig, DEFAULT_ENGINE_BASE_URL, DEFAULT_EXECUTABLE};
use task_bridge::engine::{Engine, EngineClient};
use task_bridge::error::Error;
use task_bridge::package::{FailurePolicy, Package};
use task_bridge::registry::TopicRegistry;
use task_bridge::worker::Scheduler;

#[derive(Parser)]
#[command(
    name = "task-bridge",
    version,
    about = "Serve packaged task suites as BPMN external tasks"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve one or more packages as external task workers.
    Serve(ServeArgs),
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Package references: directories or zip archives.
    #[arg(required = true)]
    packages: Vec<PathBuf>,

    #[arg(long, env = "ENGINE_REST_BASE_URL", default_value = DEFAULT_ENGINE_BASE_URL)]
    base_url: String,

    /// Opaque Authorization header value, sent verbatim.
    #[arg(long, env = "ENGINE_REST_AUTHORIZATION", hide_env_values = true)]
    authorization: Option<String>,

    /// Per-call deadline for engine requests, in seconds.
    #[arg(long, env = "ENGINE_REST_TIMEOUT_SECONDS", default_value_t = 20)]
    timeout: u64,

    /// Long-poll TTL for fetch-and-lock, in seconds.
    #[arg(long, env = "ENGINE_REST_POLL_TTL_SECONDS", default_value_t = 20)]
    poll_ttl: u64,

    /// Lock duration per lease, in seconds.
    #[arg(long, env = "ENGINE_REST_LOCK_TTL_SECONDS", default_value_t = 30)]
    lock_ttl: u64,

    /// Cap on concurrent in-flight leases.
    #[arg(long, env = "TASKS_MAX_JOBS", default_value_t = 1)]
    max_jobs: usize,

    #[arg(long, env = "TASKS_WORKER_ID")]
    worker_id: Option<String>,

    /// Secrets profile applied to packages that declare secrets.
    #[arg(long, env = "TASKS_SECRETS_PROFILE")]
    secrets: Option<String>,

    /// Executor binary invoked per lease.
    #[arg(long, env = "TASKS_EXECUTABLE", default_value = DEFAULT_EXECUTABLE)]
    executable: String,

    /// Failure policy for topics whose manifest omits one.
    #[arg(long, value_enum, default_value_t = FailurePolicy::Fail)]
    on_failure: FailurePolicy,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl ServeArgs {
    fn into_config(self) -> (Vec<PathBuf>, WorkerConfig) {
        let defaults = WorkerConfig::default();
        let config = WorkerConfig {
            base_url: self.base_url.trim_end_matches('/').to_string(),
            authorization: self.authorization.map(SecretString::from),
            timeout: Duration::from_secs(self.timeout),
            poll_ttl: Duration::from_secs(self.poll_ttl),
            lock_ttl: Duration::from_secs(self.lock_ttl),
            worker_id: self
                .worker_id
                .unwrap_or_else(|| defaults.worker_id.clone()),
            max_jobs: self.max_jobs,
            default_on_failure: self.on_failure,
            secrets_profile: self.secrets,
            executable: self.executable,
            ..defaults
        };
        (self.packages, config)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let Command::Serve(args) = cli.command;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.clone())),
        )
        .with_target(false)
        .init();

    let (package_refs, config) = args.into_config();

    if let Err(e) = config.validate() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    let mut packages = Vec::new();
    for path in &package_refs {
        match Package::load(path) {
            Ok(package) => {
                tracing::info!(
                    package = %package.display_name(),
                    fingerprint = %&package.fingerprint()[..12],
                    "Loaded package"
                );
                packages.push(package);
            }
            Err(e) => {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        }
    }

    let registry = match TopicRegistry::build(packages, &config) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let engine: Engine = match EngineClient::new(&config) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let scheduler = Scheduler::new(config, engine, registry);
    let shutdown = scheduler.shutdown_handle();

    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutdown signal received, draining in-flight leases");
        shutdown.trigger();

        // A second signal aborts without terminal reports; the engine
        // reclaims leases via lock expiry.
        wait_for_signal().await;
        tracing::warn!("Second signal received, aborting immediately");
        std::process::exit(2);
    });

    match scheduler.run().await {
        Ok(()) => std::process::exit(0),
        Err(e @ Error::Config(_)) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
