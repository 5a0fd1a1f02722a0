//! Sentinel agent entry point.
//!
//! Subcommands:
//!
//! - `sentinel` (default): load config, start the enabled watchers, run
//!   until SIGINT/SIGTERM.
//! - `validate-config <file>`: parse and validate an agent config file.
//! - `validate-connection <file>`: parse and check a connection-info file.
//!
//! Environment: `CATTLE_LOGLEVEL` selects the log level,
//! `CATTLE_AGENT_CONFIG` overrides the config path,
//! `CATTLE_AGENT_STRICT_VERIFY` enables strict TLS verification for the
//! remote watcher.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sentinel_agent::applier::{Applier, ApplierOptions};
use sentinel_agent::config::{self, AgentConfig};
use sentinel_agent::connect::{self, ConnectionInfo};
use sentinel_agent::image::{StagerConfig, Utility};
use sentinel_agent::localplan::LocalWatcher;
use sentinel_agent::remoteplan::RemoteWatcher;
use sentinel_agent::store::KubeSecretStore;

#[derive(Parser)]
#[command(name = "sentinel-agent", version, about = "Node-resident reconciliation agent")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the configured plan watchers (the default).
    Sentinel,
    /// Parse and validate an agent configuration file.
    ValidateConfig { file: String },
    /// Parse and check a connection-info file.
    ValidateConnection { file: String },
}

fn init_logging() {
    let level = std::env::var(config::LOG_LEVEL_ENV).unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn env_is_true(key: &str) -> bool {
    matches!(
        std::env::var(key).unwrap_or_default().to_lowercase().as_str(),
        "true" | "1"
    )
}

fn config_path() -> String {
    std::env::var(config::CONFIG_PATH_ENV)
        .unwrap_or_else(|_| config::DEFAULT_CONFIG_FILE.to_string())
}

fn validate_config(file: &str) -> anyhow::Result<()> {
    let parsed: AgentConfig = config::parse(file)?;
    parsed.validate()?;
    info!(file, "configuration is valid");
    Ok(())
}

fn validate_connection(file: &str) -> anyhow::Result<()> {
    let info: ConnectionInfo = config::parse(file)?;
    if info.namespace.is_empty() || info.secret_name.is_empty() {
        anyhow::bail!("connection info must name a namespace and a secret");
    }
    connect::parse_kube_config(&info.kube_config)?;
    info!(file, "connection info is valid");
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let config_file = config_path();
    info!(file = %config_file, "sentinel agent is starting");

    let cf: AgentConfig = config::parse(&config_file)?;
    cf.validate()?;
    info!(dir = %cf.work_dir, "using directory for work");

    let non_empty = |s: &String| (!s.is_empty()).then(|| PathBuf::from(s));
    let stager = Arc::new(Utility::new(StagerConfig {
        images_dir: non_empty(&cf.images_dir),
        agent_registries_file: non_empty(&cf.agent_registries_file),
        credential_provider_config: non_empty(&cf.image_credential_provider_config),
        credential_provider_bin_dir: non_empty(&cf.image_credential_provider_bin_dir),
    }));
    let applier = Arc::new(Applier::new(
        ApplierOptions {
            work_dir: PathBuf::from(&cf.work_dir),
            preserve_work_dir: cf.preserve_work_dir,
            applied_plan_dir: non_empty(&cf.applied_plan_dir),
            interlock_dir: non_empty(&cf.interlock_dir),
        },
        stager,
    ));

    let ctx = CancellationToken::new();
    let mut tasks = Vec::new();

    if cf.remote_enabled {
        info!("starting remote watch of plans");
        let conn_info: ConnectionInfo = config::parse(&cf.connection_info_file)?;
        let strict_verify = env_is_true(config::STRICT_VERIFY_ENV);
        let client = connect::connect(&conn_info, strict_verify).await?;
        let store = Arc::new(KubeSecretStore::new(
            client,
            &conn_info.namespace,
            &conn_info.secret_name,
        ));
        let watcher = RemoteWatcher::new(applier.clone(), store);
        let child_ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = watcher.run(child_ctx).await {
                // Identity violations must surface to a supervisor so the
                // process restarts with clean state.
                error!(%err, "remote watcher failed");
                std::process::exit(1);
            }
        }));
    }

    if cf.local_enabled {
        info!(dir = %cf.local_plan_dir, "starting local watch of plans");
        let watcher = LocalWatcher::new(applier.clone(), vec![PathBuf::from(&cf.local_plan_dir)]);
        let child_ctx = ctx.clone();
        tasks.push(tokio::spawn(watcher.run(child_ctx)));
    }

    shutdown_signal().await;
    info!("shutdown requested");
    ctx.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!("sentinel agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!(%err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();
    let result = match cli.command {
        None | Some(Command::Sentinel) => run().await,
        Some(Command::ValidateConfig { file }) => validate_config(&file),
        Some(Command::ValidateConnection { file }) => validate_connection(&file),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "fatal");
            ExitCode::FAILURE
        }
    }
}
