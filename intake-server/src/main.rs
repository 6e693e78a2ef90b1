//! # intaked
//!
//! Watches the configured inbox roots and hands every file that has stopped
//! being written to the processor bound to its root.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use intake_config::{Config, ConfigLoad, ConfigLoader};
use intake_core::{IntakeRuntime, ProcessRunner, TokioProcessRunner, recover};
use intake_server::{AppState, build_checker, build_table, runtime_config, spawn_status_server};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "intaked")]
#[command(about = "Watch inbox directories and process each file once it is complete")]
struct Cli {
    /// Configuration file (TOML or JSON)
    #[arg(long, env = "INTAKE_CONFIG")]
    config: Option<PathBuf>,

    /// `.env` file to load before reading the configuration
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long, conflicts_with = "recover_only")]
    check: bool,

    /// Replay leftover recovery markers under every root and exit
    #[arg(long)]
    recover_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,intake=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&cli)?;

    if cli.check {
        info!(
            roots = config.bindings.len(),
            processors = config.processors.len(),
            scratch = %config.scratch_dir.display(),
            "configuration is valid"
        );
        return Ok(());
    }

    if cli.recover_only {
        return run_recovery(&config).await;
    }

    run_daemon(config).await
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = &cli.env_file {
        loader = loader.with_env_file(path);
    }

    let ConfigLoad { config, warnings } = loader.load().context("failed to load configuration")?;

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.path {
        info!(path = %path.display(), source = ?config.metadata.source, "configuration loaded");
    }
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    Ok(config)
}

async fn run_recovery(config: &Config) -> anyhow::Result<()> {
    let roots: Vec<PathBuf> = config.roots().map(Path::to_path_buf).collect();
    let report = recover(&roots).await;
    info!(
        restored = report.restored,
        discarded = report.discarded,
        failed = report.failed,
        "recovery finished"
    );
    if report.failed > 0 {
        bail!("{} recovery marker(s) could not be resolved", report.failed);
    }
    Ok(())
}

async fn run_daemon(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let runner: Arc<dyn ProcessRunner> = Arc::new(TokioProcessRunner);
    let table = build_table(&config, Arc::clone(&runner))?;
    let checker = build_checker(&config.availability, runner);

    let runtime = IntakeRuntime::start(table, checker, runtime_config(&config))
        .await
        .context("failed to start intake runtime")?;

    let report = runtime.recovery_report();
    if report.total() > 0 {
        info!(
            restored = report.restored,
            discarded = report.discarded,
            failed = report.failed,
            "startup recovery replayed markers"
        );
    }

    let server = match config.status {
        Some(status) => {
            let state = AppState::new(runtime.status_handle(), Arc::clone(&config));
            let (_, handle) = spawn_status_server(status.bind, state, runtime.shutdown_token())
                .await
                .with_context(|| format!("failed to bind status surface on {}", status.bind))?;
            Some(handle)
        }
        None => None,
    };

    shutdown_signal().await;
    runtime.shutdown().await;

    if let Some(handle) = server {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = %err, "status surface failed"),
            Err(err) => error!(error = %err, "status surface task panicked"),
        }
    }

    info!("intaked stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown requested");
}
