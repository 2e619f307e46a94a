//! scout - service discovery supervisor
//!
//! Watches configuration sources, runs one discovery pipeline per
//! configuration document, and writes rendered artifacts to the configured
//! sinks until terminated by SIGINT, SIGTERM, or SIGHUP.

use std::io::IsTerminal;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scout_engine::provider::{CmapProvider, FileProvider};
use scout_engine::supervisor::DefaultFactory;
use scout_engine::{ConfigProvider, EngineError, Supervisor};

#[derive(Debug, Parser)]
#[command(name = "scout", about = "Service discovery supervisor")]
struct Cli {
    /// Configuration file path (shell glob)
    #[arg(long, env = "NETDATA_SD_CONFIG_FILE")]
    config_file: Option<String>,

    /// Configuration ConfigMap (name:key)
    #[arg(long, env = "NETDATA_SD_CONFIG_MAP")]
    config_map: Option<String>,

    /// Debug mode
    #[arg(short = 'd', long)]
    debug: bool,
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn new_provider(cli: &Cli) -> Result<Box<dyn ConfigProvider>, EngineError> {
    if let Some(pattern) = cli.config_file.as_ref().filter(|p| !p.is_empty()) {
        return Ok(Box::new(FileProvider::new(vec![pattern.clone()])));
    }

    let Some(cmap) = cli.config_map.as_ref().filter(|c| !c.is_empty()) else {
        return Err(EngineError::Config(
            "configuration source not set".to_string(),
        ));
    };
    let parts: Vec<&str> = cmap.trim().split(':').collect();
    let [name, key] = parts.as_slice() else {
        return Err(EngineError::Config(format!(
            "config-map parameter bad syntax ('{cmap}')"
        )));
    };
    if name.is_empty() || key.is_empty() {
        return Err(EngineError::Config(format!(
            "config-map parameter bad syntax ('{cmap}')"
        )));
    }
    let namespace = std::env::var("MY_POD_NAMESPACE").unwrap_or_default();
    Ok(Box::new(CmapProvider::new(namespace, *name, *key).await?))
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            std::process::exit(if err.use_stderr() { 1 } else { 0 });
        }
    };
    init_logging(cli.debug);

    let provider = match new_provider(&cli).await {
        Ok(provider) => provider,
        Err(err) => {
            tracing::error!(error = %err, "failed to create config provider");
            std::process::exit(1);
        }
    };

    let stdout_enabled = std::io::stdout().is_terminal();
    let supervisor = Supervisor::new(provider, Box::new(DefaultFactory::new(stdout_enabled)));

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(supervisor.run(cancel.clone()));

    wait_for_signal().await;
    cancel.cancel();
    let _ = handle.await;
}

async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(err) => {
            tracing::error!(error = %err, "failed to install signal handler");
            return;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            tracing::error!(error = %err, "failed to install signal handler");
            return;
        }
    };
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(err) => {
            tracing::error!(error = %err, "failed to install signal handler");
            return;
        }
    };

    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = hangup.recv() => "SIGHUP",
    };
    info!(signal = name, "received signal, terminating");
}
