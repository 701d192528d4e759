use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use flowctl::certificate::StaticCertificate;
use flowctl::commands;
use flowctl::config::{self, Config};
use flowctl::logging;
use flowctl::web;
use flowctl::{BridgeAdapter, SessionController};

#[derive(Parser, Debug)]
#[command(name = "flowctl")]
#[command(about = "Flow and session control plane for an intercepting debugging proxy", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Start a capture session and serve the control API (default)
    Run {
        /// Do not start capturing until asked through the API
        #[arg(long)]
        idle: bool,
    },
    /// Check configuration and list the configured rules
    Check {
        /// Also check that the engine bridge is reachable
        #[arg(long)]
        probe: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => config::load_from_path(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => config::load_from_env_or_file().context("Failed to load configuration")?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = load_config(args.config.as_ref())?;
    let _log_guard = logging::init(&config.logging, args.debug)?;

    match args.command.unwrap_or(Command::Run { idle: false }) {
        Command::Check { probe } => {
            commands::run_config_check(config, probe).await?;
            Ok(())
        }
        Command::Run { idle } => run(config, idle).await,
    }
}

async fn run(config: Config, idle: bool) -> anyhow::Result<()> {
    info!("Starting flowctl");
    info!("Loaded {} rule(s)", config.rules.len());

    let adapter = Arc::new(BridgeAdapter::new(&config.adapter));
    info!("Engine bridge at {}", adapter.url());

    let controller = Arc::new(
        SessionController::new(adapter, &config)?
            .with_certificates(Arc::new(StaticCertificate::new(config.certificate.clone()))),
    );

    let shutdown = CancellationToken::new();
    let web_handle = if config.api.enabled {
        info!(
            "Control API will be available on {}:{}",
            config.api.host, config.api.port
        );
        let controller = controller.clone();
        let api_config = config.api.clone();
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = web::start_server(controller, &api_config, shutdown).await {
                error!("Control API error: {}", e);
            }
        }))
    } else {
        None
    };

    if !idle {
        match controller.start(config.session.clone()).await {
            Ok(session) => info!(
                "Capturing on {} (session {:?})",
                config.session.listen_address(),
                session.session_id
            ),
            // keep serving the API so a consumer can retry
            Err(e) if web_handle.is_some() => error!("Failed to start capture session: {}", e),
            Err(e) => return Err(e).context("Failed to start capture session"),
        }
    }

    shutdown_signal().await;
    info!("Shutting down flowctl");

    let report = controller.stop().await?;
    for warning in &report.warnings {
        warn!("Stop warning: {}", warning);
    }

    shutdown.cancel();
    if let Some(handle) = web_handle {
        if tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .is_err()
        {
            warn!("Control API did not stop in time");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
