//! tunnel-manager orchestrator daemon
//!
//! Serves the HTTP API and supervises tunnel clients, logins and
//! deployments until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tm_core::config::{self, OrchestratorConfig};
use tm_core::ConfigError;
use tm_orchestrator::{http, Orchestrator};

#[derive(Parser)]
#[command(name = "tm-orchestrator")]
#[command(about = "Tunnel and deployment orchestrator")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address for the HTTP API (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Data directory for stores, certificates and deployments (overrides config)
    #[arg(long, env = "TM_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = resolve_config(&args)?;
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("Failed to create data directory {:?}", config.data_dir))?;

    tracing::info!(
        "tm-orchestrator {} starting (data dir {:?})",
        env!("CARGO_PKG_VERSION"),
        config.data_dir
    );

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;
    tracing::info!("HTTP API listening on {}", config.bind_address);

    let orchestrator = Arc::new(Orchestrator::new(config));
    let cancel = CancellationToken::new();
    tokio::spawn(watch_signals(cancel.clone()));

    axum::serve(listener, http::router(Arc::clone(&orchestrator)))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("HTTP server failed")?;

    tracing::info!("Stopping supervised processes...");
    orchestrator.shutdown().await;
    tracing::info!("Orchestrator stopped");
    Ok(())
}

/// `RUST_LOG` wins; otherwise `--log-level`, or debug with `--foreground`
fn init_logging(args: &Args) {
    let level = if args.foreground { "debug" } else { args.log_level.as_str() };
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Explicit `--config` must load; the default path is optional
fn resolve_config(args: &Args) -> Result<OrchestratorConfig> {
    let mut config = match &args.config {
        Some(path) => config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => {
            let path = config::default_config_path();
            match config::load_config(&path) {
                Ok(config) => config,
                Err(ConfigError::NotFound(_)) => {
                    tracing::info!("No config at {:?}, using defaults", path);
                    OrchestratorConfig::default()
                }
                Err(e) => {
                    tracing::warn!("Ignoring config at {:?}: {}", path, e);
                    OrchestratorConfig::default()
                }
            }
        }
    };

    if let Some(bind) = &args.bind {
        config.bind_address = bind.clone();
    }
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Cancel `token` on Ctrl+C or SIGTERM
async fn watch_signals(token: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Ctrl+C received, shutting down"),
        _ = terminate => tracing::info!("SIGTERM received, shutting down"),
    }
    token.cancel();
}
