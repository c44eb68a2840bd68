//! CryoBoost server entry point.
//!
//! Loads and validates the process-wide configuration, then binds the
//! HTTP/WebSocket surface. A configuration failure is fatal: the process
//! exits non-zero without binding the port.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cb_core::config::load_config;
use cb_core::scheduler::SlurmClient;
use cb_server::{create_routes, AppState, ProjectRegistry};

#[derive(Parser, Debug)]
#[command(name = "cb-server", about = "CryoBoost pipeline orchestration server")]
struct Cli {
    /// Bind address.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Listen port.
    #[arg(long, default_value_t = 8081)]
    port: u16,

    /// Path to the configuration document.
    #[arg(long, default_value = "config/config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = load_config(&cli.config)
        .with_context(|| format!("cannot start: invalid configuration {}", cli.config.display()))?;
    let config = Arc::new(config);

    // The installation root is wherever the config directory lives; the
    // shipped templates sit next to it.
    let server_root = cli
        .config
        .parent()
        .and_then(|p| p.parent())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let registry = Arc::new(ProjectRegistry::new(
        Arc::clone(&config),
        Arc::new(SlurmClient::new()),
    ));
    let state = AppState {
        config,
        registry,
        server_root,
    };

    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!("listening on {addr}");

    axum::serve(listener, create_routes(state))
        .await
        .context("server terminated")?;
    Ok(())
}
