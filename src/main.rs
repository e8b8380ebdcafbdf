use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use payment_failover::{handlers, AppState, Config};

#[derive(Debug, Parser)]
#[command(name = "payment-failover", about = "Health-aware payment routing with automatic recovery")]
struct Cli {
    /// TOML file layered over the environment configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the configured listen port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(port) = cli.port {
        config.server_port = port;
    }
    info!("Starting payment failover router on port {}", config.server_port);

    let state = Arc::new(AppState::build(config).await.context("wiring services")?);
    state.monitor.start();

    let app = handlers::router(state.clone());
    let addr = format!("0.0.0.0:{}", state.config.server_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.shutdown.clone()))
        .await
        .context("serving HTTP")?;

    state.shutdown().await;
    Ok(())
}

/// Resolves on ctrl-c after cancelling in-flight retry loops, so open
/// requests drain quickly.
async fn shutdown_signal(loops: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
    loops.cancel();
}
