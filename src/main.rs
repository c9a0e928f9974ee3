mod admin;
mod backend;
mod cli;
mod config;
mod protocol;
mod registry;
mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Load config, connect backends, and build the wired-up application state
/// ready to serve.
pub async fn initialize(cli: &cli::Cli) -> Result<server::AppState> {
    // RUST_LOG, if set, overrides the resolved --log-level/MCP_0NE_LOG_LEVEL/default directive.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(cli.effective_log_level()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let config = config::Config::load(&cli.config)?;
    info!(
        config_path = %cli.config.display(),
        backends = config.backends.len(),
        "mcp-0ne starting"
    );

    let registry = Arc::new(registry::Registry::new(cli.config.clone(), config));

    let results = registry.load_from_config().await;
    for (backend_id, status) in &results {
        info!(backend = %backend_id, status = %status, "backend loaded");
    }

    registry.ensure_all_connected().await;
    info!(
        tools = registry.list_all_tools().await.len(),
        backends = registry.list_backends().await.len(),
        "mcp-0ne ready"
    );

    let protocol = Arc::new(protocol::GatewayProtocol::new(registry.clone()));
    Ok(server::AppState { protocol, registry })
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let host = cli.effective_host();
    let port = cli.effective_port();

    let state = initialize(&cli).await?;
    let registry = state.registry.clone();
    let app = server::router(state);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "mcp-0ne listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    for info in registry.list_backends().await {
        let Some(id) = info["id"].as_str() else { continue };
        if let Some(backend) = registry.get_backend(id).await {
            backend.disconnect().await;
        }
    }
    info!("mcp-0ne stopped");

    Ok(())
}
