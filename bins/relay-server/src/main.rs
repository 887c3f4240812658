mod broker;

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use relay_engine::{Engine, RelayConfig};

#[derive(Parser)]
#[command(name = "relay-server", about = "Per-stream real-time delivery gateway")]
struct Cli {
    /// Path to TOML configuration file. Defaults apply when omitted.
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<String>,

    /// Shared API key; overrides `[auth] api_key`.
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// API port; overrides `api_port`.
    #[arg(long, env = "WEBSOCKET_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!(config = %path, "loading configuration");
            match RelayConfig::load(path) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(error = %e, "failed to load config");
                    std::process::exit(1);
                }
            }
        }
        None => {
            tracing::info!("no configuration file given, using defaults");
            RelayConfig::default()
        }
    };
    if let Some(key) = cli.api_key {
        config.auth.api_key = Some(key);
    }
    if let Some(port) = cli.port {
        config.api_port = port;
    }

    let broker = match broker::create_broker(&config.broker) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "failed to create broker");
            std::process::exit(1);
        }
    };

    let port = config.api_port;
    let engine = match Engine::bootstrap(config, broker).await {
        Ok(e) => Arc::new(e),
        Err(e) => {
            tracing::error!(error = %e, "failed to bootstrap engine");
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn(relay_api_server::run(port, engine.clone(), shutdown.clone()));

    tracing::info!(port, "relay-server started, press Ctrl+C to stop");

    tokio::select! {
        result = &mut server => {
            match result {
                Ok(Ok(())) => tracing::warn!("API server stopped unexpectedly"),
                Ok(Err(e)) => tracing::error!(error = %e, "API server failed"),
                Err(e) => tracing::error!(error = %e, "API server task panicked"),
            }
            engine.shutdown().await;
            std::process::exit(1);
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down...");
        }
    }

    shutdown.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "API server failed during shutdown"),
        Err(e) => tracing::error!(error = %e, "API server task panicked"),
    }
    engine.shutdown().await;
    tracing::info!("relay-server stopped");
}
