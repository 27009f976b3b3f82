use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::header::CONTENT_TYPE,
    response::IntoResponse,
    routing::get,
    Router,
};
use clap::Parser;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod backend;
mod config;
mod connect;
mod guacd;
mod headers;
mod http_tunnel;
mod metrics;
mod tls;
mod tunnel;
mod tunnel_map;
mod ws_tunnel;

#[cfg(test)]
mod test_support;

use config::RelayConfig;
use connect::{GuacdConnector, TunnelConnector};
use metrics::Metrics;
use tunnel_map::TunnelMap;

/// GuacTunnel relay: carries Guacamole protocol traffic between browsers
/// and guacd over HTTP long-polling or WebSocket.
#[derive(Parser, Debug)]
#[command(name = "guactunnel-relay", version, about)]
struct Cli {
    /// Config file (default: guactunnel.yml in the working or home directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the config file
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone)]
pub struct AppState {
    tunnels: TunnelMap,
    connector: Arc<dyn TunnelConnector>,
    metrics: Metrics,
    websocket_buffer_size: usize,
}

impl AppState {
    pub fn new(config: &RelayConfig, connector: Arc<dyn TunnelConnector>) -> Self {
        let metrics = Metrics::new();
        Self {
            tunnels: TunnelMap::new(config.http_tunnel.idle_timeout(), metrics.clone()),
            connector,
            metrics,
            websocket_buffer_size: config.websocket.buffer_size,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route(
            "/tunnel",
            get(http_tunnel::tunnel_handler).post(http_tunnel::tunnel_handler),
        )
        .route("/websocket-tunnel", get(ws_tunnel::websocket_handler))
        .route("/health", get(|| async { "OK" }))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "guactunnel_relay=debug,guactunnel_shared=debug"
    } else {
        "guactunnel_relay=info,guactunnel_shared=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let mut config = match cli.config.or_else(RelayConfig::find_config) {
        Some(path) => {
            info!("Loading config from {}", path.display());
            RelayConfig::load(&path)?
        }
        None => {
            info!("No config file found, using defaults");
            RelayConfig::default()
        }
    };
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    let connector = GuacdConnector::from_config(&config).context("Failed to set up guacd connector")?;
    let state = AppState::new(&config, Arc::new(connector));
    tokio::spawn(state.tunnels.clone().run_reaper());

    info!(
        "GuacTunnel Relay on {} (guacd: {}:{}{}, {} connections)",
        config.listen,
        config.guacd.host,
        config.guacd.port,
        if config.guacd.ssl { ", TLS" } else { "" },
        config.connections.len()
    );

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}
