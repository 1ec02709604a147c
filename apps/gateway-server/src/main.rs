//! Gateway Server - standalone binary for the real-time translation gateway.
//!
//! Wires `gateway_core`'s library surface into a runnable process: parses
//! CLI flags, layers configuration, binds the `/ws` and `/healthz` routes,
//! and runs a background reaper for idle calls until a shutdown signal
//! arrives.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use gateway_core::{AppState, CallManager, TaskSpawner, TokioSpawner};
use tokio::signal;

/// Gateway Server - headless translation gateway.
#[derive(Parser, Debug)]
#[command(name = "gateway-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "GATEWAY_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(short = 'b', long, default_value = "0.0.0.0:8080", env = "GATEWAY_BIND_ADDR")]
    bind_addr: SocketAddr,

    /// Provider adapter to route calls through (overrides config file).
    #[arg(long, env = "GATEWAY_PROVIDER")]
    provider: Option<String>,

    /// Provider WebSocket URL (overrides config file).
    #[arg(long, env = "GATEWAY_PROVIDER_URL")]
    provider_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();
    tracing_subscriber::fmt::init();

    log::info!("gateway-server v{}", env!("CARGO_PKG_VERSION"));

    let mut gateway_config = config::load_yaml(args.config.as_deref()).context("failed to load configuration")?;

    if let Some(provider) = args.provider {
        gateway_config.provider = provider;
    }
    if let Some(provider_url) = args.provider_url {
        gateway_config.provider_url = provider_url;
    }

    gateway_config
        .validate()
        .map_err(|err| anyhow::anyhow!("invalid configuration: {err}"))?;

    let config = Arc::new(gateway_config);
    let call_manager = Arc::new(CallManager::new());

    let reaper_manager = call_manager.clone();
    let reaper_config = config.clone();
    let reaper_handle = TokioSpawner::current().spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(reaper_config.cleanup_interval_seconds));
        loop {
            interval.tick().await;
            reaper_manager.reap_idle_calls(reaper_config.call_ttl_minutes).await;
        }
    });

    let state = AppState {
        call_manager,
        config: config.clone(),
    };
    let app = gateway_core::build_router(state);

    let listener = tokio::net::TcpListener::bind(args.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", args.bind_addr))?;
    log::info!("listening on {}", args.bind_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app.into_make_service()).await {
            log::error!("server error: {err}");
        }
    });

    shutdown_signal().await;
    log::info!("shutdown signal received, cleaning up...");

    reaper_handle.abort();
    server_handle.abort();

    log::info!("shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
