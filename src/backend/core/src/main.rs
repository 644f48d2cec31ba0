//! Relay Server - main entry point.
//!
//! Runs the job worker, the admission limiters, the monitor loop and the
//! admin HTTP API in one process.

use clap::Parser;
use std::net::SocketAddr;

use relay_core::{
    api::{self, AppState},
    config::Config,
    runtime::Runtime,
    telemetry,
};

#[derive(Parser, Debug)]
#[command(name = "relay-server", version, about = "Relay job queue and admission limiter")]
struct Args {
    /// Configuration file (TOML, YAML or JSON); environment overrides apply on top
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<String>,

    /// Admin API port, overriding `server.port`
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let telemetry = telemetry::init_telemetry(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        store = ?config.store.backend,
        "Starting Relay Server"
    );

    let runtime = Runtime::builder(config.clone()).build().await?;
    runtime.start()?;

    let app = api::build_router(AppState::from_runtime(&runtime, telemetry.metrics.clone()));

    let host: std::net::IpAddr = config.server.host.parse()?;
    let addr = SocketAddr::new(host, config.server.port);
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(report) = runtime.shutdown().await {
        if !report.graceful {
            tracing::warn!(aborted_slots = report.aborted_slots, "In-flight jobs left for the reaper");
        }
    }
    tracing::info!("Server shutdown complete");
    telemetry.shutdown();

    Ok(())
}

/// Wait for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
