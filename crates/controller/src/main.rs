//! Milvus Coredump Controller
//!
//! Cluster-wide arbiter for the per-node agents: holds the LLM cost
//! ledger, the cleanup lease registry, and the agent liveness table, and
//! serves the HTTP arbitration API.

use agent_lib::{
    config::Config,
    controller::{router, ControllerMetrics, Manager},
    persistence::Database,
};
use anyhow::{Context, Result};
use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Config file location, overridable for out-of-cluster runs
fn config_path() -> PathBuf {
    std::env::var("CONTROLLER_CONFIG_PATH")
        .unwrap_or_else(|_| "/etc/controller/config.yaml".to_string())
        .into()
}

/// HTTP API listen port
fn http_port() -> u16 {
    std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8090)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config =
        Config::load_or_default(&config_path()).context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.agent.log_level.clone())),
        )
        .with(fmt::layer().json())
        .init();

    info!(version = CONTROLLER_VERSION, "Starting Milvus coredump controller");

    let db = Arc::new(Database::open(&config.database).context("failed to initialize database")?);

    // Initialize the controller gauges before the first scrape
    let _metrics = ControllerMetrics::new();

    let manager = Arc::new(Manager::new(config, Some(db)));
    manager.update_statistics();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let background = tokio::spawn(
        manager
            .clone()
            .run_background_loops(shutdown_tx.subscribe()),
    );

    let addr = format!("0.0.0.0:{}", http_port());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %addr, "HTTP API server listening");

    let mut drain = shutdown_tx.subscribe();
    let server = axum::serve(listener, router(manager.clone()))
        .with_graceful_shutdown(async move {
            let _ = drain.recv().await;
        });
    let mut server_handle = tokio::spawn(server.into_future());

    tokio::select! {
        result = &mut server_handle => {
            let _ = shutdown_tx.send(());
            let _ = background.await;
            result??;
            info!("Milvus coredump controller stopped");
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(());
    if tokio::time::timeout(std::time::Duration::from_secs(5), &mut server_handle)
        .await
        .is_err()
    {
        server_handle.abort();
    }
    let _ = background.await;

    info!("Milvus coredump controller stopped");
    Ok(())
}
