//! Milvus Coredump Agent
//!
//! Per-node daemon that watches Milvus pods for abnormal terminations,
//! correlates them with coredump files, analyzes and scores the dumps,
//! stores the valuable ones, and decommissions crash-looping instances
//! after controller arbitration.

use agent_lib::{
    config::Config,
    controller::ControllerClient,
    health::PipelineHealth,
    observability::{AgentMetrics, StructuredLogger},
    persistence::Database,
    pipeline::Pipeline,
};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Config file location, overridable for out-of-cluster runs
fn config_path() -> PathBuf {
    std::env::var("AGENT_CONFIG_PATH")
        .unwrap_or_else(|_| "/etc/agent/config.yaml".to_string())
        .into()
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

    info!(version = AGENT_VERSION, "Starting Milvus coredump agent");

    config.validate().context("invalid configuration")?;

    let logger = StructuredLogger::new(&config.agent.node_name);
    logger.log_startup(AGENT_VERSION);

    let kube_client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let db = match Database::open(&config.database) {
        Ok(db) => Some(Arc::new(db)),
        Err(e) => return Err(e).context("failed to initialize database"),
    };

    let controller = if config.controller.enabled {
        let client = Arc::new(
            ControllerClient::new(
                &config.controller,
                config.agent.node_name.clone(),
                AGENT_VERSION.to_string(),
            )
            .context("failed to create controller client")?,
        );
        if !client.is_available().await {
            warn!(url = %config.controller.url, "Controller not reachable at startup");
        }
        Some(client)
    } else {
        info!("Controller integration disabled, running standalone");
        None
    };

    let health = PipelineHealth::new();
    let metrics = AgentMetrics::new();

    let app_state = Arc::new(api::AppState::new(health.clone(), metrics.clone()));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let api_handle = tokio::spawn(api::serve(
        config.agent.health_port,
        app_state,
        shutdown_tx.subscribe(),
    ));
    let metrics_handle = if config.monitor.prometheus_enabled {
        Some(tokio::spawn(api::serve_metrics(
            config.agent.metrics_port,
            shutdown_tx.subscribe(),
        )))
    } else {
        None
    };

    let mut pipeline = Pipeline::start(
        config.clone(),
        kube_client,
        db,
        controller,
        health.clone(),
    )
    .await
    .context("failed to start pipeline")?;

    let outcome = tokio::select! {
        result = pipeline.run_until(shutdown_tx.subscribe()) => result,
        _ = tokio::signal::ctrl_c() => {
            logger.log_shutdown("SIGINT received");
            Ok(())
        }
    };

    let _ = shutdown_tx.send(());
    pipeline.shutdown().await;
    let _ = api_handle.await;
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    info!("Milvus coredump agent stopped");
    outcome
}
