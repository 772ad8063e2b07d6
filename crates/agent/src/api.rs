//! HTTP API for health checks, version info and Prometheus metrics

use agent_lib::{
    health::{PipelineHealth, StagePhase},
    observability::AgentMetrics,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health: PipelineHealth,
    pub metrics: AgentMetrics,
}

impl AppState {
    pub fn new(health: PipelineHealth, metrics: AgentMetrics) -> Self {
        Self { health, metrics }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct VersionInfo {
    version: &'static str,
    build_time: &'static str,
    git_commit: &'static str,
}

fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION"),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown"),
        git_commit: option_env!("GIT_COMMIT").unwrap_or("unknown"),
    }
}

/// Liveness: 200 unless a pipeline stage has failed. Degraded fallback
/// modes keep serving.
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.health.report().await;

    let status_code = match report.status {
        StagePhase::Failed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };

    (status_code, Json(report))
}

/// Readiness: 200 once every enabled stage has left Starting
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Build metadata; never fails
async fn version() -> impl IntoResponse {
    (StatusCode::OK, Json(version_info()))
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, Vec::new()).into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/version", get(version))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Create the standalone metrics router served on the metrics port
pub fn create_metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics))
}

/// Start the health API server; in-flight requests get 5 seconds to
/// drain on shutdown before the server is aborted
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);
    serve_router(port, app, shutdown, "health").await
}

/// Start the Prometheus exposition server
pub async fn serve_metrics(port: u16, shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
    serve_router(port, create_metrics_router(), shutdown, "metrics").await
}

async fn serve_router(
    port: u16,
    app: Router,
    mut shutdown: broadcast::Receiver<()>,
    kind: &'static str,
) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, server = kind, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let mut drain = shutdown.resubscribe();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = drain.recv().await;
    });

    let mut handle = tokio::spawn(server.into_future());

    tokio::select! {
        result = &mut handle => {
            result??;
        }
        _ = shutdown.recv() => {
            if tokio::time::timeout(std::time::Duration::from_secs(5), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }
    }

    Ok(())
}
