//! Integration tests for the agent API endpoints

use agent_lib::{
    health::{PipelineHealth, Stage, StagePhase},
    observability::AgentMetrics,
};
use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tower::ServiceExt;

#[derive(Clone)]
pub struct AppState {
    pub health: PipelineHealth,
    pub metrics: AgentMetrics,
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.health.report().await;
    let status_code = match report.status {
        StagePhase::Failed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status_code, Json(report))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health.readiness().await;
    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(readiness))
}

async fn version() -> impl IntoResponse {
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTime": "unknown",
        "gitCommit": "unknown",
    }))
}

async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

fn create_test_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/version", get(version))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Pipeline with discovery/collector/analyzer registered but not yet
/// running, mirroring the window between construction and spawn
async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health = PipelineHealth::new();
    health.register(Stage::Discovery).await;
    health.register(Stage::Collector).await;
    health.register(Stage::Analyzer).await;

    let metrics = AgentMetrics::new();
    let state = Arc::new(AppState { health, metrics });
    let router = create_test_router(state.clone());

    (router, state)
}

async fn start_all_stages(state: &AppState) {
    state.health.mark_running(Stage::Discovery).await;
    state.health.mark_running(Stage::Collector).await;
    state.health.mark_running(Stage::Analyzer).await;
}

#[tokio::test]
async fn test_healthz_reports_starting_before_stages_spawn() {
    let (app, _state) = setup_test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    // Starting is alive, just not ready
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(health["status"], "starting");
    assert_eq!(health["stages"]["discovery"]["phase"], "starting");
}

#[tokio::test]
async fn test_healthz_running_once_stages_start() {
    let (app, state) = setup_test_app().await;
    start_all_stages(&state).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(health["status"], "running");
}

#[tokio::test]
async fn test_healthz_degraded_still_returns_ok() {
    let (app, state) = setup_test_app().await;
    start_all_stages(&state).await;

    // Debugger fallback keeps the agent serving
    state
        .health
        .mark_degraded(Stage::Analyzer, "debugger unavailable, using basic analysis")
        .await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(health["status"], "degraded");
    assert_eq!(
        health["stages"]["analyzer"]["detail"],
        "debugger unavailable, using basic analysis"
    );
}

#[tokio::test]
async fn test_healthz_returns_503_on_failed_stage() {
    let (app, state) = setup_test_app().await;
    start_all_stages(&state).await;

    state
        .health
        .mark_failed(Stage::Collector, "coredump directory missing")
        .await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(health["status"], "failed");
}

#[tokio::test]
async fn test_readyz_waits_for_every_stage() {
    let (app, state) = setup_test_app().await;

    state.health.mark_running(Stage::Discovery).await;
    state.health.mark_running(Stage::Analyzer).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/readyz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(readiness["ready"], false);
    assert_eq!(readiness["waitingOn"], serde_json::json!(["collector"]));

    state.health.mark_running(Stage::Collector).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/readyz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_readyz_ignores_disabled_stages() {
    let (app, state) = setup_test_app().await;
    start_all_stages(&state).await;
    state.health.disable(Stage::Cleaner).await;
    state.health.disable(Stage::ControllerLink).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/readyz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_version_endpoint_never_fails() {
    let (app, _state) = setup_test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/version")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let version: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert!(version["version"].is_string());
    assert!(version["buildTime"].is_string());
    assert!(version["gitCommit"].is_string());
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, state) = setup_test_app().await;

    state.metrics.inc_coredumps_discovered();
    state.metrics.observe_value_score(8.0);
    state.metrics.set_agent_up(true);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("milvus_coredump_agent_coredumps_discovered_total"));
    assert!(metrics_text.contains("milvus_coredump_agent_value_score_distribution"));
    assert!(metrics_text.contains("milvus_coredump_agent_up"));
}

#[tokio::test]
async fn test_value_score_histogram_has_unit_buckets() {
    let (app, state) = setup_test_app().await;

    state.metrics.observe_value_score(4.5);
    state.metrics.observe_value_score(9.5);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("milvus_coredump_agent_value_score_distribution_bucket"));
    assert!(metrics_text.contains("le=\"5\""));
    assert!(metrics_text.contains("le=\"10\""));
}
