//! HTTP arbitration API served by the controller process

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tracing::warn;

use super::{
    AIAnalysisRequest, CleanupRequest, ControllerMetrics, HeartbeatRequest, Manager,
};

/// Build the controller router
pub fn router(manager: Arc<Manager>) -> Router {
    Router::new()
        .route("/api/ai-analysis/request", post(ai_analysis))
        .route("/api/cleanup/request", post(cleanup))
        .route("/api/heartbeat", post(heartbeat))
        .route("/api/stats", get(stats))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(manager)
}

async fn ai_analysis(
    State(manager): State<Arc<Manager>>,
    Json(req): Json<AIAnalysisRequest>,
) -> impl IntoResponse {
    Json(manager.process_ai_request(&req, Utc::now()))
}

async fn cleanup(
    State(manager): State<Arc<Manager>>,
    Json(req): Json<CleanupRequest>,
) -> impl IntoResponse {
    Json(manager.process_cleanup_request(&req, Utc::now()))
}

async fn heartbeat(
    State(manager): State<Arc<Manager>>,
    Json(req): Json<HeartbeatRequest>,
) -> impl IntoResponse {
    Json(manager.process_heartbeat(&req, Utc::now()))
}

async fn stats(State(manager): State<Arc<Manager>>) -> impl IntoResponse {
    Json(manager.stats(Utc::now()))
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn metrics(State(manager): State<Arc<Manager>>) -> impl IntoResponse {
    let controller_metrics = ControllerMetrics::new();
    manager.publish_metrics(&controller_metrics);

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, Vec::new()).into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let mut config = Config::default();
        config.analyzer.ai_analysis.enabled = true;
        config.cleaner.enabled = true;
        router(Arc::new(Manager::new(config, None)))
    }

    async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_healthz_always_ok() {
        let response = test_router()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ai_analysis_endpoint() {
        let (status, json) = post_json(
            test_router(),
            "/api/ai-analysis/request",
            serde_json::json!({
                "nodeName": "node1",
                "coredumpPath": "/var/dumps/core.milvus.1000.1700000000.1",
                "valueScore": 8.0,
                "estimatedCost": 0.25,
                "priority": "medium"
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["allowed"], true);
        assert!(json["remainingCost"].as_f64().unwrap() < 100.0);
    }

    #[tokio::test]
    async fn test_malformed_body_is_client_error() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/ai-analysis/request")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_cleanup_endpoint_round_trip() {
        let app = test_router();

        let (status, json) = post_json(
            app.clone(),
            "/api/cleanup/request",
            serde_json::json!({
                "nodeName": "node1",
                "instanceName": "rel1",
                "namespace": "ns1",
                "restartCount": 4,
                "deploymentType": "helm"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["allowed"], true);
        assert_eq!(json["taskId"], "ns1/rel1");

        // The same key from another agent is refused with the assignee
        let (_, json) = post_json(
            app,
            "/api/cleanup/request",
            serde_json::json!({
                "nodeName": "node2",
                "instanceName": "rel1",
                "namespace": "ns1",
                "restartCount": 4,
                "deploymentType": "helm"
            }),
        )
        .await;
        assert_eq!(json["allowed"], false);
        assert_eq!(json["assignedTo"], "node1");
    }

    #[tokio::test]
    async fn test_heartbeat_then_stats() {
        let app = test_router();

        let (status, json) = post_json(
            app.clone(),
            "/api/heartbeat",
            serde_json::json!({
                "nodeName": "node1",
                "version": "1.2.3",
                "status": "active"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["acknowledged"], true);

        let response = app
            .oneshot(Request::builder().uri("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["agents"]["node1"]["status"], "active");
        assert!(json["globalState"]["monthlyAiCost"].is_number());
    }

    #[tokio::test]
    async fn test_metrics_endpoint_exposes_controller_gauges() {
        let response = test_router()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("milvus_coredump_controller_ai_cost_monthly"));
        assert!(text.contains("milvus_coredump_controller_pending_cleanups"));
        assert!(text.contains("milvus_coredump_controller_active_agents"));
    }
}
