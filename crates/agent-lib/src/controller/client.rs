//! Agent-side client for the controller arbitration API
//!
//! Transport failures surface as errors so callers can apply their
//! degrade rules: AI analysis records the denial and continues, cleanup
//! fails closed and retries on the next panic.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::{
    AIAnalysisRequest, AIAnalysisResponse, CleanupRequest, CleanupResponse, HeartbeatRequest,
    HeartbeatResponse, StatsResponse,
};
use crate::config::ControllerConfig;
use crate::health::{PipelineHealth, Stage};

/// Deadline for the availability probe
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client for the controller
pub struct ControllerClient {
    base_url: String,
    http: reqwest::Client,
    node_name: String,
    version: String,
    heartbeat_interval: Duration,
}

impl ControllerClient {
    pub fn new(config: &ControllerConfig, node_name: String, version: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .context("failed to build controller HTTP client")?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            http,
            node_name,
            version,
            heartbeat_interval: config.heartbeat_interval(),
        })
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Ask permission to spend LLM budget on one dump
    pub async fn request_ai_analysis(
        &self,
        coredump_path: &str,
        value_score: f64,
        estimated_cost: f64,
        priority: &str,
    ) -> Result<AIAnalysisResponse> {
        let request = AIAnalysisRequest {
            node_name: self.node_name.clone(),
            coredump_path: coredump_path.to_string(),
            value_score,
            estimated_cost,
            priority: priority.to_string(),
        };

        let response: AIAnalysisResponse = self
            .post_json("/api/ai-analysis/request", &request)
            .await
            .context("failed to request AI analysis")?;

        debug!(
            allowed = response.allowed,
            reason = %response.reason,
            "AI analysis request answered"
        );
        Ok(response)
    }

    /// Ask permission to decommission an instance
    pub async fn request_cleanup(
        &self,
        instance_name: &str,
        namespace: &str,
        restart_count: i32,
        deployment_type: &str,
    ) -> Result<CleanupResponse> {
        let request = CleanupRequest {
            node_name: self.node_name.clone(),
            instance_name: instance_name.to_string(),
            namespace: namespace.to_string(),
            restart_count,
            deployment_type: deployment_type.to_string(),
        };

        let response: CleanupResponse = self
            .post_json("/api/cleanup/request", &request)
            .await
            .context("failed to request cleanup")?;

        debug!(
            allowed = response.allowed,
            reason = %response.reason,
            task_id = %response.task_id,
            "Cleanup request answered"
        );
        Ok(response)
    }

    pub async fn send_heartbeat(&self) -> Result<HeartbeatResponse> {
        let request = HeartbeatRequest {
            node_name: self.node_name.clone(),
            version: self.version.clone(),
            status: "active".to_string(),
        };

        self.post_json("/api/heartbeat", &request)
            .await
            .context("failed to send heartbeat")
    }

    pub async fn get_stats(&self) -> Result<StatsResponse> {
        let url = format!("{}/api/stats", self.base_url);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            bail!("stats request failed with status {}", response.status());
        }
        response.json().await.map_err(Into::into)
    }

    /// Probe `/healthz` with a short deadline
    pub async fn is_available(&self) -> bool {
        let url = format!("{}/healthz", self.base_url);
        match self
            .http
            .get(&url)
            .timeout(HEALTH_PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Periodic heartbeat, starting with an immediate beat
    ///
    /// The heartbeat doubles as the liveness signal for the controller
    /// link: an acknowledged beat marks the link running, a failed one
    /// degrades it until the next success.
    pub async fn run_heartbeat_loop(
        self: Arc<Self>,
        health: PipelineHealth,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            controller = %self.base_url,
            node = %self.node_name,
            interval_secs = self.heartbeat_interval.as_secs(),
            "Starting controller heartbeat"
        );

        let mut ticker = interval(self.heartbeat_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.send_heartbeat().await {
                        Ok(_) => {
                            health.mark_running(Stage::ControllerLink).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to send heartbeat");
                            health
                                .mark_degraded(
                                    Stage::ControllerLink,
                                    format!("controller unreachable: {}", e),
                                )
                                .await;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Heartbeat loop stopped");
                    break;
                }
            }
        }
    }

    async fn post_json<Req, Resp>(&self, endpoint: &str, request: &Req) -> Result<Resp>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, endpoint);
        let response = self.http.post(&url).json(request).send().await?;

        if !response.status().is_success() {
            bail!("request to {} failed with status {}", endpoint, response.status());
        }

        response.json().await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_construction_trims_trailing_slash() {
        let config = ControllerConfig {
            enabled: true,
            url: "http://controller:8090/".to_string(),
            timeout_secs: 5,
            heartbeat_interval_secs: 30,
        };

        let client =
            ControllerClient::new(&config, "node1".to_string(), "1.0.0".to_string()).unwrap();
        assert_eq!(client.base_url, "http://controller:8090");
        assert_eq!(client.node_name(), "node1");
        assert_eq!(client.heartbeat_interval, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_unreachable_controller_reports_unavailable() {
        let config = ControllerConfig {
            enabled: true,
            // Reserved TEST-NET address, nothing listens there
            url: "http://192.0.2.1:1".to_string(),
            timeout_secs: 1,
            heartbeat_interval_secs: 30,
        };

        let client =
            ControllerClient::new(&config, "node1".to_string(), "1.0.0".to_string()).unwrap();
        assert!(!client.is_available().await);
        assert!(client.send_heartbeat().await.is_err());
    }
}
