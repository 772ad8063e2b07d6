//! Central arbitration: cost budget, cleanup leasing, agent liveness
//!
//! The controller is a single authoritative coordinator with soft state.
//! Agents ask it for permission before spending LLM budget or
//! decommissioning a workload, and report liveness through heartbeats.

mod client;
mod handlers;
mod state;

pub use client::ControllerClient;
pub use handlers::router;
pub use state::{AgentInfo, CleanupRecord, CleanupTask, ControllerMetrics, GlobalState, Manager};

use serde::{Deserialize, Serialize};

/// Permission request for one LLM analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AIAnalysisRequest {
    pub node_name: String,
    pub coredump_path: String,
    pub value_score: f64,
    pub estimated_cost: f64,
    /// "high", "medium" or "low"
    pub priority: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AIAnalysisResponse {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    pub remaining_cost: f64,
}

/// Permission request to decommission an instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupRequest {
    pub node_name: String,
    pub instance_name: String,
    pub namespace: String,
    pub restart_count: i32,
    /// "helm" or "operator"
    pub deployment_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResponse {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub assigned_to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub node_name: String,
    pub version: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub acknowledged: bool,
}

/// Read-only snapshot returned by `GET /api/stats`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub global_state: GlobalState,
    pub agents: std::collections::HashMap<String, AgentInfo>,
}
