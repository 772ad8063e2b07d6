//! Controller global state and decision logic
//!
//! All decisions take the state write lock; agents must retry on
//! transport failure and the controller only mutates inside the
//! accepting branch, so retried denials are side-effect free.

use chrono::{DateTime, Datelike, Utc};
use prometheus::{register_gauge, register_int_gauge, Gauge, IntGauge};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::{
    AIAnalysisRequest, AIAnalysisResponse, CleanupRequest, CleanupResponse, HeartbeatRequest,
    HeartbeatResponse, StatsResponse,
};
use crate::config::Config;
use crate::persistence::{CoredumpStore, Database, InstanceStore};

/// How long a failed pending cleanup lingers before being dropped
const FAILED_TASK_RETENTION: chrono::Duration = chrono::Duration::hours(1);
/// Completed cleanup records kept in memory
const COMPLETED_CLEANUPS_KEPT: usize = 100;

const STATE_STAT_KEY: &str = "controller_state";
const AGENTS_STAT_KEY: &str = "controller_agents";

/// Cluster-wide state guarded by the manager's state lock
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalState {
    /// LLM cost accumulated in the current calendar month (USD)
    pub monthly_ai_cost: f64,
    /// Analyses approved in the current calendar month
    pub ai_analysis_count: i64,
    /// Analyses approved in the current wall-clock hour
    pub hourly_analysis_count: i64,
    pub last_hour_reset: DateTime<Utc>,
    pub last_ai_analysis_reset: DateTime<Utc>,

    pub pending_cleanups: HashMap<String, CleanupTask>,
    pub completed_cleanups: Vec<CleanupRecord>,

    pub total_coredumps: i64,
    pub high_value_coredumps: i64,
    pub total_instances: i64,

    pub last_updated: DateTime<Utc>,
}

impl Default for GlobalState {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            monthly_ai_cost: 0.0,
            ai_analysis_count: 0,
            hourly_analysis_count: 0,
            last_hour_reset: now,
            last_ai_analysis_reset: now,
            pending_cleanups: HashMap::new(),
            completed_cleanups: Vec::new(),
            total_coredumps: 0,
            high_value_coredumps: 0,
            total_instances: 0,
            last_updated: now,
        }
    }
}

/// A pending or running decommission lease
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupTask {
    pub instance_name: String,
    pub namespace: String,
    pub restart_count: i32,
    pub scheduled_at: DateTime<Utc>,
    pub assigned_agent: String,
    /// pending, in_progress, completed, failed
    pub status: String,
}

/// A finished decommission, kept for the dashboard
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupRecord {
    pub instance_name: String,
    pub namespace: String,
    pub completed_at: DateTime<Utc>,
    pub success: bool,
    pub agent: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

/// Per-agent liveness entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub node_name: String,
    pub last_heartbeat: DateTime<Utc>,
    pub version: String,
    /// active, inactive, error
    pub status: String,
}

/// Coordinates global invariants across all agents
pub struct Manager {
    config: Config,
    state: RwLock<GlobalState>,
    agents: RwLock<HashMap<String, AgentInfo>>,
    db: Option<Arc<Database>>,
}

impl Manager {
    pub fn new(config: Config, db: Option<Arc<Database>>) -> Self {
        let manager = Self {
            config,
            state: RwLock::new(GlobalState::default()),
            agents: RwLock::new(HashMap::new()),
            db,
        };
        manager.load_state();
        manager
    }

    /// Decide one AI analysis permission request
    pub fn process_ai_request(&self, req: &AIAnalysisRequest, now: DateTime<Utc>) -> AIAnalysisResponse {
        let ai_config = &self.config.analyzer.ai_analysis;
        let mut state = self.state.write().expect("state lock poisoned");

        debug!(
            node = %req.node_name,
            path = %req.coredump_path,
            score = req.value_score,
            cost = req.estimated_cost,
            "AI analysis request"
        );

        if !ai_config.enabled {
            return AIAnalysisResponse {
                allowed: false,
                reason: "AI analysis is disabled".to_string(),
                remaining_cost: 0.0,
            };
        }

        // The hour counter rolls when a full hour of wall-clock elapses
        if now - state.last_hour_reset > chrono::Duration::hours(1) {
            state.hourly_analysis_count = 0;
            state.last_hour_reset = now;
        }

        if state.monthly_ai_cost + req.estimated_cost > ai_config.max_cost_per_month {
            let remaining = ai_config.max_cost_per_month - state.monthly_ai_cost;
            return AIAnalysisResponse {
                allowed: false,
                reason: format!(
                    "Monthly cost limit would be exceeded (remaining: ${:.2})",
                    remaining
                ),
                remaining_cost: remaining,
            };
        }

        if state.hourly_analysis_count >= ai_config.max_analysis_per_hour as i64 {
            return AIAnalysisResponse {
                allowed: false,
                reason: "Hourly analysis limit exceeded".to_string(),
                remaining_cost: ai_config.max_cost_per_month - state.monthly_ai_cost,
            };
        }

        state.monthly_ai_cost += req.estimated_cost;
        state.ai_analysis_count += 1;
        state.hourly_analysis_count += 1;
        state.last_updated = now;

        info!(
            path = %req.coredump_path,
            cost = req.estimated_cost,
            monthly_total = state.monthly_ai_cost,
            "Approved AI analysis"
        );

        AIAnalysisResponse {
            allowed: true,
            reason: String::new(),
            remaining_cost: ai_config.max_cost_per_month - state.monthly_ai_cost,
        }
    }

    /// Decide one cleanup permission request
    pub fn process_cleanup_request(&self, req: &CleanupRequest, now: DateTime<Utc>) -> CleanupResponse {
        let mut state = self.state.write().expect("state lock poisoned");
        let instance_key = format!("{}/{}", req.namespace, req.instance_name);

        debug!(
            node = %req.node_name,
            instance = %instance_key,
            restarts = req.restart_count,
            "Cleanup request"
        );

        if !self.config.cleaner.enabled {
            return CleanupResponse {
                allowed: false,
                reason: "Instance cleanup is disabled".to_string(),
                task_id: String::new(),
                assigned_to: String::new(),
            };
        }

        if req.restart_count < self.config.cleaner.max_restart_count {
            return CleanupResponse {
                allowed: false,
                reason: format!(
                    "Restart count ({}) below threshold ({})",
                    req.restart_count, self.config.cleaner.max_restart_count
                ),
                task_id: String::new(),
                assigned_to: String::new(),
            };
        }

        if let Some(existing) = state.pending_cleanups.get(&instance_key) {
            if existing.status == "pending" || existing.status == "in_progress" {
                return CleanupResponse {
                    allowed: false,
                    reason: "Cleanup already scheduled or in progress".to_string(),
                    task_id: instance_key.clone(),
                    assigned_to: existing.assigned_agent.clone(),
                };
            }
        }

        state.pending_cleanups.insert(
            instance_key.clone(),
            CleanupTask {
                instance_name: req.instance_name.clone(),
                namespace: req.namespace.clone(),
                restart_count: req.restart_count,
                scheduled_at: now,
                assigned_agent: req.node_name.clone(),
                status: "pending".to_string(),
            },
        );
        state.last_updated = now;

        info!(instance = %instance_key, assigned_to = %req.node_name, "Approved cleanup");

        CleanupResponse {
            allowed: true,
            reason: String::new(),
            task_id: instance_key,
            assigned_to: req.node_name.clone(),
        }
    }

    /// Register or refresh an agent
    pub fn process_heartbeat(&self, req: &HeartbeatRequest, now: DateTime<Utc>) -> HeartbeatResponse {
        let mut agents = self.agents.write().expect("agents lock poisoned");

        match agents.get_mut(&req.node_name) {
            Some(agent) => {
                agent.last_heartbeat = now;
                agent.version = req.version.clone();
                agent.status = "active".to_string();
            }
            None => {
                info!(node = %req.node_name, "New agent registered");
                agents.insert(
                    req.node_name.clone(),
                    AgentInfo {
                        node_name: req.node_name.clone(),
                        last_heartbeat: now,
                        version: req.version.clone(),
                        status: "active".to_string(),
                    },
                );
            }
        }

        HeartbeatResponse { acknowledged: true }
    }

    /// Snapshot for `GET /api/stats`; stale agents read as inactive
    pub fn stats(&self, now: DateTime<Utc>) -> StatsResponse {
        let global_state = self.state.read().expect("state lock poisoned").clone();
        let stale_after = self.stale_after();

        let agents = self
            .agents
            .read()
            .expect("agents lock poisoned")
            .iter()
            .map(|(name, agent)| {
                let mut agent = agent.clone();
                if now - agent.last_heartbeat > stale_after {
                    agent.status = "inactive".to_string();
                }
                (name.clone(), agent)
            })
            .collect();

        StatsResponse {
            global_state,
            agents,
        }
    }

    /// Mark a leased task finished, moving it into the completed log
    pub fn complete_cleanup(&self, task_id: &str, success: bool, error: &str) {
        let mut state = self.state.write().expect("state lock poisoned");

        let Some(mut task) = state.pending_cleanups.remove(task_id) else {
            return;
        };

        if success {
            task.status = "completed".to_string();
        } else {
            task.status = "failed".to_string();
            // Failed tasks stay visible until the state cleanup drops them
            state.pending_cleanups.insert(task_id.to_string(), task.clone());
        }

        state.completed_cleanups.push(CleanupRecord {
            instance_name: task.instance_name,
            namespace: task.namespace,
            completed_at: Utc::now(),
            success,
            agent: task.assigned_agent,
            error_message: error.to_string(),
        });
    }

    fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.controller.heartbeat_interval() * 2)
            .unwrap_or_else(|_| chrono::Duration::minutes(2))
    }

    /// Hourly maintenance: month rollover and task pruning
    pub fn cleanup_old_state(&self, now: DateTime<Utc>) {
        let mut state = self.state.write().expect("state lock poisoned");

        if now.month() != state.last_ai_analysis_reset.month()
            || now.year() != state.last_ai_analysis_reset.year()
        {
            info!("Resetting monthly AI analysis cost");
            state.monthly_ai_cost = 0.0;
            state.ai_analysis_count = 0;
            state.last_ai_analysis_reset = now;
        }

        let len = state.completed_cleanups.len();
        if len > COMPLETED_CLEANUPS_KEPT {
            state.completed_cleanups.drain(0..len - COMPLETED_CLEANUPS_KEPT);
        }

        state.pending_cleanups.retain(|_, task| {
            !(task.status == "failed" && now - task.scheduled_at > FAILED_TASK_RETENTION)
        });
    }

    /// Mark agents inactive when their heartbeat goes stale
    pub fn check_agent_health(&self, now: DateTime<Utc>) {
        let stale_after = self.stale_after();
        let mut agents = self.agents.write().expect("agents lock poisoned");

        for (node_name, agent) in agents.iter_mut() {
            if now - agent.last_heartbeat > stale_after && agent.status != "inactive" {
                warn!(node = %node_name, "Agent is now inactive");
                agent.status = "inactive".to_string();
            }
        }
    }

    /// Recompute totals from persistence
    pub fn update_statistics(&self) {
        let Some(db) = &self.db else {
            return;
        };

        let coredumps = CoredumpStore::new(db).count().unwrap_or(0);
        let high_value = CoredumpStore::new(db).high_value_count().unwrap_or(0);
        let instances = InstanceStore::new(db).count().unwrap_or(0);

        let mut state = self.state.write().expect("state lock poisoned");
        state.total_coredumps = coredumps;
        state.high_value_coredumps = high_value;
        state.total_instances = instances;
        state.last_updated = Utc::now();
    }

    /// Best-effort snapshot to persistence
    pub fn save_state(&self) {
        let Some(db) = &self.db else {
            return;
        };

        let state = self.state.read().expect("state lock poisoned");
        if let Ok(json) = serde_json::to_string(&*state) {
            if let Err(e) = db.set_stat(STATE_STAT_KEY, &json) {
                warn!(error = %e, "Failed to save controller state");
            }
        }

        let agents = self.agents.read().expect("agents lock poisoned");
        if let Ok(json) = serde_json::to_string(&*agents) {
            if let Err(e) = db.set_stat(AGENTS_STAT_KEY, &json) {
                warn!(error = %e, "Failed to save agent registry");
            }
        }

        info!("Saved controller state to database");
    }

    /// Opportunistic reload of the last snapshot
    fn load_state(&self) {
        let Some(db) = &self.db else {
            return;
        };

        if let Ok(Some(json)) = db.get_stat(STATE_STAT_KEY) {
            match serde_json::from_str::<GlobalState>(&json) {
                Ok(loaded) => {
                    *self.state.write().expect("state lock poisoned") = loaded;
                    info!("Loaded controller state from database");
                }
                Err(e) => warn!(error = %e, "Failed to parse saved controller state"),
            }
        }

        if let Ok(Some(json)) = db.get_stat(AGENTS_STAT_KEY) {
            match serde_json::from_str::<HashMap<String, AgentInfo>>(&json) {
                Ok(loaded) => {
                    *self.agents.write().expect("agents lock poisoned") = loaded;
                }
                Err(e) => warn!(error = %e, "Failed to parse saved agent registry"),
            }
        }
    }

    /// Refresh the controller gauges from current state
    pub fn publish_metrics(&self, metrics: &ControllerMetrics) {
        let state = self.state.read().expect("state lock poisoned");
        metrics.set_ai_cost_monthly(state.monthly_ai_cost);
        metrics.set_ai_analyses_total(state.ai_analysis_count);

        let pending = state
            .pending_cleanups
            .values()
            .filter(|t| t.status == "pending" || t.status == "in_progress")
            .count();
        metrics.set_pending_cleanups(pending as i64);
        drop(state);

        let now = Utc::now();
        let stale_after = self.stale_after();
        let active = self
            .agents
            .read()
            .expect("agents lock poisoned")
            .values()
            .filter(|a| a.status == "active" && now - a.last_heartbeat <= stale_after)
            .count();
        metrics.set_active_agents(active as i64);
    }

    /// All background loops, driven until shutdown
    pub async fn run_background_loops(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut state_cleanup = interval(Duration::from_secs(3600));
        let mut agent_health = interval(Duration::from_secs(30));
        let mut statistics = interval(Duration::from_secs(300));

        loop {
            tokio::select! {
                _ = state_cleanup.tick() => self.cleanup_old_state(Utc::now()),
                _ = agent_health.tick() => self.check_agent_health(Utc::now()),
                _ = statistics.tick() => self.update_statistics(),
                _ = shutdown.recv() => {
                    info!("Controller manager shutting down");
                    self.save_state();
                    break;
                }
            }
        }
    }
}

/// Controller-side Prometheus gauges
static CONTROLLER_METRICS: OnceLock<ControllerMetricsInner> = OnceLock::new();

struct ControllerMetricsInner {
    ai_cost_monthly: Gauge,
    ai_analyses_total: IntGauge,
    pending_cleanups: IntGauge,
    active_agents: IntGauge,
}

impl ControllerMetricsInner {
    fn new() -> Self {
        Self {
            ai_cost_monthly: register_gauge!(
                "milvus_coredump_controller_ai_cost_monthly",
                "Monthly AI analysis cost in USD"
            )
            .expect("Failed to register ai_cost_monthly"),
            ai_analyses_total: register_int_gauge!(
                "milvus_coredump_controller_ai_analyses_total",
                "Total AI analyses performed this month"
            )
            .expect("Failed to register ai_analyses_total"),
            pending_cleanups: register_int_gauge!(
                "milvus_coredump_controller_pending_cleanups",
                "Pending cleanup tasks"
            )
            .expect("Failed to register pending_cleanups"),
            active_agents: register_int_gauge!(
                "milvus_coredump_controller_active_agents",
                "Active agents"
            )
            .expect("Failed to register active_agents"),
        }
    }
}

/// Handle to the controller metrics set
#[derive(Clone)]
pub struct ControllerMetrics {
    _private: (),
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    pub fn new() -> Self {
        CONTROLLER_METRICS.get_or_init(ControllerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ControllerMetricsInner {
        CONTROLLER_METRICS.get().expect("Metrics not initialized")
    }

    pub fn set_ai_cost_monthly(&self, cost: f64) {
        self.inner().ai_cost_monthly.set(cost);
    }

    pub fn set_ai_analyses_total(&self, count: i64) {
        self.inner().ai_analyses_total.set(count);
    }

    pub fn set_pending_cleanups(&self, count: i64) {
        self.inner().pending_cleanups.set(count);
    }

    pub fn set_active_agents(&self, count: i64) {
        self.inner().active_agents.set(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager() -> Manager {
        let mut config = Config::default();
        config.analyzer.ai_analysis.enabled = true;
        config.analyzer.ai_analysis.max_cost_per_month = 100.0;
        config.analyzer.ai_analysis.max_analysis_per_hour = 10;
        config.cleaner.enabled = true;
        config.cleaner.max_restart_count = 3;
        Manager::new(config, None)
    }

    fn ai_request(cost: f64) -> AIAnalysisRequest {
        AIAnalysisRequest {
            node_name: "node1".to_string(),
            coredump_path: "/var/dumps/core.milvus.1000.1700000000.1".to_string(),
            value_score: 8.0,
            estimated_cost: cost,
            priority: "medium".to_string(),
        }
    }

    fn cleanup_request(node: &str, restarts: i32) -> CleanupRequest {
        CleanupRequest {
            node_name: node.to_string(),
            instance_name: "rel1".to_string(),
            namespace: "ns1".to_string(),
            restart_count: restarts,
            deployment_type: "helm".to_string(),
        }
    }

    #[test]
    fn test_ai_request_allowed_updates_counters() {
        let manager = test_manager();
        let now = Utc::now();

        let resp = manager.process_ai_request(&ai_request(0.5), now);
        assert!(resp.allowed);
        assert!((resp.remaining_cost - 99.5).abs() < 1e-9);

        let state = manager.state.read().unwrap();
        assert!((state.monthly_ai_cost - 0.5).abs() < 1e-9);
        assert_eq!(state.ai_analysis_count, 1);
        assert_eq!(state.hourly_analysis_count, 1);
    }

    #[test]
    fn test_ai_request_denied_when_disabled() {
        let mut config = Config::default();
        config.analyzer.ai_analysis.enabled = false;
        let manager = Manager::new(config, None);

        let resp = manager.process_ai_request(&ai_request(0.5), Utc::now());
        assert!(!resp.allowed);
        assert_eq!(resp.reason, "AI analysis is disabled");
    }

    #[test]
    fn test_monthly_budget_exhaustion() {
        let manager = test_manager();
        let now = Utc::now();

        manager.state.write().unwrap().monthly_ai_cost = 99.90;

        let resp = manager.process_ai_request(&ai_request(0.20), now);
        assert!(!resp.allowed);
        assert!((resp.remaining_cost - 0.10).abs() < 1e-9);
        assert_eq!(
            resp.reason,
            "Monthly cost limit would be exceeded (remaining: $0.10)"
        );

        // Denial must not consume budget
        let state = manager.state.read().unwrap();
        assert!((state.monthly_ai_cost - 99.90).abs() < 1e-9);
        assert_eq!(state.hourly_analysis_count, 0);
    }

    #[test]
    fn test_hourly_limit_and_rollover() {
        let manager = test_manager();
        let now = Utc::now();

        for _ in 0..10 {
            assert!(manager.process_ai_request(&ai_request(0.01), now).allowed);
        }
        assert!(!manager.process_ai_request(&ai_request(0.01), now).allowed);

        // After an hour the counter rolls and requests flow again
        let later = now + chrono::Duration::minutes(61);
        assert!(manager.process_ai_request(&ai_request(0.01), later).allowed);
    }

    #[test]
    fn test_approval_invariant_never_exceeds_caps() {
        let manager = test_manager();
        let now = Utc::now();
        let max = manager.config.analyzer.ai_analysis.max_cost_per_month;

        for _ in 0..1000 {
            let resp = manager.process_ai_request(&ai_request(17.3), now);
            let state = manager.state.read().unwrap();
            if resp.allowed {
                assert!(state.monthly_ai_cost <= max + 1e-9);
                assert!(state.hourly_analysis_count <= 10);
            }
        }
    }

    #[test]
    fn test_cleanup_denied_below_threshold() {
        let manager = test_manager();
        let resp = manager.process_cleanup_request(&cleanup_request("node1", 2), Utc::now());
        assert!(!resp.allowed);
        assert_eq!(resp.reason, "Restart count (2) below threshold (3)");
    }

    #[test]
    fn test_cleanup_lease_is_exclusive() {
        let manager = test_manager();
        let now = Utc::now();

        let first = manager.process_cleanup_request(&cleanup_request("node1", 4), now);
        assert!(first.allowed);
        assert_eq!(first.task_id, "ns1/rel1");
        assert_eq!(first.assigned_to, "node1");

        // A concurrent request from another agent is denied and told who owns it
        let second = manager.process_cleanup_request(&cleanup_request("node2", 4), now);
        assert!(!second.allowed);
        assert_eq!(second.assigned_to, "node1");
        assert_eq!(second.task_id, "ns1/rel1");

        // The registry is unchanged by the denial
        let state = manager.state.read().unwrap();
        assert_eq!(state.pending_cleanups.len(), 1);
        assert_eq!(state.pending_cleanups["ns1/rel1"].assigned_agent, "node1");
    }

    #[test]
    fn test_cleanup_lease_released_after_completion() {
        let manager = test_manager();
        let now = Utc::now();

        assert!(manager.process_cleanup_request(&cleanup_request("node1", 4), now).allowed);
        manager.complete_cleanup("ns1/rel1", true, "");

        // With the lease gone, another agent may claim the key again
        let resp = manager.process_cleanup_request(&cleanup_request("node2", 4), now);
        assert!(resp.allowed);
        assert_eq!(resp.assigned_to, "node2");
    }

    #[test]
    fn test_failed_cleanup_pruned_after_an_hour() {
        let manager = test_manager();
        let now = Utc::now();

        assert!(manager.process_cleanup_request(&cleanup_request("node1", 4), now).allowed);
        manager.complete_cleanup("ns1/rel1", false, "helm timed out");
        assert_eq!(
            manager.state.read().unwrap().pending_cleanups["ns1/rel1"].status,
            "failed"
        );

        manager.state.write().unwrap().pending_cleanups.get_mut("ns1/rel1").unwrap().scheduled_at =
            now - chrono::Duration::hours(2);
        manager.cleanup_old_state(now);

        assert!(manager.state.read().unwrap().pending_cleanups.is_empty());
    }

    #[test]
    fn test_heartbeat_registers_and_refreshes() {
        let manager = test_manager();
        let now = Utc::now();

        let resp = manager.process_heartbeat(
            &HeartbeatRequest {
                node_name: "node1".to_string(),
                version: "1.0.0".to_string(),
                status: "active".to_string(),
            },
            now,
        );
        assert!(resp.acknowledged);

        let stats = manager.stats(now);
        assert_eq!(stats.agents["node1"].status, "active");
    }

    #[test]
    fn test_stale_agent_reported_inactive_by_stats() {
        let manager = test_manager();
        let now = Utc::now();

        manager.process_heartbeat(
            &HeartbeatRequest {
                node_name: "node1".to_string(),
                version: "1.0.0".to_string(),
                status: "active".to_string(),
            },
            now,
        );

        // Default heartbeat interval is 60s, so 2x is two minutes
        let later = now + chrono::Duration::minutes(3);
        let stats = manager.stats(later);
        assert_eq!(stats.agents["node1"].status, "inactive");

        // The background loop persists the transition
        manager.check_agent_health(later);
        assert_eq!(
            manager.agents.read().unwrap()["node1"].status,
            "inactive"
        );
    }

    #[test]
    fn test_month_rollover_resets_ledger() {
        let manager = test_manager();
        let now = Utc::now();

        manager.process_ai_request(&ai_request(5.0), now);
        assert!(manager.state.read().unwrap().monthly_ai_cost > 0.0);

        let next_month = now + chrono::Duration::days(40);
        manager.cleanup_old_state(next_month);

        let state = manager.state.read().unwrap();
        assert_eq!(state.monthly_ai_cost, 0.0);
        assert_eq!(state.ai_analysis_count, 0);
    }

    #[test]
    fn test_completed_cleanups_trimmed() {
        let manager = test_manager();
        let now = Utc::now();

        {
            let mut state = manager.state.write().unwrap();
            for i in 0..150 {
                state.completed_cleanups.push(CleanupRecord {
                    instance_name: format!("rel{}", i),
                    namespace: "ns1".to_string(),
                    completed_at: now,
                    success: true,
                    agent: "node1".to_string(),
                    error_message: String::new(),
                });
            }
        }

        manager.cleanup_old_state(now);

        let state = manager.state.read().unwrap();
        assert_eq!(state.completed_cleanups.len(), 100);
        // The newest records survive
        assert_eq!(state.completed_cleanups.last().unwrap().instance_name, "rel149");
    }

    #[test]
    fn test_state_snapshot_round_trip() {
        let db = Arc::new(Database::in_memory().unwrap());

        let mut config = Config::default();
        config.analyzer.ai_analysis.enabled = true;
        config.cleaner.enabled = true;

        let manager = Manager::new(config.clone(), Some(db.clone()));
        manager.process_ai_request(&ai_request(2.5), Utc::now());
        manager.process_cleanup_request(&cleanup_request("node1", 5), Utc::now());
        manager.save_state();

        let restored = Manager::new(config, Some(db));
        let state = restored.state.read().unwrap();
        assert!((state.monthly_ai_cost - 2.5).abs() < 1e-9);
        assert!(state.pending_cleanups.contains_key("ns1/rel1"));
    }
}
