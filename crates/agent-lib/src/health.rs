//! Pipeline health tracking for liveness and readiness probes
//!
//! Each pipeline stage reports a lifecycle phase rather than a generic
//! healthy flag. Readiness is derived from startup: the agent becomes
//! ready once every enabled stage has left `Starting`, with no
//! separate ready bit to forget. Liveness only fails on `Failed`;
//! `Degraded` covers the documented fallback modes, which keep the
//! agent serving:
//!
//! - analyzer: debugger unavailable, basic signal-only analysis
//! - controller link: arbitration unreachable, AI skipped and cleanup
//!   deferred until the next heartbeat succeeds
//! - storage: backend write/delete errors, retried by the next ingest
//!   or retention pass
//!
//! All of these recover on the next successful operation, so stages
//! flip themselves back to `Running` rather than latching.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// The stages of the agent pipeline, in startup order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Discovery,
    Collector,
    Analyzer,
    Storage,
    Cleaner,
    /// Heartbeat and arbitration connection to the controller
    ControllerLink,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Discovery,
        Stage::Collector,
        Stage::Analyzer,
        Stage::Storage,
        Stage::Cleaner,
        Stage::ControllerLink,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Discovery => "discovery",
            Stage::Collector => "collector",
            Stage::Analyzer => "analyzer",
            Stage::Storage => "storage",
            Stage::Cleaner => "cleaner",
            Stage::ControllerLink => "controller_link",
        }
    }
}

/// Lifecycle phase of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagePhase {
    /// Registered but its tasks have not started yet
    Starting,
    Running,
    /// Operating in a fallback mode; recovers on the next success
    Degraded,
    /// Dead; the agent should be restarted
    Failed,
    /// Turned off by configuration; never blocks readiness
    Disabled,
}

/// Phase plus context for one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageHealth {
    pub phase: StagePhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// When the stage entered its current phase (epoch seconds)
    pub since: i64,
}

impl StageHealth {
    fn new(phase: StagePhase) -> Self {
        Self {
            phase,
            detail: None,
            since: Utc::now().timestamp(),
        }
    }
}

/// Liveness view: overall phase plus every stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: StagePhase,
    pub stages: BTreeMap<String, StageHealth>,
}

/// Readiness view: which stages are still starting, if any
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessReport {
    pub ready: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub waiting_on: Vec<String>,
}

/// Shared health state for the agent pipeline
#[derive(Debug, Clone, Default)]
pub struct PipelineHealth {
    stages: Arc<RwLock<BTreeMap<Stage, StageHealth>>>,
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce a stage before its tasks spawn; it blocks readiness
    /// until `mark_running`
    pub async fn register(&self, stage: Stage) {
        let mut stages = self.stages.write().await;
        stages.insert(stage, StageHealth::new(StagePhase::Starting));
    }

    /// Record a stage as configured off; it is reported but ignored by
    /// both probes
    pub async fn disable(&self, stage: Stage) {
        let mut stages = self.stages.write().await;
        stages.insert(stage, StageHealth::new(StagePhase::Disabled));
    }

    pub async fn mark_running(&self, stage: Stage) {
        self.transition(stage, StagePhase::Running, None).await;
    }

    pub async fn mark_degraded(&self, stage: Stage, detail: impl Into<String>) {
        self.transition(stage, StagePhase::Degraded, Some(detail.into()))
            .await;
    }

    pub async fn mark_failed(&self, stage: Stage, detail: impl Into<String>) {
        self.transition(stage, StagePhase::Failed, Some(detail.into()))
            .await;
    }

    async fn transition(&self, stage: Stage, phase: StagePhase, detail: Option<String>) {
        let mut stages = self.stages.write().await;
        let entry = stages
            .entry(stage)
            .or_insert_with(|| StageHealth::new(phase));

        if entry.phase != phase {
            entry.since = Utc::now().timestamp();
        }
        entry.phase = phase;
        entry.detail = detail;
    }

    /// Worst phase across enabled stages: Failed > Starting > Degraded
    /// > Running. Before anything registers the pipeline counts as
    /// starting.
    async fn overall(&self) -> StagePhase {
        let stages = self.stages.read().await;

        let mut saw_enabled = false;
        let mut has_starting = false;
        let mut has_degraded = false;

        for health in stages.values() {
            match health.phase {
                StagePhase::Failed => return StagePhase::Failed,
                StagePhase::Starting => has_starting = true,
                StagePhase::Degraded => has_degraded = true,
                StagePhase::Running => {}
                StagePhase::Disabled => continue,
            }
            saw_enabled = true;
        }

        if !saw_enabled || has_starting {
            StagePhase::Starting
        } else if has_degraded {
            StagePhase::Degraded
        } else {
            StagePhase::Running
        }
    }

    pub async fn report(&self) -> HealthReport {
        let status = self.overall().await;
        let stages = self
            .stages
            .read()
            .await
            .iter()
            .map(|(stage, health)| (stage.name().to_string(), health.clone()))
            .collect();

        HealthReport { status, stages }
    }

    /// Ready once every enabled stage has left `Starting` and none has
    /// failed
    pub async fn readiness(&self) -> ReadinessReport {
        let stages = self.stages.read().await;

        if stages.is_empty() {
            return ReadinessReport {
                ready: false,
                waiting_on: vec!["pipeline".to_string()],
            };
        }

        let waiting_on: Vec<String> = stages
            .iter()
            .filter(|(_, health)| health.phase == StagePhase::Starting)
            .map(|(stage, _)| stage.name().to_string())
            .collect();

        let failed = stages
            .values()
            .any(|health| health.phase == StagePhase::Failed);

        ReadinessReport {
            ready: waiting_on.is_empty() && !failed,
            waiting_on,
        }
    }

    /// Whether the liveness probe should pass
    pub async fn is_live(&self) -> bool {
        self.overall().await != StagePhase::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_pipeline_is_starting_and_not_ready() {
        let health = PipelineHealth::new();

        let report = health.report().await;
        assert_eq!(report.status, StagePhase::Starting);
        assert!(report.stages.is_empty());

        let readiness = health.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.waiting_on, vec!["pipeline"]);
    }

    #[tokio::test]
    async fn test_readiness_follows_stage_startup() {
        let health = PipelineHealth::new();
        health.register(Stage::Discovery).await;
        health.register(Stage::Collector).await;
        health.register(Stage::Analyzer).await;

        // Two of three stages up: still waiting on the collector
        health.mark_running(Stage::Discovery).await;
        health.mark_running(Stage::Analyzer).await;

        let readiness = health.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.waiting_on, vec!["collector"]);
        assert_eq!(health.report().await.status, StagePhase::Starting);

        health.mark_running(Stage::Collector).await;

        let readiness = health.readiness().await;
        assert!(readiness.ready);
        assert!(readiness.waiting_on.is_empty());
        assert_eq!(health.report().await.status, StagePhase::Running);
    }

    #[tokio::test]
    async fn test_disabled_stage_never_blocks_readiness() {
        let health = PipelineHealth::new();
        health.register(Stage::Discovery).await;
        health.mark_running(Stage::Discovery).await;
        health.disable(Stage::Cleaner).await;
        health.disable(Stage::ControllerLink).await;

        let readiness = health.readiness().await;
        assert!(readiness.ready);
        assert_eq!(health.report().await.status, StagePhase::Running);

        // Disabled stages still show up in the report for operators
        let report = health.report().await;
        assert_eq!(report.stages["cleaner"].phase, StagePhase::Disabled);
    }

    #[tokio::test]
    async fn test_degraded_stage_keeps_serving() {
        let health = PipelineHealth::new();
        health.register(Stage::Analyzer).await;
        health.register(Stage::ControllerLink).await;
        health.mark_running(Stage::Analyzer).await;
        health.mark_running(Stage::ControllerLink).await;

        health
            .mark_degraded(Stage::ControllerLink, "controller unreachable")
            .await;

        assert_eq!(health.report().await.status, StagePhase::Degraded);
        assert!(health.readiness().await.ready);
        assert!(health.is_live().await);

        let report = health.report().await;
        assert_eq!(
            report.stages["controller_link"].detail.as_deref(),
            Some("controller unreachable")
        );
    }

    #[tokio::test]
    async fn test_degraded_stage_recovers() {
        let health = PipelineHealth::new();
        health.register(Stage::Storage).await;
        health.mark_running(Stage::Storage).await;

        health.mark_degraded(Stage::Storage, "disk full").await;
        assert_eq!(health.report().await.status, StagePhase::Degraded);

        // The next successful store flips the stage back
        health.mark_running(Stage::Storage).await;
        assert_eq!(health.report().await.status, StagePhase::Running);
        assert!(health.report().await.stages["storage"].detail.is_none());
    }

    #[tokio::test]
    async fn test_failed_stage_kills_liveness_and_readiness() {
        let health = PipelineHealth::new();
        health.register(Stage::Discovery).await;
        health.register(Stage::Collector).await;
        health.mark_running(Stage::Discovery).await;
        health.mark_running(Stage::Collector).await;
        assert!(health.readiness().await.ready);

        health
            .mark_failed(Stage::Collector, "coredump directory missing")
            .await;

        assert_eq!(health.report().await.status, StagePhase::Failed);
        assert!(!health.is_live().await);
        assert!(!health.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_since_tracks_phase_transitions_only() {
        let health = PipelineHealth::new();
        health.register(Stage::Analyzer).await;
        health.mark_running(Stage::Analyzer).await;

        let first = health.report().await.stages["analyzer"].since;

        // Same phase again: the timestamp must not move
        health.mark_running(Stage::Analyzer).await;
        let second = health.report().await.stages["analyzer"].since;
        assert_eq!(first, second);
    }

    #[test]
    fn test_stage_names_are_stable() {
        let names: Vec<&str> = Stage::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec![
                "discovery",
                "collector",
                "analyzer",
                "storage",
                "cleaner",
                "controller_link"
            ]
        );
    }
}
