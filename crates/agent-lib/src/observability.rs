//! Observability infrastructure for the coredump agent
//!
//! Provides:
//! - Prometheus metrics for every pipeline stage (names are part of the
//!   operational contract and scraped by existing dashboards)
//! - Structured JSON logging for significant domain events

use prometheus::{
    exponential_buckets, linear_buckets, register_gauge, register_gauge_vec, register_histogram,
    register_int_counter, register_int_gauge_vec, Gauge, GaugeVec, Histogram, IntCounter,
    IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    coredumps_discovered: IntCounter,
    coredumps_processed: IntCounter,
    coredumps_skipped: IntCounter,
    coredumps_errors: IntCounter,

    analysis_total: IntCounter,
    analysis_successful: IntCounter,
    analysis_failed: IntCounter,
    analysis_duration: Histogram,
    value_score_distribution: Histogram,

    files_stored: IntCounter,
    storage_size: Gauge,
    files_deleted: IntCounter,
    storage_errors: IntCounter,

    instances_uninstalled: IntCounter,
    cleanup_errors: IntCounter,
    restart_counts: GaugeVec,

    agent_up: Gauge,
    milvus_instances: IntGaugeVec,
    last_processed_file: Gauge,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            coredumps_discovered: register_int_counter!(
                "milvus_coredump_agent_coredumps_discovered_total",
                "Total number of coredump files discovered"
            )
            .expect("Failed to register coredumps_discovered"),

            coredumps_processed: register_int_counter!(
                "milvus_coredump_agent_coredumps_processed_total",
                "Total number of coredump files processed"
            )
            .expect("Failed to register coredumps_processed"),

            coredumps_skipped: register_int_counter!(
                "milvus_coredump_agent_coredumps_skipped_total",
                "Total number of coredump files skipped"
            )
            .expect("Failed to register coredumps_skipped"),

            coredumps_errors: register_int_counter!(
                "milvus_coredump_agent_coredumps_errors_total",
                "Total number of coredump processing errors"
            )
            .expect("Failed to register coredumps_errors"),

            analysis_total: register_int_counter!(
                "milvus_coredump_agent_analysis_total",
                "Total number of coredump analyses performed"
            )
            .expect("Failed to register analysis_total"),

            analysis_successful: register_int_counter!(
                "milvus_coredump_agent_analysis_successful_total",
                "Total number of successful coredump analyses"
            )
            .expect("Failed to register analysis_successful"),

            analysis_failed: register_int_counter!(
                "milvus_coredump_agent_analysis_failed_total",
                "Total number of failed coredump analyses"
            )
            .expect("Failed to register analysis_failed"),

            analysis_duration: register_histogram!(
                "milvus_coredump_agent_analysis_duration_seconds",
                "Duration of coredump analysis in seconds",
                exponential_buckets(1.0, 2.0, 10).expect("invalid buckets")
            )
            .expect("Failed to register analysis_duration"),

            value_score_distribution: register_histogram!(
                "milvus_coredump_agent_value_score_distribution",
                "Distribution of coredump value scores",
                linear_buckets(0.0, 1.0, 11).expect("invalid buckets")
            )
            .expect("Failed to register value_score_distribution"),

            files_stored: register_int_counter!(
                "milvus_coredump_agent_files_stored_total",
                "Total number of coredump files stored"
            )
            .expect("Failed to register files_stored"),

            storage_size: register_gauge!(
                "milvus_coredump_agent_storage_size_bytes",
                "Current storage size in bytes"
            )
            .expect("Failed to register storage_size"),

            files_deleted: register_int_counter!(
                "milvus_coredump_agent_files_deleted_total",
                "Total number of files deleted during retention cleanup"
            )
            .expect("Failed to register files_deleted"),

            storage_errors: register_int_counter!(
                "milvus_coredump_agent_storage_errors_total",
                "Total number of storage errors"
            )
            .expect("Failed to register storage_errors"),

            instances_uninstalled: register_int_counter!(
                "milvus_coredump_agent_instances_uninstalled_total",
                "Total number of Milvus instances uninstalled"
            )
            .expect("Failed to register instances_uninstalled"),

            cleanup_errors: register_int_counter!(
                "milvus_coredump_agent_cleanup_errors_total",
                "Total number of cleanup errors"
            )
            .expect("Failed to register cleanup_errors"),

            restart_counts: register_gauge_vec!(
                "milvus_coredump_agent_restart_counts",
                "Current restart counts for Milvus instances",
                &["instance", "namespace"]
            )
            .expect("Failed to register restart_counts"),

            agent_up: register_gauge!(
                "milvus_coredump_agent_up",
                "Whether the agent is up and running"
            )
            .expect("Failed to register agent_up"),

            milvus_instances: register_int_gauge_vec!(
                "milvus_coredump_agent_milvus_instances_total",
                "Total number of discovered Milvus instances",
                &["namespace", "type", "status"]
            )
            .expect("Failed to register milvus_instances"),

            last_processed_file: register_gauge!(
                "milvus_coredump_agent_last_processed_file_timestamp",
                "Timestamp of the last processed coredump file"
            )
            .expect("Failed to register last_processed_file"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn inc_coredumps_discovered(&self) {
        self.inner().coredumps_discovered.inc();
        self.inner()
            .last_processed_file
            .set(chrono::Utc::now().timestamp() as f64);
    }

    pub fn inc_coredumps_processed(&self) {
        self.inner().coredumps_processed.inc();
    }

    pub fn inc_coredumps_skipped(&self) {
        self.inner().coredumps_skipped.inc();
    }

    pub fn inc_coredumps_errors(&self) {
        self.inner().coredumps_errors.inc();
    }

    pub fn inc_analysis_total(&self) {
        self.inner().analysis_total.inc();
    }

    pub fn inc_analysis_successful(&self) {
        self.inner().analysis_successful.inc();
    }

    pub fn inc_analysis_failed(&self) {
        self.inner().analysis_failed.inc();
    }

    pub fn observe_analysis_duration(&self, duration_secs: f64) {
        self.inner().analysis_duration.observe(duration_secs);
    }

    pub fn observe_value_score(&self, score: f64) {
        self.inner().value_score_distribution.observe(score);
    }

    pub fn inc_files_stored(&self) {
        self.inner().files_stored.inc();
    }

    pub fn set_storage_size(&self, bytes: i64) {
        self.inner().storage_size.set(bytes as f64);
    }

    pub fn inc_files_deleted(&self) {
        self.inner().files_deleted.inc();
    }

    pub fn inc_storage_errors(&self) {
        self.inner().storage_errors.inc();
    }

    pub fn inc_instances_uninstalled(&self) {
        self.inner().instances_uninstalled.inc();
    }

    pub fn inc_cleanup_errors(&self) {
        self.inner().cleanup_errors.inc();
    }

    pub fn set_restart_count(&self, instance: &str, namespace: &str, count: i32) {
        self.inner()
            .restart_counts
            .with_label_values(&[instance, namespace])
            .set(count as f64);
    }

    pub fn set_agent_up(&self, up: bool) {
        self.inner().agent_up.set(if up { 1.0 } else { 0.0 });
    }

    pub fn set_instance_count(&self, namespace: &str, kind: &str, status: &str, count: i64) {
        self.inner()
            .milvus_instances
            .with_label_values(&[namespace, kind, status])
            .set(count);
    }
}

/// Structured logger for agent events
///
/// Provides consistent JSON-formatted logging for restarts, score
/// breakdowns, AI analyses, and cleanup decisions.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            "Coredump agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Coredump agent shutting down"
        );
    }

    pub fn log_restart_detected(
        &self,
        pod_name: &str,
        namespace: &str,
        container: &str,
        instance: &str,
        signal: i32,
        exit_code: i32,
        is_panic: bool,
    ) {
        info!(
            event = "restart_detected",
            node = %self.node_name,
            pod_name = %pod_name,
            namespace = %namespace,
            container = %container,
            instance = %instance,
            signal = signal,
            exit_code = exit_code,
            is_panic = is_panic,
            "Container restart detected"
        );
    }

    /// Log the deterministic score breakdown for one analyzed dump
    pub fn log_score_breakdown(&self, path: &str, breakdown: &str, total: f64) {
        info!(
            event = "value_score_computed",
            node = %self.node_name,
            path = %path,
            breakdown = %breakdown,
            total = total,
            "Value score computed"
        );
    }

    pub fn log_ai_analysis(&self, path: &str, tokens: i64, cost_usd: f64, confidence: f64) {
        info!(
            event = "ai_analysis_completed",
            node = %self.node_name,
            path = %path,
            tokens = tokens,
            cost_usd = cost_usd,
            confidence = confidence,
            "AI analysis completed"
        );
    }

    pub fn log_ai_denied(&self, path: &str, reason: &str) {
        warn!(
            event = "ai_analysis_denied",
            node = %self.node_name,
            path = %path,
            reason = %reason,
            "AI analysis denied"
        );
    }

    pub fn log_cleanup_scheduled(&self, instance: &str, namespace: &str, restarts: i32) {
        warn!(
            event = "cleanup_scheduled",
            node = %self.node_name,
            instance = %instance,
            namespace = %namespace,
            restarts = restarts,
            "Instance exceeded restart threshold, cleanup scheduled"
        );
    }

    pub fn log_cleanup_completed(&self, instance: &str, namespace: &str) {
        info!(
            event = "cleanup_completed",
            node = %self.node_name,
            instance = %instance,
            namespace = %namespace,
            "Instance decommissioned"
        );
    }

    pub fn log_cleanup_failed(&self, instance: &str, namespace: &str, error: &str) {
        warn!(
            event = "cleanup_failed",
            node = %self.node_name,
            instance = %instance,
            namespace = %namespace,
            error = %error,
            "Instance cleanup failed"
        );
    }

    pub fn log_file_stored(&self, path: &str, stored_as: &str, score: f64) {
        info!(
            event = "file_stored",
            node = %self.node_name,
            path = %path,
            stored_as = %stored_as,
            score = score,
            "Coredump stored"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_metrics_creation() {
        // Metrics register against the process-global registry, so this
        // exercises the full set once.
        let metrics = AgentMetrics::new();

        metrics.inc_coredumps_discovered();
        metrics.inc_coredumps_processed();
        metrics.inc_analysis_total();
        metrics.observe_analysis_duration(1.5);
        metrics.observe_value_score(8.0);
        metrics.inc_files_stored();
        metrics.set_storage_size(1024);
        metrics.set_restart_count("rel1", "ns1", 3);
        metrics.set_agent_up(true);
        metrics.set_instance_count("ns1", "helm", "running", 2);
    }

    #[test]
    fn test_metric_names_are_exposed() {
        let metrics = AgentMetrics::new();
        metrics.inc_coredumps_discovered();

        let families = prometheus::gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"milvus_coredump_agent_coredumps_discovered_total"));
        assert!(names.contains(&"milvus_coredump_agent_value_score_distribution"));
        assert!(names.contains(&"milvus_coredump_agent_up"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-node");
        assert_eq!(logger.node_name, "test-node");
    }
}
