//! Milvus instance discovery and restart detection
//!
//! Periodically enumerates pods in the configured namespaces, classifies
//! Helm- and operator-managed Milvus workloads, and watches pod updates
//! to emit restart events with panic classification.

use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::api::{Api, ListParams};
use kube::runtime::watcher;
use kube::Client;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::models::{
    ContainerStatusInfo, DeploymentType, InstanceStatus, MilvusInstance, PodInfo, RestartEvent,
};
use crate::observability::{AgentMetrics, StructuredLogger};

/// Capacity of the restart event channel; lagging consumers see gaps
pub const RESTART_CHANNEL_CAPACITY: usize = 100;

/// Published view of discovered instances, replaced wholesale per scan
pub type InstanceView = Arc<RwLock<HashMap<String, MilvusInstance>>>;

/// Discovers Milvus instances and emits restart events
pub struct Discovery {
    client: Client,
    config: DiscoveryConfig,
    instances: InstanceView,
    restart_tx: broadcast::Sender<RestartEvent>,
    /// Last seen restart count per (pod key, container), for increment detection
    restart_snapshots: DashMap<String, HashMap<String, i32>>,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl Discovery {
    pub fn new(
        client: Client,
        config: DiscoveryConfig,
        metrics: AgentMetrics,
        logger: StructuredLogger,
    ) -> Self {
        let (restart_tx, _) = broadcast::channel(RESTART_CHANNEL_CAPACITY);
        Self {
            client,
            config,
            instances: Arc::new(RwLock::new(HashMap::new())),
            restart_tx,
            restart_snapshots: DashMap::new(),
            metrics,
            logger,
        }
    }

    /// Handle to the published instance view
    pub fn instance_view(&self) -> InstanceView {
        self.instances.clone()
    }

    /// Subscribe to the restart event stream
    pub fn subscribe_restarts(&self) -> broadcast::Receiver<RestartEvent> {
        self.restart_tx.subscribe()
    }

    /// Scan loop: immediate initial scan, then every `scan_interval`
    pub async fn run_scan_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.scan_interval_secs,
            namespaces = ?self.config.namespaces,
            "Starting Milvus instance discovery"
        );

        let mut ticker = interval(self.config.scan_interval());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scan_all_namespaces().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down discovery scan loop");
                    break;
                }
            }
        }
    }

    /// Watch loop: one pod watcher per configured namespace
    pub async fn run_watch_loop(self: Arc<Self>, shutdown: broadcast::Receiver<()>) {
        let mut handles = Vec::new();
        for namespace in self.config.namespaces.clone() {
            let this = self.clone();
            let rx = shutdown.resubscribe();
            handles.push(tokio::spawn(async move {
                this.watch_namespace(namespace, rx).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn scan_all_namespaces(&self) {
        let mut discovered: HashMap<String, MilvusInstance> = HashMap::new();

        for namespace in &self.config.namespaces {
            match self.scan_namespace(namespace).await {
                Ok(instances) => discovered.extend(instances),
                Err(e) => {
                    // Listing failures are retried on the next tick
                    warn!(namespace = %namespace, error = %e, "Failed to scan namespace");
                }
            }
        }

        self.publish_instance_metrics(&discovered);

        let count = discovered.len();
        *self.instances.write().expect("instance view lock poisoned") = discovered;
        debug!(instances = count, "Instance view updated");
    }

    async fn scan_namespace(&self, namespace: &str) -> Result<HashMap<String, MilvusInstance>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default())
            .await
            .with_context(|| format!("failed to list pods in {}", namespace))?;

        debug!(namespace = %namespace, pods = pods.items.len(), "Scanned namespace");

        let mut instances: HashMap<String, MilvusInstance> = HashMap::new();
        for pod in &pods.items {
            let Some(mut instance) = self.identify_instance(pod) else {
                continue;
            };

            let pod_info = pod_info_from(pod);
            match instances.get_mut(&instance.key()) {
                Some(existing) => existing.pods.push(pod_info),
                None => {
                    instance.pods.push(pod_info);
                    instances.insert(instance.key(), instance);
                }
            }
        }

        Ok(instances)
    }

    fn publish_instance_metrics(&self, instances: &HashMap<String, MilvusInstance>) {
        let mut counts: HashMap<(String, String, String), i64> = HashMap::new();
        for instance in instances.values() {
            *counts
                .entry((
                    instance.namespace.clone(),
                    instance.deployment_type.to_string(),
                    instance.status.to_string(),
                ))
                .or_default() += 1;
        }
        for ((namespace, kind, status), count) in counts {
            self.metrics
                .set_instance_count(&namespace, &kind, &status, count);
        }
    }

    /// Classify a pod and derive the owning instance, if it is Milvus
    pub fn identify_instance(&self, pod: &Pod) -> Option<MilvusInstance> {
        let labels: HashMap<String, String> = pod
            .metadata
            .labels
            .as_ref()
            .map(|l| l.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        let deployment_type = classify_pod(&labels, &self.config)?;
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        let name = extract_instance_name(&labels, deployment_type, &pod_name);
        if name.is_empty() {
            return None;
        }

        Some(MilvusInstance {
            name,
            namespace,
            deployment_type,
            labels,
            status: instance_status_from(pod),
            created_at: pod
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0)
                .unwrap_or_else(Utc::now),
            pods: Vec::new(),
        })
    }

    async fn watch_namespace(&self, namespace: String, mut shutdown: broadcast::Receiver<()>) {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let mut stream = watcher(api, watcher::Config::default()).boxed();

        info!(namespace = %namespace, "Watching pods for restarts");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(namespace = %namespace, "Shutting down pod watcher");
                    break;
                }
                item = stream.next() => {
                    match item {
                        Some(Ok(watcher::Event::Apply(pod)))
                        | Some(Ok(watcher::Event::InitApply(pod))) => {
                            self.handle_pod_update(&pod);
                        }
                        Some(Ok(watcher::Event::Delete(pod))) => {
                            if let Some(key) = pod_key(&pod) {
                                self.restart_snapshots.remove(&key);
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            // The watcher re-lists on its own; just surface the error
                            warn!(namespace = %namespace, error = %e, "Pod watch error");
                        }
                        None => break,
                    }
                }
            }
        }
    }

    fn handle_pod_update(&self, pod: &Pod) {
        let Some(instance) = self.identify_instance(pod) else {
            return;
        };
        let Some(key) = pod_key(pod) else {
            return;
        };

        let statuses = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref());
        let Some(statuses) = statuses else {
            return;
        };

        let mut snapshot = self.restart_snapshots.entry(key.clone()).or_default();
        let first_sighting = snapshot.is_empty();

        for status in statuses {
            let previous = snapshot.get(&status.name).copied();
            snapshot.insert(status.name.clone(), status.restart_count);

            // Only a strict increase over a known snapshot is a restart;
            // the initial listing seeds the snapshot without emitting.
            if first_sighting {
                continue;
            }
            let Some(previous) = previous else {
                continue;
            };
            if status.restart_count <= previous {
                continue;
            }

            let event = restart_event_from(pod, status, &instance.name);
            self.logger.log_restart_detected(
                &event.pod_name,
                &event.pod_namespace,
                &event.container_name,
                &event.instance_name,
                event.signal,
                event.exit_code,
                event.is_panic,
            );

            if self.restart_tx.send(event).is_err() {
                warn!(pod = %key, "No restart event subscribers, dropping event");
            }
        }
    }
}

fn pod_key(pod: &Pod) -> Option<String> {
    let name = pod.metadata.name.as_ref()?;
    let namespace = pod.metadata.namespace.as_ref()?;
    Some(format!("{}/{}", namespace, name))
}

/// Classify a pod by its labels: Helm predicates win over operator ones
pub fn classify_pod(
    labels: &HashMap<String, String>,
    config: &DiscoveryConfig,
) -> Option<DeploymentType> {
    if matches_all(labels, &config.helm_release_labels) {
        return Some(DeploymentType::Helm);
    }
    if matches_all(labels, &config.operator_labels) {
        return Some(DeploymentType::Operator);
    }
    None
}

fn matches_all(labels: &HashMap<String, String>, predicates: &[String]) -> bool {
    if predicates.is_empty() {
        return false;
    }
    predicates.iter().all(|predicate| {
        match predicate.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(predicate),
        }
    })
}

/// Instance name from the declared attribute list, falling back to the pod name
pub fn extract_instance_name(
    labels: &HashMap<String, String>,
    deployment_type: DeploymentType,
    pod_name: &str,
) -> String {
    let candidates: &[&str] = match deployment_type {
        DeploymentType::Helm => &["app.kubernetes.io/instance", "helm.sh/release"],
        DeploymentType::Operator => &["app.kubernetes.io/name", "milvus.io/instance"],
    };

    for key in candidates {
        if let Some(value) = labels.get(*key) {
            return value.clone();
        }
    }

    pod_name.to_string()
}

fn instance_status_from(pod: &Pod) -> InstanceStatus {
    match pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("")
    {
        "Running" => InstanceStatus::Running,
        "Failed" => InstanceStatus::Failed,
        "Pending" => InstanceStatus::Pending,
        _ => InstanceStatus::Terminating,
    }
}

/// Build the pod-level snapshot kept on each instance
pub fn pod_info_from(pod: &Pod) -> PodInfo {
    let mut restart_count = 0;
    let mut last_restart = None;
    let mut container_statuses = Vec::new();

    if let Some(statuses) = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
    {
        for status in statuses {
            restart_count += status.restart_count;

            let terminated = status
                .last_state
                .as_ref()
                .and_then(|s| s.terminated.as_ref());

            if let Some(finished) = terminated.and_then(|t| t.finished_at.as_ref()) {
                if last_restart.map(|prev| finished.0 > prev).unwrap_or(true) {
                    last_restart = Some(finished.0);
                }
            }

            container_statuses.push(ContainerStatusInfo {
                name: status.name.clone(),
                restart_count: status.restart_count,
                ready: status.ready,
                last_termination_reason: terminated
                    .and_then(|t| t.reason.clone())
                    .unwrap_or_default(),
                last_termination_message: terminated
                    .and_then(|t| t.message.clone())
                    .unwrap_or_default(),
            });
        }
    }

    PodInfo {
        name: pod.metadata.name.clone().unwrap_or_default(),
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        status: pod
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_default(),
        restart_count,
        last_restart,
        container_statuses,
    }
}

fn restart_event_from(pod: &Pod, status: &ContainerStatus, instance_name: &str) -> RestartEvent {
    let terminated = status
        .last_state
        .as_ref()
        .and_then(|s| s.terminated.as_ref());

    let reason = terminated
        .and_then(|t| t.reason.clone())
        .unwrap_or_default();
    let message = terminated
        .and_then(|t| t.message.clone())
        .unwrap_or_default();
    let exit_code = terminated.map(|t| t.exit_code).unwrap_or_default();
    let signal = terminated.and_then(|t| t.signal).unwrap_or_default();

    let is_panic = is_panic_restart(&reason, &message, exit_code, signal);

    RestartEvent {
        pod_name: pod.metadata.name.clone().unwrap_or_default(),
        pod_namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        container_name: status.name.clone(),
        restart_time: Utc::now(),
        reason,
        message,
        exit_code,
        signal,
        instance_name: instance_name.to_string(),
        is_panic,
    }
}

/// Panic classification rule
///
/// A restart is a panic iff a known panic token appears in the reason or
/// message, or the terminating signal is SIGSEGV/SIGABRT/SIGFPE, or the
/// exit code is outside the benign set {0, 1, 130, 143}. Probe-triggered
/// restarts (liveness/readiness/startup) are never panics.
pub fn is_panic_restart(reason: &str, message: &str, exit_code: i32, signal: i32) -> bool {
    let reason_lower = reason.to_lowercase();
    let message_lower = message.to_lowercase();

    if reason_lower.contains("liveness")
        || reason_lower.contains("readiness")
        || reason_lower.contains("startup")
    {
        return false;
    }

    const PANIC_INDICATORS: &[&str] = &[
        "panic",
        "fatal",
        "sigsegv",
        "sigabrt",
        "sigfpe",
        "assertion failed",
    ];
    for indicator in PANIC_INDICATORS {
        if reason_lower.contains(indicator) || message_lower.contains(indicator) {
            return true;
        }
    }

    if signal == 11 || signal == 6 || signal == 8 {
        return true;
    }

    if exit_code != 0 && exit_code != 1 && exit_code != 130 && exit_code != 143 {
        return true;
    }

    false
}
