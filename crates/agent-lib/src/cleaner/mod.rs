//! Crash-loop decommissioning
//!
//! Tracks panic restarts per instance in a sliding window and, after
//! controller approval, uninstalls the offending deployment. Cleanup
//! fails closed: without an approval the cleaner never acts.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams};
use kube::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::CleanerConfig;
use crate::controller::ControllerClient;
use crate::discovery::InstanceView;
use crate::models::{CleanupEvent, DeploymentType, RestartEvent, StorageEvent};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::persistence::{Database, EventStore, InstanceStore};

/// Capacity of the cleanup event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Tracker garbage collection cadence
const GC_INTERVAL: Duration = Duration::from_secs(3600);
/// Idle trackers older than this are collected
const TRACKER_MAX_IDLE: chrono::Duration = chrono::Duration::hours(24);

/// Per-instance sliding window of panic restarts
#[derive(Debug, Clone)]
pub struct RestartTracker {
    pub count: i32,
    pub first_restart: DateTime<Utc>,
    pub last_restart: DateTime<Utc>,
    pub instance_name: String,
    pub namespace: String,
    pub cleaned: bool,
}

/// Decommissions chronically crashing instances
pub struct Cleaner {
    config: CleanerConfig,
    kube_client: Option<Client>,
    instances: InstanceView,
    controller: Option<Arc<ControllerClient>>,
    trackers: Mutex<HashMap<String, RestartTracker>>,
    event_tx: broadcast::Sender<CleanupEvent>,
    db: Option<Arc<Database>>,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl Cleaner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CleanerConfig,
        kube_client: Option<Client>,
        instances: InstanceView,
        controller: Option<Arc<ControllerClient>>,
        db: Option<Arc<Database>>,
        metrics: AgentMetrics,
        logger: StructuredLogger,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            kube_client,
            instances,
            controller,
            trackers: Mutex::new(HashMap::new()),
            event_tx,
            db,
            metrics,
            logger,
        })
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CleanupEvent> {
        self.event_tx.subscribe()
    }

    /// Restart event consumer; the whole component is a no-op when disabled
    pub async fn run_restart_listener(
        self: Arc<Self>,
        mut restarts: broadcast::Receiver<RestartEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        if !self.config.enabled {
            info!("Auto cleanup is disabled");
            return;
        }

        info!(
            max_restarts = self.config.max_restart_count,
            window_secs = self.config.restart_time_window_secs,
            "Starting auto cleanup manager"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutting down cleaner restart listener");
                    break;
                }
                event = restarts.recv() => {
                    match event {
                        Ok(event) if event.is_panic => self.handle_restart_event(&event),
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Cleaner lagged on restart events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    /// Storage event consumer: a stored dump re-evaluates its instance
    pub async fn run_storage_listener(
        self: Arc<Self>,
        mut storage_events: broadcast::Receiver<StorageEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        if !self.config.enabled {
            return;
        }

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = storage_events.recv() => {
                    match event {
                        Ok(StorageEvent::FileStored { file }) => {
                            self.evaluate_for_cleanup(&file.instance_name, &file.pod_namespace);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Cleaner lagged on storage events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    /// Hourly tracker garbage collection
    pub async fn run_gc(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            return;
        }

        let mut ticker = interval(GC_INTERVAL);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.collect_idle_trackers(Utc::now()),
                _ = shutdown.recv() => break,
            }
        }
    }

    /// Apply one panic restart to the sliding window
    pub fn handle_restart_event(self: &Arc<Self>, event: &RestartEvent) {
        let key = format!("{}/{}", event.pod_namespace, event.instance_name);
        let window = chrono::Duration::from_std(self.config.restart_time_window())
            .unwrap_or_else(|_| chrono::Duration::minutes(10));

        let schedule = {
            let mut trackers = self.trackers.lock().expect("tracker map poisoned");
            let tracker = trackers.entry(key.clone()).or_insert_with(|| RestartTracker {
                count: 0,
                first_restart: event.restart_time,
                last_restart: event.restart_time,
                instance_name: event.instance_name.clone(),
                namespace: event.pod_namespace.clone(),
                cleaned: false,
            });

            if tracker.count == 0 {
                tracker.count = 1;
            } else if event.restart_time - tracker.first_restart > window {
                tracker.count = 1;
                tracker.first_restart = event.restart_time;
            } else {
                tracker.count += 1;
            }
            tracker.last_restart = event.restart_time;

            debug!(
                instance = %key,
                count = tracker.count,
                window_secs = self.config.restart_time_window_secs,
                "Restart count updated"
            );
            self.metrics
                .set_restart_count(&tracker.instance_name, &tracker.namespace, tracker.count);

            tracker.count >= self.config.max_restart_count && !tracker.cleaned
        };

        if schedule {
            self.logger.log_cleanup_scheduled(
                &event.instance_name,
                &event.pod_namespace,
                self.config.max_restart_count,
            );
            self.send_event(CleanupEvent::RestartThresholdExceeded {
                instance_name: event.instance_name.clone(),
                namespace: event.pod_namespace.clone(),
                count: self.config.max_restart_count,
            });

            let this = self.clone();
            let instance_name = event.instance_name.clone();
            let namespace = event.pod_namespace.clone();
            tokio::spawn(async move {
                this.schedule_cleanup(instance_name, namespace).await;
            });
        }
    }

    /// Immediate re-evaluation after a stored dump
    pub fn evaluate_for_cleanup(self: &Arc<Self>, instance_name: &str, namespace: &str) {
        if instance_name.is_empty() || namespace.is_empty() {
            return;
        }

        let key = format!("{}/{}", namespace, instance_name);
        let eligible = {
            let trackers = self.trackers.lock().expect("tracker map poisoned");
            trackers
                .get(&key)
                .map(|t| t.count >= self.config.max_restart_count && !t.cleaned)
                .unwrap_or(false)
        };

        if eligible {
            info!(instance = %key, "Stored coredump triggered immediate cleanup evaluation");
            let this = self.clone();
            let instance_name = instance_name.to_string();
            let namespace = namespace.to_string();
            tokio::spawn(async move {
                this.schedule_cleanup(instance_name, namespace).await;
            });
        }
    }

    /// Delay, re-check, arbitrate, act
    async fn schedule_cleanup(&self, instance_name: String, namespace: String) {
        tokio::time::sleep(self.config.cleanup_delay()).await;

        let key = format!("{}/{}", namespace, instance_name);
        let restart_count = {
            let mut trackers = self.trackers.lock().expect("tracker map poisoned");
            let Some(tracker) = trackers.get_mut(&key) else {
                return;
            };
            if tracker.cleaned {
                debug!(instance = %key, "Instance already cleaned, skipping");
                return;
            }
            // Claim before acting so concurrent schedules cannot double-fire
            tracker.cleaned = true;
            tracker.count
        };

        if let Some(denial) = self.arbitrate(&instance_name, &namespace, restart_count).await {
            info!(instance = %key, reason = %denial, "Cleanup denied");
            self.send_event(CleanupEvent::CleanupSkipped {
                instance_name: instance_name.clone(),
                namespace: namespace.clone(),
                reason: denial,
            });
            // Denials do not consume the local flag
            self.reset_cleaned_flag(&key);
            return;
        }

        match self.cleanup_instance(&instance_name, &namespace).await {
            Ok(()) => {
                self.logger.log_cleanup_completed(&instance_name, &namespace);
                self.metrics.inc_instances_uninstalled();
                if let Some(db) = &self.db {
                    let _ = InstanceStore::new(db).delete(&instance_name);
                }
                self.send_event(CleanupEvent::InstanceUninstalled {
                    instance_name,
                    namespace,
                    reason: "Automatic cleanup due to repeated crashes".to_string(),
                });
            }
            Err(e) => {
                self.logger
                    .log_cleanup_failed(&instance_name, &namespace, &e.to_string());
                self.metrics.inc_cleanup_errors();
                self.send_event(CleanupEvent::CleanupError {
                    instance_name,
                    namespace,
                    error: e.to_string(),
                });
                self.reset_cleaned_flag(&key);
            }
        }
    }

    /// Ask the controller; returns the denial reason when refused.
    /// Cleanup never proceeds without an approval.
    async fn arbitrate(
        &self,
        instance_name: &str,
        namespace: &str,
        restart_count: i32,
    ) -> Option<String> {
        let Some(controller) = &self.controller else {
            return None;
        };

        let deployment_type = self
            .deployment_type_of(instance_name, namespace)
            .map(|t| t.to_string())
            .unwrap_or_else(|| "helm".to_string());

        match controller
            .request_cleanup(instance_name, namespace, restart_count, &deployment_type)
            .await
        {
            Ok(response) if response.allowed => None,
            Ok(response) => Some(response.reason),
            Err(e) => {
                warn!(error = %e, "Controller unreachable for cleanup arbitration");
                Some("controller unreachable".to_string())
            }
        }
    }

    fn reset_cleaned_flag(&self, key: &str) {
        let mut trackers = self.trackers.lock().expect("tracker map poisoned");
        if let Some(tracker) = trackers.get_mut(key) {
            tracker.cleaned = false;
        }
    }

    fn deployment_type_of(&self, instance_name: &str, namespace: &str) -> Option<DeploymentType> {
        let key = format!("{}/{}", namespace, instance_name);
        self.instances
            .read()
            .expect("instance view lock poisoned")
            .get(&key)
            .map(|i| i.deployment_type)
    }

    async fn cleanup_instance(&self, instance_name: &str, namespace: &str) -> Result<()> {
        let key = format!("{}/{}", namespace, instance_name);
        let Some(deployment_type) = self.deployment_type_of(instance_name, namespace) else {
            bail!("instance not found: {}", key);
        };

        match deployment_type {
            DeploymentType::Helm => self.uninstall_helm_release(instance_name, namespace).await,
            DeploymentType::Operator => {
                self.delete_operator_instance(instance_name, namespace).await
            }
        }
    }

    /// `helm uninstall <release> -n <namespace>`; "not found" is success
    async fn uninstall_helm_release(&self, release: &str, namespace: &str) -> Result<()> {
        info!(release = %release, namespace = %namespace, "Uninstalling Helm release");

        let mut command = tokio::process::Command::new("helm");
        command
            .args(["uninstall", release, "-n", namespace])
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.config.uninstall_timeout(), command.output())
            .await
            .map_err(|_| anyhow::anyhow!("helm uninstall timed out"))?
            .context("failed to run helm")?;

        if !output.status.success() {
            let combined = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            if combined.contains("not found") {
                info!(release = %release, "Helm release not found, may already be uninstalled");
                return Ok(());
            }
            bail!("helm uninstall failed: {}", combined.trim());
        }

        info!(release = %release, "Helm release uninstalled");
        Ok(())
    }

    /// Delete pods and deployments matching the instance label selector
    async fn delete_operator_instance(&self, instance_name: &str, namespace: &str) -> Result<()> {
        info!(instance = %instance_name, namespace = %namespace, "Deleting operator instance");

        let Some(client) = &self.kube_client else {
            bail!("no Kubernetes client available for operator cleanup");
        };

        let selector = format!("app.kubernetes.io/name={}", instance_name);
        let list_params = ListParams::default().labels(&selector);
        let delete_params = DeleteParams::default();

        let work = async {
            let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
            pods.delete_collection(&delete_params, &list_params)
                .await
                .context("failed to delete operator instance pods")?;

            let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
            deployments
                .delete_collection(&delete_params, &list_params)
                .await
                .context("failed to delete operator instance deployments")?;

            Ok::<_, anyhow::Error>(())
        };

        tokio::time::timeout(self.config.uninstall_timeout(), work)
            .await
            .map_err(|_| anyhow::anyhow!("operator instance deletion timed out"))??;

        info!(instance = %instance_name, "Operator instance deleted");
        Ok(())
    }

    /// Drop trackers idle for a day
    pub fn collect_idle_trackers(&self, now: DateTime<Utc>) {
        let mut trackers = self.trackers.lock().expect("tracker map poisoned");
        trackers.retain(|key, tracker| {
            let keep = now - tracker.last_restart < TRACKER_MAX_IDLE;
            if !keep {
                debug!(instance = %key, "Removed idle restart tracker");
            }
            keep
        });
    }

    /// Snapshot of the tracker map
    pub fn restart_counts(&self) -> HashMap<String, RestartTracker> {
        self.trackers.lock().expect("tracker map poisoned").clone()
    }

    fn send_event(&self, event: CleanupEvent) {
        if let Some(db) = &self.db {
            if let Err(e) = EventStore::new(db).record_cleanup(&event) {
                warn!(error = %e, "Failed to persist cleanup event");
            }
        }
        let _ = self.event_tx.send(event);
    }
}
