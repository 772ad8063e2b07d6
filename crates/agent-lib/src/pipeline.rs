//! Pipeline wiring for the per-node agent
//!
//! Composes Discovery -> Collector -> Analyzer -> Storage -> Cleaner over
//! bounded channels. Producers never block: mpsc hops drop on full and
//! broadcast hops let lagging consumers skip ahead. Periodic scans
//! resynchronise whatever the channels dropped.

use anyhow::{Context, Result};
use kube::Client;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::analyzer::{ai::AiAnalyzer, Analyzer};
use crate::cleaner::Cleaner;
use crate::collector::Collector;
use crate::config::Config;
use crate::controller::ControllerClient;
use crate::discovery::Discovery;
use crate::health::{PipelineHealth, Stage};
use crate::models::{RestartEvent, StorageEvent};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::persistence::{CoredumpStore, Database, EventStore, InstanceStore};
use crate::storage::Storage;

/// A running agent pipeline
pub struct Pipeline {
    shutdown_tx: broadcast::Sender<()>,
    error_rx: mpsc::Receiver<anyhow::Error>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Pipeline {
    /// Construct every stage and spawn their tasks
    pub async fn start(
        config: Config,
        kube_client: Client,
        db: Option<Arc<Database>>,
        controller: Option<Arc<ControllerClient>>,
        health: PipelineHealth,
    ) -> Result<Self> {
        let metrics = AgentMetrics::new();
        let logger = StructuredLogger::new(&config.agent.node_name);

        let (shutdown_tx, _) = broadcast::channel(1);
        // Sized to the number of top-level tasks so failure reporting
        // can never block
        let (error_tx, error_rx) = mpsc::channel(16);

        // Every enabled stage starts in Starting and blocks readiness
        // until its tasks are spawned below
        for stage in [
            Stage::Discovery,
            Stage::Collector,
            Stage::Analyzer,
            Stage::Storage,
        ] {
            health.register(stage).await;
        }
        if config.cleaner.enabled {
            health.register(Stage::Cleaner).await;
        } else {
            health.disable(Stage::Cleaner).await;
        }
        if controller.is_some() {
            health.register(Stage::ControllerLink).await;
        } else {
            health.disable(Stage::ControllerLink).await;
        }

        let discovery = Arc::new(Discovery::new(
            kube_client.clone(),
            config.discovery.clone(),
            metrics.clone(),
            logger.clone(),
        ));
        let instance_view = discovery.instance_view();

        let (collector, collection_rx) = Collector::new(
            config.collector.clone(),
            instance_view.clone(),
            metrics.clone(),
        );
        if let Some(db) = &db {
            match CoredumpStore::new(db).processed_paths() {
                Ok(paths) => collector.seed_processed(paths),
                Err(e) => warn!(error = %e, "Failed to seed processed-set from database"),
            }
        }

        let ai = AiAnalyzer::new(
            config.analyzer.ai_analysis.clone(),
            controller.clone(),
            logger.clone(),
        )
        .context("failed to initialize AI analyzer")?;

        let (analyzer, analysis_rx) = Analyzer::new(
            config.analyzer.clone(),
            ai,
            db.clone(),
            health.clone(),
            metrics.clone(),
            logger.clone(),
        );

        let storage = Storage::new(
            config.storage.clone(),
            config.analyzer.value_threshold,
            db.clone(),
            health.clone(),
            metrics.clone(),
            logger.clone(),
        )
        .context("failed to create storage manager")?;

        let cleaner = Cleaner::new(
            config.cleaner.clone(),
            Some(kube_client),
            instance_view,
            controller.clone(),
            db.clone(),
            metrics.clone(),
            logger.clone(),
        );

        let mut tasks = Vec::new();
        let mut spawn = |name: &'static str, fut: futures::future::BoxFuture<'static, ()>| {
            let error_tx = error_tx.clone();
            tasks.push(tokio::spawn(async move {
                // Stage tasks only return on shutdown; a panic here is a
                // class-6 failure that tears down the process.
                if let Err(panic) = tokio::spawn(fut).await {
                    let _ = error_tx
                        .try_send(anyhow::anyhow!("{} task failed: {}", name, panic));
                }
            }));
        };

        spawn(
            "discovery-scan",
            Box::pin(discovery.clone().run_scan_loop(shutdown_tx.subscribe())),
        );
        spawn(
            "discovery-watch",
            Box::pin(discovery.clone().run_watch_loop(shutdown_tx.subscribe())),
        );
        health.mark_running(Stage::Discovery).await;

        spawn(
            "collector-scan",
            Box::pin(collector.clone().run_scan_loop(shutdown_tx.subscribe())),
        );
        spawn(
            "collector-restarts",
            Box::pin(collector.clone().run_restart_listener(
                discovery.subscribe_restarts(),
                shutdown_tx.subscribe(),
            )),
        );
        health.mark_running(Stage::Collector).await;

        spawn(
            "analyzer",
            Box::pin(analyzer.clone().run(collection_rx, shutdown_tx.subscribe())),
        );
        health.mark_running(Stage::Analyzer).await;

        spawn(
            "storage-ingest",
            Box::pin(storage.clone().run_ingest(analysis_rx, shutdown_tx.subscribe())),
        );
        spawn(
            "storage-retention",
            Box::pin(storage.clone().run_retention(shutdown_tx.subscribe())),
        );
        health.mark_running(Stage::Storage).await;

        spawn(
            "cleaner-restarts",
            Box::pin(cleaner.clone().run_restart_listener(
                discovery.subscribe_restarts(),
                shutdown_tx.subscribe(),
            )),
        );
        spawn(
            "cleaner-storage",
            Box::pin(
                cleaner
                    .clone()
                    .run_storage_listener(storage.subscribe(), shutdown_tx.subscribe()),
            ),
        );
        spawn("cleaner-gc", Box::pin(cleaner.clone().run_gc(shutdown_tx.subscribe())));
        if config.cleaner.enabled {
            health.mark_running(Stage::Cleaner).await;
        }

        if let Some(db) = db.clone() {
            spawn(
                "event-recorder",
                Box::pin(run_event_recorder(
                    db.clone(),
                    discovery.subscribe_restarts(),
                    storage.subscribe(),
                    shutdown_tx.subscribe(),
                )),
            );
            spawn(
                "db-retention",
                Box::pin(run_db_retention(
                    db.clone(),
                    config.database.retention_days,
                    shutdown_tx.subscribe(),
                )),
            );
            spawn(
                "instance-recorder",
                Box::pin(run_instance_recorder(
                    db,
                    discovery.clone(),
                    config.discovery.scan_interval(),
                    shutdown_tx.subscribe(),
                )),
            );
        }

        if let Some(controller) = controller {
            // The heartbeat loop owns the link phase: running on an
            // acknowledged beat, degraded while unreachable
            spawn(
                "heartbeat",
                Box::pin(
                    controller.run_heartbeat_loop(health.clone(), shutdown_tx.subscribe()),
                ),
            );
        }

        metrics.set_agent_up(true);

        info!(tasks = tasks.len(), "All pipeline stages started");

        Ok(Self {
            shutdown_tx,
            error_rx,
            tasks,
        })
    }

    /// Block until shutdown is requested or a stage dies
    pub async fn run_until(&mut self, mut shutdown_signal: broadcast::Receiver<()>) -> Result<()> {
        tokio::select! {
            _ = shutdown_signal.recv() => {
                info!("Shutdown signal received");
                Ok(())
            }
            error = self.error_rx.recv() => {
                match error {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        }
    }

    /// Cancel producers first, then wait for consumers to drain
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            let _ = task.await;
        }
        AgentMetrics::new().set_agent_up(false);
    }
}

/// Persist restart and storage event streams
async fn run_event_recorder(
    db: Arc<Database>,
    mut restarts: broadcast::Receiver<RestartEvent>,
    mut storage_events: broadcast::Receiver<StorageEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            event = restarts.recv() => {
                match event {
                    Ok(event) => {
                        if let Err(e) = EventStore::new(&db).record_restart(&event) {
                            warn!(error = %e, "Failed to persist restart event");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            event = storage_events.recv() => {
                match event {
                    Ok(event) => {
                        if let Err(e) = EventStore::new(&db).record_storage(&event) {
                            warn!(error = %e, "Failed to persist storage event");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

/// Daily purge of event rows past the retention horizon
async fn run_db_retention(
    db: Arc<Database>,
    retention_days: u32,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(24 * 3600));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = db.cleanup_old_records(retention_days) {
                    warn!(error = %e, "Failed to clean up old database records");
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

/// Persist the discovered instance view on the scan cadence
async fn run_instance_recorder(
    db: Arc<Database>,
    discovery: Arc<Discovery>,
    scan_interval: std::time::Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(scan_interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let instances: Vec<_> = discovery
                    .instance_view()
                    .read()
                    .expect("instance view lock poisoned")
                    .values()
                    .cloned()
                    .collect();

                for instance in instances {
                    if let Err(e) = InstanceStore::new(&db).save(&instance) {
                        warn!(instance = %instance.key(), error = %e, "Failed to persist instance");
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
