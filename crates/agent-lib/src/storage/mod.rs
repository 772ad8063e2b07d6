//! Dump persistence with compression and retention
//!
//! Dumps whose value score passes the threshold are compressed and
//! written under a deterministic naming scheme. An hourly retention
//! pass deletes by age first, then evicts the lowest-value files until
//! the total size fits the budget.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::health::{PipelineHealth, Stage};
use crate::models::{AnalysisEvent, CoredumpFile, FileStatus, StorageEvent};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::persistence::{CoredumpStore, Database};

/// Capacity of the storage event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Retention pass cadence
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
/// Fallback storage budget when the configured size fails to parse
const DEFAULT_MAX_STORAGE: i64 = 50 * 1024 * 1024 * 1024;

/// A file tracked by a storage backend
#[derive(Debug, Clone)]
pub struct StoredFile {
    /// Path relative to the backend root
    pub path: String,
    pub size: i64,
    pub stored_at: DateTime<Utc>,
    pub value_score: f64,
    pub instance_name: String,
}

/// Storage backend capability set
#[async_trait]
pub trait Backend: Send + Sync {
    /// Persist `reader` under a name derived from the dump metadata,
    /// returning the relative path written
    async fn store(&self, file: &CoredumpFile, data: Box<dyn Read + Send>) -> Result<String>;

    /// Delete a stored file by relative path
    async fn delete(&self, path: &str) -> Result<()>;

    /// Enumerate stored files
    async fn list(&self) -> Result<Vec<StoredFile>>;

    /// Total bytes currently stored
    async fn storage_size(&self) -> Result<i64>;
}

/// Build the configured backend; unknown names are a startup error
pub fn new_backend(config: &StorageConfig) -> Result<Arc<dyn Backend>> {
    match config.backend.as_str() {
        "local" => Ok(Arc::new(LocalBackend::new(config)?)),
        "s3" => Ok(Arc::new(S3Backend)),
        "nfs" => Ok(Arc::new(NfsBackend)),
        other => bail!("unsupported storage backend: {}", other),
    }
}

/// Generate the deterministic storage filename for a dump
pub fn storage_filename(file: &CoredumpFile) -> String {
    let timestamp = file.timestamp.format("%Y-%m-%d_%H-%M-%S");

    if !file.instance_name.is_empty() && !file.pod_name.is_empty() {
        format!(
            "{}/{}_{}_{}.core.gz",
            file.instance_name, timestamp, file.pod_name, file.container_name
        )
    } else {
        format!("{}_{}.core.gz", timestamp, file.file_name)
    }
}

/// Parse a size string with KB/MB/GB suffixes; bare numbers are bytes
pub fn parse_size(size: &str) -> i64 {
    let normalized = size.trim().to_uppercase();

    let (number, multiplier) = if let Some(n) = normalized.strip_suffix("GB") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = normalized.strip_suffix("MB") {
        (n, 1024 * 1024)
    } else if let Some(n) = normalized.strip_suffix("KB") {
        (n, 1024)
    } else {
        (normalized.as_str(), 1)
    };

    match number.trim().parse::<i64>() {
        Ok(value) => value * multiplier,
        Err(_) => DEFAULT_MAX_STORAGE,
    }
}

/// Persists analyzed dumps and enforces retention
pub struct Storage {
    config: StorageConfig,
    value_threshold: f64,
    backend: Arc<dyn Backend>,
    event_tx: broadcast::Sender<StorageEvent>,
    db: Option<Arc<Database>>,
    health: PipelineHealth,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl Storage {
    pub fn new(
        config: StorageConfig,
        value_threshold: f64,
        db: Option<Arc<Database>>,
        health: PipelineHealth,
        metrics: AgentMetrics,
        logger: StructuredLogger,
    ) -> Result<Arc<Self>> {
        let backend = new_backend(&config)?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Arc::new(Self {
            config,
            value_threshold,
            backend,
            event_tx,
            db,
            health,
            metrics,
            logger,
        }))
    }

    /// Subscribe to storage events (cleaner, metrics fan-out)
    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.event_tx.subscribe()
    }

    /// Ingest loop over analyzer events
    pub async fn run_ingest(
        self: Arc<Self>,
        mut analysis_rx: mpsc::Receiver<AnalysisEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            backend = %self.config.backend,
            threshold = self.value_threshold,
            "Starting storage manager"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutting down storage ingest");
                    break;
                }
                event = analysis_rx.recv() => {
                    match event {
                        Some(AnalysisEvent::AnalysisComplete { file }) => {
                            self.handle_analyzed_file(*file).await;
                        }
                        Some(AnalysisEvent::AnalysisSkipped { file }) => {
                            debug!(path = %file.path, "Not storing skipped file");
                        }
                        Some(AnalysisEvent::AnalysisError { .. }) => {}
                        None => break,
                    }
                }
            }
        }
    }

    /// Hourly retention pass
    pub async fn run_retention(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(CLEANUP_INTERVAL);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.perform_cleanup().await {
                        warn!(error = %e, "Storage cleanup failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down storage retention");
                    break;
                }
            }
        }
    }

    async fn handle_analyzed_file(&self, mut file: CoredumpFile) {
        if file.value_score < self.value_threshold {
            debug!(
                path = %file.path,
                score = file.value_score,
                threshold = self.value_threshold,
                "Skipping storage for low-value coredump"
            );
            return;
        }

        match self.store_file(&file).await {
            Ok(stored_as) => {
                file.status = FileStatus::Stored;
                file.updated_at = Utc::now();

                self.logger
                    .log_file_stored(&file.path, &stored_as, file.value_score);
                self.metrics.inc_files_stored();
                self.health.mark_running(Stage::Storage).await;
                if let Ok(size) = self.backend.storage_size().await {
                    self.metrics.set_storage_size(size);
                }

                self.persist(&file);
                self.send_event(StorageEvent::FileStored {
                    file: Box::new(file),
                });
            }
            Err(e) => {
                warn!(path = %file.path, error = %e, "Failed to store coredump");
                self.metrics.inc_storage_errors();
                self.health
                    .mark_degraded(Stage::Storage, format!("backend store failed: {}", e))
                    .await;
                self.send_event(StorageEvent::StorageError {
                    error: e.to_string(),
                });
            }
        }
    }

    async fn store_file(&self, file: &CoredumpFile) -> Result<String> {
        let source = std::fs::File::open(&file.path)
            .with_context(|| format!("failed to open coredump file {}", file.path))?;

        let reader: Box<dyn Read + Send> = if self.config.compression_enabled {
            Box::new(GzReader::new(source))
        } else {
            Box::new(source)
        };

        self.backend.store(file, reader).await
    }

    /// Delete by age, then by ascending value score until under budget
    pub async fn perform_cleanup(&self) -> Result<()> {
        info!("Starting storage cleanup");

        let mut files = self.backend.list().await?;
        let now = Utc::now();
        let retention = chrono::Duration::days(self.config.retention_days as i64);
        let max_size = parse_size(&self.config.max_storage_size);

        let mut to_delete: Vec<StoredFile> = Vec::new();
        let mut total_size: i64 = 0;

        for file in &files {
            total_size += file.size;
            if now - file.stored_at > retention {
                to_delete.push(file.clone());
            }
        }

        // The age pass already frees this much; only the remainder
        // counts against the size budget
        total_size -= to_delete.iter().map(|f| f.size).sum::<i64>();

        if total_size > max_size {
            info!(
                total_size,
                max_size, "Storage size exceeds limit, evicting low-value files"
            );

            files.sort_by(|a, b| {
                a.value_score
                    .partial_cmp(&b.value_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            for file in &files {
                if total_size <= max_size {
                    break;
                }
                if to_delete.iter().any(|d| d.path == file.path) {
                    continue;
                }
                to_delete.push(file.clone());
                total_size -= file.size;
            }
        }

        let mut deleted = 0;
        for file in &to_delete {
            match self.backend.delete(&file.path).await {
                Ok(()) => {
                    deleted += 1;
                    debug!(path = %file.path, "Deleted stored coredump");
                    self.metrics.inc_files_deleted();
                    self.send_event(StorageEvent::FileDeleted {
                        path: file.path.clone(),
                    });
                }
                Err(e) => {
                    warn!(path = %file.path, error = %e, "Failed to delete stored file");
                    self.metrics.inc_storage_errors();
                    self.health
                        .mark_degraded(Stage::Storage, format!("backend delete failed: {}", e))
                        .await;
                    self.send_event(StorageEvent::StorageError {
                        error: e.to_string(),
                    });
                }
            }
        }

        if let Ok(size) = self.backend.storage_size().await {
            self.metrics.set_storage_size(size);
        }

        info!(deleted, "Storage cleanup completed");
        self.send_event(StorageEvent::CleanupDone);
        Ok(())
    }

    fn persist(&self, file: &CoredumpFile) {
        if let Some(db) = &self.db {
            if let Err(e) = CoredumpStore::new(db).save(file) {
                warn!(path = %file.path, error = %e, "Failed to persist stored record");
            }
        }
    }

    fn send_event(&self, event: StorageEvent) {
        // Broadcast send only fails when nobody subscribed
        let _ = self.event_tx.send(event);
    }
}

/// Adapter that gzip-compresses an inner reader on the fly
struct GzReader {
    inner: Option<std::fs::File>,
    buffer: Vec<u8>,
    position: usize,
    finished: bool,
}

impl GzReader {
    fn new(inner: std::fs::File) -> Self {
        Self {
            inner: Some(inner),
            buffer: Vec::new(),
            position: 0,
            finished: false,
        }
    }

    fn fill(&mut self) -> std::io::Result<()> {
        // Compress in 256 KiB input chunks to bound memory
        const CHUNK: usize = 256 * 1024;

        let Some(file) = self.inner.as_mut() else {
            return Ok(());
        };

        let mut chunk = vec![0u8; CHUNK];
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

        let read = file.read(&mut chunk)?;
        if read == 0 {
            let file_done = self.inner.take();
            drop(file_done);
            self.finished = true;
        } else {
            encoder.write_all(&chunk[..read])?;
        }

        self.buffer = encoder.finish()?;
        self.position = 0;
        Ok(())
    }
}

impl Read for GzReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.position < self.buffer.len() {
                let n = (self.buffer.len() - self.position).min(out.len());
                out[..n].copy_from_slice(&self.buffer[self.position..self.position + n]);
                self.position += n;
                return Ok(n);
            }
            if self.finished {
                return Ok(0);
            }
            self.fill()?;
        }
    }
}

/// Primary backend: plain files under a local directory
pub struct LocalBackend {
    base_path: PathBuf,
}

impl LocalBackend {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.local_path)
            .with_context(|| format!("failed to create storage directory {}", config.local_path))?;
        Ok(Self {
            base_path: PathBuf::from(&config.local_path),
        })
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn store(&self, file: &CoredumpFile, mut data: Box<dyn Read + Send>) -> Result<String> {
        let filename = storage_filename(file);
        let full_path = self.base_path.join(&filename);

        if let Some(dir) = full_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {:?}", dir))?;
        }

        let full_path_clone = full_path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut out = std::fs::File::create(&full_path_clone)
                .with_context(|| format!("failed to create output file {:?}", full_path_clone))?;
            std::io::copy(&mut data, &mut out).context("failed to copy file")?;
            Ok(())
        })
        .await
        .context("storage write task panicked")??;

        Ok(filename)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.base_path.join(path);
        std::fs::remove_file(&full_path)
            .with_context(|| format!("failed to delete {:?}", full_path))
    }

    async fn list(&self) -> Result<Vec<StoredFile>> {
        let mut files = Vec::new();
        let mut stack = vec![self.base_path.clone()];

        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                if meta.is_dir() {
                    stack.push(path);
                    continue;
                }

                let relative = path
                    .strip_prefix(&self.base_path)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .to_string();
                let instance_name = relative
                    .split('/')
                    .next()
                    .filter(|_| relative.contains('/'))
                    .unwrap_or_default()
                    .to_string();

                files.push(StoredFile {
                    path: relative,
                    size: meta.len() as i64,
                    stored_at: meta
                        .modified()
                        .map(DateTime::<Utc>::from)
                        .unwrap_or_else(|_| Utc::now()),
                    value_score: 0.0,
                    instance_name,
                });
            }
        }

        Ok(files)
    }

    async fn storage_size(&self) -> Result<i64> {
        let files = self.list().await?;
        Ok(files.iter().map(|f| f.size).sum())
    }
}

/// Remote object store driver, not part of the core
pub struct S3Backend;

#[async_trait]
impl Backend for S3Backend {
    async fn store(&self, _file: &CoredumpFile, _data: Box<dyn Read + Send>) -> Result<String> {
        bail!("S3 backend not implemented yet")
    }

    async fn delete(&self, _path: &str) -> Result<()> {
        bail!("S3 backend not implemented yet")
    }

    async fn list(&self) -> Result<Vec<StoredFile>> {
        bail!("S3 backend not implemented yet")
    }

    async fn storage_size(&self) -> Result<i64> {
        bail!("S3 backend not implemented yet")
    }
}

/// Network filesystem driver, not part of the core
pub struct NfsBackend;

#[async_trait]
impl Backend for NfsBackend {
    async fn store(&self, _file: &CoredumpFile, _data: Box<dyn Read + Send>) -> Result<String> {
        bail!("NFS backend not implemented yet")
    }

    async fn delete(&self, _path: &str) -> Result<()> {
        bail!("NFS backend not implemented yet")
    }

    async fn list(&self) -> Result<Vec<StoredFile>> {
        bail!("NFS backend not implemented yet")
    }

    async fn storage_size(&self) -> Result<i64> {
        bail!("NFS backend not implemented yet")
    }
}
