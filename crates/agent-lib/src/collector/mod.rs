//! Coredump file collection and pod correlation
//!
//! Two producers feed the pipeline: a periodic directory walk that
//! guarantees eventual discovery, and a targeted search triggered by
//! panic restart events that lowers latency for fresh dumps.

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::CollectorConfig;
use crate::discovery::InstanceView;
use crate::models::{
    CollectionEvent, CoredumpFile, FileStatus, MilvusInstance, PodInfo, RestartEvent,
};
use crate::observability::AgentMetrics;

/// Capacity of the collection event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Total time to poll for a dump after a panic restart
const TARGETED_SEARCH_WINDOW: Duration = Duration::from_secs(30);
/// Poll interval during a targeted search
const TARGETED_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Maximum file age accepted during a targeted search
const TARGETED_MAX_AGE: chrono::Duration = chrono::Duration::minutes(2);
/// Correlation window between a dump's mtime and a pod's last restart
const CORRELATION_WINDOW: chrono::Duration = chrono::Duration::minutes(5);

fn kernel_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^core\.([^.]+)\.(\d+)\.(\d+)\.(\d+)$").expect("invalid regex"))
}

fn systemd_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^core\.([^.]+)\.(\d+)\.([0-9a-f]+)\.(\d+)\.(\d+)$").expect("invalid regex")
    })
}

/// Fields parsed out of a conforming coredump filename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFilename {
    pub executable: String,
    pub uid: i32,
    pub wall_time: i64,
    pub pid: i32,
    /// Present only in the host-manager (systemd) shape
    pub boot_id: Option<String>,
}

impl ParsedFilename {
    /// Re-serialize into the filename this was parsed from
    pub fn to_filename(&self) -> String {
        match &self.boot_id {
            Some(boot_id) => format!(
                "core.{}.{}.{}.{}.{}",
                self.executable, self.uid, boot_id, self.wall_time, self.pid
            ),
            None => format!(
                "core.{}.{}.{}.{}",
                self.executable, self.uid, self.wall_time, self.pid
            ),
        }
    }
}

/// Parse either accepted filename shape
pub fn parse_filename(filename: &str) -> Option<ParsedFilename> {
    if let Some(caps) = systemd_pattern().captures(filename) {
        return Some(ParsedFilename {
            executable: caps[1].to_string(),
            uid: caps[2].parse().ok()?,
            boot_id: Some(caps[3].to_string()),
            wall_time: caps[4].parse().ok()?,
            pid: caps[5].parse().ok()?,
        });
    }
    if let Some(caps) = kernel_pattern().captures(filename) {
        return Some(ParsedFilename {
            executable: caps[1].to_string(),
            uid: caps[2].parse().ok()?,
            boot_id: None,
            wall_time: caps[3].parse().ok()?,
            pid: caps[4].parse().ok()?,
        });
    }
    None
}

/// Whether a filename looks like a coredump at all
pub fn is_coredump_file(filename: &str) -> bool {
    kernel_pattern().is_match(filename)
        || systemd_pattern().is_match(filename)
        || filename.starts_with("core.")
}

/// Turns crash-dump artifacts into correlated coredump records
pub struct Collector {
    config: CollectorConfig,
    instances: InstanceView,
    event_tx: mpsc::Sender<CollectionEvent>,
    processed: Mutex<HashSet<String>>,
    metrics: AgentMetrics,
}

impl Collector {
    pub fn new(
        config: CollectorConfig,
        instances: InstanceView,
        metrics: AgentMetrics,
    ) -> (Arc<Self>, mpsc::Receiver<CollectionEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            Arc::new(Self {
                config,
                instances,
                event_tx,
                processed: Mutex::new(HashSet::new()),
                metrics,
            }),
            event_rx,
        )
    }

    /// Seed the processed-set with paths already known to persistence
    pub fn seed_processed(&self, paths: Vec<String>) {
        let mut processed = self.processed.lock().expect("processed set poisoned");
        let count = paths.len();
        processed.extend(paths);
        info!(count, "Seeded processed-set from database");
    }

    /// Periodic directory walk
    pub async fn run_scan_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            path = %self.config.coredump_path,
            interval_secs = self.config.watch_interval_secs,
            "Starting coredump collector"
        );

        let mut ticker = interval(self.config.watch_interval());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scan_directory();
                }
                _ = shutdown.recv() => {
                    info!("Shutting down collector scan loop");
                    break;
                }
            }
        }
    }

    /// Restart event consumer; panics trigger a targeted search
    pub async fn run_restart_listener(
        self: Arc<Self>,
        mut restarts: broadcast::Receiver<RestartEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutting down collector restart listener");
                    break;
                }
                event = restarts.recv() => {
                    match event {
                        Ok(event) => self.handle_restart_event(event),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Restart listener lagged, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    fn handle_restart_event(self: &Arc<Self>, event: RestartEvent) {
        debug!(
            pod = %event.pod_name,
            namespace = %event.pod_namespace,
            is_panic = event.is_panic,
            "Handling restart event"
        );

        self.send_event(CollectionEvent::RestartDetected {
            event: event.clone(),
        });

        if event.is_panic {
            let this = self.clone();
            tokio::spawn(async move {
                this.collect_for_restart(event).await;
            });
        }
    }

    /// Poll for a dump correlated with a panic restart
    async fn collect_for_restart(&self, event: RestartEvent) {
        let deadline = tokio::time::Instant::now() + TARGETED_SEARCH_WINDOW;
        let mut ticker = interval(TARGETED_POLL_INTERVAL);
        ticker.tick().await;

        loop {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    pod = %event.pod_name,
                    namespace = %event.pod_namespace,
                    "Timeout waiting for coredump after panic restart"
                );
                return;
            }
            ticker.tick().await;

            let files = self.find_for_restart(&event);
            if !files.is_empty() {
                for file in files {
                    self.process_file(file);
                }
                return;
            }
        }
    }

    fn find_for_restart(&self, event: &RestartEvent) -> Vec<CoredumpFile> {
        let now = Utc::now();
        let mut found = Vec::new();

        for (path, meta) in walk_files(Path::new(&self.config.coredump_path)) {
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !is_coredump_file(filename) {
                continue;
            }

            let mod_time = mod_time_of(&meta);
            if now - mod_time > TARGETED_MAX_AGE {
                continue;
            }
            if self.is_processed(&path.to_string_lossy()) {
                continue;
            }

            let Some(mut file) = self.build_coredump_file(&path, &meta) else {
                continue;
            };
            if is_related_to_restart(&file, event) {
                // The restart event carries the terminating signal; the
                // filename does not.
                if file.signal == 0 {
                    file.signal = event.signal;
                }
                if !file.has_pod_association() {
                    file.pod_name = event.pod_name.clone();
                    file.pod_namespace = event.pod_namespace.clone();
                    file.instance_name = event.instance_name.clone();
                }
                if file.container_name.is_empty() && file.pod_name == event.pod_name {
                    file.container_name = event.container_name.clone();
                }
                found.push(file);
            }
        }

        found
    }

    fn scan_directory(&self) {
        let now = Utc::now();
        let max_age = chrono::Duration::from_std(self.config.max_file_age())
            .unwrap_or_else(|_| chrono::Duration::days(1));

        for (path, meta) in walk_files(Path::new(&self.config.coredump_path)) {
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !is_coredump_file(filename) {
                continue;
            }
            if now - mod_time_of(&meta) > max_age {
                continue;
            }
            if self.is_processed(&path.to_string_lossy()) {
                continue;
            }

            if let Some(file) = self.build_coredump_file(&path, &meta) {
                self.process_file(file);
            }
        }
    }

    fn is_processed(&self, path: &str) -> bool {
        self.processed
            .lock()
            .expect("processed set poisoned")
            .contains(path)
    }

    /// Parse filename metadata and correlate with the instance view
    fn build_coredump_file(&self, path: &Path, meta: &std::fs::Metadata) -> Option<CoredumpFile> {
        let filename = path.file_name()?.to_str()?.to_string();
        let mod_time = mod_time_of(meta);
        let now = Utc::now();

        let mut file = CoredumpFile {
            path: path.to_string_lossy().to_string(),
            file_name: filename.clone(),
            size: meta.len() as i64,
            mod_time,
            pid: 0,
            uid: 0,
            gid: 0,
            signal: 0,
            timestamp: mod_time,
            executable: String::new(),
            boot_id: None,
            pod_name: String::new(),
            pod_namespace: String::new(),
            container_name: String::new(),
            instance_name: String::new(),
            is_analyzed: false,
            value_score: 0.0,
            analysis_time: None,
            analysis_results: None,
            status: FileStatus::Discovered,
            error_message: String::new(),
            created_at: now,
            updated_at: now,
        };

        if let Some(parsed) = parse_filename(&filename) {
            file.executable = parsed.executable;
            file.uid = parsed.uid;
            file.pid = parsed.pid;
            file.boot_id = parsed.boot_id;
            if let Some(ts) = Utc.timestamp_opt(parsed.wall_time, 0).single() {
                file.timestamp = ts;
            }
        }

        let instances = self
            .instances
            .read()
            .expect("instance view lock poisoned")
            .clone();
        enrich_with_pod_info(&mut file, &instances);

        Some(file)
    }

    /// Mark processed and hand the record to the analyzer
    fn process_file(&self, mut file: CoredumpFile) {
        {
            let mut processed = self.processed.lock().expect("processed set poisoned");
            if !processed.insert(file.path.clone()) {
                return;
            }
        }

        info!(path = %file.path, executable = %file.executable, "Processing coredump file");
        self.metrics.inc_coredumps_discovered();

        file.status = FileStatus::Processing;
        file.updated_at = Utc::now();

        self.send_event(CollectionEvent::FileDiscovered {
            file: Box::new(file),
        });
    }

    fn send_event(&self, event: CollectionEvent) {
        if self.event_tx.try_send(event).is_err() {
            warn!("Collection event channel is full, dropping event");
        }
    }
}

/// Iterative error-tolerant directory walk
fn walk_files(root: &Path) -> Vec<(std::path::PathBuf, std::fs::Metadata)> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];

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
            } else {
                out.push((path, meta));
            }
        }
    }

    out
}

fn mod_time_of(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

/// Correlate a dump with a pod of a discovered instance
///
/// The executable substring test is deliberately permissive: any dump
/// from a milvus binary on the node is attributed to the first matching
/// instance.
pub fn enrich_with_pod_info(file: &mut CoredumpFile, instances: &HashMap<String, MilvusInstance>) {
    for instance in instances.values() {
        for pod in &instance.pods {
            if !is_pod_related(pod, file) {
                continue;
            }

            file.pod_name = pod.name.clone();
            file.pod_namespace = pod.namespace.clone();
            file.instance_name = instance.name.clone();

            for status in &pod.container_statuses {
                if file.executable.contains(&status.name) {
                    file.container_name = status.name.clone();
                    break;
                }
            }
            return;
        }
    }
}

/// A dump belongs to a pod when the executable is workload-related or the
/// mtime falls near the pod's last restart
pub fn is_pod_related(pod: &PodInfo, file: &CoredumpFile) -> bool {
    if file.executable.contains("milvus") {
        return true;
    }

    if let Some(last_restart) = pod.last_restart {
        let diff = (file.mod_time - last_restart).abs();
        if diff < CORRELATION_WINDOW {
            return true;
        }
    }

    false
}

/// Targeted correlation against one restart event
pub fn is_related_to_restart(file: &CoredumpFile, event: &RestartEvent) -> bool {
    if file.pod_name == event.pod_name && file.pod_namespace == event.pod_namespace {
        return true;
    }

    (file.mod_time - event.restart_time).abs() < TARGETED_MAX_AGE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_coredump_file;
    use std::sync::RwLock;

    #[test]
    fn test_parse_kernel_filename() {
        let parsed = parse_filename("core.milvus.1000.1700000000.12345").unwrap();
        assert_eq!(parsed.executable, "milvus");
        assert_eq!(parsed.uid, 1000);
        assert_eq!(parsed.wall_time, 1_700_000_000);
        assert_eq!(parsed.pid, 12345);
        assert!(parsed.boot_id.is_none());
    }

    #[test]
    fn test_parse_systemd_filename() {
        let parsed = parse_filename("core.milvus.1000.4f2a9c.1700000000.12345").unwrap();
        assert_eq!(parsed.executable, "milvus");
        assert_eq!(parsed.uid, 1000);
        assert_eq!(parsed.boot_id.as_deref(), Some("4f2a9c"));
        assert_eq!(parsed.wall_time, 1_700_000_000);
        assert_eq!(parsed.pid, 12345);
    }

    #[test]
    fn test_filename_round_trip() {
        for name in [
            "core.milvus.1000.1700000000.12345",
            "core.querynode.0.4f2a9cbb01.1699999999.1",
        ] {
            let parsed = parse_filename(name).unwrap();
            assert_eq!(parsed.to_filename(), name);
        }
    }

    #[test]
    fn test_reject_malformed_filenames() {
        assert!(parse_filename("milvus.core").is_none());
        assert!(parse_filename("core.milvus.abc.123.456").is_none());
        assert!(parse_filename("core.milvus.1000.1700000000").is_none());
        // Uppercase hex is not a valid boot id field
        assert!(parse_filename("core.milvus.1000.4F2A.1700000000.1").is_none());
    }

    #[test]
    fn test_is_coredump_file() {
        assert!(is_coredump_file("core.milvus.1000.1700000000.12345"));
        assert!(is_coredump_file("core.milvus.partial"));
        assert!(!is_coredump_file("milvus.log"));
        assert!(!is_coredump_file("notcore.milvus.1.2.3"));
    }

    #[test]
    fn test_pod_related_by_executable() {
        let file = test_coredump_file();
        let pod = PodInfo {
            name: "p1".to_string(),
            namespace: "ns1".to_string(),
            status: "Running".to_string(),
            restart_count: 1,
            last_restart: None,
            container_statuses: vec![],
        };

        assert!(is_pod_related(&pod, &file));
    }

    #[test]
    fn test_pod_related_by_restart_window() {
        let mut file = test_coredump_file();
        file.executable = "etcd".to_string();

        let mut pod = PodInfo {
            name: "p1".to_string(),
            namespace: "ns1".to_string(),
            status: "Running".to_string(),
            restart_count: 1,
            last_restart: Some(file.mod_time - chrono::Duration::minutes(3)),
            container_statuses: vec![],
        };
        assert!(is_pod_related(&pod, &file));

        pod.last_restart = Some(file.mod_time - chrono::Duration::minutes(7));
        assert!(!is_pod_related(&pod, &file));
    }

    #[test]
    fn test_restart_correlation_window() {
        let file = test_coredump_file();

        let mut event = RestartEvent {
            pod_name: "other".to_string(),
            pod_namespace: "ns1".to_string(),
            container_name: "c1".to_string(),
            restart_time: file.mod_time + chrono::Duration::seconds(60),
            reason: "Error".to_string(),
            message: String::new(),
            exit_code: 139,
            signal: 11,
            instance_name: "rel1".to_string(),
            is_panic: true,
        };
        assert!(is_related_to_restart(&file, &event));

        event.restart_time = file.mod_time + chrono::Duration::minutes(3);
        assert!(!is_related_to_restart(&file, &event));

        // Identity match overrides the time window
        let mut matched = file.clone();
        matched.pod_name = "other".to_string();
        matched.pod_namespace = "ns1".to_string();
        assert!(is_related_to_restart(&matched, &event));
    }

    #[test]
    fn test_enrich_assigns_first_matching_instance() {
        use crate::models::{ContainerStatusInfo, DeploymentType, InstanceStatus};

        let mut file = test_coredump_file();
        let instance = MilvusInstance {
            name: "rel1".to_string(),
            namespace: "ns1".to_string(),
            deployment_type: DeploymentType::Helm,
            labels: HashMap::new(),
            status: InstanceStatus::Running,
            created_at: Utc::now(),
            pods: vec![PodInfo {
                name: "p1".to_string(),
                namespace: "ns1".to_string(),
                status: "Running".to_string(),
                restart_count: 1,
                last_restart: None,
                container_statuses: vec![ContainerStatusInfo {
                    name: "milvus".to_string(),
                    restart_count: 1,
                    ready: false,
                    last_termination_reason: String::new(),
                    last_termination_message: String::new(),
                }],
            }],
        };

        let instances = HashMap::from([(instance.key(), instance)]);
        enrich_with_pod_info(&mut file, &instances);

        assert_eq!(file.pod_name, "p1");
        assert_eq!(file.pod_namespace, "ns1");
        assert_eq!(file.instance_name, "rel1");
        assert_eq!(file.container_name, "milvus");
    }

    #[tokio::test]
    async fn test_scan_emits_file_discovered_once() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("core.milvus.1000.1700000000.12345");
        std::fs::write(&dump, b"not a real dump").unwrap();

        let config = CollectorConfig {
            coredump_path: dir.path().to_string_lossy().to_string(),
            ..Default::default()
        };
        let view: InstanceView = Arc::new(RwLock::new(HashMap::new()));
        let (collector, mut rx) = Collector::new(config, view, AgentMetrics::new());

        collector.scan_directory();
        match rx.try_recv().unwrap() {
            CollectionEvent::FileDiscovered { file } => {
                assert_eq!(file.executable, "milvus");
                assert_eq!(file.pid, 12345);
                assert_eq!(file.status, FileStatus::Processing);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // Second scan must not re-emit the same path
        collector.scan_directory();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_seeded_paths_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let dump = dir.path().join("core.milvus.1000.1700000000.99");
        std::fs::write(&dump, b"x").unwrap();

        let config = CollectorConfig {
            coredump_path: dir.path().to_string_lossy().to_string(),
            ..Default::default()
        };
        let view: InstanceView = Arc::new(RwLock::new(HashMap::new()));
        let (collector, mut rx) = Collector::new(config, view, AgentMetrics::new());

        collector.seed_processed(vec![dump.to_string_lossy().to_string()]);
        collector.scan_directory();
        assert!(rx.try_recv().is_err());
    }
}
