//! Core data models shared across the diagnostic pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a Milvus workload instance is deployed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentType {
    /// Installed through a Helm release
    Helm,
    /// Managed by the Milvus operator
    Operator,
}

impl std::fmt::Display for DeploymentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentType::Helm => write!(f, "helm"),
            DeploymentType::Operator => write!(f, "operator"),
        }
    }
}

/// Lifecycle status of a discovered instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Running,
    Failed,
    Terminating,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Pending => write!(f, "pending"),
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Failed => write!(f, "failed"),
            InstanceStatus::Terminating => write!(f, "terminating"),
        }
    }
}

/// A discovered Milvus workload instance and its pods
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilvusInstance {
    pub name: String,
    pub namespace: String,
    pub deployment_type: DeploymentType,
    pub labels: HashMap<String, String>,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub pods: Vec<PodInfo>,
}

impl MilvusInstance {
    /// Map key used everywhere an instance is referenced by identity
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Pod-level view maintained by discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub status: String,
    pub restart_count: i32,
    pub last_restart: Option<DateTime<Utc>>,
    pub container_statuses: Vec<ContainerStatusInfo>,
}

/// Per-container status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatusInfo {
    pub name: String,
    pub restart_count: i32,
    pub ready: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_termination_reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_termination_message: String,
}

/// Immutable record of one container restart
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartEvent {
    pub pod_name: String,
    pub pod_namespace: String,
    pub container_name: String,
    pub restart_time: DateTime<Utc>,
    pub reason: String,
    pub message: String,
    pub exit_code: i32,
    pub signal: i32,
    pub instance_name: String,
    pub is_panic: bool,
}

/// Processing state of a coredump file as it moves through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Discovered,
    Processing,
    Analyzed,
    Stored,
    Skipped,
    Error,
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileStatus::Discovered => "discovered",
            FileStatus::Processing => "processing",
            FileStatus::Analyzed => "analyzed",
            FileStatus::Stored => "stored",
            FileStatus::Skipped => "skipped",
            FileStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovered" => Ok(FileStatus::Discovered),
            "processing" => Ok(FileStatus::Processing),
            "analyzed" => Ok(FileStatus::Analyzed),
            "stored" => Ok(FileStatus::Stored),
            "skipped" => Ok(FileStatus::Skipped),
            "error" => Ok(FileStatus::Error),
            other => Err(format!("unknown file status: {}", other)),
        }
    }
}

/// A crash dump file discovered on the node, enriched stage by stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoredumpFile {
    pub path: String,
    pub file_name: String,
    pub size: i64,
    pub mod_time: DateTime<Utc>,
    pub pid: i32,
    pub uid: i32,
    pub gid: i32,
    pub signal: i32,
    /// Wall-clock crash time parsed from the filename (falls back to mod_time)
    pub timestamp: DateTime<Utc>,
    pub executable: String,
    /// Boot id field of the systemd-coredump filename shape, when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_id: Option<String>,

    // Associated pod identity, filled in by correlation
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_name: String,

    // Analysis outcome
    pub is_analyzed: bool,
    pub value_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_results: Option<AnalysisResults>,

    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CoredumpFile {
    pub fn has_pod_association(&self) -> bool {
        !self.pod_name.is_empty() && !self.instance_name.is_empty()
    }
}

/// Evidence extracted from a coredump by the debugger
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisResults {
    pub stack_trace: String,
    pub crash_reason: String,
    pub crash_address: String,
    pub thread_count: i32,
    pub library_versions: HashMap<String, String>,
    pub memory_info: MemoryInfo,
    pub register_info: HashMap<String, String>,
    pub shared_libraries: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_analysis: Option<AIAnalysisResult>,
}

/// Memory layout summary parsed from the debugger output
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub virtual_size: i64,
    pub resident_size: i64,
    pub heap_size: i64,
    pub stack_size: i64,
}

/// Narrative enrichment produced by the LLM provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AIAnalysisResult {
    pub enabled: bool,
    pub provider: String,
    pub model: String,
    pub analysis_time: Option<DateTime<Utc>>,
    pub summary: String,
    pub root_cause: String,
    pub impact: String,
    pub recommendations: Vec<String>,
    /// Provider self-reported confidence in [0.0, 1.0]
    pub confidence: f64,
    pub tokens_used: i64,
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_issues: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code_suggestions: Vec<CodeSuggestion>,
}

/// A concrete code fix suggested by the LLM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSuggestion {
    pub file: String,
    pub function: String,
    #[serde(default)]
    pub line_number: i32,
    pub issue: String,
    pub suggestion: String,
    /// "high", "medium" or "low"
    pub priority: String,
}

/// Events emitted by the collector stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CollectionEvent {
    FileDiscovered { file: Box<CoredumpFile> },
    FileProcessed { file: Box<CoredumpFile> },
    FileSkipped { file: Box<CoredumpFile> },
    FileError { file: Box<CoredumpFile>, error: String },
    RestartDetected { event: RestartEvent },
}

/// Events emitted by the analyzer stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnalysisEvent {
    AnalysisComplete { file: Box<CoredumpFile> },
    AnalysisSkipped { file: Box<CoredumpFile> },
    AnalysisError { file: Box<CoredumpFile>, error: String },
}

/// Events emitted by the storage stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageEvent {
    FileStored { file: Box<CoredumpFile> },
    FileDeleted { path: String },
    StorageError { error: String },
    CleanupDone,
}

/// Events emitted by the cleaner stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CleanupEvent {
    InstanceUninstalled {
        instance_name: String,
        namespace: String,
        reason: String,
    },
    CleanupSkipped {
        instance_name: String,
        namespace: String,
        reason: String,
    },
    CleanupError {
        instance_name: String,
        namespace: String,
        error: String,
    },
    RestartThresholdExceeded {
        instance_name: String,
        namespace: String,
        count: i32,
    },
}

#[cfg(test)]
pub(crate) fn test_coredump_file() -> CoredumpFile {
    use chrono::TimeZone;

    let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    CoredumpFile {
        path: "/var/dumps/core.milvus.1000.1700000000.12345".to_string(),
        file_name: "core.milvus.1000.1700000000.12345".to_string(),
        size: 150 * 1024 * 1024,
        mod_time: ts,
        pid: 12345,
        uid: 1000,
        gid: 0,
        signal: 11,
        timestamp: ts,
        executable: "milvus".to_string(),
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
        created_at: ts,
        updated_at: ts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_key_format() {
        let instance = MilvusInstance {
            name: "rel1".to_string(),
            namespace: "ns1".to_string(),
            deployment_type: DeploymentType::Helm,
            labels: HashMap::new(),
            status: InstanceStatus::Running,
            created_at: Utc::now(),
            pods: vec![],
        };

        assert_eq!(instance.key(), "ns1/rel1");
    }

    #[test]
    fn test_file_status_round_trip() {
        for status in [
            FileStatus::Discovered,
            FileStatus::Processing,
            FileStatus::Analyzed,
            FileStatus::Stored,
            FileStatus::Skipped,
            FileStatus::Error,
        ] {
            let parsed: FileStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }

        assert!("bogus".parse::<FileStatus>().is_err());
    }

    #[test]
    fn test_deployment_type_serde_lowercase() {
        let json = serde_json::to_string(&DeploymentType::Helm).unwrap();
        assert_eq!(json, "\"helm\"");
        let json = serde_json::to_string(&DeploymentType::Operator).unwrap();
        assert_eq!(json, "\"operator\"");
    }

    #[test]
    fn test_pod_association() {
        let mut file = super::test_coredump_file();
        file.pod_name.clear();
        file.instance_name.clear();
        assert!(!file.has_pod_association());

        file.pod_name = "p1".to_string();
        assert!(!file.has_pod_association());

        file.instance_name = "rel1".to_string();
        assert!(file.has_pod_association());
    }
}
