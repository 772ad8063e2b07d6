//! Hierarchical configuration for the agent and controller
//!
//! Loaded from a single YAML/TOML file with environment overrides
//! (prefix `AGENT`, `__` separator). Durations are integer seconds,
//! sizes are strings with KB/MB/GB suffixes.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub controller: ControllerConfig,
    pub database: DatabaseConfig,
    pub discovery: DiscoveryConfig,
    pub collector: CollectorConfig,
    pub analyzer: AnalyzerConfig,
    pub storage: StorageConfig,
    pub cleaner: CleanerConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    /// Node name, normally injected through the downward API
    pub node_name: String,
    pub log_level: String,
    pub metrics_port: u16,
    pub health_port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "milvus-coredump-agent".to_string(),
            node_name: std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string()),
            log_level: "info".to_string(),
            metrics_port: 8080,
            health_port: 8081,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub enabled: bool,
    pub url: String,
    pub timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "http://coredump-controller:8090".to_string(),
            timeout_secs: 10,
            heartbeat_interval_secs: 60,
        }
    }
}

impl ControllerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub conn_max_lifetime_secs: u64,
    pub retention_days: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./data/coredump_agent.db".to_string(),
            max_open_conns: 10,
            max_idle_conns: 5,
            conn_max_lifetime_secs: 3600,
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub scan_interval_secs: u64,
    pub namespaces: Vec<String>,
    /// Label predicates marking a pod as part of a Helm release,
    /// either `key` (presence) or `key=value`
    pub helm_release_labels: Vec<String>,
    /// Label predicates marking a pod as operator managed
    pub operator_labels: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 300,
            namespaces: vec!["default".to_string()],
            helm_release_labels: vec![
                "app.kubernetes.io/name=milvus".to_string(),
                "helm.sh/chart".to_string(),
            ],
            operator_labels: vec!["milvus.io/operator-version".to_string()],
        }
    }
}

impl DiscoveryConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Crash dump directory as mounted inside the agent container
    pub coredump_path: String,
    /// The same directory as seen on the host, for operator reference
    pub host_coredump_path: String,
    pub watch_interval_secs: u64,
    pub max_file_age_secs: u64,
    pub max_file_size: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            coredump_path: "/host/coredumps".to_string(),
            host_coredump_path: "/var/lib/systemd/coredump".to_string(),
            watch_interval_secs: 60,
            max_file_age_secs: 24 * 3600,
            max_file_size: "2GB".to_string(),
        }
    }
}

impl CollectorConfig {
    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs)
    }

    pub fn max_file_age(&self) -> Duration {
        Duration::from_secs(self.max_file_age_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub enable_gdb_analysis: bool,
    pub gdb_timeout_secs: u64,
    /// Minimum value score a dump must reach to be stored
    pub value_threshold: f64,
    /// Container name substrings excluded from analysis
    pub ignore_patterns: Vec<String>,
    /// Crash reason substrings granting the panic keyword bonus
    pub panic_keywords: Vec<String>,
    pub ai_analysis: AIAnalysisConfig,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            enable_gdb_analysis: true,
            gdb_timeout_secs: 300,
            value_threshold: 5.0,
            ignore_patterns: vec![],
            panic_keywords: vec![
                "panic".to_string(),
                "fatal".to_string(),
                "segmentation".to_string(),
                "sigsegv".to_string(),
                "sigabrt".to_string(),
                "abort".to_string(),
                "assert".to_string(),
            ],
            ai_analysis: AIAnalysisConfig::default(),
        }
    }
}

impl AnalyzerConfig {
    pub fn gdb_timeout(&self) -> Duration {
        Duration::from_secs(self.gdb_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AIAnalysisConfig {
    pub enabled: bool,
    pub provider: String,
    pub model: String,
    pub api_key: String,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: f32,
    pub enable_cost_control: bool,
    pub max_cost_per_month: f64,
    pub max_analysis_per_hour: u32,
}

impl Default for AIAnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: "glm".to_string(),
            model: "glm-4".to_string(),
            api_key: String::new(),
            base_url: String::new(),
            timeout_secs: 120,
            max_tokens: 2000,
            temperature: 0.3,
            enable_cost_control: true,
            max_cost_per_month: 100.0,
            max_analysis_per_hour: 10,
        }
    }
}

impl AIAnalysisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Resolve the API key, falling back to the provider environment variable
    pub fn resolve_api_key(&self) -> Option<String> {
        if !self.api_key.is_empty() {
            return Some(self.api_key.clone());
        }
        let var = match self.provider.as_str() {
            "openai" => "OPENAI_API_KEY",
            _ => "GLM_API_KEY",
        };
        std::env::var(var).ok().filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: String,
    pub local_path: String,
    pub max_storage_size: String,
    pub retention_days: u32,
    pub compression_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "local".to_string(),
            local_path: "/data/coredumps".to_string(),
            max_storage_size: "50GB".to_string(),
            retention_days: 30,
            compression_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    pub enabled: bool,
    pub max_restart_count: i32,
    pub restart_time_window_secs: u64,
    pub cleanup_delay_secs: u64,
    pub uninstall_timeout_secs: u64,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_restart_count: 3,
            restart_time_window_secs: 600,
            cleanup_delay_secs: 30,
            uninstall_timeout_secs: 300,
        }
    }
}

impl CleanerConfig {
    pub fn restart_time_window(&self) -> Duration {
        Duration::from_secs(self.restart_time_window_secs)
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_secs(self.cleanup_delay_secs)
    }

    pub fn uninstall_timeout(&self) -> Duration {
        Duration::from_secs(self.uninstall_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub prometheus_enabled: bool,
    pub alerting: AlertingConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            prometheus_enabled: true,
            alerting: AlertingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    pub enabled: bool,
    pub webhook_url: String,
}

impl Config {
    /// Load configuration from a file with environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("AGENT").separator("__"))
            .build()
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        let config: Config = settings
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        Ok(config)
    }

    /// Load with defaults when no config file is present
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Startup validation; failures here are fatal
    pub fn validate(&self) -> Result<()> {
        if self.agent.name.is_empty() {
            bail!("agent name cannot be empty");
        }
        if self.agent.metrics_port == 0 {
            bail!("invalid metrics port: {}", self.agent.metrics_port);
        }
        if self.agent.health_port == 0 {
            bail!("invalid health port: {}", self.agent.health_port);
        }
        if self.collector.coredump_path.is_empty() {
            bail!("coredump path cannot be empty");
        }
        if !matches!(self.storage.backend.as_str(), "local" | "s3" | "nfs") {
            bail!("unsupported storage backend: {}", self.storage.backend);
        }
        if self.analyzer.value_threshold < 0.0 || self.analyzer.value_threshold > 10.0 {
            bail!(
                "value threshold must be within [0, 10]: {}",
                self.analyzer.value_threshold
            );
        }
        if self.cleaner.enabled && self.cleaner.max_restart_count <= 0 {
            bail!(
                "cleaner max restart count must be positive: {}",
                self.cleaner.max_restart_count
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.agent.metrics_port, 8080);
        assert_eq!(config.controller.heartbeat_interval_secs, 60);
        assert_eq!(config.cleaner.max_restart_count, 3);
        assert_eq!(config.storage.backend, "local");
    }

    #[test]
    fn test_validate_rejects_unknown_backend() {
        let mut config = Config::default();
        config.storage.backend = "tape".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_coredump_path() {
        let mut config = Config::default();
        config.collector.coredump_path.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_threshold() {
        let mut config = Config::default();
        config.analyzer.value_threshold = 12.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            concat!(
                "agent:\n",
                "  name: test-agent\n",
                "  metrics_port: 9100\n",
                "cleaner:\n",
                "  enabled: true\n",
                "  max_restart_count: 5\n",
                "analyzer:\n",
                "  value_threshold: 6.5\n",
            )
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.agent.name, "test-agent");
        assert_eq!(config.agent.metrics_port, 9100);
        assert!(config.cleaner.enabled);
        assert_eq!(config.cleaner.max_restart_count, 5);
        assert!((config.analyzer.value_threshold - 6.5).abs() < f64::EPSILON);
        // Untouched sections keep defaults
        assert_eq!(config.storage.backend, "local");
    }

    #[test]
    fn test_duration_helpers() {
        let config = Config::default();
        assert_eq!(config.discovery.scan_interval(), Duration::from_secs(300));
        assert_eq!(config.cleaner.cleanup_delay(), Duration::from_secs(30));
        assert_eq!(
            config.analyzer.gdb_timeout(),
            Duration::from_secs(config.analyzer.gdb_timeout_secs)
        );
    }
}
