//! Configuration module for GHM
//!
//! Handles loading and validating configuration from YAML files and environment variables.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use ghm_core::processor::PLATFORM_CONNECTOR;
use ghm_core::{ProcessorSpec, SourceKind, WatcherConfig};
use serde::{Deserialize, Serialize};

/// Diagnostic source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source type
    #[serde(default)]
    pub kind: SourceKind,

    /// `host:port` of the diagnostics daemon, or `service.namespace:port`
    /// when discovery is enabled
    #[serde(default = "default_source_address")]
    pub address: String,

    /// Resolve the address through the Kubernetes API instead of DNS
    #[serde(default)]
    pub discovery: bool,

    /// Time between polls, in whole seconds
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,

    /// Upper bound for one query
    #[serde(with = "humantime_serde", default = "default_query_timeout")]
    pub query_timeout: Duration,

    /// Timeout for resolving and connecting to the daemon
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Raise a node-level condition while the source is unreachable
    #[serde(default = "default_true")]
    pub report_connectivity_failures: bool,

    /// Command printing the kernel log, for the xid_log source
    #[serde(default = "default_xid_command")]
    pub xid_command: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            address: default_source_address(),
            discovery: false,
            poll_interval_seconds: default_poll_interval_seconds(),
            query_timeout: default_query_timeout(),
            connect_timeout: default_connect_timeout(),
            report_connectivity_failures: true,
            xid_command: default_xid_command(),
        }
    }
}

/// Categorization tables configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategorizationConfig {
    /// Error-mapping table: `code,recommended_action[,name]` per line
    #[serde(default = "default_error_mapping_file")]
    pub error_mapping_file: PathBuf,

    /// Severity class for names and groups missing from `severity_classes`
    #[serde(default = "default_class")]
    pub default_class: String,

    /// Error name or group → severity class
    #[serde(default)]
    pub severity_classes: HashMap<String, String>,
}

impl Default for CategorizationConfig {
    fn default() -> Self {
        Self {
            error_mapping_file: default_error_mapping_file(),
            default_class: default_class(),
            severity_classes: HashMap::new(),
        }
    }
}

/// Metrics export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics are enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port to expose metrics on
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

/// Shutdown behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// How long to wait for in-flight events after a shutdown signal
    #[serde(with = "humantime_serde", default = "default_drain_timeout")]
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: default_drain_timeout(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node name (from K8s downward API)
    #[serde(default)]
    pub node_name: Option<String>,

    /// Diagnostic source
    #[serde(default)]
    pub source: SourceConfig,

    /// Categorization tables
    #[serde(default)]
    pub categorization: CategorizationConfig,

    /// Event processors, each `{type: ..., <settings>}`
    #[serde(default = "default_processors")]
    pub processors: Vec<ProcessorSpec>,

    /// State file for processors that do not set their own
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Poll batches each processor may have queued before ONGOING events
    /// are dropped
    #[serde(default = "default_processor_queue_capacity")]
    pub processor_queue_capacity: usize,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Shutdown configuration
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: None,
            source: SourceConfig::default(),
            categorization: CategorizationConfig::default(),
            processors: default_processors(),
            state_file: default_state_file(),
            processor_queue_capacity: default_processor_queue_capacity(),
            metrics: MetricsConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse YAML configuration")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.node_name.as_deref() {
            None => anyhow::bail!(
                "node_name must be specified via config, --node-name, or NODE_NAME env"
            ),
            Some(name) if name.trim().is_empty() => anyhow::bail!("node_name must not be empty"),
            Some(_) => {}
        }
        if self.source.poll_interval_seconds == 0 {
            anyhow::bail!("source.poll_interval_seconds must be > 0");
        }
        if self.source.query_timeout.is_zero() || self.source.connect_timeout.is_zero() {
            anyhow::bail!("source timeouts must be > 0");
        }
        match self.source.kind {
            SourceKind::Remote if self.source.address.trim().is_empty() => {
                anyhow::bail!("source.address must be set for the remote source")
            }
            SourceKind::XidLog if self.source.xid_command.is_empty() => {
                anyhow::bail!("source.xid_command must not be empty")
            }
            _ => {}
        }
        if self.categorization.default_class.trim().is_empty() {
            anyhow::bail!("categorization.default_class must not be empty");
        }
        if self.processors.is_empty() {
            anyhow::bail!("at least one processor must be configured");
        }
        if self.state_file.as_os_str().is_empty() {
            anyhow::bail!("state_file must not be empty");
        }
        if self.processor_queue_capacity == 0 {
            anyhow::bail!("processor_queue_capacity must be > 0");
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            anyhow::bail!("metrics.port must be > 0 when metrics are enabled");
        }
        if self.shutdown.drain_timeout.is_zero() {
            anyhow::bail!("shutdown.drain_timeout must be > 0");
        }
        Ok(())
    }

    /// Override node_name from environment if not set
    pub fn with_node_name_from_env(mut self) -> Self {
        if self.node_name.is_none() {
            self.node_name = std::env::var("NODE_NAME").ok();
        }
        self
    }

    /// Poll loop settings
    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            poll_interval: Duration::from_secs(self.source.poll_interval_seconds),
            query_timeout: self.source.query_timeout,
            drain_timeout: self.shutdown.drain_timeout,
            report_connectivity: self.source.report_connectivity_failures,
            queue_capacity: self.processor_queue_capacity,
        }
    }
}

// Default value functions
fn default_source_address() -> String {
    "localhost:5555".to_string()
}

fn default_poll_interval_seconds() -> u64 {
    30
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_xid_command() -> Vec<String> {
    vec!["dmesg".to_string()]
}

fn default_error_mapping_file() -> PathBuf {
    PathBuf::from("/etc/ghm/error_mapping.csv")
}

fn default_class() -> String {
    "NonFatal".to_string()
}

fn default_processors() -> Vec<ProcessorSpec> {
    vec![ProcessorSpec::new(PLATFORM_CONNECTOR)]
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/run/ghm/state.json")
}

fn default_processor_queue_capacity() -> usize {
    16
}

fn default_metrics_port() -> u16 {
    9100
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_true() -> bool {
    true
}
