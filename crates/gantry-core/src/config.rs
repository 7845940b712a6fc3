//! Configuration types for gantry

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::deserialize_memory;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// API server configuration
    pub api: ApiConfig,
    /// Queue and instance pool configuration
    pub scheduler: SchedulerConfig,
    /// Worker runtime configuration
    pub runtime: RuntimeConfig,
    /// Session storage configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::GantryError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::GantryError::Config(format!("Failed to read config file: {}", e))
        })?;
        toml::from_str(&content)
            .map_err(|e| crate::GantryError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub address: String,
    /// Port for the REST API server
    pub port: u16,
    /// Enable CORS
    pub cors_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9090,
            cors_enabled: true,
        }
    }
}

/// Queue and instance pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Run model instances on this host and reconcile them against the queue
    pub local_instances: bool,
    /// Seconds between reconciliation passes
    pub reconcile_interval_secs: u64,
    /// Idle seconds after which an instance is stale
    pub stale_timeout_secs: u64,
    /// Seconds an instance may take to start
    pub start_timeout_secs: u64,
    /// Seconds to wait for an instance to stop
    pub stop_timeout_secs: u64,
    /// Seconds before retrying a model binding whose instance failed to start
    pub start_backoff_secs: u64,
    /// Maximum number of concurrent instances
    pub max_instances: u32,
    /// Memory budget shared by all instances; unlimited when absent
    #[serde(deserialize_with = "deserialize_memory")]
    pub total_memory: Option<u64>,
    /// Seconds after which a silent runner is dropped from the runner table
    pub runner_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            local_instances: true,
            reconcile_interval_secs: 5,
            stale_timeout_secs: 300,
            start_timeout_secs: 120,
            stop_timeout_secs: 30,
            start_backoff_secs: 30,
            max_instances: 4,
            total_memory: None,
            runner_ttl_secs: 60,
        }
    }
}

impl SchedulerConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn start_backoff(&self) -> Duration {
        Duration::from_secs(self.start_backoff_secs)
    }

    pub fn runner_ttl(&self) -> Duration {
        Duration::from_secs(self.runner_ttl_secs)
    }
}

/// Worker runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Runtime type
    pub runtime_type: RuntimeType,
    /// Path to the runner binary that serves one model instance
    pub runner_binary: PathBuf,
    /// Base port for worker allocation
    pub worker_base_port: u16,
    /// URL workers use to reach this control plane
    pub api_url: String,
    /// Additional arguments passed to every worker
    pub extra_args: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_type: RuntimeType::Process,
            runner_binary: PathBuf::from("gantry-runner"),
            worker_base_port: 31000,
            api_url: "http://127.0.0.1:9090".to_string(),
            extra_args: Vec::new(),
        }
    }
}

/// Runtime type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// One OS process per model instance
    Process,
}

/// Session storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for JSON session files; in-memory when absent
    pub sessions_path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}
