//! Worker process and endpoint type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ModelName, SessionMode};

/// An OS process serving one model instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerProcess {
    /// Unique worker identifier
    pub id: Uuid,
    /// Model instance this worker belongs to
    pub instance_id: String,
    /// Bound model
    pub model_name: ModelName,
    /// Bound mode
    pub mode: SessionMode,
    /// Bound adapter directory; empty for the base model
    pub lora_dir: String,
    /// Current status
    pub status: WorkerStatus,
    /// Network endpoint
    pub endpoint: Endpoint,
    /// Process ID once spawned
    pub pid: Option<u32>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl WorkerProcess {
    /// Create a new worker
    pub fn new(
        instance_id: String,
        model_name: ModelName,
        mode: SessionMode,
        lora_dir: String,
        port: u16,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance_id,
            model_name,
            mode,
            lora_dir,
            status: WorkerStatus::Pending,
            endpoint: Endpoint::new("127.0.0.1".to_string(), port),
            pid: None,
            created_at: Utc::now(),
        }
    }
}

/// Worker status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Worker is being created
    Pending,
    /// Process spawned
    Running,
    /// Termination requested
    Terminating,
    /// Process exited
    Terminated,
    /// Spawn failed
    Error,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Pending => write!(f, "Pending"),
            WorkerStatus::Running => write!(f, "Running"),
            WorkerStatus::Terminating => write!(f, "Terminating"),
            WorkerStatus::Terminated => write!(f, "Terminated"),
            WorkerStatus::Error => write!(f, "Error"),
        }
    }
}

/// Network endpoint for a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    /// Get the URL for this endpoint
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_new() {
        let worker = WorkerProcess::new(
            "instance-1".to_string(),
            ModelName::Sdxl,
            SessionMode::Inference,
            String::new(),
            31000,
        );
        assert_eq!(worker.instance_id, "instance-1");
        assert_eq!(worker.endpoint.port, 31000);
        assert_eq!(worker.status, WorkerStatus::Pending);
        assert!(worker.pid.is_none());
    }

    #[test]
    fn test_endpoint_url() {
        let endpoint = Endpoint::new("127.0.0.1".to_string(), 31000);
        assert_eq!(endpoint.url(), "http://127.0.0.1:31000");
    }
}
