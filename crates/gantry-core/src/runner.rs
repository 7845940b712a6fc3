//! Reports exchanged with runners and model instance snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::{ModelName, SessionFilter, SessionMode, SessionSummary};

/// Kind of task update a runner sends back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerTaskResponseType {
    /// Partial output to append
    Stream,
    /// Progress update only
    Progress,
    /// Final outcome
    Result,
}

/// Result or progress of a session executed by a runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerTaskResponse {
    #[serde(rename = "type")]
    pub response_type: RunnerTaskResponseType,
    pub session_id: String,
    #[serde(default)]
    pub interaction_id: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub progress: u32,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub lora_dir: String,
    /// Non-empty when the session failed
    #[serde(default)]
    pub error: String,
}

impl RunnerTaskResponse {
    /// Whether this response ends the session's current turn
    pub fn is_final(&self) -> bool {
        self.response_type == RunnerTaskResponseType::Result
    }
}

/// Liveness and resource report from a runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerState {
    pub id: String,
    pub created: DateTime<Utc>,
    /// Total accelerator memory in bytes
    #[serde(default)]
    pub total_memory: u64,
    /// Memory not claimed by loaded models
    #[serde(default)]
    pub free_memory: u64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub model_instances: Vec<ModelInstanceState>,
}

/// Lifecycle phase of a model instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Starting,
    Idle,
    Busy,
    Stopping,
    Stopped,
}

impl InstanceStatus {
    /// Idle or Busy: the worker is alive and accepting work
    pub fn is_active(&self) -> bool {
        matches!(self, InstanceStatus::Idle | InstanceStatus::Busy)
    }

    /// Stopping or Stopped: no further work may be queued
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Stopping | InstanceStatus::Stopped)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Starting => write!(f, "Starting"),
            InstanceStatus::Idle => write!(f, "Idle"),
            InstanceStatus::Busy => write!(f, "Busy"),
            InstanceStatus::Stopping => write!(f, "Stopping"),
            InstanceStatus::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Point-in-time snapshot of a model instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInstanceState {
    pub id: String,
    pub model_name: ModelName,
    pub mode: SessionMode,
    #[serde(default)]
    pub lora_dir: String,
    pub status: InstanceStatus,
    #[serde(default)]
    pub initial_session_id: String,
    pub current_session_id: Option<String>,
    #[serde(default)]
    pub queued_session_ids: Vec<String>,
    /// Bytes reserved for the loaded model
    pub memory: u64,
    pub last_activity: DateTime<Utc>,
    pub stale: bool,
}

impl ModelInstanceState {
    /// The filter describing what this instance accepts
    pub fn filter(&self) -> SessionFilter {
        SessionFilter::any()
            .with_model(self.model_name)
            .with_mode(self.mode)
            .with_lora_dir(self.lora_dir.clone())
    }
}

/// Everything an operator sees at once
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashboardData {
    pub session_queue: Vec<SessionSummary>,
    pub runners: Vec<RunnerState>,
    pub instances: Vec<ModelInstanceState>,
}
