//! Runtime trait definitions

use async_trait::async_trait;
use gantry_core::{GantryResult, WorkerProcess};

/// Runtime trait for managing the OS-level worker behind a model instance
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Start a new worker
    async fn start_worker(&self, worker: &mut WorkerProcess) -> GantryResult<()>;

    /// Stop a running worker
    async fn stop_worker(&self, worker: &WorkerProcess) -> GantryResult<()>;

    /// Check if a worker is running
    async fn is_running(&self, worker: &WorkerProcess) -> GantryResult<bool>;

    /// Get the runtime name
    fn name(&self) -> &'static str;
}
