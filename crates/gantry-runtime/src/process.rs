//! Process-based runtime implementation
//!
//! Each model instance is served by one runner process bound to a single
//! model, mode and adapter. The process pulls its work from the control
//! plane's worker task endpoint using its instance id.

use async_trait::async_trait;
use gantry_core::{GantryError, GantryResult, RuntimeConfig, WorkerProcess, WorkerStatus};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::traits::Runtime;

/// Process-based runtime configuration
#[derive(Debug, Clone)]
pub struct ProcessRuntimeConfig {
    /// Path to the runner binary
    pub runner_binary: PathBuf,
    /// URL the runner uses to reach the control plane
    pub api_url: String,
    /// Additional arguments for the runner
    pub extra_args: Vec<String>,
}

impl Default for ProcessRuntimeConfig {
    fn default() -> Self {
        Self {
            runner_binary: PathBuf::from("gantry-runner"),
            api_url: "http://127.0.0.1:9090".to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl From<&RuntimeConfig> for ProcessRuntimeConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            runner_binary: config.runner_binary.clone(),
            api_url: config.api_url.clone(),
            extra_args: config.extra_args.clone(),
        }
    }
}

/// Process-based runtime for managing runner workers
pub struct ProcessRuntime {
    config: ProcessRuntimeConfig,
    /// Spawned children by worker ID. Dropping a child kills it.
    children: Mutex<HashMap<Uuid, Child>>,
}

impl ProcessRuntime {
    /// Create a new process runtime
    pub fn new(config: ProcessRuntimeConfig) -> Self {
        Self {
            config,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn children(&self) -> MutexGuard<'_, HashMap<Uuid, Child>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build the command to start a worker
    fn build_command(&self, worker: &WorkerProcess) -> Command {
        let mut cmd = Command::new(&self.config.runner_binary);

        cmd.arg("--instance-id").arg(&worker.instance_id);
        cmd.arg("--model-name").arg(worker.model_name.as_str());
        cmd.arg("--mode").arg(worker.mode.to_string());
        if !worker.lora_dir.is_empty() {
            cmd.arg("--lora-dir").arg(&worker.lora_dir);
        }
        cmd.arg("--api-url").arg(&self.config.api_url);
        cmd.arg("--host").arg(&worker.endpoint.host);
        cmd.arg("--port").arg(worker.endpoint.port.to_string());

        for arg in &self.config.extra_args {
            cmd.arg(arg);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        cmd
    }
}

/// PID of a freshly spawned child; a child without one has already exited
fn child_pid(child: &Child) -> GantryResult<u32> {
    child
        .id()
        .ok_or_else(|| GantryError::Runtime("worker exited before reporting a PID".to_string()))
}

/// Relay a worker's output stream into the log, line by line, until it closes
fn forward_output<R>(worker_id: Uuid, stream: &'static str, output: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(output).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!(worker_id = %worker_id, stream, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    debug!(worker_id = %worker_id, stream, error = %e, "Worker output closed");
                    break;
                }
            }
        }
    });
}

#[async_trait]
impl Runtime for ProcessRuntime {
    async fn start_worker(&self, worker: &mut WorkerProcess) -> GantryResult<()> {
        info!(
            worker_id = %worker.id,
            instance_id = %worker.instance_id,
            model = %worker.model_name,
            port = worker.endpoint.port,
            "Starting worker process"
        );

        let mut cmd = self.build_command(worker);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(
                    worker_id = %worker.id,
                    error = %e,
                    "Failed to spawn worker process"
                );
                worker.status = WorkerStatus::Error;
                return Err(GantryError::Runtime(format!(
                    "Failed to spawn worker: {}",
                    e
                )));
            }
        };

        let pid = match child_pid(&child) {
            Ok(pid) => pid,
            Err(e) => {
                worker.status = WorkerStatus::Error;
                return Err(e);
            }
        };

        if let Some(stdout) = child.stdout.take() {
            forward_output(worker.id, "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(worker.id, "stderr", stderr);
        }

        worker.pid = Some(pid);
        worker.status = WorkerStatus::Running;
        self.children().insert(worker.id, child);

        debug!(
            worker_id = %worker.id,
            pid = pid,
            "Worker process spawned"
        );
        Ok(())
    }

    async fn stop_worker(&self, worker: &WorkerProcess) -> GantryResult<()> {
        let pid = worker
            .pid
            .ok_or_else(|| GantryError::Runtime("Worker has no PID".to_string()))?;
        let child = self.children().remove(&worker.id);

        info!(
            worker_id = %worker.id,
            pid = pid,
            "Stopping worker process"
        );

        #[cfg(unix)]
        let output = Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .output()
            .await;

        #[cfg(windows)]
        let output = Command::new("taskkill")
            .arg("/PID")
            .arg(pid.to_string())
            .arg("/F")
            .output()
            .await;

        output
            .map_err(|e| GantryError::Runtime(format!("Failed to signal worker {}: {}", pid, e)))?;

        // If the caller gives up waiting, dropping the child kills it.
        if let Some(mut child) = child {
            let status = child
                .wait()
                .await
                .map_err(|e| GantryError::Runtime(format!("Failed to reap worker {}: {}", pid, e)))?;
            debug!(worker_id = %worker.id, status = %status, "Worker process exited");
        }
        Ok(())
    }

    async fn is_running(&self, worker: &WorkerProcess) -> GantryResult<bool> {
        if worker.pid.is_none() {
            return Ok(false);
        }

        let mut children = self.children();
        let Some(child) = children.get_mut(&worker.id) else {
            return Ok(false);
        };
        match child.try_wait() {
            Ok(None) => Ok(true),
            Ok(Some(status)) => {
                warn!(worker_id = %worker.id, status = %status, "Worker process exited");
                children.remove(&worker.id);
                Ok(false)
            }
            Err(e) => Err(GantryError::Runtime(format!(
                "Failed to check worker {}: {}",
                worker.id, e
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::{ModelName, SessionMode};

    fn worker(lora_dir: &str) -> WorkerProcess {
        WorkerProcess::new(
            "instance-1".to_string(),
            ModelName::Sdxl,
            SessionMode::Inference,
            lora_dir.to_string(),
            31000,
        )
    }

    #[test]
    fn test_config_from_runtime_config() {
        let runtime_config = RuntimeConfig::default();
        let config = ProcessRuntimeConfig::from(&runtime_config);
        assert_eq!(config.runner_binary, PathBuf::from("gantry-runner"));
        assert_eq!(config.api_url, runtime_config.api_url);
    }

    #[test]
    fn test_build_command_args() {
        let runtime = ProcessRuntime::new(ProcessRuntimeConfig {
            runner_binary: PathBuf::from("/usr/bin/gantry-runner"),
            api_url: "http://control:9090".to_string(),
            extra_args: vec!["--verbose".to_string()],
        });

        let cmd = runtime.build_command(&worker("/loras/abc"));
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(cmd.as_std().get_program(), "/usr/bin/gantry-runner");
        assert!(args.windows(2).any(|w| w == ["--lora-dir", "/loras/abc"]));
        assert!(args.windows(2).any(|w| w == ["--mode", "inference"]));
        assert!(args.windows(2).any(|w| w == ["--api-url", "http://control:9090"]));
        assert_eq!(args.last().map(String::as_str), Some("--verbose"));
        assert_eq!(runtime.name(), "process");
    }

    #[test]
    fn test_build_command_base_model_has_no_lora_arg() {
        let runtime = ProcessRuntime::new(ProcessRuntimeConfig::default());
        let cmd = runtime.build_command(&worker(""));
        assert!(!cmd.as_std().get_args().any(|a| a == "--lora-dir"));
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_start() {
        let runtime = ProcessRuntime::new(ProcessRuntimeConfig {
            runner_binary: PathBuf::from("/nonexistent/gantry-runner"),
            ..Default::default()
        });
        let mut w = worker("");
        let err = runtime.start_worker(&mut w).await.unwrap_err();
        assert!(matches!(err, GantryError::Runtime(_)));
        assert_eq!(w.status, WorkerStatus::Error);
    }

    #[tokio::test]
    async fn test_worker_without_pid_is_not_running() {
        let runtime = ProcessRuntime::new(ProcessRuntimeConfig::default());
        assert!(!runtime.is_running(&worker("")).await.unwrap());
        assert!(runtime.stop_worker(&worker("")).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_child_has_no_pid() {
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().await.unwrap();
        let err = child_pid(&child).unwrap_err();
        assert!(matches!(err, GantryError::Runtime(_)));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_worker_keeps_running_after_writing_output() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("alive");
        let script = dir.path().join("runner.sh");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nsleep 0.2\necho ready\necho warming up >&2\ntouch '{}'\nexec sleep 30\n",
                marker.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runtime = ProcessRuntime::new(ProcessRuntimeConfig {
            runner_binary: script,
            ..Default::default()
        });
        let mut w = worker("");
        runtime.start_worker(&mut w).await.unwrap();
        assert!(w.pid.is_some_and(|pid| pid > 0));

        let mut waited = Duration::ZERO;
        while !marker.exists() && waited < Duration::from_secs(10) {
            tokio::time::sleep(Duration::from_millis(50)).await;
            waited += Duration::from_millis(50);
        }
        assert!(marker.exists());
        assert!(runtime.is_running(&w).await.unwrap());

        runtime.stop_worker(&w).await.unwrap();
        assert!(!runtime.is_running(&w).await.unwrap());
    }
}
