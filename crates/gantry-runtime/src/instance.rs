//! Model instance lifecycle
//!
//! A model instance is the scheduler's handle to one worker process bound to
//! a fixed (model, mode, adapter) tuple. It owns a private work list of
//! sessions and moves through
//! `Starting -> Idle <-> Busy -> Stopping -> Stopped`.
//! Staleness is evaluated on demand from the last activity timestamp.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::{
    GantryError, GantryResult, InstanceStatus, ModelInstanceState, ModelName, Session,
    SessionFilter, SessionMode, WorkerProcess, WorkerStatus,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::traits::Runtime;

/// One-shot signal fired when an instance has fully stopped
#[derive(Debug, Clone)]
pub struct DoneSignal {
    rx: watch::Receiver<bool>,
}

impl DoneSignal {
    fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// Create a signal/trigger pair
    pub fn channel() -> (watch::Sender<bool>, DoneSignal) {
        let (tx, rx) = watch::channel(false);
        (tx, DoneSignal::new(rx))
    }

    pub fn is_done(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the instance is done
    pub async fn wait(mut self) {
        // A dropped sender means the instance is gone, which also counts as done.
        let _ = self.rx.wait_for(|done| *done).await;
    }
}

/// Binding and placement for a new model instance
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub id: String,
    pub model_name: ModelName,
    pub mode: SessionMode,
    /// Adapter directory; empty for the base model
    pub lora_dir: String,
    pub port: u16,
}

impl InstanceSpec {
    pub fn new(model_name: ModelName, mode: SessionMode, lora_dir: String, port: u16) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            model_name,
            mode,
            lora_dir,
            port,
        }
    }
}

/// Handle to one live worker bound to a (model, mode, adapter) tuple
#[async_trait]
pub trait ModelInstance: Send + Sync {
    fn id(&self) -> &str;

    fn model_name(&self) -> ModelName;

    fn mode(&self) -> SessionMode;

    /// Bound adapter directory; empty for the base model
    fn lora_dir(&self) -> &str;

    /// Bytes the bound model needs
    fn memory(&self) -> u64 {
        self.model_name().memory_requirement(self.mode())
    }

    /// What this instance accepts, expressed as a session filter
    fn filter(&self) -> SessionFilter {
        SessionFilter::any()
            .with_model(self.model_name())
            .with_mode(self.mode())
            .with_lora_dir(self.lora_dir().to_string())
    }

    /// Provision the worker process
    async fn start(&self) -> GantryResult<()>;

    /// Append a session to the work list.
    ///
    /// Returns the session back when the instance is stopping or stopped;
    /// the caller must return it to the queue.
    #[must_use]
    fn queue_session(&self, session: Session, is_initial_session: bool) -> Option<Session>;

    /// Hand the next queued session to the worker, marking the instance busy
    fn next_session(&self) -> Option<Session>;

    /// Mark the in-flight session finished. Returns false if it was not in flight here.
    fn complete_session(&self, session_id: &str) -> bool;

    /// Remove and return every queued, not yet started session
    fn drain_queued(&self) -> Vec<Session>;

    /// Pull one not yet started session off the work list
    fn remove_queued(&self, session_id: &str) -> Option<Session>;

    /// Take the session the worker was running, if any. Used when the
    /// instance goes away so the session can be retried elsewhere.
    fn take_in_flight(&self) -> Option<Session>;

    fn status(&self) -> InstanceStatus;

    /// The worker process is alive and accepting work. Asks the runtime.
    async fn is_active(&self) -> bool;

    fn is_busy(&self) -> bool {
        self.status() == InstanceStatus::Busy
    }

    /// Idle for longer than the inactivity threshold. Never true while busy.
    fn stale(&self) -> bool;

    /// Snapshot of the instance; fails when the worker cannot be reached
    async fn get_state(&self) -> GantryResult<ModelInstanceState>;

    /// Request termination. Stopping a stopped instance is a no-op.
    async fn stop(&self) -> GantryResult<()>;

    fn done(&self) -> DoneSignal;
}

struct InstanceInner {
    status: InstanceStatus,
    queue: VecDeque<Session>,
    current: Option<Session>,
    initial_session_id: String,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
}

impl InstanceInner {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }
}

/// Model instance backed by a worker process managed through a [`Runtime`]
pub struct RunnerModelInstance {
    id: String,
    model_name: ModelName,
    mode: SessionMode,
    lora_dir: String,
    stale_timeout: Duration,
    runtime: Arc<dyn Runtime>,
    worker: tokio::sync::Mutex<WorkerProcess>,
    inner: Mutex<InstanceInner>,
    done_tx: watch::Sender<bool>,
    done: DoneSignal,
}

impl RunnerModelInstance {
    pub fn new(spec: InstanceSpec, stale_timeout: Duration, runtime: Arc<dyn Runtime>) -> Self {
        let worker = WorkerProcess::new(
            spec.id.clone(),
            spec.model_name,
            spec.mode,
            spec.lora_dir.clone(),
            spec.port,
        );
        let (done_tx, done) = DoneSignal::channel();

        Self {
            id: spec.id,
            model_name: spec.model_name,
            mode: spec.mode,
            lora_dir: spec.lora_dir,
            stale_timeout,
            runtime,
            worker: tokio::sync::Mutex::new(worker),
            inner: Mutex::new(InstanceInner {
                status: InstanceStatus::Starting,
                queue: VecDeque::new(),
                current: None,
                initial_session_id: String::new(),
                last_activity: Instant::now(),
                last_activity_at: Utc::now(),
            }),
            done_tx,
            done,
        }
    }

    fn inner(&self) -> MutexGuard<'_, InstanceInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self) {
        self.inner().status = InstanceStatus::Stopped;
        self.done_tx.send_replace(true);
        debug!(instance_id = %self.id, "Instance stopped");
    }
}

#[async_trait]
impl ModelInstance for RunnerModelInstance {
    fn id(&self) -> &str {
        &self.id
    }

    fn model_name(&self) -> ModelName {
        self.model_name
    }

    fn mode(&self) -> SessionMode {
        self.mode
    }

    fn lora_dir(&self) -> &str {
        &self.lora_dir
    }

    async fn start(&self) -> GantryResult<()> {
        let status = self.inner().status;
        if status != InstanceStatus::Starting {
            return Err(GantryError::Provisioning(format!(
                "instance {} cannot start while {}",
                self.id, status
            )));
        }

        info!(
            instance_id = %self.id,
            model = %self.model_name,
            mode = %self.mode,
            lora_dir = %self.lora_dir,
            runtime = self.runtime.name(),
            "Starting model instance"
        );

        let mut worker = self.worker.lock().await;
        if let Err(e) = self.runtime.start_worker(&mut worker).await {
            drop(worker);
            warn!(instance_id = %self.id, error = %e, "Model instance failed to start");
            self.finish();
            return Err(GantryError::Provisioning(format!(
                "instance {}: {}",
                self.id, e
            )));
        }
        drop(worker);

        let mut inner = self.inner();
        if inner.status == InstanceStatus::Starting {
            inner.status = InstanceStatus::Idle;
            inner.touch();
        }
        Ok(())
    }

    fn queue_session(&self, session: Session, is_initial_session: bool) -> Option<Session> {
        let mut inner = self.inner();
        if inner.status.is_terminal() {
            warn!(
                instance_id = %self.id,
                session_id = %session.id,
                status = %inner.status,
                "Refusing session for stopping instance"
            );
            return Some(session);
        }

        if is_initial_session {
            inner.initial_session_id = session.id.clone();
        }
        debug!(
            instance_id = %self.id,
            session_id = %session.id,
            initial = is_initial_session,
            "Session queued on instance"
        );
        inner.queue.push_back(session);
        inner.touch();
        None
    }

    fn next_session(&self) -> Option<Session> {
        let mut inner = self.inner();
        if inner.status != InstanceStatus::Idle {
            return None;
        }
        let session = inner.queue.pop_front()?;
        inner.current = Some(session.clone());
        inner.status = InstanceStatus::Busy;
        inner.touch();
        Some(session)
    }

    fn complete_session(&self, session_id: &str) -> bool {
        let mut inner = self.inner();
        let matches = inner
            .current
            .as_ref()
            .is_some_and(|s| s.id == session_id);
        if !matches {
            return false;
        }
        inner.current = None;
        if inner.status == InstanceStatus::Busy {
            inner.status = InstanceStatus::Idle;
        }
        inner.touch();
        true
    }

    fn drain_queued(&self) -> Vec<Session> {
        self.inner().queue.drain(..).collect()
    }

    fn remove_queued(&self, session_id: &str) -> Option<Session> {
        let mut inner = self.inner();
        let idx = inner.queue.iter().position(|s| s.id == session_id)?;
        let removed = inner.queue.remove(idx);
        if removed.is_some() {
            debug!(instance_id = %self.id, session_id = %session_id, "Session removed from instance");
        }
        removed
    }

    fn take_in_flight(&self) -> Option<Session> {
        let mut inner = self.inner();
        let session = inner.current.take()?;
        if inner.status == InstanceStatus::Busy {
            inner.status = InstanceStatus::Idle;
        }
        Some(session)
    }

    fn status(&self) -> InstanceStatus {
        self.inner().status
    }

    async fn is_active(&self) -> bool {
        if !self.status().is_active() {
            return false;
        }
        let worker = self.worker.lock().await;
        match self.runtime.is_running(&worker).await {
            Ok(running) => running,
            Err(e) => {
                debug!(instance_id = %self.id, error = %e, "Liveness check failed");
                false
            }
        }
    }

    fn stale(&self) -> bool {
        let inner = self.inner();
        if inner.status == InstanceStatus::Busy || inner.current.is_some() {
            return false;
        }
        inner.last_activity.elapsed() > self.stale_timeout
    }

    async fn get_state(&self) -> GantryResult<ModelInstanceState> {
        let status = self.status();
        if status.is_active() {
            let worker = self.worker.lock().await;
            match self.runtime.is_running(&worker).await {
                Ok(true) => {}
                Ok(false) => {
                    return Err(GantryError::StateUnavailable(format!(
                        "worker for instance {} is not running",
                        self.id
                    )))
                }
                Err(e) => {
                    return Err(GantryError::StateUnavailable(format!(
                        "instance {}: {}",
                        self.id, e
                    )))
                }
            }
        }

        let stale = self.stale();
        let inner = self.inner();
        Ok(ModelInstanceState {
            id: self.id.clone(),
            model_name: self.model_name,
            mode: self.mode,
            lora_dir: self.lora_dir.clone(),
            status: inner.status,
            initial_session_id: inner.initial_session_id.clone(),
            current_session_id: inner.current.as_ref().map(|s| s.id.clone()),
            queued_session_ids: inner.queue.iter().map(|s| s.id.clone()).collect(),
            memory: self.memory(),
            last_activity: inner.last_activity_at,
            stale,
        })
    }

    async fn stop(&self) -> GantryResult<()> {
        {
            let mut inner = self.inner();
            if inner.status.is_terminal() {
                return Ok(());
            }
            inner.status = InstanceStatus::Stopping;
        }

        info!(instance_id = %self.id, model = %self.model_name, "Stopping model instance");

        let result = {
            let mut worker = self.worker.lock().await;
            if worker.pid.is_some() {
                worker.status = WorkerStatus::Terminating;
                let result = self.runtime.stop_worker(&worker).await;
                worker.status = WorkerStatus::Terminated;
                result
            } else {
                Ok(())
            }
        };

        self.finish();
        result
    }

    fn done(&self) -> DoneSignal {
        self.done.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::{OwnerType, SessionType};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Runtime double that never spawns anything
    #[derive(Default)]
    struct FakeRuntime {
        pub fail_start: bool,
        pub dead: AtomicBool,
        pub stops: AtomicUsize,
    }

    #[async_trait]
    impl Runtime for FakeRuntime {
        async fn start_worker(&self, worker: &mut WorkerProcess) -> GantryResult<()> {
            if self.fail_start {
                worker.status = WorkerStatus::Error;
                return Err(GantryError::Runtime("no GPU".to_string()));
            }
            worker.pid = Some(4242);
            worker.status = WorkerStatus::Running;
            Ok(())
        }

        async fn stop_worker(&self, _worker: &WorkerProcess) -> GantryResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn is_running(&self, worker: &WorkerProcess) -> GantryResult<bool> {
            Ok(worker.pid.is_some() && !self.dead.load(Ordering::SeqCst))
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    fn instance(runtime: Arc<FakeRuntime>, stale_secs: u64) -> RunnerModelInstance {
        RunnerModelInstance::new(
            InstanceSpec::new(ModelName::Sdxl, SessionMode::Inference, String::new(), 31000),
            Duration::from_secs(stale_secs),
            runtime,
        )
    }

    fn session() -> Session {
        Session::new(
            SessionMode::Inference,
            SessionType::Image,
            ModelName::Sdxl,
            "alice".to_string(),
            OwnerType::User,
        )
    }

    #[tokio::test]
    async fn test_start_makes_instance_active() {
        let inst = instance(Arc::new(FakeRuntime::default()), 300);
        assert_eq!(inst.status(), InstanceStatus::Starting);
        assert!(!inst.is_active().await);

        inst.start().await.unwrap();
        assert_eq!(inst.status(), InstanceStatus::Idle);
        assert!(inst.is_active().await);
        assert!(!inst.done().is_done());
    }

    #[tokio::test]
    async fn test_failed_start_is_provisioning_error() {
        let runtime = Arc::new(FakeRuntime {
            fail_start: true,
            ..Default::default()
        });
        let inst = instance(runtime, 300);

        let err = inst.start().await.unwrap_err();
        assert!(matches!(err, GantryError::Provisioning(_)));
        assert!(!inst.is_active().await);
        assert!(inst.done().is_done());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let inst = instance(Arc::new(FakeRuntime::default()), 300);
        inst.start().await.unwrap();
        assert!(inst.start().await.is_err());
        assert!(inst.is_active().await);
    }

    #[tokio::test]
    async fn test_work_list_flow() {
        let inst = instance(Arc::new(FakeRuntime::default()), 300);
        inst.start().await.unwrap();

        let first = session();
        let first_id = first.id.clone();
        assert!(inst.queue_session(first, true).is_none());
        assert!(inst.queue_session(session(), false).is_none());

        let taken = inst.next_session().unwrap();
        assert_eq!(taken.id, first_id);
        assert!(inst.is_busy());
        // one at a time
        assert!(inst.next_session().is_none());

        assert!(!inst.complete_session("someone-else"));
        assert!(inst.complete_session(&first_id));
        assert_eq!(inst.status(), InstanceStatus::Idle);

        let state = inst.get_state().await.unwrap();
        assert_eq!(state.initial_session_id, first_id);
        assert_eq!(state.queued_session_ids.len(), 1);
        assert!(state.current_session_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_after_threshold() {
        let inst = instance(Arc::new(FakeRuntime::default()), 300);
        inst.start().await.unwrap();

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(!inst.stale());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(inst.stale());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_session_refreshes_activity() {
        let inst = instance(Arc::new(FakeRuntime::default()), 300);
        inst.start().await.unwrap();

        tokio::time::advance(Duration::from_secs(200)).await;
        assert!(inst.queue_session(session(), false).is_none());
        tokio::time::advance(Duration::from_secs(200)).await;
        assert!(!inst.stale());
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_instance_never_stale() {
        let inst = instance(Arc::new(FakeRuntime::default()), 300);
        inst.start().await.unwrap();
        assert!(inst.queue_session(session(), true).is_none());
        let running = inst.next_session().unwrap();

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(!inst.stale());

        inst.complete_session(&running.id);
        assert!(!inst.stale());
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(inst.stale());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_fires_done() {
        let runtime = Arc::new(FakeRuntime::default());
        let inst = instance(runtime.clone(), 300);
        inst.start().await.unwrap();
        let done = inst.done();

        inst.stop().await.unwrap();
        inst.stop().await.unwrap();

        assert_eq!(inst.status(), InstanceStatus::Stopped);
        assert_eq!(runtime.stops.load(Ordering::SeqCst), 1);
        assert!(done.is_done());
        done.wait().await;
    }

    #[tokio::test]
    async fn test_stop_before_start_skips_runtime() {
        let runtime = Arc::new(FakeRuntime::default());
        let inst = instance(runtime.clone(), 300);
        inst.stop().await.unwrap();
        assert_eq!(runtime.stops.load(Ordering::SeqCst), 0);
        assert!(inst.done().is_done());
        assert!(inst.start().await.is_err());
    }

    #[tokio::test]
    async fn test_queue_after_stop_returns_session() {
        let inst = instance(Arc::new(FakeRuntime::default()), 300);
        inst.start().await.unwrap();
        inst.stop().await.unwrap();

        let s = session();
        let id = s.id.clone();
        let returned = inst.queue_session(s, false).unwrap();
        assert_eq!(returned.id, id);
        assert!(inst.drain_queued().is_empty());
    }

    #[tokio::test]
    async fn test_get_state_unreachable_worker() {
        let runtime = Arc::new(FakeRuntime::default());
        let inst = instance(runtime.clone(), 300);
        inst.start().await.unwrap();

        runtime.dead.store(true, Ordering::SeqCst);
        let err = inst.get_state().await.unwrap_err();
        assert!(matches!(err, GantryError::StateUnavailable(_)));
    }

    #[tokio::test]
    async fn test_crashed_worker_is_not_active() {
        let runtime = Arc::new(FakeRuntime::default());
        let inst = instance(runtime.clone(), 300);
        inst.start().await.unwrap();
        assert!(inst.is_active().await);

        // status still says idle, but the process is gone
        runtime.dead.store(true, Ordering::SeqCst);
        assert_eq!(inst.status(), InstanceStatus::Idle);
        assert!(!inst.is_active().await);
    }

    #[tokio::test]
    async fn test_remove_queued_session() {
        let inst = instance(Arc::new(FakeRuntime::default()), 300);
        inst.start().await.unwrap();
        let first = session();
        let second = session();
        let second_id = second.id.clone();
        assert!(inst.queue_session(first, true).is_none());
        assert!(inst.queue_session(second, false).is_none());

        assert_eq!(inst.remove_queued(&second_id).unwrap().id, second_id);
        assert!(inst.remove_queued(&second_id).is_none());
        assert_eq!(inst.drain_queued().len(), 1);
    }

    #[tokio::test]
    async fn test_take_in_flight_frees_instance() {
        let inst = instance(Arc::new(FakeRuntime::default()), 300);
        inst.start().await.unwrap();
        assert!(inst.take_in_flight().is_none());

        assert!(inst.queue_session(session(), true).is_none());
        let running = inst.next_session().unwrap();
        assert!(inst.is_busy());

        assert_eq!(inst.take_in_flight().unwrap().id, running.id);
        assert_eq!(inst.status(), InstanceStatus::Idle);
        assert!(!inst.complete_session(&running.id));
    }

    #[test]
    fn test_filter_describes_binding() {
        let inst = RunnerModelInstance::new(
            InstanceSpec::new(
                ModelName::Mistral7bInstruct01,
                SessionMode::Finetune,
                "/loras/x".to_string(),
                31001,
            ),
            Duration::from_secs(1),
            Arc::new(FakeRuntime::default()),
        );
        let filter = inst.filter();
        assert_eq!(filter.model_name, Some(ModelName::Mistral7bInstruct01));
        assert_eq!(filter.mode, Some(SessionMode::Finetune));
        assert_eq!(filter.lora_dir, "/loras/x");
        assert_eq!(
            inst.memory(),
            ModelName::Mistral7bInstruct01.memory_requirement(SessionMode::Finetune)
        );
    }
}
