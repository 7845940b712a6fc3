//! Model instance pool
//!
//! Reconciles local instances against the queue backlog. Reuse of a live
//! instance whose binding already fits a session always wins over starting
//! a new one. Idle instances past the staleness threshold are stopped and
//! dropped once their done signal fires. Instances whose worker can no
//! longer be reached are evicted at the start of every pass.

use futures::future::join_all;
use gantry_core::{
    GantryError, GantryResult, InstanceStatus, ModelInstanceState, SchedulerConfig, Session,
    SessionFilterModel,
};
use gantry_runtime::{InstanceSpec, ModelInstance, RunnerModelInstance, Runtime};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::capacity::MemoryAllocator;
use crate::matcher::accepts_bound;
use crate::queue::SessionQueue;

type InstanceMap = HashMap<String, Arc<dyn ModelInstance>>;

/// Creates model instances for the pool
pub trait InstanceFactory: Send + Sync {
    fn create(&self, spec: InstanceSpec) -> Arc<dyn ModelInstance>;
}

/// Factory producing worker-process backed instances
pub struct RunnerInstanceFactory {
    runtime: Arc<dyn Runtime>,
    stale_timeout: Duration,
}

impl RunnerInstanceFactory {
    pub fn new(runtime: Arc<dyn Runtime>, stale_timeout: Duration) -> Self {
        Self {
            runtime,
            stale_timeout,
        }
    }
}

impl InstanceFactory for RunnerInstanceFactory {
    fn create(&self, spec: InstanceSpec) -> Arc<dyn ModelInstance> {
        Arc::new(RunnerModelInstance::new(
            spec,
            self.stale_timeout,
            self.runtime.clone(),
        ))
    }
}

/// Timeouts applied to instance lifecycle calls
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    /// How long a binding that failed to start is left alone
    pub start_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(120),
            stop_timeout: Duration::from_secs(30),
            start_backoff: Duration::from_secs(30),
        }
    }
}

impl From<&SchedulerConfig> for PoolConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            start_timeout: config.start_timeout(),
            stop_timeout: config.stop_timeout(),
            start_backoff: config.start_backoff(),
        }
    }
}

fn binding(instance: &dyn ModelInstance) -> SessionFilterModel {
    SessionFilterModel {
        model_name: instance.model_name(),
        mode: instance.mode(),
        finetune_file: instance.lora_dir().to_string(),
    }
}

/// What one reconciliation pass did
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Sessions attached to an existing instance
    pub attached: usize,
    /// Instances started for unserved sessions
    pub started: usize,
    /// Instances that failed to start
    pub failed: usize,
    /// Stale instances stopped
    pub stopped: usize,
    /// Finished instances dropped from the pool
    pub removed: usize,
    /// Instances dropped because their worker was unreachable
    pub evicted: usize,
    /// Sessions returned to the queue
    pub requeued: usize,
    /// Sessions a worker had pulled when its instance went away. The
    /// caller owns putting them back in front of a runner.
    pub interrupted: Vec<Session>,
    /// Start failures, reported upward
    pub errors: Vec<GantryError>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.attached == 0
            && self.started == 0
            && self.failed == 0
            && self.stopped == 0
            && self.removed == 0
            && self.evicted == 0
            && self.requeued == 0
            && self.interrupted.is_empty()
    }

    fn merge(&mut self, other: ReconcileReport) {
        self.attached += other.attached;
        self.started += other.started;
        self.failed += other.failed;
        self.stopped += other.stopped;
        self.removed += other.removed;
        self.evicted += other.evicted;
        self.requeued += other.requeued;
        self.interrupted.extend(other.interrupted);
        self.errors.extend(other.errors);
    }
}

/// Tracks every local model instance
pub struct ModelInstancePool {
    /// Instances indexed by ID
    instances: RwLock<InstanceMap>,
    /// Memory and port accounting
    allocator: RwLock<MemoryAllocator>,
    factory: Arc<dyn InstanceFactory>,
    config: PoolConfig,
    /// Bindings whose last start failed, until the given instant
    cooldowns: std::sync::Mutex<HashMap<SessionFilterModel, Instant>>,
    /// Serializes reconciliation passes
    reconcile_lock: Mutex<()>,
}

impl ModelInstancePool {
    pub fn new(
        factory: Arc<dyn InstanceFactory>,
        allocator: MemoryAllocator,
        config: PoolConfig,
    ) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            allocator: RwLock::new(allocator),
            factory,
            config,
            cooldowns: std::sync::Mutex::new(HashMap::new()),
            reconcile_lock: Mutex::new(()),
        }
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    /// Look up an instance by ID
    pub async fn instance(&self, id: &str) -> GantryResult<Arc<dyn ModelInstance>> {
        self.instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| GantryError::InstanceNotFound(id.to_string()))
    }

    /// A live, non-stale instance whose binding fits `session`, idle ones first.
    /// Instances still starting count as live; anything else must answer a
    /// liveness check.
    pub async fn find_for(&self, session: &Session) -> Option<Arc<dyn ModelInstance>> {
        let mut candidates: Vec<_> = self
            .instances
            .read()
            .await
            .values()
            .filter(|i| !i.status().is_terminal() && !i.stale())
            .filter(|i| accepts_bound(&i.filter(), session))
            .cloned()
            .collect();
        candidates.sort_by_key(|i| i.is_busy());

        for candidate in candidates {
            if candidate.status() == InstanceStatus::Starting || candidate.is_active().await {
                return Some(candidate);
            }
            trace!(instance_id = %candidate.id(), "Skipping unreachable instance");
        }
        None
    }

    /// Mark a session finished on whichever instance runs it
    pub async fn complete_session(&self, session_id: &str) -> bool {
        let instances = self.instances.read().await;
        instances.values().any(|i| i.complete_session(session_id))
    }

    /// Drop a session from whichever instance work list holds it
    pub async fn remove_session(&self, session_id: &str) -> bool {
        let instances = self.instances.read().await;
        instances
            .values()
            .any(|i| i.remove_queued(session_id).is_some())
    }

    fn cooling_down(&self, binding: &SessionFilterModel) -> bool {
        let mut cooldowns = self.cooldowns.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        cooldowns.retain(|_, until| *until > now);
        cooldowns.contains_key(binding)
    }

    fn start_failed(&self, binding: SessionFilterModel) {
        let until = Instant::now() + self.config.start_backoff;
        self.cooldowns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(binding, until);
    }

    /// Snapshots of every reachable instance
    pub async fn states(&self) -> Vec<ModelInstanceState> {
        let instances: Vec<_> = self.instances.read().await.values().cloned().collect();
        let mut states = Vec::with_capacity(instances.len());
        for instance in instances {
            match instance.get_state().await {
                Ok(state) => states.push(state),
                Err(e) => {
                    warn!(instance_id = %instance.id(), error = %e, "Instance state unavailable");
                }
            }
        }
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }

    /// Match the queue backlog against instances, then sweep stale ones
    pub async fn reconcile(&self, queue: &SessionQueue) -> ReconcileReport {
        let _guard = self.reconcile_lock.lock().await;
        let mut report = self.evict_unreachable(queue).await;
        let mut fresh: Vec<Arc<dyn ModelInstance>> = Vec::new();

        for pending in queue.snapshot().await {
            if let Some(instance) = self.find_for(&pending).await {
                let Some(session) = queue.take_by_id(&pending.id).await else {
                    continue;
                };
                match instance.queue_session(session, false) {
                    None => {
                        debug!(
                            session_id = %pending.id,
                            instance_id = %instance.id(),
                            "Attached session to existing instance"
                        );
                        report.attached += 1;
                    }
                    Some(returned) => {
                        queue.push(returned).await;
                        report.requeued += 1;
                    }
                }
                continue;
            }

            if let Some(instance) = self.create_for(&pending, queue).await {
                fresh.push(instance);
            }
        }

        let starts = fresh.iter().map(|instance| {
            let instance = instance.clone();
            let start_timeout = self.config.start_timeout;
            async move {
                let result = match tokio::time::timeout(start_timeout, instance.start()).await {
                    Ok(result) => result,
                    Err(_) => Err(GantryError::Provisioning(format!(
                        "instance {} did not start within {:?}",
                        instance.id(),
                        start_timeout
                    ))),
                };
                (instance, result)
            }
        });

        for (instance, result) in join_all(starts).await {
            match result {
                Ok(()) => {
                    info!(
                        instance_id = %instance.id(),
                        model = %instance.model_name(),
                        mode = %instance.mode(),
                        "Model instance started"
                    );
                    report.started += 1;
                }
                Err(e) => {
                    warn!(instance_id = %instance.id(), error = %e, "Model instance failed to start");
                    report.failed += 1;
                    self.start_failed(binding(instance.as_ref()));
                    self.retire(&instance, queue, &mut report).await;
                    report.errors.push(e);
                }
            }
        }

        report.merge(self.sweep(queue).await);
        report
    }

    /// Create and register an instance for `pending`, claiming it from the queue
    async fn create_for(
        &self,
        pending: &Session,
        queue: &SessionQueue,
    ) -> Option<Arc<dyn ModelInstance>> {
        if self.cooling_down(&pending.filter_model()) {
            trace!(session_id = %pending.id, "Binding is backing off after a failed start");
            return None;
        }

        let mut spec = InstanceSpec::new(
            pending.model_name,
            pending.mode,
            pending.finetune_file.clone(),
            0,
        );

        let reservation = {
            let mut allocator = self.allocator.write().await;
            match allocator.reserve(&spec.id, pending.memory_requirement()) {
                Ok(reservation) => reservation,
                Err(e) => {
                    trace!(session_id = %pending.id, reason = %e, "No capacity for a new instance");
                    return None;
                }
            }
        };
        spec.port = reservation.port;

        let Some(session) = queue.take_by_id(&pending.id).await else {
            self.allocator.write().await.release(&spec.id);
            return None;
        };

        let instance = self.factory.create(spec);
        if let Some(returned) = instance.queue_session(session, true) {
            queue.push(returned).await;
            self.allocator.write().await.release(instance.id());
            return None;
        }

        self.instances
            .write()
            .await
            .insert(instance.id().to_string(), instance.clone());
        debug!(
            session_id = %pending.id,
            instance_id = %instance.id(),
            port = reservation.port,
            "Created instance for session"
        );
        Some(instance)
    }

    /// Stop an instance and forget it. Queued sessions go back to the queue
    /// and the in-flight one, if any, is reported as interrupted.
    async fn retire(
        &self,
        instance: &Arc<dyn ModelInstance>,
        queue: &SessionQueue,
        report: &mut ReconcileReport,
    ) {
        if let Err(e) = self.stop_with_timeout(instance).await {
            warn!(instance_id = %instance.id(), error = %e, "Failed to stop instance");
        }
        report.requeued += self.requeue_drained(instance, queue).await;
        report.interrupted.extend(instance.take_in_flight());
        self.instances.write().await.remove(instance.id());
        self.allocator.write().await.release(instance.id());
    }

    /// Retire every running instance whose worker no longer answers
    async fn evict_unreachable(&self, queue: &SessionQueue) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let running: Vec<_> = self
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.status().is_active())
            .cloned()
            .collect();

        for instance in running {
            if let Err(e) = instance.get_state().await {
                warn!(
                    instance_id = %instance.id(),
                    model = %instance.model_name(),
                    error = %e,
                    "Evicting unreachable instance"
                );
                self.retire(&instance, queue, &mut report).await;
                report.evicted += 1;
            }
        }
        report
    }

    async fn stop_with_timeout(&self, instance: &Arc<dyn ModelInstance>) -> GantryResult<()> {
        match tokio::time::timeout(self.config.stop_timeout, instance.stop()).await {
            Ok(result) => result,
            Err(_) => Err(GantryError::Runtime(format!(
                "instance {} did not stop within {:?}",
                instance.id(),
                self.config.stop_timeout
            ))),
        }
    }

    async fn requeue_drained(
        &self,
        instance: &Arc<dyn ModelInstance>,
        queue: &SessionQueue,
    ) -> usize {
        let drained = instance.drain_queued();
        let count = drained.len();
        for session in drained {
            debug!(
                session_id = %session.id,
                instance_id = %instance.id(),
                "Returning session to queue"
            );
            queue.push(session).await;
        }
        count
    }

    /// Stop stale instances and drop finished ones
    pub async fn sweep(&self, queue: &SessionQueue) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let instances: Vec<_> = self.instances.read().await.values().cloned().collect();

        let stale: Vec<_> = instances
            .iter()
            .filter(|i| i.status().is_active() && i.stale())
            .cloned()
            .collect();
        for instance in &stale {
            info!(
                instance_id = %instance.id(),
                model = %instance.model_name(),
                "Stopping stale instance"
            );
            report.requeued += self.requeue_drained(instance, queue).await;
        }

        let stops = join_all(stale.iter().map(|i| self.stop_with_timeout(i))).await;
        for (instance, result) in stale.iter().zip(stops) {
            match result {
                Ok(()) => report.stopped += 1,
                Err(e) => {
                    warn!(instance_id = %instance.id(), error = %e, "Stale instance did not stop cleanly");
                }
            }
        }

        for instance in instances.iter().filter(|i| i.done().is_done()) {
            report.requeued += self.requeue_drained(instance, queue).await;
            report.interrupted.extend(instance.take_in_flight());
            self.instances.write().await.remove(instance.id());
            self.allocator.write().await.release(instance.id());
            debug!(instance_id = %instance.id(), "Removed finished instance");
            report.removed += 1;
        }

        report
    }

    /// Stop every instance; returns every session the instances had taken on,
    /// pulled or not
    pub async fn shutdown(&self) -> Vec<Session> {
        let instances: Vec<_> = self
            .instances
            .write()
            .await
            .drain()
            .map(|(_, instance)| instance)
            .collect();
        info!(count = instances.len(), "Shutting down model instances");

        let mut pending = Vec::new();
        for instance in &instances {
            pending.extend(instance.take_in_flight());
            pending.extend(instance.drain_queued());
        }

        let results = join_all(instances.iter().map(|i| self.stop_with_timeout(i))).await;
        let mut allocator = self.allocator.write().await;
        for (instance, result) in instances.iter().zip(results) {
            if let Err(e) = result {
                warn!(instance_id = %instance.id(), error = %e, "Failed to stop instance");
            }
            allocator.release(instance.id());
        }
        pending
    }
}
