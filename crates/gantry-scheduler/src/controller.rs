//! Controller: the façade the transport talks to
//!
//! Owns the session queue, the optional local instance pool and the runner
//! table, and keeps the store in step with every dispatch and result.

use gantry_core::{
    CreateSessionRequest, DashboardData, GantryError, GantryResult, Interaction,
    InteractionState, ModelInstanceState, ModelName, RequestContext, RunnerState,
    RunnerTaskResponse, RunnerTaskResponseType, Session, SessionFilter, SessionMode,
    SessionStatus, SessionSummary, UpdateSessionRequest,
};
use gantry_store::{GetSessionsQuery, Store};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::locks::SessionLocks;
use crate::pool::{ModelInstancePool, ReconcileReport};
use crate::queue::{QueueTake, SessionQueue};

struct RunnerEntry {
    state: RunnerState,
    seen: Instant,
}

/// Wires the queue, pool and store together
pub struct Controller {
    store: Arc<dyn Store>,
    queue: Arc<SessionQueue>,
    /// Local model instances; `None` when only remote runners serve work
    pool: Option<Arc<ModelInstancePool>>,
    /// Latest report per runner ID
    runners: RwLock<HashMap<String, RunnerEntry>>,
    runner_ttl: Duration,
    /// Runner each polled session was handed to, by session ID
    assignments: RwLock<HashMap<String, String>>,
    /// Serializes read-modify-write of a stored session
    locks: SessionLocks,
    /// Wakes the reconcile loop when the backlog changes
    wake: Notify,
}

/// Put a session that never finished back in line for a fresh attempt
fn reset_for_retry(session: &mut Session) -> GantryResult<()> {
    session.transition(SessionStatus::Queued)?;
    let reply = session.system_interaction_mut()?;
    if !reply.finished {
        reply.message.clear();
        reply.progress = 0;
        reply.status.clear();
        reply.state = InteractionState::Waiting;
        reply.updated = chrono::Utc::now();
    }
    Ok(())
}

impl Controller {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<SessionQueue>,
        pool: Option<Arc<ModelInstancePool>>,
        runner_ttl: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            pool,
            runners: RwLock::new(HashMap::new()),
            runner_ttl,
            assignments: RwLock::new(HashMap::new()),
            locks: SessionLocks::new(),
            wake: Notify::new(),
        }
    }

    pub fn queue(&self) -> &SessionQueue {
        &self.queue
    }

    pub fn pool(&self) -> Option<&ModelInstancePool> {
        self.pool.as_deref()
    }

    /// Put every stored `queued` session back on the queue after a restart.
    /// Sessions left `assigned` by the previous process lost their runner,
    /// so they are queued again too.
    pub async fn restore_queue(&self) -> GantryResult<usize> {
        let sessions = self.store.get_sessions(GetSessionsQuery::default()).await?;
        let mut restored = 0;
        for mut session in sessions {
            match session.status {
                SessionStatus::Queued => {}
                SessionStatus::Assigned => {
                    reset_for_retry(&mut session)?;
                    session = self.store.update_session(session).await?;
                    debug!(session_id = %session.id, "Requeued session orphaned by restart");
                }
                _ => continue,
            }
            self.queue.push(session).await;
            restored += 1;
        }
        if restored > 0 {
            info!(count = restored, "Restored queued sessions");
            self.wake.notify_one();
        }
        Ok(restored)
    }

    /// Create a session and queue it for execution
    pub async fn create_session(
        &self,
        ctx: &RequestContext,
        req: CreateSessionRequest,
    ) -> GantryResult<Session> {
        req.validate()?;

        let model = req
            .model_name
            .unwrap_or_else(|| ModelName::for_session_type(req.session_type));
        let mut session = Session::new(
            req.mode,
            req.session_type,
            model,
            ctx.owner.clone(),
            ctx.owner_type,
        );
        session.name = req.name;
        session.finetune_file = req.finetune_file;
        session
            .interactions
            .push(Interaction::user(req.message, req.files));
        session.interactions.push(Interaction::system_waiting());
        session.transition(SessionStatus::Queued)?;

        let session = self.store.create_session(session).await?;
        self.queue.push(session.clone()).await;
        self.wake.notify_one();

        info!(
            session_id = %session.id,
            owner = %session.owner,
            model = %session.model_name,
            mode = %session.mode,
            "Session created"
        );
        Ok(session)
    }

    /// Append a follow-up turn to a finished session and queue it again
    pub async fn update_session(
        &self,
        ctx: &RequestContext,
        id: &str,
        req: UpdateSessionRequest,
    ) -> GantryResult<Session> {
        if req.message.trim().is_empty() && req.files.is_empty() {
            return Err(GantryError::Validation(
                "an update needs a message or at least one file".to_string(),
            ));
        }

        let _guard = self.locks.lock(id).await;
        let mut session = self.get_session(ctx, id).await?;
        if !matches!(
            session.status,
            SessionStatus::Complete | SessionStatus::Error
        ) {
            return Err(GantryError::SessionInUse(id.to_string()));
        }

        session
            .interactions
            .push(Interaction::user(req.message, req.files));
        session.interactions.push(Interaction::system_waiting());
        session.transition(SessionStatus::Queued)?;

        let session = self.store.update_session(session).await?;
        self.queue.push(session.clone()).await;
        self.wake.notify_one();

        info!(session_id = %session.id, turns = session.interactions.len(), "Session requeued");
        Ok(session)
    }

    /// Fetch a session the caller owns
    pub async fn get_session(&self, ctx: &RequestContext, id: &str) -> GantryResult<Session> {
        let session = self
            .store
            .get_session(id)
            .await?
            .ok_or_else(|| GantryError::SessionNotFound(id.to_string()))?;
        if !session.is_owned_by(ctx) {
            return Err(GantryError::AccessDenied(format!(
                "session {} belongs to another owner",
                id
            )));
        }
        Ok(session)
    }

    /// Sessions owned by the caller, newest first
    pub async fn get_sessions(&self, ctx: &RequestContext) -> GantryResult<Vec<Session>> {
        self.store
            .get_sessions(GetSessionsQuery {
                owner: ctx.owner.clone(),
                owner_type: Some(ctx.owner_type),
            })
            .await
    }

    /// Delete a session unless a runner is working on it
    pub async fn delete_session(&self, ctx: &RequestContext, id: &str) -> GantryResult<Session> {
        let _guard = self.locks.lock(id).await;
        let session = self.get_session(ctx, id).await?;
        if session.status == SessionStatus::Assigned {
            return Err(GantryError::SessionInUse(id.to_string()));
        }

        self.queue.remove(id).await;
        if let Some(pool) = &self.pool {
            pool.remove_session(id).await;
        }
        let deleted = self
            .store
            .delete_session(id)
            .await?
            .ok_or_else(|| GantryError::SessionNotFound(id.to_string()))?;
        info!(session_id = %id, "Session deleted");
        Ok(deleted)
    }

    /// Answer a runner poll with the next matching session.
    /// Queue entries whose stored session was deleted or already moved on
    /// are dropped and the search continues.
    pub async fn shift_session_queue(
        &self,
        filter: &SessionFilter,
        runner_id: &str,
    ) -> GantryResult<QueueTake> {
        loop {
            let QueueTake::Found(session) = self.queue.take_matching(filter).await else {
                trace!(runner_id = %runner_id, "No session for runner");
                return Ok(QueueTake::Empty);
            };

            match self.assign(&session.id).await {
                Ok(assigned) => {
                    self.assignments
                        .write()
                        .await
                        .insert(assigned.id.clone(), runner_id.to_string());
                    debug!(
                        session_id = %assigned.id,
                        runner_id = %runner_id,
                        model = %assigned.model_name,
                        "Session dispatched to runner"
                    );
                    return Ok(QueueTake::Found(assigned));
                }
                Err(e @ (GantryError::SessionNotFound(_) | GantryError::InvalidTransition { .. })) => {
                    debug!(session_id = %session.id, reason = %e, "Dropping stale queue entry");
                }
                Err(e) => {
                    error!(session_id = %session.id, error = %e, "Failed to record assignment");
                    self.queue.push(session).await;
                    return Err(e);
                }
            }
        }
    }

    /// Move the stored session to `assigned`, reading it fresh under its lock
    async fn assign(&self, id: &str) -> GantryResult<Session> {
        let _guard = self.locks.lock(id).await;
        let mut session = self
            .store
            .get_session(id)
            .await?
            .ok_or_else(|| GantryError::SessionNotFound(id.to_string()))?;
        session.transition(SessionStatus::Assigned)?;
        self.store.update_session(session).await
    }

    /// Return a session whose runner or instance went away to the queue.
    /// Only sessions still `assigned` or `queued` are touched.
    pub async fn requeue_interrupted(&self, id: &str) -> GantryResult<bool> {
        let _guard = self.locks.lock(id).await;
        self.assignments.write().await.remove(id);
        let Some(mut session) = self.store.get_session(id).await? else {
            return Ok(false);
        };

        match session.status {
            SessionStatus::Assigned => {
                reset_for_retry(&mut session)?;
                let session = self.store.update_session(session).await?;
                self.queue.remove(id).await;
                self.queue.push(session).await;
            }
            SessionStatus::Queued => {
                if !self.queue.replace(session.clone()).await {
                    self.queue.push(session).await;
                }
            }
            _ => return Ok(false),
        }

        info!(session_id = %id, "Interrupted session returned to queue");
        self.wake.notify_one();
        Ok(true)
    }

    fn local_pool(&self) -> GantryResult<&ModelInstancePool> {
        self.pool
            .as_deref()
            .ok_or_else(|| GantryError::InstanceNotFound("local instances are disabled".to_string()))
    }

    /// Hand a local worker the next session from its instance's work list
    pub async fn next_instance_task(&self, instance_id: &str) -> GantryResult<Option<Session>> {
        let instance = self.local_pool()?.instance(instance_id).await?;

        while let Some(queued) = instance.next_session() {
            match self.assign(&queued.id).await {
                Ok(assigned) => {
                    debug!(
                        session_id = %assigned.id,
                        instance_id = %instance_id,
                        "Session handed to instance"
                    );
                    return Ok(Some(assigned));
                }
                Err(GantryError::SessionNotFound(_)) => {
                    debug!(session_id = %queued.id, "Skipping deleted session");
                    instance.complete_session(&queued.id);
                }
                Err(e @ GantryError::InvalidTransition { .. }) => {
                    warn!(session_id = %queued.id, error = %e, "Dropping session from instance");
                    instance.complete_session(&queued.id);
                }
                Err(e) => {
                    error!(session_id = %queued.id, error = %e, "Failed to record assignment");
                    instance.complete_session(&queued.id);
                    self.queue.push(queued).await;
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    /// Apply a runner's progress, stream chunk or final result to its session.
    /// Only an `assigned` session accepts runner output.
    pub async fn handle_runner_response(
        &self,
        resp: RunnerTaskResponse,
    ) -> GantryResult<Session> {
        let _guard = self.locks.lock(&resp.session_id).await;
        let mut session = self
            .store
            .get_session(&resp.session_id)
            .await?
            .ok_or_else(|| GantryError::SessionNotFound(resp.session_id.clone()))?;
        if !resp.owner.is_empty() && resp.owner != session.owner {
            return Err(GantryError::AccessDenied(format!(
                "response owner does not match session {}",
                session.id
            )));
        }
        if !resp.is_final() && session.status != SessionStatus::Assigned {
            return Err(GantryError::InvalidTransition {
                id: session.id.clone(),
                from: session.status,
                to: SessionStatus::Assigned,
            });
        }

        let failed = !resp.error.is_empty();
        {
            let interaction = if resp.interaction_id.is_empty() {
                session.system_interaction_mut()?
            } else {
                session
                    .interactions
                    .iter_mut()
                    .find(|i| i.id == resp.interaction_id)
                    .ok_or_else(|| {
                        GantryError::Validation(format!(
                            "unknown interaction {}",
                            resp.interaction_id
                        ))
                    })?
            };
            interaction.updated = chrono::Utc::now();

            match resp.response_type {
                RunnerTaskResponseType::Stream => {
                    interaction.message.push_str(&resp.message);
                    interaction.state = InteractionState::Editing;
                }
                RunnerTaskResponseType::Progress => {
                    interaction.progress = resp.progress.min(100);
                    interaction.status = resp.status.clone();
                    interaction.state = InteractionState::Editing;
                }
                RunnerTaskResponseType::Result => {
                    if !resp.message.is_empty() {
                        interaction.message = resp.message.clone();
                    }
                    if !resp.files.is_empty() {
                        interaction.files = resp.files.clone();
                    }
                    interaction.status = resp.status.clone();
                    interaction.finished = true;
                    if failed {
                        interaction.error = resp.error.clone();
                        interaction.state = InteractionState::Error;
                    } else {
                        interaction.progress = 100;
                        interaction.lora_dir = resp.lora_dir.clone();
                        interaction.state = InteractionState::Complete;
                    }
                }
            }
        }

        if resp.is_final() {
            let next = if failed {
                SessionStatus::Error
            } else {
                SessionStatus::Complete
            };
            session.transition(next)?;
            if !failed && session.mode == SessionMode::Finetune && !resp.lora_dir.is_empty() {
                session.lora_dir = resp.lora_dir.clone();
            }
        }

        let session = self.store.update_session(session).await?;

        if resp.is_final() {
            self.assignments.write().await.remove(&session.id);
            if let Some(pool) = &self.pool {
                pool.complete_session(&session.id).await;
            }
            info!(
                session_id = %session.id,
                status = %session.status,
                "Session finished"
            );
        }
        Ok(session)
    }

    /// Record a runner's liveness report
    pub async fn add_runner_metrics(&self, state: RunnerState) {
        debug!(
            runner_id = %state.id,
            free_memory = state.free_memory,
            instances = state.model_instances.len(),
            "Runner state received"
        );
        self.runners.write().await.insert(
            state.id.clone(),
            RunnerEntry {
                state,
                seen: Instant::now(),
            },
        );
        self.expire_runners().await;
    }

    /// Drop runners past the TTL; returns their IDs
    fn prune(runners: &mut HashMap<String, RunnerEntry>, ttl: Duration) -> Vec<String> {
        let mut expired = Vec::new();
        runners.retain(|id, entry| {
            let fresh = entry.seen.elapsed() <= ttl;
            if !fresh {
                debug!(runner_id = %id, "Runner report expired");
                expired.push(id.clone());
            }
            fresh
        });
        expired
    }

    /// Forget silent runners and requeue whatever they were working on
    async fn expire_runners(&self) {
        let expired = {
            let mut runners = self.runners.write().await;
            Self::prune(&mut runners, self.runner_ttl)
        };
        if expired.is_empty() {
            return;
        }

        let orphaned: Vec<String> = self
            .assignments
            .read()
            .await
            .iter()
            .filter(|(_, runner)| expired.contains(runner))
            .map(|(session, _)| session.clone())
            .collect();
        for id in orphaned {
            warn!(session_id = %id, "Runner went silent, requeueing its session");
            if let Err(e) = self.requeue_interrupted(&id).await {
                warn!(session_id = %id, error = %e, "Failed to requeue session");
            }
        }
    }

    /// Runners that reported within the TTL
    pub async fn runner_states(&self) -> Vec<RunnerState> {
        self.expire_runners().await;
        let runners = self.runners.read().await;
        let mut states: Vec<RunnerState> = runners.values().map(|e| e.state.clone()).collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }

    pub async fn instance_states(&self) -> Vec<ModelInstanceState> {
        match &self.pool {
            Some(pool) => pool.states().await,
            None => Vec::new(),
        }
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.len().await
    }

    pub async fn instance_count(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.len().await,
            None => 0,
        }
    }

    pub async fn runner_count(&self) -> usize {
        self.runner_states().await.len()
    }

    pub async fn dashboard(&self) -> DashboardData {
        let session_queue = self
            .queue
            .snapshot()
            .await
            .iter()
            .map(SessionSummary::from)
            .collect();
        DashboardData {
            session_queue,
            runners: self.runner_states().await,
            instances: self.instance_states().await,
        }
    }

    /// One reconciliation pass over the local pool
    pub async fn reconcile(&self) -> ReconcileReport {
        self.expire_runners().await;
        let Some(pool) = &self.pool else {
            return ReconcileReport::default();
        };
        let report = pool.reconcile(&self.queue).await;
        if !report.is_noop() {
            info!(
                attached = report.attached,
                started = report.started,
                failed = report.failed,
                stopped = report.stopped,
                removed = report.removed,
                evicted = report.evicted,
                requeued = report.requeued,
                interrupted = report.interrupted.len(),
                "Reconciled model instances"
            );
        }
        for err in &report.errors {
            warn!(error = %err, "Instance provisioning failed");
        }
        for session in &report.interrupted {
            if let Err(e) = self.requeue_interrupted(&session.id).await {
                warn!(session_id = %session.id, error = %e, "Failed to requeue session");
            }
        }
        report
    }

    /// Stop every local instance and requeue the work they held
    pub async fn shutdown(&self) {
        let Some(pool) = &self.pool else {
            return;
        };
        let pending = pool.shutdown().await;
        let mut requeued = 0;
        for session in &pending {
            match self.requeue_interrupted(&session.id).await {
                Ok(true) => requeued += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "Failed to requeue session");
                }
            }
        }
        if requeued > 0 {
            info!(count = requeued, "Returned instance sessions to the queue");
        }
    }

    /// Reconcile every `interval` and whenever the backlog changes, until `shutdown` flips
    pub fn spawn_reconcile_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?interval, "Reconcile loop started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.wake.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                self.reconcile().await;
            }

            info!("Reconcile loop stopped");
        })
    }
}
