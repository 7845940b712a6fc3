//! Pending session queue
//!
//! Every mutation goes through one mutex, so a take is linearizable with
//! respect to every other take and insert: a session is handed out at most
//! once and stays visible until it is.

use chrono::Utc;
use gantry_core::{Session, SessionFilter};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::matcher::{AffinityMatchStrategy, MatchStrategy};

/// Outcome of a take
#[derive(Debug, Clone)]
pub enum QueueTake {
    Found(Session),
    /// Nothing eligible right now; poll again later
    Empty,
}

impl QueueTake {
    pub fn into_option(self) -> Option<Session> {
        match self {
            QueueTake::Found(session) => Some(session),
            QueueTake::Empty => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, QueueTake::Empty)
    }
}

/// Ordered collection of sessions waiting for a runner
pub struct SessionQueue {
    sessions: Mutex<VecDeque<Session>>,
    strategy: Arc<dyn MatchStrategy>,
}

impl Default for SessionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionQueue {
    pub fn new() -> Self {
        Self::with_strategy(Arc::new(AffinityMatchStrategy))
    }

    pub fn with_strategy(strategy: Arc<dyn MatchStrategy>) -> Self {
        Self {
            sessions: Mutex::new(VecDeque::new()),
            strategy,
        }
    }

    /// Insert a session at its arrival position.
    ///
    /// A requeued session goes back ahead of anything created after it.
    pub async fn push(&self, session: Session) {
        let mut sessions = self.sessions.lock().await;
        let pos = sessions
            .iter()
            .position(|s| s.created > session.created)
            .unwrap_or(sessions.len());
        debug!(session_id = %session.id, position = pos, "Session queued");
        sessions.insert(pos, session);
    }

    /// Atomically remove and return the session the strategy picks for `filter`
    pub async fn take_matching(&self, filter: &SessionFilter) -> QueueTake {
        let mut sessions = self.sessions.lock().await;
        let Some(idx) = self.strategy.select(&sessions, filter, Utc::now()) else {
            trace!(queued = sessions.len(), "No session matches filter");
            return QueueTake::Empty;
        };
        match sessions.remove(idx) {
            Some(session) => QueueTake::Found(session),
            None => QueueTake::Empty,
        }
    }

    /// Atomically remove a specific session if it is still queued
    pub async fn take_by_id(&self, id: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock().await;
        let idx = sessions.iter().position(|s| s.id == id)?;
        sessions.remove(idx)
    }

    /// Drop a session from the queue, e.g. when it is deleted
    pub async fn remove(&self, id: &str) -> Option<Session> {
        let removed = self.take_by_id(id).await;
        if removed.is_some() {
            debug!(session_id = %id, "Session removed from queue");
        }
        removed
    }

    /// Swap in a newer copy of a queued session, keeping its position.
    /// Returns false if the session is no longer queued.
    pub async fn replace(&self, session: Session) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.iter_mut().find(|s| s.id == session.id) {
            Some(slot) => {
                *slot = session;
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Copy of the queue in order
    pub async fn snapshot(&self) -> Vec<Session> {
        self.sessions.lock().await.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use gantry_core::{ModelName, OwnerType, SessionFilterModel, SessionMode};
    use std::collections::HashSet;

    fn session(model: ModelName) -> Session {
        Session::new(
            SessionMode::Inference,
            model.descriptor().session_type,
            model,
            "alice".to_string(),
            OwnerType::User,
        )
    }

    #[tokio::test]
    async fn test_poll_by_model_then_empty() {
        let queue = SessionQueue::new();
        let a = session(ModelName::Sdxl);
        let mut b = session(ModelName::Mistral7bInstruct01);
        b.created = a.created + ChronoDuration::seconds(5);
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        queue.push(a).await;
        queue.push(b).await;

        let got = queue
            .take_matching(&SessionFilter::any().with_model(ModelName::Sdxl))
            .await;
        assert_eq!(got.into_option().unwrap().id, a_id);

        let got = queue
            .take_matching(&SessionFilter::any().with_model(ModelName::Mistral7bInstruct01))
            .await;
        assert_eq!(got.into_option().unwrap().id, b_id);

        assert!(queue.take_matching(&SessionFilter::any()).await.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_session_stays_queued() {
        let queue = SessionQueue::new();
        let c = session(ModelName::Sdxl);
        let c_id = c.id.clone();
        queue.push(c).await;

        let rejecting = SessionFilter::any()
            .with_model(ModelName::Sdxl)
            .with_reject(SessionFilterModel {
                model_name: ModelName::Sdxl,
                mode: SessionMode::Inference,
                finetune_file: String::new(),
            });
        assert!(queue.take_matching(&rejecting).await.is_empty());
        assert_eq!(queue.len().await, 1);

        let got = queue
            .take_matching(&SessionFilter::any().with_model(ModelName::Sdxl))
            .await;
        assert_eq!(got.into_option().unwrap().id, c_id);
    }

    #[tokio::test]
    async fn test_memory_gate() {
        let queue = SessionQueue::new();
        let d = session(ModelName::Sdxl);
        let d_id = d.id.clone();
        queue.push(d).await;

        let small = SessionFilter::any()
            .with_model(ModelName::Sdxl)
            .with_memory(4_000_000_000);
        assert!(queue.take_matching(&small).await.is_empty());

        let large = SessionFilter::any()
            .with_model(ModelName::Sdxl)
            .with_memory(16_000_000_000);
        assert_eq!(queue.take_matching(&large).await.into_option().unwrap().id, d_id);
    }

    #[tokio::test]
    async fn test_push_keeps_arrival_order() {
        let queue = SessionQueue::new();
        let first = session(ModelName::Sdxl);
        let mut second = session(ModelName::Sdxl);
        second.created = first.created + ChronoDuration::seconds(1);
        let first_id = first.id.clone();

        queue.push(second).await;
        // requeued older session goes back to the front
        queue.push(first).await;

        let snapshot = queue.snapshot().await;
        assert_eq!(snapshot[0].id, first_id);
    }

    #[tokio::test]
    async fn test_take_by_id_replace_and_remove() {
        let queue = SessionQueue::new();
        let s = session(ModelName::Sdxl);
        let id = s.id.clone();
        queue.push(s.clone()).await;

        let mut renamed = s;
        renamed.name = "renamed".to_string();
        assert!(queue.replace(renamed).await);
        assert_eq!(queue.snapshot().await[0].name, "renamed");

        assert!(queue.take_by_id(&id).await.is_some());
        assert!(queue.take_by_id(&id).await.is_none());
        assert!(queue.remove(&id).await.is_none());
        assert!(!queue.replace(session(ModelName::Sdxl)).await);
        assert!(queue.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_takes_never_double_dispatch() {
        let queue = Arc::new(SessionQueue::new());
        let mut ids = HashSet::new();
        for i in 0..200 {
            let model = if i % 2 == 0 {
                ModelName::Sdxl
            } else {
                ModelName::Mistral7bInstruct01
            };
            let s = session(model);
            ids.insert(s.id.clone());
            queue.push(s).await;
        }

        let mut handles = Vec::new();
        for poller in 0..16 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let filter = match poller % 3 {
                    0 => SessionFilter::any(),
                    1 => SessionFilter::any().with_model(ModelName::Sdxl),
                    _ => SessionFilter::any().with_model(ModelName::Mistral7bInstruct01),
                };
                let mut taken = Vec::new();
                while let QueueTake::Found(s) = queue.take_matching(&filter).await {
                    taken.push(s.id);
                    tokio::task::yield_now().await;
                }
                taken
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "session dispatched twice");
            }
        }
        assert_eq!(seen, ids);
        assert!(queue.is_empty().await);
    }
}
