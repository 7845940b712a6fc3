//! In-memory session store

use async_trait::async_trait;
use gantry_core::{GantryError, GantryResult, Session};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::store::{sort_newest_first, GetSessionsQuery, Store};

/// Session store backed by a map; contents are lost on restart
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_session(&self, session: Session) -> GantryResult<Session> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(GantryError::Storage(format!(
                "session {} already exists",
                session.id
            )));
        }
        sessions.insert(session.id.clone(), session.clone());
        debug!(session_id = %session.id, "Stored session");
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> GantryResult<Option<Session>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn get_sessions(&self, query: GetSessionsQuery) -> GantryResult<Vec<Session>> {
        let sessions = self.sessions.read().await;
        let mut matching: Vec<Session> = sessions
            .values()
            .filter(|s| query.matches(s))
            .cloned()
            .collect();
        sort_newest_first(&mut matching);
        Ok(matching)
    }

    async fn update_session(&self, session: Session) -> GantryResult<Session> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&session.id) {
            Some(existing) => {
                *existing = session.clone();
                Ok(session)
            }
            None => Err(GantryError::SessionNotFound(session.id)),
        }
    }

    async fn delete_session(&self, id: &str) -> GantryResult<Option<Session>> {
        let removed = self.sessions.write().await.remove(id);
        if removed.is_some() {
            debug!(session_id = %id, "Deleted session");
        }
        Ok(removed)
    }
}
