//! Persistence contract for sessions

use async_trait::async_trait;
use gantry_core::{GantryResult, OwnerType, Session};

/// Selects the sessions belonging to one owner
#[derive(Debug, Clone, Default)]
pub struct GetSessionsQuery {
    pub owner: String,
    pub owner_type: Option<OwnerType>,
}

impl GetSessionsQuery {
    pub fn matches(&self, session: &Session) -> bool {
        (self.owner.is_empty() || session.owner == self.owner)
            && self.owner_type.map_or(true, |t| session.owner_type == t)
    }
}

/// Authoritative session storage
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_session(&self, session: Session) -> GantryResult<Session>;

    async fn get_session(&self, id: &str) -> GantryResult<Option<Session>>;

    /// Sessions matching the query, newest first
    async fn get_sessions(&self, query: GetSessionsQuery) -> GantryResult<Vec<Session>>;

    /// Replace a stored session; fails if it does not exist
    async fn update_session(&self, session: Session) -> GantryResult<Session>;

    /// Remove a session, returning it if it existed
    async fn delete_session(&self, id: &str) -> GantryResult<Option<Session>>;
}

pub(crate) fn sort_newest_first(sessions: &mut [Session]) {
    sessions.sort_by(|a, b| b.created.cmp(&a.created));
}
