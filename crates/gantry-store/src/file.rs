//! File-backed session store
//!
//! Each session is one JSON document under the base directory. Writes go to
//! a temporary file first and are renamed into place.

use async_trait::async_trait;
use gantry_core::{GantryError, GantryResult, Session};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::store::{sort_newest_first, GetSessionsQuery, Store};

/// Session store persisting JSON files in a directory
pub struct FileStore {
    /// Base path for session files
    base_path: PathBuf,
    /// Serializes writers so read-modify-write sequences stay consistent
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open a store, creating the directory if needed
    pub async fn open(base_path: PathBuf) -> GantryResult<Self> {
        if !base_path.exists() {
            tokio::fs::create_dir_all(&base_path).await?;
            info!(path = %base_path.display(), "Created session directory");
        }
        Ok(Self {
            base_path,
            write_lock: Mutex::new(()),
        })
    }

    /// Get the path for a session
    pub fn session_path(&self, id: &str) -> PathBuf {
        let safe_name: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.base_path.join(format!("{}.json", safe_name))
    }

    async fn read(path: &Path) -> GantryResult<Option<Session>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, session: &Session) -> GantryResult<()> {
        let path = self.session_path(&session.id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(session)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn create_session(&self, session: Session) -> GantryResult<Session> {
        let _guard = self.write_lock.lock().await;
        if self.session_path(&session.id).exists() {
            return Err(GantryError::Storage(format!(
                "session {} already exists",
                session.id
            )));
        }
        self.write(&session).await?;
        debug!(session_id = %session.id, "Stored session");
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> GantryResult<Option<Session>> {
        Self::read(&self.session_path(id)).await
    }

    async fn get_sessions(&self, query: GetSessionsQuery) -> GantryResult<Vec<Session>> {
        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |e| e != "json") {
                continue;
            }
            match Self::read(&path).await {
                Ok(Some(session)) if query.matches(&session) => sessions.push(session),
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable session file");
                }
            }
        }
        sort_newest_first(&mut sessions);
        Ok(sessions)
    }

    async fn update_session(&self, session: Session) -> GantryResult<Session> {
        let _guard = self.write_lock.lock().await;
        if !self.session_path(&session.id).exists() {
            return Err(GantryError::SessionNotFound(session.id));
        }
        self.write(&session).await?;
        Ok(session)
    }

    async fn delete_session(&self, id: &str) -> GantryResult<Option<Session>> {
        let _guard = self.write_lock.lock().await;
        let path = self.session_path(id);
        let existing = Self::read(&path).await?;
        if existing.is_some() {
            tokio::fs::remove_file(&path).await?;
            debug!(session_id = %id, "Deleted session");
        }
        Ok(existing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::{ModelName, OwnerType, SessionMode, SessionType};

    fn session(owner: &str) -> Session {
        Session::new(
            SessionMode::Inference,
            SessionType::Image,
            ModelName::Sdxl,
            owner.to_string(),
            OwnerType::User,
        )
    }

    #[test]
    fn test_session_path_is_safe() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore {
            base_path: dir.path().to_path_buf(),
            write_lock: Mutex::new(()),
        };
        let path = store.session_path("../etc/passwd");
        assert_eq!(path, dir.path().join("___etc_passwd.json"));
    }

    #[tokio::test]
    async fn test_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("sessions")).await.unwrap();

        let s = store.create_session(session("alice")).await.unwrap();
        store.create_session(session("bob")).await.unwrap();

        let reopened = FileStore::open(dir.path().join("sessions")).await.unwrap();
        let fetched = reopened.get_session(&s.id).await.unwrap().unwrap();
        assert_eq!(fetched.model_name, ModelName::Sdxl);

        let alice = reopened
            .get_sessions(GetSessionsQuery {
                owner: "alice".to_string(),
                owner_type: None,
            })
            .await
            .unwrap();
        assert_eq!(alice.len(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().to_path_buf()).await.unwrap();

        let s = session("alice");
        assert!(matches!(
            store.update_session(s.clone()).await,
            Err(GantryError::SessionNotFound(_))
        ));

        store.create_session(s.clone()).await.unwrap();
        assert!(store.delete_session(&s.id).await.unwrap().is_some());
        assert!(store.get_session(&s.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), b"hello").await.unwrap();
        tokio::fs::write(dir.path().join("broken.json"), b"{").await.unwrap();

        let store = FileStore::open(dir.path().to_path_buf()).await.unwrap();
        store.create_session(session("alice")).await.unwrap();

        let all = store.get_sessions(GetSessionsQuery::default()).await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
