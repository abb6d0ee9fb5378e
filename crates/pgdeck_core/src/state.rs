//! Console state shared by every request of one web-server process.
//!
//! [`ConsoleState`] maps session ids to the server managers of that session. Each
//! session sits behind its own async mutex, so concurrent requests of one session are
//! serialized while different sessions proceed independently.

use crate::error::{PgDeckError, PgDeckResult};
use crate::models::{ReleaseRequest, ServerId, ServerIdentity, SessionSnapshot, SESSION_STORE_KEY};
use crate::process::JobLauncher;
use crate::services::{ServerManager, Services, SessionStore};

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Identifier of an HTTP session.
pub type SessionId = String;

/// Server managers of one session.
pub struct SessionManagers {
    session_id: SessionId,
    services: Services,
    managers: HashMap<ServerId, ServerManager>,
}

impl std::fmt::Debug for SessionManagers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManagers")
            .field("session_id", &self.session_id)
            .field("servers", &self.managers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SessionManagers {
    fn new(session_id: SessionId, services: Services) -> Self {
        Self { session_id, services, managers: HashMap::new() }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Manager for a server, restoring it from `store` on first use in this process.
    ///
    /// A failed restore still leaves the manager registered with whatever was restored
    /// before the failure; the error is returned so the caller can ask the user to
    /// reconnect.
    pub async fn manager(
        &mut self,
        identity: ServerIdentity,
        store: &dyn SessionStore,
    ) -> PgDeckResult<&mut ServerManager> {
        let sid = identity.id;

        if !self.managers.contains_key(&sid) {
            let saved = match store.get(SESSION_STORE_KEY) {
                Some(value) => SessionSnapshot::from_value(value)?.managers.remove(&sid),
                None => None,
            };

            self.managers.insert(sid, ServerManager::new(identity, self.services.clone()));
            if let Some(saved) = saved {
                tracing::debug!(
                    session_id = %self.session_id,
                    server_id = sid,
                    "Restoring server manager from session"
                );
                if let Some(manager) = self.managers.get_mut(&sid) {
                    manager.restore(&saved).await?;
                }
            }
        }

        self.managers
            .get_mut(&sid)
            .ok_or_else(|| PgDeckError::internal(format!("Server manager {sid} vanished")))
    }

    /// An already loaded manager.
    pub fn get(&self, sid: ServerId) -> Option<&ServerManager> {
        self.managers.get(&sid)
    }

    /// Apply an edited server definition to a loaded manager.
    pub async fn update_server(&mut self, identity: ServerIdentity) -> bool {
        match self.managers.get_mut(&identity.id) {
            Some(manager) => {
                manager.update(identity).await;
                true
            }
            None => false,
        }
    }

    /// Server ids with a loaded manager.
    pub fn server_ids(&self) -> Vec<ServerId> {
        let mut ids: Vec<_> = self.managers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Write the snapshots of the loaded managers into `store`.
    ///
    /// Managers of servers not loaded in this process keep their stored snapshot. A
    /// manager without a snapshot (nothing connected) is dropped from the store.
    pub fn persist(&self, store: &dyn SessionStore) -> PgDeckResult<()> {
        let mut snapshot = match store.get(SESSION_STORE_KEY) {
            Some(value) => SessionSnapshot::from_value(value)?,
            None => SessionSnapshot::new(),
        };

        for (sid, manager) in &self.managers {
            match manager.snapshot() {
                Some(saved) => {
                    snapshot.managers.insert(*sid, saved);
                }
                None => {
                    snapshot.managers.remove(sid);
                }
            }
        }

        if snapshot.managers.is_empty() {
            store.remove(SESSION_STORE_KEY);
        } else {
            store.set(SESSION_STORE_KEY, snapshot.to_value()?);
        }
        tracing::trace!(
            session_id = %self.session_id,
            servers = snapshot.managers.len(),
            "Session persisted"
        );
        Ok(())
    }

    /// Release and forget one server's manager, here and in `store`.
    pub async fn remove(&mut self, sid: ServerId, store: &dyn SessionStore) -> PgDeckResult<()> {
        if let Some(mut manager) = self.managers.remove(&sid) {
            manager.release(ReleaseRequest::all()).await?;
        }
        if let Some(value) = store.get(SESSION_STORE_KEY) {
            let mut snapshot = SessionSnapshot::from_value(value)?;
            if snapshot.managers.remove(&sid).is_some() {
                if snapshot.managers.is_empty() {
                    store.remove(SESSION_STORE_KEY);
                } else {
                    store.set(SESSION_STORE_KEY, snapshot.to_value()?);
                }
            }
        }
        Ok(())
    }

    /// Release every connection of every loaded manager.
    pub async fn release_all(&mut self) {
        for (sid, manager) in self.managers.iter_mut() {
            if let Err(e) = manager.release(ReleaseRequest::all()).await {
                tracing::warn!(server_id = *sid, error = %e, "Release failed");
            }
        }
    }
}

/// Process-wide console state.
///
/// Holds the shared services, every live session and the background job launcher.
/// Thread-safe via `parking_lot::RwLock` for the session map and a per-session
/// `tokio::sync::Mutex`.
pub struct ConsoleState {
    services: Services,
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<SessionManagers>>>>,
    jobs: JobLauncher,
}

impl ConsoleState {
    /// Create console state around the given services.
    pub fn new(services: Services) -> Self {
        let jobs = JobLauncher::new(
            services.config.executor_path.clone(),
            services.config.jobs_dir.clone(),
        );
        tracing::info!(
            data_dir = %services.config.data_dir.display(),
            "Console state initialized"
        );
        Self { services, sessions: RwLock::new(HashMap::new()), jobs }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Background job launcher.
    pub fn jobs(&self) -> &JobLauncher {
        &self.jobs
    }

    /// Lock a session, creating it on first use.
    ///
    /// The guard is the critical section of a request: restore, use and persist all
    /// happen while it is held.
    pub async fn session(&self, id: &str) -> OwnedMutexGuard<SessionManagers> {
        let existing = self.sessions.read().get(id).cloned();
        let session = match existing {
            Some(session) => session,
            None => self
                .sessions
                .write()
                .entry(id.to_string())
                .or_insert_with(|| {
                    tracing::debug!(session_id = %id, "Session created");
                    Arc::new(Mutex::new(SessionManagers::new(
                        id.to_string(),
                        self.services.clone(),
                    )))
                })
                .clone(),
        };
        session.lock_owned().await
    }

    /// Ids of every live session.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Drop a session and release its connections.
    pub async fn end_session(&self, id: &str) -> bool {
        let session = self.sessions.write().remove(id);
        match session {
            Some(session) => {
                session.lock().await.release_all().await;
                tracing::debug!(session_id = %id, "Session ended");
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectionKey, ConnectionRequest, ConnectionState};
    use crate::services::test_support::Harness;
    use crate::services::MemorySessionStore;

    fn identity(id: ServerId) -> ServerIdentity {
        ServerIdentity::new(id, "db.internal", "postgres", "alice")
    }

    #[tokio::test]
    async fn test_session_survives_process_restart() {
        let harness = Harness::new();
        let store = MemorySessionStore::new();

        {
            let state = ConsoleState::new(harness.services.clone());
            let mut session = state.session("s1").await;
            let manager = session.manager(identity(1), &store).await.unwrap();
            let request = ConnectionRequest::database("sales").with_conn_id(5);
            let connection = manager.connection(request).await.unwrap();
            connection.connect(None).await.unwrap();
            session.persist(&store).unwrap();
        }

        // A fresh process sees the stored snapshot and reconnects.
        let state = ConsoleState::new(harness.services.clone());
        let mut session = state.session("s1").await;
        let manager = session.manager(identity(1), &store).await.unwrap();
        let connection = manager.get(&ConnectionKey::Conn(5)).unwrap();
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(connection.database(), "sales");
        assert_eq!(harness.events.count("driver:connect sales@"), 2);
    }

    #[tokio::test]
    async fn test_persist_keeps_managers_of_other_servers() {
        let harness = Harness::new();
        let store = MemorySessionStore::new();
        let state = ConsoleState::new(harness.services.clone());

        {
            let mut session = state.session("s1").await;
            for sid in [1, 2] {
                let manager = session.manager(identity(sid), &store).await.unwrap();
                let connection =
                    manager.connection(ConnectionRequest::database("postgres")).await.unwrap();
                connection.connect(None).await.unwrap();
            }
            session.persist(&store).unwrap();
        }
        state.end_session("s1").await;

        let mut session = state.session("s1").await;
        let manager = session.manager(identity(1), &store).await.unwrap();
        manager.release(ReleaseRequest::all()).await.unwrap();
        session.persist(&store).unwrap();

        let saved = SessionSnapshot::from_value(store.get(SESSION_STORE_KEY).unwrap()).unwrap();
        assert_eq!(saved.managers.keys().copied().collect::<Vec<_>>(), vec![2]);

        session.remove(2, &store).await.unwrap();
        assert!(store.get(SESSION_STORE_KEY).is_none());
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let harness = Harness::new();
        let state = ConsoleState::new(harness.services.clone());
        let store = MemorySessionStore::new();

        let mut first = state.session("a").await;
        first.manager(identity(1), &store).await.unwrap();
        drop(first);

        let second = state.session("b").await;
        assert!(second.get(1).is_none());
        drop(second);

        let mut ids = state.session_ids();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert!(state.end_session("a").await);
        assert!(!state.end_session("a").await);
    }

    #[tokio::test]
    async fn test_update_server_resets_manager() {
        let harness = Harness::new();
        let state = ConsoleState::new(harness.services.clone());
        let store = MemorySessionStore::new();
        let mut session = state.session("s").await;

        assert!(!session.update_server(identity(1)).await);
        let manager = session.manager(identity(1), &store).await.unwrap();
        manager.connection(ConnectionRequest::database("postgres")).await.unwrap();
        assert!(session.update_server(identity(1)).await);
        assert!(session.get(1).unwrap().is_empty());
        assert_eq!(session.server_ids(), vec![1]);
    }
}
