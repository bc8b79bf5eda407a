use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

use crate::{connection::ConnectionHandle, error::RegistryError};

/// Identifier of a registered session. Allocated in increasing order, so
/// ordering by id is insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct ClientSession {
    id: SessionId,
    username: String,
    joined_at: DateTime<Local>,
    handle: ConnectionHandle,
}

impl ClientSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn joined_at(&self) -> DateTime<Local> {
        self.joined_at
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }
}

/// The set of active sessions.
///
/// Every mutation and every snapshot goes through one mutex, which the
/// router also holds while fanning out, so nobody observes a half-applied
/// add or remove.
pub struct Registry {
    state: Mutex<RegistryState>,
}

pub(crate) struct RegistryState {
    sessions: BTreeMap<SessionId, ClientSession>,
    next_id: u64,
    enforce_unique_usernames: bool,
}

impl RegistryState {
    pub(crate) fn sessions(&self) -> impl Iterator<Item = &ClientSession> {
        self.sessions.values()
    }

    /// Inserts a session. Fanout sees it as soon as the lock is released.
    pub(crate) fn admit(
        &mut self,
        username: String,
        handle: ConnectionHandle,
    ) -> Result<SessionId, RegistryError> {
        if self.enforce_unique_usernames && self.sessions.values().any(|s| s.username == username) {
            return Err(RegistryError::DuplicateUsername(username));
        }

        let id = SessionId(self.next_id);
        self.next_id += 1;
        self.sessions.insert(
            id,
            ClientSession {
                id,
                username,
                joined_at: Local::now(),
                handle,
            },
        );
        Ok(id)
    }

    pub(crate) fn remove(&mut self, id: SessionId) -> Option<ClientSession> {
        self.sessions.remove(&id)
    }
}

impl Registry {
    pub fn new(enforce_unique_usernames: bool) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                sessions: BTreeMap::new(),
                next_id: 1,
                enforce_unique_usernames,
            }),
        }
    }

    pub async fn add(
        &self,
        username: impl Into<String>,
        handle: ConnectionHandle,
    ) -> Result<SessionId, RegistryError> {
        self.state.lock().await.admit(username.into(), handle)
    }

    /// Removes a session. Unknown ids are ignored.
    pub async fn remove(&self, id: SessionId) -> Option<ClientSession> {
        self.state.lock().await.remove(id)
    }

    /// Active sessions in the order they joined.
    pub async fn snapshot(&self) -> Vec<ClientSession> {
        self.state.lock().await.sessions().cloned().collect()
    }

    pub async fn usernames(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .sessions()
            .map(|s| s.username.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.sessions.is_empty()
    }

    /// Removes and returns every session, e.g. at shutdown.
    pub async fn drain(&self) -> Vec<ClientSession> {
        let mut state = self.state.lock().await;
        std::mem::take(&mut state.sessions).into_values().collect()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{config::ConnectionConfig, connection::Connection};

    fn handle() -> ConnectionHandle {
        let (local, _remote) = tokio::io::duplex(256);
        Connection::new(local, "test", &ConnectionConfig::default()).handle()
    }

    #[tokio::test]
    async fn snapshot_keeps_join_order() {
        let registry = Registry::new(false);
        let a = registry.add("alice", handle()).await.unwrap();
        let b = registry.add("bob", handle()).await.unwrap();
        let c = registry.add("carol", handle()).await.unwrap();

        let ids: Vec<_> = registry.snapshot().await.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![a, b, c]);
        assert_eq!(registry.usernames().await, vec!["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn removed_session_is_not_in_snapshot() {
        let registry = Registry::new(false);
        let a = registry.add("alice", handle()).await.unwrap();
        let b = registry.add("bob", handle()).await.unwrap();

        let removed = registry.remove(a).await.expect("alice was registered");
        assert_eq!(removed.username(), "alice");

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), b);
    }

    #[tokio::test]
    async fn removing_unknown_id_is_a_no_op() {
        let registry = Registry::new(false);
        let a = registry.add("alice", handle()).await.unwrap();

        assert!(registry.remove(a).await.is_some());
        assert!(registry.remove(a).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_usernames_follow_policy() {
        let relaxed = Registry::new(false);
        relaxed.add("alice", handle()).await.unwrap();
        relaxed.add("alice", handle()).await.unwrap();
        assert_eq!(relaxed.len().await, 2);

        let strict = Registry::new(true);
        strict.add("alice", handle()).await.unwrap();
        assert_eq!(
            strict.add("alice", handle()).await,
            Err(RegistryError::DuplicateUsername("alice".into()))
        );
    }

    #[tokio::test]
    async fn concurrent_adds_get_unique_ids() {
        let registry = Arc::new(Registry::new(false));
        let mut tasks = Vec::new();
        for n in 0..32 {
            let registry = Arc::clone(&registry);
            let handle = handle();
            tasks.push(tokio::spawn(async move {
                registry.add(format!("user{n}"), handle).await.unwrap()
            }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 32);
        assert_eq!(registry.len().await, 32);
    }

    #[tokio::test]
    async fn drain_empties_the_registry() {
        let registry = Registry::new(false);
        registry.add("alice", handle()).await.unwrap();
        registry.add("bob", handle()).await.unwrap();

        let drained = registry.drain().await;
        assert_eq!(drained.len(), 2);
        assert!(registry.snapshot().await.is_empty());
    }
}
