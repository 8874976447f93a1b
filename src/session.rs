//! Device sessions: continuation tokens and per-key serialization.
//!
//! A session key names one conversation with one runner. Two jobs with the
//! same key must not overlap: the second would resume from a token the first
//! is about to replace. `SessionStore::lock` hands out a lease that the job
//! holds across its resolve → run → write sequence.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::error::DatabaseError;
use crate::runner::Runner;
use crate::store::Database;

/// Thread used when the client does not name one.
pub const DEFAULT_THREAD_ID: &str = "default";

/// Identifies one conversation: a device, a room, a runner, and a thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub device_id: String,
    pub room_id: String,
    pub runner: Runner,
    pub thread_id: String,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.device_id, self.room_id, self.runner, self.thread_id
        )
    }
}

type LockMap = Mutex<HashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>>;

/// Registry of per-key async mutexes. Entries exist only while a lease is
/// held or awaited.
#[derive(Default)]
struct KeyLocks {
    locks: LockMap,
}

/// Exclusive hold on a session key. Released on drop.
pub struct SessionLease {
    guard: Option<OwnedMutexGuard<()>>,
    slot: Arc<tokio::sync::Mutex<()>>,
    key: SessionKey,
    registry: Arc<KeyLocks>,
}

impl SessionLease {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        // Release before inspecting the registry so a waiter can proceed.
        drop(self.guard.take());

        let mut locks = self
            .registry
            .locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one in `self.slot`: nobody else holds or awaits it.
        if Arc::strong_count(&self.slot) == 2 {
            locks.remove(&self.key);
        }
    }
}

/// Persistent continuation tokens plus the per-key lock registry.
#[derive(Clone)]
pub struct SessionStore {
    db: Arc<dyn Database>,
    registry: Arc<KeyLocks>,
}

impl SessionStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            registry: Arc::new(KeyLocks::default()),
        }
    }

    /// Stored token for `key`, if a previous job produced one.
    pub async fn get(&self, key: &SessionKey) -> Result<Option<String>, DatabaseError> {
        self.db.get_session_token(key).await
    }

    /// Store `token` for `key`, replacing any previous token.
    pub async fn upsert(&self, key: &SessionKey, token: &str) -> Result<(), DatabaseError> {
        self.db.upsert_session_token(key, token, Utc::now()).await?;
        debug!(session = %key, "Session token stored");
        Ok(())
    }

    /// Forget stored tokens. `thread_id: None` clears every thread of the room.
    pub async fn delete(
        &self,
        device_id: &str,
        room_id: &str,
        runner: Runner,
        thread_id: Option<&str>,
    ) -> Result<u64, DatabaseError> {
        self.db
            .delete_sessions(device_id, room_id, runner, thread_id)
            .await
    }

    /// Wait for exclusive use of `key`.
    pub async fn lock(&self, key: &SessionKey) -> SessionLease {
        let slot = {
            let mut locks = self
                .registry
                .locks
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            locks.entry(key.clone()).or_default().clone()
        };

        let guard = slot.clone().lock_owned().await;
        SessionLease {
            guard: Some(guard),
            slot,
            key: key.clone(),
            registry: self.registry.clone(),
        }
    }

    /// Number of keys currently held or awaited.
    pub fn active_keys(&self) -> usize {
        self.registry
            .locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::LibSqlBackend;

    async fn store() -> SessionStore {
        SessionStore::new(Arc::new(LibSqlBackend::new_memory().await.unwrap()))
    }

    fn key(thread: &str) -> SessionKey {
        SessionKey {
            device_id: "dev".into(),
            room_id: "room".into(),
            runner: Runner::Codex,
            thread_id: thread.into(),
        }
    }

    #[tokio::test]
    async fn get_upsert_delete() {
        let sessions = store().await;
        let k = key(DEFAULT_THREAD_ID);
        assert!(sessions.get(&k).await.unwrap().is_none());

        sessions.upsert(&k, "tok-1").await.unwrap();
        sessions.upsert(&k, "tok-2").await.unwrap();
        assert_eq!(sessions.get(&k).await.unwrap().as_deref(), Some("tok-2"));

        let deleted = sessions
            .delete("dev", "room", Runner::Codex, Some(DEFAULT_THREAD_ID))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(sessions.get(&k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn same_key_is_serialized() {
        let sessions = store().await;
        let first = sessions.lock(&key("t")).await;

        let waiter = {
            let sessions = sessions.clone();
            tokio::spawn(async move {
                let _lease = sessions.lock(&key("t")).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let sessions = store().await;
        let _a = sessions.lock(&key("a")).await;
        let b = tokio::time::timeout(Duration::from_millis(200), sessions.lock(&key("b"))).await;
        assert!(b.is_ok());
        assert_eq!(sessions.active_keys(), 2);
    }

    #[tokio::test]
    async fn registry_entry_removed_after_last_lease() {
        let sessions = store().await;
        let first = sessions.lock(&key("t")).await;
        let waiter = {
            let sessions = sessions.clone();
            tokio::spawn(async move { sessions.lock(&key("t")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(first);
        assert_eq!(sessions.active_keys(), 1);

        let second = waiter.await.unwrap();
        assert_eq!(second.key(), &key("t"));
        drop(second);
        assert_eq!(sessions.active_keys(), 0);
    }

    #[test]
    fn key_display() {
        assert_eq!(key("t1").to_string(), "dev/room/codex/t1");
    }
}
