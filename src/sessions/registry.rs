//! In-memory session registry with write-through persistence.
//!
//! The registry is the single source of truth for sessions owned by this
//! daemon. Every mutation is written through to the profile store before it
//! is acknowledged, so a daemon crash loses at most the in-flight operation.

use super::{ProfileStore, SessionKey, SessionRecord, SessionStatus};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Mutex;

pub struct SessionRegistry {
    // One lock covers both the map and the store so that load-modify-save
    // cycles on a profile file never interleave.
    inner: Mutex<Inner>,
}

struct Inner {
    sessions: HashMap<SessionKey, SessionRecord>,
    store: ProfileStore,
}

impl SessionRegistry {
    pub fn new(store: ProfileStore) -> Self {
        Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                store,
            }),
        }
    }

    /// Inserts or replaces a session, persisting before the in-memory update.
    pub fn upsert(&self, record: SessionRecord) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .store
            .upsert_session(&record)
            .context("Failed to persist session")?;
        inner.sessions.insert(record.key.clone(), record);
        Ok(())
    }

    /// Removes a session from memory and from the durable mirror.
    pub fn remove(&self, key: &SessionKey) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .store
            .remove_session(key)
            .context("Failed to remove persisted session")?;
        inner.sessions.remove(key);
        Ok(())
    }

    pub fn get(&self, key: &SessionKey) -> Option<SessionRecord> {
        self.inner.lock().unwrap().sessions.get(key).cloned()
    }

    /// Applies a status transition to a known session.
    ///
    /// Unknown keys are ignored: the engine may race an explicit removal and
    /// losing that race must not resurrect the record.
    pub fn update_status(
        &self,
        key: &SessionKey,
        status: SessionStatus,
        reason: impl Into<String>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(mut record) = inner.sessions.get(key).cloned() else {
            return Ok(());
        };
        record.set_status(status, reason);
        inner
            .store
            .upsert_session(&record)
            .context("Failed to persist session transition")?;
        inner.sessions.insert(key.clone(), record);
        Ok(())
    }

    /// In-memory sessions for one application.
    #[allow(dead_code)]
    pub fn list(&self, namespace: &str, application: &str) -> Vec<SessionRecord> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .values()
            .filter(|r| r.key.namespace == namespace && r.key.application == application)
            .cloned()
            .collect()
    }

    /// Persisted sessions for one application, reconciled against liveness:
    /// records whose owning daemon is gone are reported as stale, and records
    /// this daemon currently owns are overlaid with their fresher in-memory
    /// state.
    pub fn list_reconciled(&self, namespace: &str, application: &str) -> Result<Vec<SessionRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut records = inner.store.list_sessions(namespace, application)?;
        for record in &mut records {
            if let Some(live) = inner.sessions.get(&record.key) {
                *record = live.clone();
            } else if !crate::daemon::lock::is_process_alive(record.owner_daemon_pid)
                && record.status != SessionStatus::Stopped
            {
                record.set_status(SessionStatus::Stopped, "stale (owner daemon exited)");
            }
        }
        Ok(records)
    }

    /// Persisted sessions across every application (daemon startup recovery).
    pub fn persisted_sessions(&self) -> Result<Vec<SessionRecord>> {
        self.inner.lock().unwrap().store.list_all_sessions()
    }
}
