//! Durable per-application profile store.
//!
//! One JSON document per `(namespace, application)` pair under
//! `profiles/<namespace>/<application>.json`. The profile is the write-through
//! mirror of the in-memory session registry and the only state a restarted
//! daemon needs to reconcile or recover sessions.

use super::{SessionKey, SessionRecord};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Per-workload slice of an application profile.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkloadProfile {
    pub name: String,
    pub workload_type: String,
    #[serde(default)]
    pub developing: bool,
    #[serde(default)]
    pub syncing: bool,
    #[serde(default)]
    pub port_forwards: Vec<SessionRecord>,
}

/// Durable record for one application in one namespace.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppProfile {
    pub namespace: String,
    pub application: String,
    #[serde(default)]
    pub workloads: Vec<WorkloadProfile>,
}

impl AppProfile {
    fn workload_mut(&mut self, name: &str, workload_type: &str) -> &mut WorkloadProfile {
        if let Some(idx) = self.workloads.iter().position(|w| w.name == name) {
            return &mut self.workloads[idx];
        }
        self.workloads.push(WorkloadProfile {
            name: name.to_string(),
            workload_type: workload_type.to_string(),
            ..Default::default()
        });
        self.workloads.last_mut().unwrap()
    }
}

/// Filesystem-backed profile store.
pub struct ProfileStore {
    root: PathBuf,
}

impl ProfileStore {
    /// Opens a store rooted at an explicit directory (used by tests).
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Opens the store under `~/.kubetun/profiles/`.
    pub fn open_default() -> Result<Self> {
        Ok(Self::open(crate::paths::profiles_dir()?))
    }

    fn profile_path(&self, namespace: &str, application: &str) -> PathBuf {
        self.root
            .join(namespace)
            .join(format!("{}.json", application))
    }

    /// Loads a profile, returning an empty one when none has been written yet.
    pub fn load(&self, namespace: &str, application: &str) -> Result<AppProfile> {
        let path = self.profile_path(namespace, application);
        if !path.exists() {
            return Ok(AppProfile {
                namespace: namespace.to_string(),
                application: application.to_string(),
                workloads: Vec::new(),
            });
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read profile: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse profile: {}", path.display()))
    }

    /// Persists a profile atomically (temp file + rename).
    pub fn save(&self, profile: &AppProfile) -> Result<()> {
        let path = self.profile_path(&profile.namespace, &profile.application);
        let dir = path.parent().context("Profile path has no parent")?;
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create profile directory: {}", dir.display()))?;
        let content =
            serde_json::to_string_pretty(profile).context("Failed to serialize profile")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .with_context(|| format!("Failed to write profile: {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to commit profile: {}", path.display()))?;
        Ok(())
    }

    /// Inserts or replaces one session record in its profile.
    pub fn upsert_session(&self, record: &SessionRecord) -> Result<()> {
        let mut profile = self.load(&record.key.namespace, &record.key.application)?;
        let workload = profile.workload_mut(&record.key.workload, &record.workload_type);
        match workload.port_forwards.iter_mut().find(|r| r.key == record.key) {
            Some(existing) => *existing = record.clone(),
            None => workload.port_forwards.push(record.clone()),
        }
        self.save(&profile)
    }

    /// Removes one session record; missing records are not an error.
    pub fn remove_session(&self, key: &SessionKey) -> Result<()> {
        let mut profile = self.load(&key.namespace, &key.application)?;
        for workload in &mut profile.workloads {
            workload.port_forwards.retain(|r| r.key != *key);
        }
        self.save(&profile)
    }

    /// All persisted sessions for one application.
    pub fn list_sessions(&self, namespace: &str, application: &str) -> Result<Vec<SessionRecord>> {
        let profile = self.load(namespace, application)?;
        Ok(profile
            .workloads
            .into_iter()
            .flat_map(|w| w.port_forwards)
            .collect())
    }

    /// Every persisted session across all namespaces and applications.
    ///
    /// Used by daemon startup recovery; unreadable profiles are skipped with
    /// a warning rather than aborting recovery.
    pub fn list_all_sessions(&self) -> Result<Vec<SessionRecord>> {
        let mut sessions = Vec::new();
        if !self.root.exists() {
            return Ok(sessions);
        }
        for ns_entry in fs::read_dir(&self.root).context("Failed to read profiles directory")? {
            let ns_dir = ns_entry?.path();
            if !ns_dir.is_dir() {
                continue;
            }
            for app_entry in fs::read_dir(&ns_dir)? {
                let path = app_entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match self.read_profile_file(&path) {
                    Ok(profile) => sessions
                        .extend(profile.workloads.into_iter().flat_map(|w| w.port_forwards)),
                    Err(e) => {
                        tracing::warn!("Skipping unreadable profile {}: {}", path.display(), e)
                    }
                }
            }
        }
        Ok(sessions)
    }

    fn read_profile_file(&self, path: &Path) -> Result<AppProfile> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
