//! Session model shared by the daemon, the engines, and the CLI.
//!
//! A session is one managed port-forward tunnel between a local port and a
//! pod port. Sessions are uniquely keyed by
//! `(namespace, application, workload, local_port, remote_port)` and mirrored
//! write-through to the per-application profile store on every transition.

pub mod profile;
pub mod registry;

#[cfg(test)]
#[path = "tests/profile_tests.rs"]
mod profile_tests;

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod registry_tests;

pub use profile::ProfileStore;
pub use registry::SessionRegistry;

use serde::{Deserialize, Serialize};

/// Unique identity of a port-forward session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub namespace: String,
    pub application: String,
    pub workload: String,
    pub local_port: u16,
    pub remote_port: u16,
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{} {}:{}",
            self.namespace, self.application, self.workload, self.local_port, self.remote_port
        )
    }
}

/// Lifecycle state of a session.
///
/// `Connecting -> Connected -> (on failure) Reconnecting -> Connected | Failed`,
/// and `Connected | Reconnecting -> Stopped` on explicit end. `Failed` is
/// terminal until a new explicit start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SessionStatus {
    #[default]
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Stopped,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Connecting => "Connecting",
            SessionStatus::Connected => "Connected",
            SessionStatus::Reconnecting => "Reconnecting",
            SessionStatus::Failed => "Failed",
            SessionStatus::Stopped => "Stopped",
        };
        write!(f, "{}", s)
    }
}

/// Who owns the tunnel process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SessionRole {
    Manual,
    #[default]
    Daemon,
}

impl std::fmt::Display for SessionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionRole::Manual => write!(f, "manual"),
            SessionRole::Daemon => write!(f, "daemon"),
        }
    }
}

/// A session record in the registry and the profile store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub key: SessionKey,
    pub workload_type: String,
    pub container: Option<String>,
    pub pod_name: Option<String>,
    pub kubeconfig: Option<std::path::PathBuf>,
    pub status: SessionStatus,
    pub role: SessionRole,
    pub sudo: bool,
    pub owner_daemon_pid: u32,
    /// Timestamp of the last status transition (RFC3339).
    pub updated_at: String,
    /// Last failure text, shown in `port-forward list`.
    pub reason: String,
}

impl SessionRecord {
    pub fn new(key: SessionKey, workload_type: String, role: SessionRole, sudo: bool) -> Self {
        Self {
            key,
            workload_type,
            container: None,
            pod_name: None,
            kubeconfig: None,
            status: SessionStatus::Connecting,
            role,
            sudo,
            owner_daemon_pid: std::process::id(),
            updated_at: chrono::Utc::now().to_rfc3339(),
            reason: String::new(),
        }
    }

    /// Applies a status transition, refreshing the timestamp.
    pub fn set_status(&mut self, status: SessionStatus, reason: impl Into<String>) {
        self.status = status;
        self.reason = reason.into();
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_key(local_port: u16) -> SessionKey {
        SessionKey {
            namespace: "default".to_string(),
            application: "bookinfo".to_string(),
            workload: "ratings".to_string(),
            local_port,
            remote_port: 80,
        }
    }

    #[test]
    fn test_key_display() {
        let key = test_key(8080);
        assert_eq!(key.to_string(), "default/bookinfo/ratings 8080:80");
    }

    #[test]
    fn test_new_record_starts_connecting() {
        let record = SessionRecord::new(
            test_key(8080),
            "deployment".to_string(),
            SessionRole::Daemon,
            false,
        );
        assert_eq!(record.status, SessionStatus::Connecting);
        assert_eq!(record.owner_daemon_pid, std::process::id());
        assert!(record.reason.is_empty());
    }

    #[test]
    fn test_set_status_updates_timestamp() {
        let mut record = SessionRecord::new(
            test_key(8080),
            "deployment".to_string(),
            SessionRole::Daemon,
            false,
        );
        let before = record.updated_at.clone();
        record.set_status(SessionStatus::Failed, "port in use");
        assert_eq!(record.status, SessionStatus::Failed);
        assert_eq!(record.reason, "port in use");
        assert!(record.updated_at >= before);
    }

    #[test]
    fn test_record_serde_roundtrip() {
        let record = SessionRecord::new(
            test_key(8080),
            "statefulset".to_string(),
            SessionRole::Manual,
            true,
        );
        let json = serde_json::to_string(&record).unwrap();
        let parsed: SessionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.key, record.key);
        assert_eq!(parsed.role, SessionRole::Manual);
        assert!(parsed.sudo);
    }
}
