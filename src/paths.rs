//! Centralized home-based storage paths for all kubetun persistence.
//!
//! This module provides helpers for unified storage under `~/.kubetun/`:
//! - `daemon-<mode>.lock` / `daemon-<mode>.pid` - singleton lock and pid per privilege mode
//! - `daemon-<mode>.sock` - daemon endpoint (Unix) / `daemon-<mode>.port` (Windows)
//! - `profiles/<namespace>/<application>.json` - durable session mirrors
//! - `logs/port-forward/` - per-tunnel output logs
//! - `config.yaml` - optional user configuration
//!
//! The root can be overridden with the `KUBETUN_HOME` environment variable,
//! which tests use to isolate their storage.

use crate::daemon::PrivilegeMode;
use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

/// The name of the kubetun directory under the user's home.
const KUBETUN_DIR: &str = ".kubetun";

/// Returns the kubetun home directory, creating it if needed.
pub fn kubetun_home_dir() -> Result<PathBuf> {
    let root = match std::env::var_os("KUBETUN_HOME") {
        Some(dir) => PathBuf::from(dir),
        None => dirs::home_dir()
            .context("Could not determine home directory")?
            .join(KUBETUN_DIR),
    };
    fs::create_dir_all(&root)
        .with_context(|| format!("Failed to create kubetun directory: {}", root.display()))?;
    Ok(root)
}

/// Lock file guarding the daemon singleton for a privilege mode.
pub fn daemon_lock_path(mode: PrivilegeMode) -> Result<PathBuf> {
    Ok(kubetun_home_dir()?.join(format!("daemon-{}.lock", mode.suffix())))
}

/// Lock file serializing concurrent client-side daemon spawns.
pub fn daemon_spawn_lock_path(mode: PrivilegeMode) -> Result<PathBuf> {
    Ok(kubetun_home_dir()?.join(format!("daemon-{}.spawn.lock", mode.suffix())))
}

/// Pid file written by a running daemon for `daemon info`.
pub fn daemon_pid_path(mode: PrivilegeMode) -> Result<PathBuf> {
    Ok(kubetun_home_dir()?.join(format!("daemon-{}.pid", mode.suffix())))
}

/// Unix socket endpoint for a privilege mode.
#[cfg(unix)]
pub fn daemon_socket_path(mode: PrivilegeMode) -> Result<PathBuf> {
    Ok(kubetun_home_dir()?.join(format!("daemon-{}.sock", mode.suffix())))
}

/// Windows port file holding the TCP port and auth token for a privilege mode.
#[cfg(windows)]
pub fn daemon_port_path(mode: PrivilegeMode) -> Result<PathBuf> {
    Ok(kubetun_home_dir()?.join(format!("daemon-{}.port", mode.suffix())))
}

/// Registered kubeconfig list maintained through KubeconfigAdd/Remove.
pub fn kubeconfigs_path() -> Result<PathBuf> {
    Ok(kubetun_home_dir()?.join("kubeconfigs.json"))
}

/// Root directory for per-application profiles.
pub fn profiles_dir() -> Result<PathBuf> {
    let dir = kubetun_home_dir()?.join("profiles");
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create profiles directory: {}", dir.display()))?;
    Ok(dir)
}

/// Directory for per-tunnel port-forward logs.
pub fn port_forward_logs_dir() -> Result<PathBuf> {
    let dir = kubetun_home_dir()?.join("logs").join("port-forward");
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create logs directory: {}", dir.display()))?;
    Ok(dir)
}

/// Log file for a single port-forward tunnel.
pub fn port_forward_log_path(
    namespace: &str,
    application: &str,
    workload: &str,
    local_port: u16,
    remote_port: u16,
) -> Result<PathBuf> {
    Ok(port_forward_logs_dir()?.join(format!(
        "{}_{}_{}_{}_{}.log",
        namespace, application, workload, local_port, remote_port
    )))
}

/// Optional user configuration file.
pub fn config_path() -> Result<PathBuf> {
    Ok(kubetun_home_dir()?.join("config.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_home_dir_env_override() {
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("KUBETUN_HOME", tmp.path());
        let home = kubetun_home_dir().unwrap();
        assert_eq!(home, tmp.path());
        std::env::remove_var("KUBETUN_HOME");
    }

    #[test]
    #[serial]
    fn test_mode_scoped_paths_are_distinct() {
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("KUBETUN_HOME", tmp.path());
        let user = daemon_lock_path(PrivilegeMode::User).unwrap();
        let sudo = daemon_lock_path(PrivilegeMode::Sudo).unwrap();
        assert_ne!(user, sudo);
        assert!(user.ends_with("daemon-user.lock"));
        assert!(sudo.ends_with("daemon-sudo.lock"));
        std::env::remove_var("KUBETUN_HOME");
    }
}
