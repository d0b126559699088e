//! Typed configuration with documented defaults.
//!
//! Loaded once at startup from `~/.kubetun/config.yaml` (all fields optional)
//! and validated at the boundary; the engines never re-validate.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fixed delay between reconnect attempts (seconds).
///
/// Deliberately fixed rather than exponential: clusters are reachable or not
/// and rarely flap, so the engine trades backoff sophistication for faster
/// recovery.
fn default_reconnect_backoff_secs() -> u64 {
    30
}

/// Interval between TCP heartbeats over an open tunnel (seconds).
fn default_heartbeat_interval_secs() -> u64 {
    30
}

/// How long a client waits for a freshly spawned daemon to come up (ms).
fn default_daemon_init_timeout_ms() -> u64 {
    5000
}

/// Maximum connection attempts against the daemon endpoint.
fn default_connect_attempts() -> u32 {
    5
}

/// How long `port-forward start` waits for the tunnel to become ready (seconds).
fn default_ready_wait_secs() -> u64 {
    60
}

/// Bounded retry count for tunnel-driver install/uninstall.
fn default_driver_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_daemon_init_timeout_ms")]
    pub daemon_init_timeout_ms: u64,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_ready_wait_secs")]
    pub ready_wait_secs: u64,
    #[serde(default = "default_driver_retries")]
    pub driver_retries: u32,
    /// Explicit kubectl binary path; discovered via PATH when unset.
    #[serde(default)]
    pub kubectl_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reconnect_backoff_secs: default_reconnect_backoff_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            daemon_init_timeout_ms: default_daemon_init_timeout_ms(),
            connect_attempts: default_connect_attempts(),
            ready_wait_secs: default_ready_wait_secs(),
            driver_retries: default_driver_retries(),
            kubectl_path: None,
        }
    }
}

impl Config {
    /// Loads configuration from `~/.kubetun/config.yaml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self> {
        let path = crate::paths::config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engines cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_secs == 0 {
            bail!("heartbeat_interval_secs must be greater than zero");
        }
        if self.connect_attempts == 0 {
            bail!("connect_attempts must be greater than zero");
        }
        if self.driver_retries == 0 {
            bail!("driver_retries must be greater than zero");
        }
        Ok(())
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn daemon_init_timeout(&self) -> Duration {
        Duration::from_millis(self.daemon_init_timeout_ms)
    }

    pub fn ready_wait(&self) -> Duration {
        Duration::from_secs(self.ready_wait_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.reconnect_backoff_secs, 30);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.connect_attempts, 5);
        assert!(config.kubectl_path.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let config: Config = serde_yaml::from_str("reconnect_backoff_secs: 5\n").unwrap();
        assert_eq!(config.reconnect_backoff_secs, 5);
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_validate_rejects_zero_heartbeat() {
        let config: Config = serde_yaml::from_str("heartbeat_interval_secs: 0\n").unwrap();
        assert!(config.validate().is_err());
    }
}
