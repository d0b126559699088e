//! VPN mesh manager: routed connectivity to cluster workloads, layered above
//! the same supervised-tunnel machinery the port-forward engine uses, plus
//! OS-level tunnel-driver lifecycle and privilege elevation.

pub mod driver;
pub mod elevation;
pub mod manager;

#[cfg(test)]
#[path = "tests/manager_tests.rs"]
mod manager_tests;

pub use driver::platform_driver;
pub use manager::VpnManager;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle state of the mesh connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VpnStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for VpnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VpnStatus::Disconnected => "Disconnected",
            VpnStatus::Connecting => "Connecting",
            VpnStatus::Connected => "Connected",
            VpnStatus::Reconnecting => "Reconnecting",
            VpnStatus::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}

/// Caller-supplied options for `vpn connect`; retained so `vpn reconnect`
/// can re-establish without the caller resending them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnOptions {
    pub kubeconfig: PathBuf,
    pub namespace: String,
    #[serde(default)]
    pub workloads: Vec<String>,
}

/// Read-only state dump returned by `vpn status` and after each verb.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnStatusReport {
    pub status: VpnStatus,
    pub kubeconfig: Option<PathBuf>,
    pub namespace: Option<String>,
    #[serde(default)]
    pub workloads: Vec<String>,
    pub driver_installed: bool,
    #[serde(default)]
    pub reason: String,
}
