//! Wire protocol between CLI clients and the daemon.
//!
//! One request/response exchange per connection. Frames are single lines of
//! JSON terminated by `\n`; the tagged enums below are the whole protocol
//! surface. Handler failures travel inside the `Error` response, never as a
//! broken connection.

use crate::sessions::SessionRecord;
use crate::vpn::{VpnOptions, VpnStatusReport};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Everything a client can ask the daemon to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DaemonRequest {
    GetServerInfo,
    GetServerStatus,
    StopServer,
    RestartServer,
    KubeconfigAdd {
        path: PathBuf,
    },
    KubeconfigRemove {
        path: PathBuf,
    },
    FlushDirMappingCache,
    GetResourceInfo {
        kubeconfig: Option<PathBuf>,
        namespace: String,
        workload_type: String,
        workload: String,
    },
    PortForwardStart(PortForwardRequest),
    PortForwardEnd {
        namespace: String,
        application: String,
        workload: String,
        local_port: u16,
    },
    PortForwardList {
        namespace: String,
        application: String,
    },
    VpnOperate {
        verb: VpnVerb,
        options: VpnOptions,
    },
    VpnStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VpnVerb {
    Connect,
    Disconnect,
    Reconnect,
}

/// Body of `PortForwardStart`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortForwardRequest {
    pub namespace: String,
    pub application: String,
    pub workload: String,
    #[serde(default = "default_workload_type")]
    pub workload_type: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub container: Option<String>,
    /// Pin a specific pod instead of resolving one from the workload.
    pub pod_name: Option<String>,
    pub kubeconfig: Option<PathBuf>,
}

fn default_workload_type() -> String {
    "deployment".to_string()
}

/// Every reply the daemon can send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DaemonResponse {
    Ok,
    Error { message: String },
    ServerInfo(DaemonInfo),
    ServerStatus(DaemonStatusReport),
    Sessions(Vec<SessionRecord>),
    ResourceInfo { pod_name: String },
    Vpn(VpnStatusReport),
}

impl DaemonResponse {
    pub fn error(message: impl std::fmt::Display) -> Self {
        DaemonResponse::Error {
            message: message.to_string(),
        }
    }
}

/// Identity of a serving daemon, used by clients to detect stale builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub pid: u32,
    pub privilege_mode: super::PrivilegeMode,
    pub version: String,
    pub build_sha: String,
    /// RFC3339 start timestamp.
    pub started_at: String,
    pub listen_address: String,
}

/// Structured report behind `daemon status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatusReport {
    pub pid: u32,
    pub uptime_secs: u64,
    pub active_port_forwards: usize,
    pub vpn: VpnStatusReport,
}

/// Contents of the Windows port file: the daemon's loopback TCP port plus a
/// per-daemon token clients must present, since loopback TCP is reachable by
/// any local user.
#[cfg(windows)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortFileContent {
    pub port: u16,
    pub token: String,
}
