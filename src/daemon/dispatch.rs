//! Maps protocol requests onto the engines.
//!
//! Handlers receive the immutable request value and return a response value;
//! all daemon state they touch hangs off [`DaemonContext`]. Errors become
//! `DaemonResponse::Error`, never a dropped connection.

use super::protocol::{
    DaemonInfo, DaemonRequest, DaemonResponse, DaemonStatusReport, PortForwardRequest, VpnVerb,
};
use super::PrivilegeMode;
use crate::config::Config;
use crate::kube::PodResolver;
use crate::portforward::PortForwardManager;
use crate::sessions::{SessionKey, SessionRecord, SessionRegistry, SessionRole, SessionStatus};
use crate::vpn::VpnManager;
use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::oneshot;

/// Resolved pods are cached per cluster: the same namespace/workload name can
/// exist in two clusters, so the kubeconfig is part of the key.
type ResourceKey = (Option<PathBuf>, String, String, String);

/// How the daemon should exit after answering the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    Stop,
    Restart,
}

/// A handled request: the reply to send, plus an optional shutdown the
/// server triggers only after the reply has been flushed.
pub struct DispatchOutcome {
    pub response: DaemonResponse,
    pub shutdown: Option<ShutdownKind>,
}

impl DispatchOutcome {
    fn reply(response: DaemonResponse) -> Self {
        Self {
            response,
            shutdown: None,
        }
    }
}

pub struct DaemonContext {
    pub mode: PrivilegeMode,
    pub config: Config,
    pub registry: Arc<SessionRegistry>,
    pub port_forwards: Arc<PortForwardManager>,
    pub vpn: Arc<VpnManager>,
    resolver: Arc<dyn PodResolver>,
    listen_address: String,
    started_at: String,
    start_instant: Instant,
    kubeconfigs: Mutex<BTreeSet<PathBuf>>,
    resource_cache: Mutex<HashMap<ResourceKey, String>>,
}

impl DaemonContext {
    pub fn new(
        mode: PrivilegeMode,
        config: Config,
        registry: Arc<SessionRegistry>,
        port_forwards: Arc<PortForwardManager>,
        vpn: Arc<VpnManager>,
        resolver: Arc<dyn PodResolver>,
        listen_address: String,
    ) -> Self {
        Self {
            mode,
            config,
            registry,
            port_forwards,
            vpn,
            resolver,
            listen_address,
            started_at: chrono::Utc::now().to_rfc3339(),
            start_instant: Instant::now(),
            kubeconfigs: Mutex::new(load_kubeconfigs().unwrap_or_default()),
            resource_cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn handle(&self, request: DaemonRequest) -> DispatchOutcome {
        match request {
            DaemonRequest::GetServerInfo => {
                DispatchOutcome::reply(DaemonResponse::ServerInfo(self.info()))
            }
            DaemonRequest::GetServerStatus => {
                let report = DaemonStatusReport {
                    pid: std::process::id(),
                    uptime_secs: self.start_instant.elapsed().as_secs(),
                    active_port_forwards: self.port_forwards.active_count(),
                    vpn: self.vpn.status().await,
                };
                DispatchOutcome::reply(DaemonResponse::ServerStatus(report))
            }
            DaemonRequest::StopServer => DispatchOutcome {
                response: DaemonResponse::Ok,
                shutdown: Some(ShutdownKind::Stop),
            },
            DaemonRequest::RestartServer => DispatchOutcome {
                response: DaemonResponse::Ok,
                shutdown: Some(ShutdownKind::Restart),
            },
            DaemonRequest::KubeconfigAdd { path } => {
                DispatchOutcome::reply(self.result_to_response(self.kubeconfig_add(path)))
            }
            DaemonRequest::KubeconfigRemove { path } => {
                DispatchOutcome::reply(self.result_to_response(self.kubeconfig_remove(&path)))
            }
            DaemonRequest::FlushDirMappingCache => {
                self.resource_cache.lock().unwrap().clear();
                DispatchOutcome::reply(DaemonResponse::Ok)
            }
            DaemonRequest::GetResourceInfo {
                kubeconfig,
                namespace,
                workload_type,
                workload,
            } => DispatchOutcome::reply(
                match self
                    .resource_info(kubeconfig.as_deref(), &namespace, &workload_type, &workload)
                    .await
                {
                    Ok(pod_name) => DaemonResponse::ResourceInfo { pod_name },
                    Err(e) => DaemonResponse::error(format!("{:#}", e)),
                },
            ),
            DaemonRequest::PortForwardStart(request) => {
                DispatchOutcome::reply(self.port_forward_start(request).await)
            }
            DaemonRequest::PortForwardEnd {
                namespace,
                application,
                workload,
                local_port,
            } => DispatchOutcome::reply(
                self.port_forward_end(&namespace, &application, &workload, local_port)
                    .await,
            ),
            DaemonRequest::PortForwardList {
                namespace,
                application,
            } => DispatchOutcome::reply(match self.registry.list_reconciled(&namespace, &application)
            {
                Ok(sessions) => DaemonResponse::Sessions(sessions),
                Err(e) => DaemonResponse::error(format!("{:#}", e)),
            }),
            DaemonRequest::VpnOperate { verb, options } => {
                let result = match verb {
                    VpnVerb::Connect => self.vpn.connect(options).await,
                    VpnVerb::Disconnect => self.vpn.disconnect(&options).await,
                    VpnVerb::Reconnect => self.vpn.reconnect().await,
                };
                DispatchOutcome::reply(match result {
                    Ok(report) => DaemonResponse::Vpn(report),
                    Err(e) => DaemonResponse::error(format!("{:#}", e)),
                })
            }
            DaemonRequest::VpnStatus => {
                DispatchOutcome::reply(DaemonResponse::Vpn(self.vpn.status().await))
            }
        }
    }

    pub fn info(&self) -> DaemonInfo {
        DaemonInfo {
            pid: std::process::id(),
            privilege_mode: self.mode,
            version: crate::version::VERSION.to_string(),
            build_sha: crate::version::BUILD_SHA.to_string(),
            started_at: self.started_at.clone(),
            listen_address: self.listen_address.clone(),
        }
    }

    async fn port_forward_start(&self, request: PortForwardRequest) -> DaemonResponse {
        let key = SessionKey {
            namespace: request.namespace,
            application: request.application,
            workload: request.workload,
            local_port: request.local_port,
            remote_port: request.remote_port,
        };
        let mut record = SessionRecord::new(
            key.clone(),
            request.workload_type,
            SessionRole::Daemon,
            self.mode == PrivilegeMode::Sudo,
        );
        record.container = request.container;
        record.pod_name = request.pod_name;
        record.kubeconfig = request.kubeconfig;

        let (ready_tx, ready_rx) = oneshot::channel();
        if let Err(e) = self.port_forwards.start(record, Some(ready_tx)) {
            return DaemonResponse::error(format!("{:#}", e));
        }
        // Wait for the first Connected, bounded; a slow cluster leaves the
        // engine retrying in the background and we report the interim state.
        let _ = tokio::time::timeout(self.config.ready_wait(), ready_rx).await;

        match self.registry.get(&key) {
            Some(record) if record.status == SessionStatus::Failed => {
                DaemonResponse::error(format!("Port-forward {} failed: {}", key, record.reason))
            }
            Some(record) => DaemonResponse::Sessions(vec![record]),
            None => DaemonResponse::error(format!("Port-forward {} was removed while starting", key)),
        }
    }

    async fn port_forward_end(
        &self,
        namespace: &str,
        application: &str,
        workload: &str,
        local_port: u16,
    ) -> DaemonResponse {
        let sessions = match self.registry.list_reconciled(namespace, application) {
            Ok(sessions) => sessions,
            Err(e) => return DaemonResponse::error(format!("{:#}", e)),
        };
        let Some(record) = sessions
            .iter()
            .find(|r| r.key.workload == workload && r.key.local_port == local_port)
        else {
            return DaemonResponse::error(format!(
                "No port-forward for {}/{}/{} on local port {}",
                namespace, application, workload, local_port
            ));
        };
        // Resolved pods may change once the tunnel is gone.
        self.resource_cache.lock().unwrap().clear();
        match self.port_forwards.stop(&record.key).await {
            Ok(()) => DaemonResponse::Ok,
            Err(e) => DaemonResponse::error(format!("{:#}", e)),
        }
    }

    async fn resource_info(
        &self,
        kubeconfig: Option<&Path>,
        namespace: &str,
        workload_type: &str,
        workload: &str,
    ) -> Result<String> {
        let cache_key = (
            kubeconfig.map(Path::to_path_buf),
            namespace.to_string(),
            workload_type.to_string(),
            workload.to_string(),
        );
        if let Some(pod) = self.resource_cache.lock().unwrap().get(&cache_key) {
            return Ok(pod.clone());
        }
        let pod = self
            .resolver
            .resolve_pod(kubeconfig, namespace, workload_type, workload)
            .await?;
        self.resource_cache
            .lock()
            .unwrap()
            .insert(cache_key, pod.clone());
        Ok(pod)
    }

    fn kubeconfig_add(&self, path: PathBuf) -> Result<()> {
        let mut kubeconfigs = self.kubeconfigs.lock().unwrap();
        kubeconfigs.insert(path);
        save_kubeconfigs(&kubeconfigs)
    }

    fn kubeconfig_remove(&self, path: &Path) -> Result<()> {
        let mut kubeconfigs = self.kubeconfigs.lock().unwrap();
        kubeconfigs.remove(path);
        save_kubeconfigs(&kubeconfigs)
    }

    fn result_to_response(&self, result: Result<()>) -> DaemonResponse {
        match result {
            Ok(()) => DaemonResponse::Ok,
            Err(e) => DaemonResponse::error(format!("{:#}", e)),
        }
    }
}

fn load_kubeconfigs() -> Result<BTreeSet<PathBuf>> {
    let path = crate::paths::kubeconfigs_path()?;
    if !path.exists() {
        return Ok(BTreeSet::new());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn save_kubeconfigs(kubeconfigs: &BTreeSet<PathBuf>) -> Result<()> {
    let path = crate::paths::kubeconfigs_path()?;
    let content = serde_json::to_string_pretty(kubeconfigs)?;
    std::fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))
}
