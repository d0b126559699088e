//! The mesh connection state machine.
//!
//! Verbs are serialized on one async mutex so connect/disconnect/reconnect
//! never interleave. The tunnel itself is supervised by a background task
//! that reuses the port-forward reconnect policy: fixed backoff, transition
//! to `Reconnecting` on network failure, give up only on explicit stop.

use super::driver::TunnelDriver;
use super::elevation::{self, elevation_hint};
use super::{VpnOptions, VpnStatus, VpnStatusReport};
use crate::config::Config;
use crate::daemon_log::daemon_log;
use crate::kube::PodResolver;
use crate::portforward::{StopSignal, Tunnel, TunnelSpec};
use anyhow::{bail, Context, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Workload backing the mesh inside the cluster.
const TRAFFIC_MANAGER_WORKLOAD: &str = "traffic-manager";
/// Port the traffic manager listens on; mirrored locally.
const TRAFFIC_MANAGER_PORT: u16 = 10800;

/// Status and reason, shared with the supervising tunnel task.
struct Shared {
    status: VpnStatus,
    reason: String,
}

struct State {
    options: Option<VpnOptions>,
    driver_installed: bool,
    stop: Option<watch::Sender<StopSignal>>,
    task: Option<JoinHandle<()>>,
}

pub struct VpnManager {
    // Serializes the verbs; held across awaits on purpose.
    state: tokio::sync::Mutex<State>,
    shared: Arc<Mutex<Shared>>,
    resolver: Arc<dyn PodResolver>,
    tunnel: Arc<dyn Tunnel>,
    driver: Arc<dyn TunnelDriver>,
    config: Config,
    requires_elevation: bool,
}

impl VpnManager {
    pub fn new(
        resolver: Arc<dyn PodResolver>,
        tunnel: Arc<dyn Tunnel>,
        driver: Arc<dyn TunnelDriver>,
        config: Config,
    ) -> Self {
        Self {
            state: tokio::sync::Mutex::new(State {
                options: None,
                driver_installed: false,
                stop: None,
                task: None,
            }),
            shared: Arc::new(Mutex::new(Shared {
                status: VpnStatus::Disconnected,
                reason: String::new(),
            })),
            resolver,
            tunnel,
            driver,
            config,
            requires_elevation: true,
        }
    }

    /// Disables the privilege check (tests run unelevated).
    #[cfg(test)]
    pub fn without_elevation_check(mut self) -> Self {
        self.requires_elevation = false;
        self
    }

    /// Establishes the mesh connection, returning once the tunnel is up.
    ///
    /// Idempotent for the `(kubeconfig, namespace)` pair already connected;
    /// a different pair tears the old connection down first.
    pub async fn connect(&self, options: VpnOptions) -> Result<VpnStatusReport> {
        let mut state = self.state.lock().await;
        self.ensure_elevated()?;
        if state.stop.is_some() {
            if let Some(active) = &state.options {
                if active.kubeconfig == options.kubeconfig && active.namespace == options.namespace
                {
                    return Ok(self.report(&state));
                }
            }
            // Switching target pairs: drop the old tunnel, keep the driver.
            self.teardown_tunnel(&mut state).await;
        }
        self.connect_locked(&mut state, options).await
    }

    /// Tears down the mesh and uninstalls the driver. Idempotent: with no
    /// active connection it succeeds without touching the driver again.
    ///
    /// The requested `(kubeconfig, namespace)` pair must name the active
    /// connection; disconnecting pair B must never silently drop pair A.
    pub async fn disconnect(&self, requested: &VpnOptions) -> Result<VpnStatusReport> {
        let mut state = self.state.lock().await;
        if state.stop.is_none() && !state.driver_installed {
            self.set_status(VpnStatus::Disconnected, "");
            return Ok(self.report(&state));
        }
        if let Some(active) = &state.options {
            if active.kubeconfig != requested.kubeconfig
                || active.namespace != requested.namespace
            {
                bail!(
                    "vpn is connected to namespace {} via {}, not the requested target",
                    active.namespace,
                    active.kubeconfig.display()
                );
            }
        }
        self.teardown_tunnel(&mut state).await;
        if state.driver_installed {
            match self.uninstall_driver() {
                Ok(()) => self.set_status(VpnStatus::Disconnected, ""),
                Err(e) => {
                    let reason = self.relocate_driver_artifact(&e);
                    self.set_status(VpnStatus::Disconnected, reason);
                }
            }
            state.driver_installed = false;
        }
        Ok(self.report(&state))
    }

    /// Re-establishes the mesh with the last-known options.
    pub async fn reconnect(&self) -> Result<VpnStatusReport> {
        let mut state = self.state.lock().await;
        self.ensure_elevated()?;
        let Some(options) = state.options.clone() else {
            bail!("No previous vpn connection to reconnect; run `vpn connect` first");
        };
        self.teardown_tunnel(&mut state).await;
        self.connect_locked(&mut state, options).await
    }

    /// Read-only state dump; never mutates.
    pub async fn status(&self) -> VpnStatusReport {
        let state = self.state.lock().await;
        self.report(&state)
    }

    async fn connect_locked(
        &self,
        state: &mut State,
        options: VpnOptions,
    ) -> Result<VpnStatusReport> {
        if !state.driver_installed {
            self.install_driver()?;
            state.driver_installed = true;
        }
        self.set_status(VpnStatus::Connecting, "");
        daemon_log(
            "vpn",
            &format!("connecting mesh in namespace {}", options.namespace),
        );

        let (stop_tx, stop_rx) = watch::channel(StopSignal::Run);
        let (first_tx, first_rx) = oneshot::channel();
        let task = tokio::spawn(run_mesh_loop(
            self.shared.clone(),
            self.resolver.clone(),
            self.tunnel.clone(),
            self.config.reconnect_backoff(),
            options.clone(),
            first_tx,
            stop_rx,
        ));
        state.options = Some(options);
        state.stop = Some(stop_tx);
        state.task = Some(task);

        match tokio::time::timeout(self.config.ready_wait(), first_rx).await {
            Ok(Ok(())) => Ok(self.report(state)),
            _ => {
                self.teardown_tunnel(state).await;
                self.set_status(VpnStatus::Failed, "timed out waiting for the mesh tunnel");
                bail!("vpn connect timed out waiting for the mesh tunnel");
            }
        }
    }

    fn ensure_elevated(&self) -> Result<()> {
        if self.requires_elevation && !elevation::is_elevated() {
            self.set_status(VpnStatus::Failed, "missing elevated privileges");
            bail!("This operation requires elevated privileges; {}", elevation_hint());
        }
        Ok(())
    }

    async fn teardown_tunnel(&self, state: &mut State) {
        if let Some(stop) = state.stop.take() {
            let _ = stop.send(StopSignal::EndSession);
        }
        if let Some(task) = state.task.take() {
            let _ = task.await;
        }
        self.set_status(VpnStatus::Disconnected, "");
    }

    fn install_driver(&self) -> Result<()> {
        if self.driver.is_installed() {
            return Ok(());
        }
        let mut last = None;
        for attempt in 1..=self.config.driver_retries {
            match self.driver.install() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    daemon_log(
                        "vpn",
                        &format!(
                            "driver install attempt {}/{} failed: {:#}",
                            attempt, self.config.driver_retries, e
                        ),
                    );
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap())
            .with_context(|| format!("Failed to install the {} driver", self.driver.name()))
    }

    fn uninstall_driver(&self) -> Result<()> {
        let mut last = None;
        for attempt in 1..=self.config.driver_retries {
            match self.driver.uninstall() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    daemon_log(
                        "vpn",
                        &format!(
                            "driver uninstall attempt {}/{} failed: {:#}",
                            attempt, self.config.driver_retries, e
                        ),
                    );
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap())
            .with_context(|| format!("Failed to uninstall the {} driver", self.driver.name()))
    }

    /// Uninstall kept failing: move the artifact out of the way so the next
    /// run is not blocked by a stale file. Returns the reason to report.
    fn relocate_driver_artifact(&self, uninstall_error: &anyhow::Error) -> String {
        let Some(artifact) = self.driver.artifact_path() else {
            return format!("driver uninstall failed: {:#}", uninstall_error);
        };
        let file_name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tunnel-driver".to_string());
        let dest = std::env::temp_dir().join(format!("kubetun-{}-{}", std::process::id(), file_name));
        match std::fs::rename(&artifact, &dest) {
            Ok(()) => {
                let reason = format!(
                    "driver uninstall failed ({:#}); relocated {} to {}",
                    uninstall_error,
                    artifact.display(),
                    dest.display()
                );
                tracing::warn!("{}", reason);
                reason
            }
            Err(e) => {
                let reason = format!(
                    "driver uninstall failed ({:#}); relocation also failed: {}",
                    uninstall_error, e
                );
                tracing::warn!("{}", reason);
                reason
            }
        }
    }

    fn set_status(&self, status: VpnStatus, reason: impl Into<String>) {
        let mut shared = self.shared.lock().unwrap();
        shared.status = status;
        shared.reason = reason.into();
    }

    fn report(&self, state: &State) -> VpnStatusReport {
        let shared = self.shared.lock().unwrap();
        VpnStatusReport {
            status: shared.status,
            kubeconfig: state.options.as_ref().map(|o| o.kubeconfig.clone()),
            namespace: state.options.as_ref().map(|o| o.namespace.clone()),
            workloads: state
                .options
                .as_ref()
                .map(|o| o.workloads.clone())
                .unwrap_or_default(),
            driver_installed: state.driver_installed,
            reason: shared.reason.clone(),
        }
    }
}

/// Supervises the tunnel to the traffic manager until told to stop.
async fn run_mesh_loop(
    shared: Arc<Mutex<Shared>>,
    resolver: Arc<dyn PodResolver>,
    tunnel: Arc<dyn Tunnel>,
    backoff: Duration,
    options: VpnOptions,
    first_ready: oneshot::Sender<()>,
    mut stop: watch::Receiver<StopSignal>,
) {
    let set = |status: VpnStatus, reason: &str| {
        let mut shared = shared.lock().unwrap();
        shared.status = status;
        shared.reason = reason.to_string();
    };
    let mut first_ready = Some(first_ready);

    loop {
        let pod = match resolver
            .resolve_pod(
                Some(&options.kubeconfig),
                &options.namespace,
                "deployment",
                TRAFFIC_MANAGER_WORKLOAD,
            )
            .await
        {
            Ok(pod) => pod,
            Err(e) => {
                let reason = format!("traffic manager lookup failed: {:#}", e);
                daemon_log("vpn", &reason);
                set(VpnStatus::Reconnecting, &reason);
                if !sleep_or_stop(&mut stop, backoff).await {
                    return;
                }
                continue;
            }
        };

        let spec = TunnelSpec {
            kubeconfig: Some(options.kubeconfig.clone()),
            namespace: options.namespace.clone(),
            pod,
            local_port: TRAFFIC_MANAGER_PORT,
            remote_port: TRAFFIC_MANAGER_PORT,
            log_path: crate::paths::port_forward_log_path(
                &options.namespace,
                "vpn",
                TRAFFIC_MANAGER_WORKLOAD,
                TRAFFIC_MANAGER_PORT,
                TRAFFIC_MANAGER_PORT,
            )
            .ok(),
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let run_fut = tunnel.run(&spec, ready_tx, stop.clone());
        tokio::pin!(run_fut);

        let early = tokio::select! {
            res = &mut run_fut => Some(res),
            outcome = ready_rx => {
                if outcome.is_ok() {
                    set(VpnStatus::Connected, "");
                    daemon_log("vpn", "mesh tunnel established");
                    if let Some(tx) = first_ready.take() {
                        let _ = tx.send(());
                    }
                }
                None
            }
        };
        let result = match early {
            Some(result) => result,
            None => (&mut run_fut).await,
        };

        if *stop.borrow() != StopSignal::Run {
            return;
        }
        let reason = match result {
            Ok(()) => format!("mesh tunnel closed, reconnecting in {}s", backoff.as_secs()),
            Err(e) => format!("{:#}, reconnecting in {}s", e, backoff.as_secs()),
        };
        daemon_log("vpn", &reason);
        set(VpnStatus::Reconnecting, &reason);
        if !sleep_or_stop(&mut stop, backoff).await {
            return;
        }
    }
}

/// False when the stop channel fired (or closed) during the backoff.
async fn sleep_or_stop(stop: &mut watch::Receiver<StopSignal>, backoff: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(backoff) => true,
        _ = stop.changed() => false,
    }
}
