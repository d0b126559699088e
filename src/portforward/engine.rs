//! Supervision loop around individual tunnels.
//!
//! The manager owns one engine task per active session. An engine resolves
//! the target pod, runs a tunnel attempt, and on failure re-enters the loop
//! after a fixed backoff. It only leaves the loop on an explicit stop or on
//! an error that cannot succeed on retry (the local port is unusable).

use super::tunnel::{is_local_bind_error, Tunnel, TunnelSpec};
use super::StopSignal;
use crate::config::Config;
use crate::daemon_log::daemon_log;
use crate::kube::PodResolver;
use crate::sessions::{SessionKey, SessionRecord, SessionRegistry, SessionRole, SessionStatus};
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

struct ActiveForward {
    stop: watch::Sender<StopSignal>,
    done: JoinHandle<()>,
}

#[derive(Clone)]
struct EngineDeps {
    registry: Arc<SessionRegistry>,
    resolver: Arc<dyn PodResolver>,
    tunnel: Arc<dyn Tunnel>,
    config: Config,
    forwards: Arc<Mutex<HashMap<SessionKey, ActiveForward>>>,
}

/// Owns every active port-forward in this daemon.
pub struct PortForwardManager {
    deps: EngineDeps,
}

impl PortForwardManager {
    pub fn new(
        registry: Arc<SessionRegistry>,
        resolver: Arc<dyn PodResolver>,
        tunnel: Arc<dyn Tunnel>,
        config: Config,
    ) -> Self {
        Self {
            deps: EngineDeps {
                registry,
                resolver,
                tunnel,
                config,
                forwards: Arc::new(Mutex::new(HashMap::new())),
            },
        }
    }

    /// Starts supervising a session.
    ///
    /// The record is persisted as `Connecting` before the engine task is
    /// spawned, so the session is durable before the caller sees any reply.
    /// `ready` fires with the local port once traffic can flow; it fires at
    /// most once even across reconnects.
    pub fn start(
        &self,
        record: SessionRecord,
        ready: Option<oneshot::Sender<u16>>,
    ) -> Result<()> {
        let key = record.key.clone();
        let mut forwards = self.deps.forwards.lock().unwrap();
        if forwards.contains_key(&key) {
            bail!("Port-forward {} is already running", key);
        }
        self.deps.registry.upsert(record.clone())?;
        let (stop_tx, stop_rx) = watch::channel(StopSignal::Run);
        let done = tokio::spawn(run_engine(self.deps.clone(), record, ready, stop_rx));
        forwards.insert(key, ActiveForward { stop: stop_tx, done });
        Ok(())
    }

    /// Stops one session and removes its durable record.
    pub async fn stop(&self, key: &SessionKey) -> Result<()> {
        let active = self.deps.forwards.lock().unwrap().remove(key);
        match active {
            Some(active) => {
                let _ = active.stop.send(StopSignal::EndSession);
                let _ = active.done.await;
                Ok(())
            }
            // Not active in this daemon (stale record from a previous run):
            // just drop the persisted record.
            None => self.deps.registry.remove(key),
        }
    }

    /// Stops every active tunnel but keeps the durable records, so a
    /// replacement daemon can recover them.
    pub async fn stop_all(&self) {
        let drained: Vec<ActiveForward> = {
            let mut forwards = self.deps.forwards.lock().unwrap();
            forwards.drain().map(|(_, active)| active).collect()
        };
        for active in &drained {
            let _ = active.stop.send(StopSignal::DaemonExit);
        }
        for active in drained {
            let _ = active.done.await;
        }
    }

    /// Restarts daemon-owned sessions left behind by a previous daemon of the
    /// same privilege mode.
    pub fn recover(&self, sudo: bool) {
        let persisted = match self.deps.registry.persisted_sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::warn!("Session recovery skipped: {}", e);
                return;
            }
        };
        for mut record in persisted {
            if record.role != SessionRole::Daemon || record.sudo != sudo {
                continue;
            }
            if matches!(record.status, SessionStatus::Stopped | SessionStatus::Failed) {
                continue;
            }
            if record.owner_daemon_pid != std::process::id()
                && crate::daemon::lock::is_process_alive(record.owner_daemon_pid)
            {
                continue;
            }
            daemon_log("recover", &format!("recovering port-forward {}", record.key));
            record.owner_daemon_pid = std::process::id();
            record.set_status(SessionStatus::Connecting, "recovered after daemon restart");
            if let Err(e) = self.start(record, None) {
                tracing::warn!("Recovery failed: {}", e);
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.deps.forwards.lock().unwrap().len()
    }

    #[allow(dead_code)]
    pub fn is_active(&self, key: &SessionKey) -> bool {
        self.deps.forwards.lock().unwrap().contains_key(key)
    }
}

enum BackoffOutcome {
    Elapsed,
    Stopped(StopSignal),
}

async fn wait_backoff(
    stop: &mut watch::Receiver<StopSignal>,
    backoff: Duration,
) -> BackoffOutcome {
    tokio::select! {
        _ = tokio::time::sleep(backoff) => BackoffOutcome::Elapsed,
        res = stop.changed() => match res {
            Ok(()) => BackoffOutcome::Stopped(*stop.borrow()),
            // Sender gone means the daemon is tearing down.
            Err(_) => BackoffOutcome::Stopped(StopSignal::DaemonExit),
        },
    }
}

async fn run_engine(
    deps: EngineDeps,
    record: SessionRecord,
    ready: Option<oneshot::Sender<u16>>,
    mut stop: watch::Receiver<StopSignal>,
) {
    let key = record.key.clone();
    let backoff = deps.config.reconnect_backoff();
    let mut caller_ready = ready;
    // A pinned pod is honored for the first attempt only; every retry
    // re-resolves, since the old pod may be gone.
    let mut pinned_pod = record.pod_name.clone();

    loop {
        let pod = match pinned_pod.take() {
            Some(pod) => pod,
            None => {
                match deps
                    .resolver
                    .resolve_pod(
                        record.kubeconfig.as_deref(),
                        &key.namespace,
                        &record.workload_type,
                        &key.workload,
                    )
                    .await
                {
                    Ok(pod) => pod,
                    Err(e) => {
                        let reason = format!("pod lookup failed: {:#}", e);
                        daemon_log("port-forward", &format!("{}: {}", key, reason));
                        let _ = deps
                            .registry
                            .update_status(&key, SessionStatus::Reconnecting, reason);
                        match wait_backoff(&mut stop, backoff).await {
                            BackoffOutcome::Elapsed => continue,
                            BackoffOutcome::Stopped(signal) => {
                                finish(&deps, &key, signal);
                                return;
                            }
                        }
                    }
                }
            }
        };

        let spec = TunnelSpec {
            kubeconfig: record.kubeconfig.clone(),
            namespace: key.namespace.clone(),
            pod,
            local_port: key.local_port,
            remote_port: key.remote_port,
            log_path: crate::paths::port_forward_log_path(
                &key.namespace,
                &key.application,
                &key.workload,
                key.local_port,
                key.remote_port,
            )
            .ok(),
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let run_fut = deps.tunnel.run(&spec, ready_tx, stop.clone());
        tokio::pin!(run_fut);

        let mut heartbeat: Option<JoinHandle<()>> = None;
        let early = tokio::select! {
            res = &mut run_fut => Some(res),
            outcome = ready_rx => {
                if outcome.is_ok() {
                    let _ = deps.registry.update_status(&key, SessionStatus::Connected, "");
                    if let Some(tx) = caller_ready.take() {
                        let _ = tx.send(key.local_port);
                    }
                    heartbeat = Some(tokio::spawn(heartbeat_loop(
                        deps.registry.clone(),
                        key.clone(),
                        deps.config.heartbeat_interval(),
                    )));
                }
                None
            }
        };
        let result = match early {
            Some(result) => result,
            None => (&mut run_fut).await,
        };
        if let Some(task) = heartbeat.take() {
            task.abort();
        }

        let signal = *stop.borrow();
        if signal != StopSignal::Run {
            finish(&deps, &key, signal);
            return;
        }

        match result {
            Ok(()) => {
                // Closed cleanly without a stop signal: remote side went away.
                let reason = format!("tunnel closed, reconnecting in {}s", backoff.as_secs());
                daemon_log("port-forward", &format!("{}: {}", key, reason));
                let _ = deps
                    .registry
                    .update_status(&key, SessionStatus::Reconnecting, reason);
            }
            Err(e) => {
                let message = format!("{:#}", e);
                if is_local_bind_error(&message) {
                    daemon_log("port-forward", &format!("{}: giving up: {}", key, message));
                    let _ = deps
                        .registry
                        .update_status(&key, SessionStatus::Failed, message);
                    deps.forwards.lock().unwrap().remove(&key);
                    return;
                }
                let reason = format!("{}, reconnecting in {}s", message, backoff.as_secs());
                daemon_log("port-forward", &format!("{}: {}", key, reason));
                let _ = deps
                    .registry
                    .update_status(&key, SessionStatus::Reconnecting, reason);
            }
        }

        match wait_backoff(&mut stop, backoff).await {
            BackoffOutcome::Elapsed => continue,
            BackoffOutcome::Stopped(signal) => {
                finish(&deps, &key, signal);
                return;
            }
        }
    }
}

/// Terminal bookkeeping for a stopped engine. `EndSession` drops the durable
/// record; `DaemonExit` keeps it so the next daemon can recover the session.
fn finish(deps: &EngineDeps, key: &SessionKey, signal: StopSignal) {
    match signal {
        StopSignal::EndSession => {
            daemon_log("port-forward", &format!("{}: stopped", key));
            if let Err(e) = deps.registry.remove(key) {
                tracing::warn!("Failed to remove session {}: {}", key, e);
            }
        }
        StopSignal::DaemonExit => {
            daemon_log("port-forward", &format!("{}: released for daemon exit", key));
        }
        StopSignal::Run => {}
    }
}

/// Probes the local port every interval and records heartbeat loss and
/// recovery in the session's reason field.
async fn heartbeat_loop(registry: Arc<SessionRegistry>, key: SessionKey, interval: Duration) {
    let addr = format!("127.0.0.1:{}", key.local_port);
    let mut healthy = true;
    loop {
        tokio::time::sleep(interval).await;
        let ok = tokio::net::TcpStream::connect(&addr).await.is_ok();
        if ok == healthy {
            continue;
        }
        healthy = ok;
        let reason = if ok { "heartbeat restored" } else { "heartbeat lost" };
        daemon_log("heartbeat", &format!("{}: {}", key, reason));
        let _ = registry.update_status(&key, SessionStatus::Connected, reason);
    }
}
