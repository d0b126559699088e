use super::engine::PortForwardManager;
use super::tunnel::{Tunnel, TunnelSpec};
use super::StopSignal;
use crate::config::Config;
use crate::kube::PodResolver;
use crate::sessions::{
    ProfileStore, SessionKey, SessionRecord, SessionRegistry, SessionRole, SessionStatus,
};
use anyhow::{bail, Result};
use async_trait::async_trait;
use serial_test::serial;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};

struct FakeResolver;

#[async_trait]
impl PodResolver for FakeResolver {
    async fn resolve_pod(
        &self,
        _kubeconfig: Option<&Path>,
        _namespace: &str,
        _workload_type: &str,
        workload: &str,
    ) -> Result<String> {
        Ok(format!("{}-pod", workload))
    }
}

#[derive(Clone, Copy)]
enum Attempt {
    /// Fail immediately with this error text.
    Fail(&'static str),
    /// Signal ready, then fail when the test fires `drop_tunnel`.
    Connect,
    /// Signal ready and stay up until stopped.
    ConnectAndHold,
}

struct FakeTunnel {
    script: Mutex<VecDeque<Attempt>>,
    attempts: AtomicUsize,
    drop_tunnel: tokio::sync::Notify,
}

impl FakeTunnel {
    fn new(script: Vec<Attempt>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            attempts: AtomicUsize::new(0),
            drop_tunnel: tokio::sync::Notify::new(),
        })
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tunnel for FakeTunnel {
    async fn run(
        &self,
        _spec: &TunnelSpec,
        ready: oneshot::Sender<()>,
        mut stop: watch::Receiver<StopSignal>,
    ) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let attempt = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Attempt::ConnectAndHold);
        match attempt {
            Attempt::Fail(message) => bail!("{}", message),
            Attempt::Connect => {
                let _ = ready.send(());
                tokio::select! {
                    _ = self.drop_tunnel.notified() => bail!("tunnel dropped"),
                    _ = stop.changed() => Ok(()),
                }
            }
            Attempt::ConnectAndHold => {
                let _ = ready.send(());
                let _ = stop.changed().await;
                Ok(())
            }
        }
    }
}

fn test_config() -> Config {
    Config {
        reconnect_backoff_secs: 0,
        heartbeat_interval_secs: 3600,
        ..Config::default()
    }
}

fn key(local_port: u16) -> SessionKey {
    SessionKey {
        namespace: "default".to_string(),
        application: "bookinfo".to_string(),
        workload: "ratings".to_string(),
        local_port,
        remote_port: 80,
    }
}

fn record(local_port: u16) -> SessionRecord {
    SessionRecord::new(
        key(local_port),
        "deployment".to_string(),
        SessionRole::Daemon,
        false,
    )
}

struct Harness {
    _home: tempfile::TempDir,
    registry: Arc<SessionRegistry>,
    tunnel: Arc<FakeTunnel>,
    manager: PortForwardManager,
}

fn harness(script: Vec<Attempt>) -> Harness {
    let home = tempfile::tempdir().unwrap();
    std::env::set_var("KUBETUN_HOME", home.path());
    let registry = Arc::new(SessionRegistry::new(ProfileStore::open(
        home.path().join("profiles"),
    )));
    let tunnel = FakeTunnel::new(script);
    let manager = PortForwardManager::new(
        registry.clone(),
        Arc::new(FakeResolver),
        tunnel.clone(),
        test_config(),
    );
    Harness {
        _home: home,
        registry,
        tunnel,
        manager,
    }
}

async fn wait_for_attempts(tunnel: &FakeTunnel, attempts: usize) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while tunnel.attempts() < attempts {
        assert!(
            std::time::Instant::now() < deadline,
            "tunnel never reached {} attempts, currently {}",
            attempts,
            tunnel.attempts()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_status(registry: &SessionRegistry, key: &SessionKey, status: SessionStatus) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if registry.get(key).map(|r| r.status) == Some(status) {
            return;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "session never reached {:?}, currently {:?}",
            status,
            registry.get(key)
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
#[serial]
async fn test_start_connects_and_signals_ready() {
    let h = harness(vec![Attempt::ConnectAndHold]);
    let (ready_tx, ready_rx) = oneshot::channel();
    h.manager.start(record(8080), Some(ready_tx)).unwrap();

    assert_eq!(ready_rx.await.unwrap(), 8080);
    wait_for_status(&h.registry, &key(8080), SessionStatus::Connected).await;
    assert!(h.manager.is_active(&key(8080)));
}

#[tokio::test]
#[serial]
async fn test_duplicate_key_is_rejected() {
    let h = harness(vec![Attempt::ConnectAndHold]);
    h.manager.start(record(8080), None).unwrap();
    let err = h.manager.start(record(8080), None).unwrap_err();
    assert!(err.to_string().contains("already running"));
    assert_eq!(h.manager.active_count(), 1);
}

#[tokio::test]
#[serial]
async fn test_reconnects_until_tunnel_succeeds() {
    let h = harness(vec![
        Attempt::Fail("dial error"),
        Attempt::Fail("dial error"),
        Attempt::ConnectAndHold,
    ]);
    let (ready_tx, ready_rx) = oneshot::channel();
    h.manager.start(record(8080), Some(ready_tx)).unwrap();

    assert_eq!(ready_rx.await.unwrap(), 8080);
    wait_for_status(&h.registry, &key(8080), SessionStatus::Connected).await;
    assert_eq!(h.tunnel.attempts(), 3);
}

#[tokio::test]
#[serial]
async fn test_dropped_tunnel_reconnects() {
    let h = harness(vec![Attempt::Connect, Attempt::ConnectAndHold]);
    let (ready_tx, ready_rx) = oneshot::channel();
    h.manager.start(record(8080), Some(ready_tx)).unwrap();
    ready_rx.await.unwrap();

    // The record stays Connected from the first attempt until the engine
    // notices the drop, so wait for the second attempt itself.
    h.tunnel.drop_tunnel.notify_one();
    wait_for_attempts(&h.tunnel, 2).await;
    wait_for_status(&h.registry, &key(8080), SessionStatus::Connected).await;
    assert_eq!(h.tunnel.attempts(), 2);
}

#[tokio::test]
#[serial]
async fn test_local_bind_error_is_terminal() {
    let h = harness(vec![Attempt::Fail(
        "unable to listen on any of the requested ports",
    )]);
    let (ready_tx, ready_rx) = oneshot::channel();
    h.manager.start(record(8080), Some(ready_tx)).unwrap();

    // Readiness is never signaled for a failed session.
    assert!(ready_rx.await.is_err());
    wait_for_status(&h.registry, &key(8080), SessionStatus::Failed).await;
    assert!(!h.manager.is_active(&key(8080)));
    assert_eq!(h.tunnel.attempts(), 1);
    // The record survives so `list` can show why it failed.
    let failed = h.registry.get(&key(8080)).unwrap();
    assert!(failed.reason.contains("unable to listen"));
}

#[tokio::test]
#[serial]
async fn test_stop_removes_durable_record() {
    let h = harness(vec![Attempt::ConnectAndHold]);
    let (ready_tx, ready_rx) = oneshot::channel();
    h.manager.start(record(8080), Some(ready_tx)).unwrap();
    ready_rx.await.unwrap();

    h.manager.stop(&key(8080)).await.unwrap();
    assert!(h.registry.get(&key(8080)).is_none());
    assert_eq!(h.manager.active_count(), 0);
}

#[tokio::test]
#[serial]
async fn test_stop_all_keeps_records_for_recovery() {
    let h = harness(vec![Attempt::ConnectAndHold]);
    let (ready_tx, ready_rx) = oneshot::channel();
    h.manager.start(record(8080), Some(ready_tx)).unwrap();
    ready_rx.await.unwrap();

    h.manager.stop_all().await;
    assert_eq!(h.manager.active_count(), 0);
    assert!(h.registry.get(&key(8080)).is_some());
}

#[tokio::test]
#[serial]
async fn test_recover_restarts_orphaned_sessions() {
    let h = harness(vec![Attempt::ConnectAndHold]);
    // Left behind by a daemon that no longer exists.
    let mut orphan = record(8080);
    orphan.owner_daemon_pid = 0;
    orphan.set_status(SessionStatus::Reconnecting, "daemon exited");
    h.registry.upsert(orphan).unwrap();

    h.manager.recover(false);
    wait_for_status(&h.registry, &key(8080), SessionStatus::Connected).await;
    assert_eq!(h.registry.get(&key(8080)).unwrap().owner_daemon_pid, std::process::id());
}

#[tokio::test]
#[serial]
async fn test_recover_skips_manual_and_terminal_sessions() {
    let h = harness(vec![]);
    let mut manual = record(8080);
    manual.role = SessionRole::Manual;
    manual.owner_daemon_pid = 0;
    h.registry.upsert(manual).unwrap();
    let mut failed = record(8081);
    failed.owner_daemon_pid = 0;
    failed.set_status(SessionStatus::Failed, "port in use");
    h.registry.upsert(failed).unwrap();

    h.manager.recover(false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.manager.active_count(), 0);
}
