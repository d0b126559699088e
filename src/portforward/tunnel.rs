//! One tunnel attempt: a `kubectl port-forward` child process supervised
//! until it exits or is told to stop.

use super::StopSignal;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{oneshot, watch};

/// Everything a single tunnel attempt needs to know.
#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub kubeconfig: Option<PathBuf>,
    pub namespace: String,
    pub pod: String,
    pub local_port: u16,
    pub remote_port: u16,
    /// Per-tunnel log file for the child's output; `None` discards it.
    pub log_path: Option<PathBuf>,
}

/// A single run of a tunnel.
///
/// Implementations block until the tunnel closes. `ready` fires at most once,
/// when traffic can actually flow. `Ok(())` means the tunnel was closed by the
/// stop channel; every other way of ending is an `Err` and the caller decides
/// whether to retry.
#[async_trait]
pub trait Tunnel: Send + Sync {
    async fn run(
        &self,
        spec: &TunnelSpec,
        ready: oneshot::Sender<()>,
        stop: watch::Receiver<StopSignal>,
    ) -> Result<()>;
}

/// kubectl prints this when the local port cannot be bound. It will never
/// succeed on retry, so the engine fails the session instead of looping.
const LOCAL_BIND_ERROR: &str = "unable to listen on any of the requested ports";

/// True for errors that mean the local port itself is unusable.
pub fn is_local_bind_error(message: &str) -> bool {
    message.contains(LOCAL_BIND_ERROR) || message.contains("address already in use")
}

/// Tunnel backed by a `kubectl port-forward` child process.
pub struct KubectlTunnel {
    kubectl: Option<PathBuf>,
}

impl KubectlTunnel {
    pub fn new(kubectl_path: Option<&str>) -> Self {
        Self {
            kubectl: kubectl_path.map(PathBuf::from),
        }
    }

    fn kubectl_binary(&self) -> Result<PathBuf> {
        match &self.kubectl {
            Some(path) => Ok(path.clone()),
            None => which::which("kubectl").context("kubectl not found in PATH"),
        }
    }
}

#[async_trait]
impl Tunnel for KubectlTunnel {
    async fn run(
        &self,
        spec: &TunnelSpec,
        ready: oneshot::Sender<()>,
        mut stop: watch::Receiver<StopSignal>,
    ) -> Result<()> {
        let kubectl = self.kubectl_binary()?;
        let mut cmd = tokio::process::Command::new(&kubectl);
        let target = format!("pod/{}", spec.pod);
        let ports = format!("{}:{}", spec.local_port, spec.remote_port);
        cmd.args([
            "port-forward",
            target.as_str(),
            ports.as_str(),
            "-n",
            spec.namespace.as_str(),
        ]);
        if let Some(path) = &spec.kubeconfig {
            cmd.arg("--kubeconfig").arg(path);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", kubectl.display()))?;
        let stdout = child.stdout.take().context("Child stdout not captured")?;
        let stderr = child.stderr.take().context("Child stderr not captured")?;

        let log = Arc::new(Mutex::new(open_log(spec.log_path.as_deref())));
        let error_tail = Arc::new(Mutex::new(String::new()));

        // kubectl announces readiness on stdout ("Forwarding from ...").
        let stdout_task = tokio::spawn(pump_stdout(stdout, ready, log.clone()));
        let stderr_task = tokio::spawn(pump_stderr(stderr, error_tail.clone(), log.clone()));

        let status = tokio::select! {
            status = child.wait() => Some(status.context("Failed to wait for kubectl")?),
            _ = stop.changed() => {
                // Stop requested; killing the child also unblocks the pumps.
                let _ = child.start_kill();
                None
            }
        };
        let _ = tokio::join!(stdout_task, stderr_task);

        match status {
            None => {
                let _ = child.wait().await;
                Ok(())
            }
            Some(status) => {
                let tail = error_tail.lock().unwrap().trim().to_string();
                if tail.is_empty() {
                    bail!("kubectl port-forward exited: {}", status);
                }
                Err(anyhow!("kubectl port-forward exited: {}", tail))
            }
        }
    }
}

fn open_log(path: Option<&std::path::Path>) -> Option<std::fs::File> {
    let path = path?;
    if let Some(dir) = path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .ok()
}

fn append_line(log: &Mutex<Option<std::fs::File>>, line: &str) {
    use std::io::Write;
    if let Some(file) = log.lock().unwrap().as_mut() {
        let _ = writeln!(file, "{}", line);
    }
}

async fn pump_stdout(
    stdout: impl AsyncRead + Unpin,
    ready: oneshot::Sender<()>,
    log: Arc<Mutex<Option<std::fs::File>>>,
) {
    let mut ready = Some(ready);
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        append_line(&log, &line);
        if line.contains("Forwarding from") {
            if let Some(tx) = ready.take() {
                let _ = tx.send(());
            }
        }
    }
}

async fn pump_stderr(
    stderr: impl AsyncRead + Unpin,
    error_tail: Arc<Mutex<String>>,
    log: Arc<Mutex<Option<std::fs::File>>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        append_line(&log, &line);
        let mut tail = error_tail.lock().unwrap();
        if !tail.is_empty() {
            tail.push_str("; ");
        }
        tail.push_str(line.trim());
    }
}
