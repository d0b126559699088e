//! Client side of the daemon protocol: locate a running daemon or spawn
//! one, detect stale daemon builds, and exchange one request per
//! connection with bounded, jittered retries.

use super::lock;
use super::protocol::{
    DaemonInfo, DaemonRequest, DaemonResponse, DaemonStatusReport, PortForwardRequest, VpnVerb,
};
use super::PrivilegeMode;
use crate::config::Config;
use crate::daemon_log::daemon_log;
use crate::sessions::SessionRecord;
use crate::vpn::elevation;
use crate::vpn::{VpnOptions, VpnStatusReport};
use anyhow::{bail, Context, Result};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

pub struct DaemonClient {
    mode: PrivilegeMode,
    config: Config,
}

impl DaemonClient {
    pub fn new(mode: PrivilegeMode, config: Config) -> Self {
        Self { mode, config }
    }

    /// Sends a request, spawning a daemon first if none is serving.
    pub async fn send(&self, request: &DaemonRequest) -> Result<DaemonResponse> {
        self.ensure_daemon().await?;
        self.send_with_retry(request).await
    }

    /// Sends a request to an already-running daemon; never spawns one.
    pub async fn send_to_running(&self, request: &DaemonRequest) -> Result<DaemonResponse> {
        if !lock::is_daemon_running(self.mode)? {
            bail!("No {} daemon is running", self.mode);
        }
        self.send_with_retry(request).await
    }

    /// Makes sure a daemon of a compatible build is serving this mode.
    ///
    /// A running daemon built from different sources is asked to stop and is
    /// replaced, so a freshly upgraded CLI never talks to yesterday's daemon.
    pub async fn ensure_daemon(&self) -> Result<()> {
        if !lock::is_daemon_running(self.mode)? {
            self.spawn_daemon().await?;
        }
        let info = self.server_info_inner().await?;
        if info.build_sha != crate::version::BUILD_SHA {
            if !self.can_spawn() {
                tracing::warn!(
                    "The running {} daemon (pid {}) was built from {}, this binary from {}",
                    self.mode,
                    info.pid,
                    info.build_sha,
                    crate::version::BUILD_SHA
                );
                return Ok(());
            }
            daemon_log(
                "client",
                &format!(
                    "replacing {} daemon pid {} (build {} -> {})",
                    self.mode, info.pid, info.build_sha, crate::version::BUILD_SHA
                ),
            );
            let _ = self.send_with_retry(&DaemonRequest::StopServer).await?;
            self.wait_until_stopped().await?;
            self.spawn_daemon().await?;
        }
        Ok(())
    }

    fn can_spawn(&self) -> bool {
        self.mode == PrivilegeMode::User || elevation::is_elevated()
    }

    /// Spawns a detached daemon process and waits for it to take the lock.
    ///
    /// The spawn lock serializes concurrent clients: whoever gets it first
    /// spawns, everyone else finds the daemon already running on re-probe.
    async fn spawn_daemon(&self) -> Result<()> {
        if !self.can_spawn() {
            bail!(
                "No sudo daemon is running and this process is not elevated; \
                 start one with `sudo kubetun daemon start --sudo`"
            );
        }
        let _spawn_lock = lock::acquire_spawn_lock(self.mode)?;
        if lock::is_daemon_running(self.mode)? {
            return Ok(());
        }

        let exe = std::env::current_exe().context("Failed to locate the kubetun binary")?;
        let mut cmd = tokio::process::Command::new(&exe);
        cmd.args(["daemon", "start"]);
        if self.mode == PrivilegeMode::Sudo {
            cmd.arg("--sudo");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd.spawn()
            .with_context(|| format!("Failed to spawn {}", exe.display()))?;
        daemon_log("client", &format!("spawned {} daemon", self.mode));

        let deadline = Instant::now() + self.config.daemon_init_timeout();
        while Instant::now() < deadline {
            if lock::is_daemon_running(self.mode)? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        bail!(
            "The {} daemon did not come up within {:?}",
            self.mode,
            self.config.daemon_init_timeout()
        )
    }

    async fn wait_until_stopped(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.daemon_init_timeout();
        while Instant::now() < deadline {
            if !lock::is_daemon_running(self.mode)? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        bail!("The old {} daemon did not release its lock", self.mode)
    }

    async fn send_with_retry(&self, request: &DaemonRequest) -> Result<DaemonResponse> {
        let mut delay = Duration::from_millis(100);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.exchange(request).await {
                Ok(response) => return Ok(response),
                Err(_) if attempt < self.config.connect_attempts => {
                    tokio::time::sleep(jittered(delay)).await;
                    delay *= 2;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!(
                            "Failed to reach the {} daemon after {} attempts",
                            self.mode, attempt
                        )
                    })
                }
            }
        }
    }

    #[cfg(unix)]
    async fn exchange(&self, request: &DaemonRequest) -> Result<DaemonResponse> {
        let path = crate::paths::daemon_socket_path(self.mode)?;
        let stream = tokio::net::UnixStream::connect(&path)
            .await
            .with_context(|| format!("Failed to connect to {}", path.display()))?;
        exchange_on(stream, None, request).await
    }

    #[cfg(windows)]
    async fn exchange(&self, request: &DaemonRequest) -> Result<DaemonResponse> {
        let path = crate::paths::daemon_port_path(self.mode)?;
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let port_file: super::protocol::PortFileContent = serde_json::from_str(&content)
            .with_context(|| format!("Malformed port file: {}", path.display()))?;
        let stream = tokio::net::TcpStream::connect(("127.0.0.1", port_file.port))
            .await
            .with_context(|| format!("Failed to connect to port {}", port_file.port))?;
        exchange_on(stream, Some(port_file.token), request).await
    }

    async fn server_info_inner(&self) -> Result<DaemonInfo> {
        match self.send_with_retry(&DaemonRequest::GetServerInfo).await? {
            DaemonResponse::ServerInfo(info) => Ok(info),
            other => bail!("Unexpected response to GetServerInfo: {:?}", other),
        }
    }

    pub async fn server_info(&self) -> Result<DaemonInfo> {
        if !lock::is_daemon_running(self.mode)? {
            bail!("No {} daemon is running", self.mode);
        }
        self.server_info_inner().await
    }

    pub async fn server_status(&self) -> Result<DaemonStatusReport> {
        match self
            .send_to_running(&DaemonRequest::GetServerStatus)
            .await?
        {
            DaemonResponse::ServerStatus(report) => Ok(report),
            DaemonResponse::Error { message } => bail!(message),
            other => bail!("Unexpected response to GetServerStatus: {:?}", other),
        }
    }

    pub async fn stop_server(&self) -> Result<()> {
        expect_ok(self.send_to_running(&DaemonRequest::StopServer).await?)
    }

    pub async fn restart_server(&self) -> Result<()> {
        expect_ok(self.send_to_running(&DaemonRequest::RestartServer).await?)
    }

    pub async fn port_forward_start(&self, request: PortForwardRequest) -> Result<SessionRecord> {
        match self
            .send(&DaemonRequest::PortForwardStart(request))
            .await?
        {
            DaemonResponse::Sessions(mut sessions) if !sessions.is_empty() => {
                Ok(sessions.remove(0))
            }
            DaemonResponse::Error { message } => bail!(message),
            other => bail!("Unexpected response to PortForwardStart: {:?}", other),
        }
    }

    pub async fn port_forward_end(
        &self,
        namespace: &str,
        application: &str,
        workload: &str,
        local_port: u16,
    ) -> Result<()> {
        expect_ok(
            self.send_to_running(&DaemonRequest::PortForwardEnd {
                namespace: namespace.to_string(),
                application: application.to_string(),
                workload: workload.to_string(),
                local_port,
            })
            .await?,
        )
    }

    pub async fn port_forward_list(
        &self,
        namespace: &str,
        application: &str,
    ) -> Result<Vec<SessionRecord>> {
        match self
            .send(&DaemonRequest::PortForwardList {
                namespace: namespace.to_string(),
                application: application.to_string(),
            })
            .await?
        {
            DaemonResponse::Sessions(sessions) => Ok(sessions),
            DaemonResponse::Error { message } => bail!(message),
            other => bail!("Unexpected response to PortForwardList: {:?}", other),
        }
    }

    pub async fn vpn_operate(&self, verb: VpnVerb, options: VpnOptions) -> Result<VpnStatusReport> {
        match self.send(&DaemonRequest::VpnOperate { verb, options }).await? {
            DaemonResponse::Vpn(report) => Ok(report),
            DaemonResponse::Error { message } => bail!(message),
            other => bail!("Unexpected response to VpnOperate: {:?}", other),
        }
    }

    pub async fn vpn_status(&self) -> Result<VpnStatusReport> {
        match self.send_to_running(&DaemonRequest::VpnStatus).await? {
            DaemonResponse::Vpn(report) => Ok(report),
            DaemonResponse::Error { message } => bail!(message),
            other => bail!("Unexpected response to VpnStatus: {:?}", other),
        }
    }
}

fn expect_ok(response: DaemonResponse) -> Result<()> {
    match response {
        DaemonResponse::Ok => Ok(()),
        DaemonResponse::Error { message } => bail!(message),
        other => bail!("Unexpected response: {:?}", other),
    }
}

/// +-25% jitter so concurrent clients do not retry in lockstep.
fn jittered(base: Duration) -> Duration {
    use rand::Rng;
    base.mul_f64(rand::thread_rng().gen_range(0.75..1.25))
}

async fn exchange_on<S>(
    stream: S,
    token: Option<String>,
    request: &DaemonRequest,
) -> Result<DaemonResponse>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut payload = String::new();
    if let Some(token) = token {
        payload.push_str(&token);
        payload.push('\n');
    }
    payload.push_str(&serde_json::to_string(request).context("Failed to encode request")?);
    payload.push('\n');
    write
        .write_all(payload.as_bytes())
        .await
        .context("Failed to send request")?;
    write.flush().await.context("Failed to send request")?;

    let mut lines = BufReader::new(read).lines();
    let line = lines
        .next_line()
        .await
        .context("Failed to read response")?
        .context("Daemon closed the connection without a response")?;
    serde_json::from_str(&line).context("Failed to decode response")
}
