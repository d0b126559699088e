//! The daemon server loop.
//!
//! Binds the privilege-mode-scoped endpoint, accepts one request per
//! connection, and hands each connection its own task so a slow handler
//! (a vpn connect, a pod lookup) never blocks the accept loop. Shutdown is
//! triggered by StopServer/RestartServer or by a termination signal; either
//! way every active tunnel is stopped and the endpoint is cleaned up.

use super::dispatch::{DaemonContext, DispatchOutcome, ShutdownKind};
use super::lock::DaemonLock;
use super::protocol::{DaemonRequest, DaemonResponse};
use super::PrivilegeMode;
use crate::config::Config;
use crate::daemon_log::daemon_log;
use crate::kube::KubectlPodResolver;
use crate::portforward::{KubectlTunnel, PortForwardManager};
use crate::sessions::{ProfileStore, SessionRegistry};
use crate::vpn::{platform_driver, VpnManager};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

/// Runs the daemon until it is told to stop or restart.
///
/// The returned [`ShutdownKind`] tells the caller whether to spawn a
/// replacement process.
pub async fn run_daemon(mode: PrivilegeMode, config: Config) -> Result<ShutdownKind> {
    if mode == PrivilegeMode::Sudo && !crate::vpn::elevation::is_elevated() {
        bail!(
            "The sudo daemon requires elevated privileges; {}",
            crate::vpn::elevation::elevation_hint()
        );
    }
    let lock = DaemonLock::acquire(mode)?;

    let registry = Arc::new(SessionRegistry::new(ProfileStore::open_default()?));
    let resolver = Arc::new(KubectlPodResolver::new(config.kubectl_path.as_deref()));
    let tunnel = Arc::new(KubectlTunnel::new(config.kubectl_path.as_deref()));
    let port_forwards = Arc::new(PortForwardManager::new(
        registry.clone(),
        resolver.clone(),
        tunnel.clone(),
        config.clone(),
    ));
    let vpn = Arc::new(VpnManager::new(
        resolver.clone(),
        tunnel,
        platform_driver(),
        config.clone(),
    ));

    let endpoint = Endpoint::bind(mode).await?;
    let ctx = Arc::new(DaemonContext::new(
        mode,
        config,
        registry,
        port_forwards,
        vpn,
        resolver,
        endpoint.address(),
    ));

    daemon_log(
        "daemon",
        &format!(
            "{} daemon listening on {} (pid {}, build {})",
            mode,
            endpoint.address(),
            std::process::id(),
            crate::version::BUILD_SHA
        ),
    );
    ctx.port_forwards.recover(mode == PrivilegeMode::Sudo);

    let kind = endpoint.accept_loop(ctx.clone()).await;

    daemon_log("daemon", &format!("{} daemon shutting down ({:?})", mode, kind));
    ctx.port_forwards.stop_all().await;
    endpoint.cleanup();
    drop(lock);
    Ok(kind)
}

/// The bound, privilege-mode-scoped endpoint.
struct Endpoint {
    #[cfg(unix)]
    listener: tokio::net::UnixListener,
    #[cfg(unix)]
    socket_path: std::path::PathBuf,
    #[cfg(windows)]
    listener: tokio::net::TcpListener,
    #[cfg(windows)]
    port_path: std::path::PathBuf,
    #[cfg(windows)]
    token: String,
    address: String,
}

impl Endpoint {
    #[cfg(unix)]
    async fn bind(mode: PrivilegeMode) -> Result<Self> {
        let socket_path = crate::paths::daemon_socket_path(mode)?;
        // Stale socket from a crashed daemon; the lock already proved no
        // daemon is serving it.
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("Failed to remove {}", socket_path.display()))?;
        }
        let listener = tokio::net::UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
        let address = socket_path.display().to_string();
        Ok(Self {
            listener,
            socket_path,
            address,
        })
    }

    #[cfg(windows)]
    async fn bind(mode: PrivilegeMode) -> Result<Self> {
        use base64::Engine as _;
        use rand::RngCore;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("Failed to bind a loopback port")?;
        let port = listener.local_addr()?.port();
        let mut bytes = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = base64::engine::general_purpose::STANDARD.encode(bytes);
        let port_path = crate::paths::daemon_port_path(mode)?;
        let content = serde_json::to_string(&super::protocol::PortFileContent {
            port,
            token: token.clone(),
        })?;
        std::fs::write(&port_path, content)
            .with_context(|| format!("Failed to write {}", port_path.display()))?;
        Ok(Self {
            listener,
            port_path,
            token,
            address: format!("127.0.0.1:{}", port),
        })
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    async fn accept_loop(&self, ctx: Arc<DaemonContext>) -> ShutdownKind {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<ShutdownKind>(1);
        let signal = wait_for_signal();
        tokio::pin!(signal);
        loop {
            tokio::select! {
                _ = &mut signal => break ShutdownKind::Stop,
                Some(kind) = shutdown_rx.recv() => break kind,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(handle_connection(
                            ctx.clone(),
                            stream,
                            self.expected_token(),
                            shutdown_tx.clone(),
                        ));
                    }
                    Err(e) => daemon_log("daemon", &format!("accept failed: {}", e)),
                },
            }
        }
    }

    #[cfg(unix)]
    fn expected_token(&self) -> Option<String> {
        None
    }

    #[cfg(windows)]
    fn expected_token(&self) -> Option<String> {
        Some(self.token.clone())
    }

    #[cfg(unix)]
    fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }

    #[cfg(windows)]
    fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.port_path);
    }
}

/// One request, one reply, then the connection is done.
///
/// A shutdown requested by the command is sent only after the reply has been
/// flushed, so the client never observes a dropped connection on a
/// successful stop/restart.
pub(crate) async fn handle_connection<S>(
    ctx: Arc<DaemonContext>,
    stream: S,
    expected_token: Option<String>,
    shutdown: mpsc::Sender<ShutdownKind>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    use tokio::io::AsyncBufReadExt;

    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();

    if let Some(expected) = expected_token {
        let presented = lines.next_line().await.ok().flatten();
        if presented.as_deref().map(str::trim) != Some(expected.as_str()) {
            let _ = write_response(&mut write, &DaemonResponse::error("Invalid auth token")).await;
            return;
        }
    }

    let line = match lines.next_line().await {
        Ok(Some(line)) => line,
        Ok(None) => return,
        Err(e) => {
            daemon_log("daemon", &format!("request read failed: {}", e));
            return;
        }
    };

    let outcome = match serde_json::from_str::<DaemonRequest>(&line) {
        Ok(request) => ctx.handle(request).await,
        Err(e) => DispatchOutcome {
            response: DaemonResponse::error(format!("Malformed request: {}", e)),
            shutdown: None,
        },
    };

    if let Err(e) = write_response(&mut write, &outcome.response).await {
        daemon_log("daemon", &format!("response write failed: {}", e));
    }
    if let Some(kind) = outcome.shutdown {
        let _ = shutdown.send(kind).await;
    }
}

async fn write_response<W>(write: &mut W, response: &DaemonResponse) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut payload = serde_json::to_string(response)?;
    payload.push('\n');
    write.write_all(payload.as_bytes()).await?;
    write.flush().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(windows)]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
