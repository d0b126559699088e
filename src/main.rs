//! kubetun: daemon-mediated port-forward tunnels and a VPN mesh for
//! Kubernetes workloads.

mod cli;
mod config;
mod daemon;
mod daemon_log;
mod kube;
mod paths;
mod portforward;
mod sessions;
mod version;
mod vpn;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command, DaemonCommand, PortForwardCommand, VpnCommand};
use config::Config;
use daemon::client::DaemonClient;
use daemon::dispatch::ShutdownKind;
use daemon::protocol::{PortForwardRequest, VpnVerb};
use daemon::PrivilegeMode;
use sessions::SessionRecord;
use std::process::Stdio;
use vpn::{VpnOptions, VpnStatusReport};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;
    match cli.command {
        Command::Daemon { command } => daemon_command(command, config).await,
        Command::PortForward { command } => port_forward_command(command, config).await,
        Command::Vpn { command } => vpn_command(command, config).await,
    }
}

fn mode_of(sudo: bool) -> PrivilegeMode {
    if sudo {
        PrivilegeMode::Sudo
    } else {
        PrivilegeMode::User
    }
}

/// Re-execs `daemon start` detached from the current terminal.
fn spawn_detached(sudo: bool) -> Result<()> {
    let exe = std::env::current_exe().context("Failed to locate the kubetun binary")?;
    let mut cmd = std::process::Command::new(&exe);
    cmd.args(["daemon", "start"]);
    if sudo {
        cmd.arg("--sudo");
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd.spawn()
        .with_context(|| format!("Failed to spawn {}", exe.display()))?;
    Ok(())
}

async fn daemon_command(command: DaemonCommand, config: Config) -> Result<()> {
    match command {
        DaemonCommand::Start { sudo, daemon } => {
            let mode = mode_of(sudo);
            if daemon {
                spawn_detached(sudo)?;
                println!("Started the {} daemon in the background", mode);
                return Ok(());
            }
            match daemon::server::run_daemon(mode, config).await {
                Ok(ShutdownKind::Stop) => Ok(()),
                Ok(ShutdownKind::Restart) => {
                    // The replacement takes over once this process releases
                    // the lock on exit.
                    spawn_detached(sudo)
                }
                Err(e) => {
                    // Losing the singleton race is not a failure; the caller
                    // wanted a daemon and one exists.
                    if daemon::lock::is_daemon_running(mode).unwrap_or(false) {
                        match daemon::lock::read_daemon_pid(mode) {
                            Ok(pid) => {
                                println!("A {} daemon is already running (pid {})", mode, pid)
                            }
                            Err(_) => println!("A {} daemon is already running", mode),
                        }
                        Ok(())
                    } else {
                        Err(e)
                    }
                }
            }
        }
        DaemonCommand::Stop { sudo } => {
            let mode = mode_of(sudo);
            DaemonClient::new(mode, config).stop_server().await?;
            println!("Stopped the {} daemon", mode);
            Ok(())
        }
        DaemonCommand::Restart { sudo } => {
            let mode = mode_of(sudo);
            DaemonClient::new(mode, config).restart_server().await?;
            println!("Restarting the {} daemon", mode);
            Ok(())
        }
        DaemonCommand::Status { sudo } => {
            let report = DaemonClient::new(mode_of(sudo), config)
                .server_status()
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        DaemonCommand::Info { sudo } => {
            let info = DaemonClient::new(mode_of(sudo), config).server_info().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
    }
}

async fn port_forward_command(command: PortForwardCommand, config: Config) -> Result<()> {
    match command {
        PortForwardCommand::Start {
            name,
            workload,
            port,
            container,
            workload_type,
            pod,
            namespace,
            kubeconfig,
            sudo,
        } => {
            let (local_port, remote_port) = cli::parse_port_pair(&port)?;
            let client = DaemonClient::new(mode_of(sudo), config);
            let record = client
                .port_forward_start(PortForwardRequest {
                    namespace,
                    application: name,
                    workload,
                    workload_type,
                    local_port,
                    remote_port,
                    container,
                    pod_name: pod,
                    kubeconfig,
                })
                .await?;
            println!("Port-forward {}: {}", record.key, record.status);
            if !record.reason.is_empty() {
                println!("  {}", record.reason);
            }
            Ok(())
        }
        PortForwardCommand::End {
            name,
            workload,
            port,
            namespace,
            sudo,
        } => {
            let client = DaemonClient::new(mode_of(sudo), config);
            client
                .port_forward_end(&namespace, &name, &workload, port)
                .await?;
            println!("Stopped port-forward on local port {}", port);
            Ok(())
        }
        PortForwardCommand::List {
            name,
            namespace,
            json,
            yaml,
            sudo,
        } => {
            let client = DaemonClient::new(mode_of(sudo), config);
            let sessions = client.port_forward_list(&namespace, &name).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else if yaml {
                print!("{}", serde_yaml::to_string(&sessions)?);
            } else {
                print_session_table(&sessions);
            }
            Ok(())
        }
    }
}

fn print_session_table(sessions: &[SessionRecord]) {
    if sessions.is_empty() {
        println!("No port-forwards");
        return;
    }
    println!(
        "{:<16} {:<12} {:<12} {:<12} {:<7} {:<5} {:<7} {:<25} REASON",
        "SERVICE", "TYPE", "PORT", "STATUS", "ROLE", "SUDO", "PID", "UPDATED"
    );
    for record in sessions {
        let ports = format!("{}:{}", record.key.local_port, record.key.remote_port);
        let status = record.status.to_string();
        let role = record.role.to_string();
        println!(
            "{:<16} {:<12} {:<12} {:<12} {:<7} {:<5} {:<7} {:<25} {}",
            record.key.workload,
            record.workload_type,
            ports,
            status,
            role,
            record.sudo,
            record.owner_daemon_pid,
            record.updated_at,
            record.reason
        );
    }
}

async fn vpn_command(command: VpnCommand, config: Config) -> Result<()> {
    // The mesh always lives in the elevated daemon.
    let client = DaemonClient::new(PrivilegeMode::Sudo, config);
    let report = match command {
        VpnCommand::Connect { options } => {
            client
                .vpn_operate(VpnVerb::Connect, vpn_options(options))
                .await?
        }
        VpnCommand::Disconnect { options } => {
            client
                .vpn_operate(VpnVerb::Disconnect, vpn_options(options))
                .await?
        }
        VpnCommand::Reconnect { options } => {
            client
                .vpn_operate(VpnVerb::Reconnect, vpn_options(options))
                .await?
        }
        VpnCommand::Status { .. } => client.vpn_status().await?,
    };
    print_vpn_report(&report);
    Ok(())
}

fn vpn_options(args: cli::VpnArgs) -> VpnOptions {
    VpnOptions {
        kubeconfig: args.kubeconfig,
        namespace: args.namespace,
        workloads: args.workloads,
    }
}

fn print_vpn_report(report: &VpnStatusReport) {
    println!("vpn: {}", report.status);
    if let Some(namespace) = &report.namespace {
        println!("  namespace: {}", namespace);
    }
    if let Some(kubeconfig) = &report.kubeconfig {
        println!("  kubeconfig: {}", kubeconfig.display());
    }
    if !report.workloads.is_empty() {
        println!("  workloads: {}", report.workloads.join(", "));
    }
    println!("  driver installed: {}", report.driver_installed);
    if !report.reason.is_empty() {
        println!("  reason: {}", report.reason);
    }
}
