//! Command-line surface.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kubetun", version, about = "Daemon-mediated Kubernetes tunnels")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Manage the background daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
    /// Manage port-forward sessions
    PortForward {
        #[command(subcommand)]
        command: PortForwardCommand,
    },
    /// Manage the VPN mesh connection
    Vpn {
        #[command(subcommand)]
        command: VpnCommand,
    },
}

#[derive(Subcommand)]
pub enum DaemonCommand {
    /// Run a daemon (or background one with --daemon)
    Start {
        /// Run the elevated daemon
        #[arg(long)]
        sudo: bool,
        /// Re-exec detached and return immediately
        #[arg(long)]
        daemon: bool,
    },
    /// Ask the daemon to exit
    Stop {
        #[arg(long)]
        sudo: bool,
    },
    /// Ask the daemon to exit and start a replacement
    Restart {
        #[arg(long)]
        sudo: bool,
    },
    /// Structured report of pid, uptime and session counts
    Status {
        #[arg(long)]
        sudo: bool,
    },
    /// Identity of the running daemon
    Info {
        #[arg(long)]
        sudo: bool,
    },
}

#[derive(Subcommand)]
pub enum PortForwardCommand {
    /// Start or resume a session
    Start {
        /// Application name
        name: String,
        /// Workload the tunnel targets
        #[arg(short = 'd', long = "deployment")]
        workload: String,
        /// LOCAL:REMOTE port pair, e.g. 8080:80
        #[arg(short = 'p', long = "port")]
        port: String,
        #[arg(short = 'c', long)]
        container: Option<String>,
        /// Workload type (deployment, statefulset, ...)
        #[arg(long = "type", default_value = "deployment")]
        workload_type: String,
        /// Pin a specific pod instead of resolving one
        #[arg(long)]
        pod: Option<String>,
        #[arg(short = 'n', long, default_value = "default")]
        namespace: String,
        #[arg(long)]
        kubeconfig: Option<PathBuf>,
        /// Route through the elevated daemon
        #[arg(long)]
        sudo: bool,
    },
    /// Stop a session by local port
    End {
        name: String,
        #[arg(short = 'd', long = "deployment")]
        workload: String,
        /// Local port of the session to stop
        #[arg(short = 'p', long = "port")]
        port: u16,
        #[arg(short = 'n', long, default_value = "default")]
        namespace: String,
        #[arg(long)]
        sudo: bool,
    },
    /// List sessions for an application
    List {
        name: String,
        #[arg(short = 'n', long, default_value = "default")]
        namespace: String,
        #[arg(long, conflicts_with = "yaml")]
        json: bool,
        #[arg(long)]
        yaml: bool,
        #[arg(long)]
        sudo: bool,
    },
}

#[derive(Subcommand)]
pub enum VpnCommand {
    /// Establish the mesh connection (requires elevation)
    Connect {
        #[command(flatten)]
        options: VpnArgs,
    },
    /// Tear down the mesh connection
    Disconnect {
        #[command(flatten)]
        options: VpnArgs,
    },
    /// Re-establish with the last-known options (requires elevation)
    Reconnect {
        #[command(flatten)]
        options: VpnArgs,
    },
    /// Read-only state dump
    Status {
        #[command(flatten)]
        options: VpnArgs,
    },
}

#[derive(Args)]
pub struct VpnArgs {
    #[arg(long)]
    pub kubeconfig: PathBuf,
    #[arg(short = 'n', long, default_value = "default")]
    pub namespace: String,
    /// Workload selectors routed through the mesh
    #[arg(long = "workloads", num_args = 0..)]
    pub workloads: Vec<String>,
}

/// Parses a `LOCAL:REMOTE` port pair.
pub fn parse_port_pair(spec: &str) -> Result<(u16, u16)> {
    let Some((local, remote)) = spec.split_once(':') else {
        bail!("Invalid port pair {:?}: expected LOCAL:REMOTE, e.g. 8080:80", spec);
    };
    let local = local
        .parse()
        .with_context(|| format!("Invalid local port {:?}", local))?;
    let remote = remote
        .parse()
        .with_context(|| format!("Invalid remote port {:?}", remote))?;
    Ok((local, remote))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_pair() {
        assert_eq!(parse_port_pair("8080:80").unwrap(), (8080, 80));
    }

    #[test]
    fn test_parse_port_pair_rejects_bad_syntax() {
        assert!(parse_port_pair("8080").is_err());
        assert!(parse_port_pair("8080:http").is_err());
        assert!(parse_port_pair("99999:80").is_err());
    }

    #[test]
    fn test_cli_parses_port_forward_start() {
        let cli = Cli::try_parse_from([
            "kubetun",
            "port-forward",
            "start",
            "bookinfo",
            "-d",
            "ratings",
            "-p",
            "8080:80",
        ])
        .unwrap();
        let Command::PortForward {
            command:
                PortForwardCommand::Start {
                    name,
                    workload,
                    port,
                    namespace,
                    ..
                },
        } = cli.command
        else {
            panic!("parsed into the wrong command");
        };
        assert_eq!(name, "bookinfo");
        assert_eq!(workload, "ratings");
        assert_eq!(port, "8080:80");
        assert_eq!(namespace, "default");
    }

    #[test]
    fn test_cli_parses_vpn_connect() {
        let cli = Cli::try_parse_from([
            "kubetun",
            "vpn",
            "connect",
            "--kubeconfig",
            "/tmp/kc",
            "-n",
            "dev",
            "--workloads",
            "deployment/ratings",
            "deployment/web",
        ])
        .unwrap();
        let Command::Vpn {
            command: VpnCommand::Connect { options },
        } = cli.command
        else {
            panic!("parsed into the wrong command");
        };
        assert_eq!(options.namespace, "dev");
        assert_eq!(options.workloads.len(), 2);
    }
}
