//! Port-forward engine: keeps one local<->remote tunnel alive per session.

pub mod engine;
pub mod tunnel;

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod engine_tests;

pub use engine::PortForwardManager;
pub use tunnel::{KubectlTunnel, Tunnel, TunnelSpec};

/// Value carried on the per-session stop channel.
///
/// `EndSession` removes the durable record (explicit `port-forward end`);
/// `DaemonExit` leaves it in place so the next daemon can recover it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Run,
    EndSession,
    DaemonExit,
}
