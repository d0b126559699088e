//! The background daemon: singleton lock, wire protocol, command dispatch,
//! the server loop, and the connect-or-spawn client.

pub mod client;
pub mod dispatch;
pub mod lock;
pub mod protocol;
pub mod server;

#[cfg(test)]
#[path = "tests/lock_tests.rs"]
mod lock_tests;

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod protocol_tests;

#[cfg(test)]
#[path = "tests/dispatch_tests.rs"]
mod dispatch_tests;

use serde::{Deserialize, Serialize};

/// Which of the two daemon singletons a path or endpoint belongs to.
///
/// One daemon runs per privilege mode: the user daemon owns ordinary
/// port-forwards, the sudo daemon owns everything that needs raw
/// tunnel-device access (the VPN mesh and sudo port-forwards).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrivilegeMode {
    User,
    Sudo,
}

impl PrivilegeMode {
    /// File-name suffix scoping per-mode paths.
    pub fn suffix(&self) -> &'static str {
        match self {
            PrivilegeMode::User => "user",
            PrivilegeMode::Sudo => "sudo",
        }
    }
}

impl std::fmt::Display for PrivilegeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.suffix())
    }
}
