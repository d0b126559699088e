//! Privilege checks for operations that need raw tunnel-device access.

/// True when the current process runs with elevated privileges.
#[cfg(unix)]
pub fn is_elevated() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(windows)]
pub fn is_elevated() -> bool {
    #[link(name = "shell32")]
    extern "system" {
        fn IsUserAnAdmin() -> i32;
    }
    unsafe { IsUserAnAdmin() != 0 }
}

/// Actionable text telling the caller how to re-invoke elevated.
pub fn elevation_hint() -> &'static str {
    if cfg!(windows) {
        "re-run the command from an Administrator prompt"
    } else {
        "re-run the command with sudo, e.g. `sudo kubetun vpn connect ...`"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_names_a_reinvocation() {
        assert!(elevation_hint().contains("re-run"));
    }
}
