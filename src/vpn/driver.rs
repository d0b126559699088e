//! Platform tunnel-driver lifecycle behind a capability interface.
//!
//! Only Windows needs a user-space virtual network driver (wintun.dll next
//! to the executable); everywhere else the kernel provides the tun device
//! and the driver is a no-op. The manager stays platform-agnostic and talks
//! to whichever implementation `platform_driver` returns.

use anyhow::Result;
use std::path::PathBuf;

pub trait TunnelDriver: Send + Sync {
    fn name(&self) -> &str;
    /// Whether the driver artifact is already in place.
    fn is_installed(&self) -> bool;
    fn install(&self) -> Result<()>;
    fn uninstall(&self) -> Result<()>;
    /// On-disk artifact, if the platform has one. Used as a relocation
    /// fallback when uninstall keeps failing.
    fn artifact_path(&self) -> Option<PathBuf>;
}

/// Selects the driver implementation for the running OS.
pub fn platform_driver() -> std::sync::Arc<dyn TunnelDriver> {
    #[cfg(windows)]
    {
        std::sync::Arc::new(WintunDriver::new())
    }
    #[cfg(not(windows))]
    {
        std::sync::Arc::new(NullDriver)
    }
}

/// Platforms where the kernel provides the tun device.
#[cfg(not(windows))]
pub struct NullDriver;

#[cfg(not(windows))]
impl TunnelDriver for NullDriver {
    fn name(&self) -> &str {
        "none"
    }

    fn is_installed(&self) -> bool {
        true
    }

    fn install(&self) -> Result<()> {
        Ok(())
    }

    fn uninstall(&self) -> Result<()> {
        Ok(())
    }

    fn artifact_path(&self) -> Option<PathBuf> {
        None
    }
}

/// wintun.dll lifecycle: the dll must sit next to the executable while the
/// mesh is up, and is removed again on disconnect.
#[cfg(windows)]
pub struct WintunDriver {
    dll: PathBuf,
}

#[cfg(windows)]
impl WintunDriver {
    pub fn new() -> Self {
        let dll = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("wintun.dll")))
            .unwrap_or_else(|| PathBuf::from("wintun.dll"));
        Self { dll }
    }
}

#[cfg(windows)]
impl TunnelDriver for WintunDriver {
    fn name(&self) -> &str {
        "wintun"
    }

    fn is_installed(&self) -> bool {
        self.dll.exists()
    }

    fn install(&self) -> Result<()> {
        use anyhow::{bail, Context};
        if self.dll.exists() {
            return Ok(());
        }
        // The dll ships alongside the release archive; install means copying
        // it from the home directory cache next to the executable.
        let cached = crate::paths::kubetun_home_dir()?.join("wintun.dll");
        if !cached.exists() {
            bail!(
                "wintun.dll not found at {}; reinstall the release archive",
                cached.display()
            );
        }
        std::fs::copy(&cached, &self.dll)
            .with_context(|| format!("Failed to install {}", self.dll.display()))?;
        Ok(())
    }

    fn uninstall(&self) -> Result<()> {
        use anyhow::Context;
        if !self.dll.exists() {
            return Ok(());
        }
        std::fs::remove_file(&self.dll)
            .with_context(|| format!("Failed to remove {}", self.dll.display()))
    }

    fn artifact_path(&self) -> Option<PathBuf> {
        Some(self.dll.clone())
    }
}
