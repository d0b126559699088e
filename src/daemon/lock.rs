//! Singleton lock and pid registry for the daemon.
//!
//! Liveness is the OS advisory lock itself, not the pid file: the lock is
//! released by the kernel when the holder dies, so a crashed daemon never
//! leaves a stale "running" state behind. The pid file exists only to name
//! the holder in messages and `daemon info`.

use super::PrivilegeMode;
use crate::paths;
use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open lock file: {}", path.display()))
}

/// Probes whether a daemon currently holds the lock for this mode.
///
/// Taking and immediately releasing the lock is safe: a daemon that starts
/// in the probe window will simply win the lock itself.
pub fn is_daemon_running(mode: PrivilegeMode) -> Result<bool> {
    let file = open_lock_file(&paths::daemon_lock_path(mode)?)?;
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = fs2::FileExt::unlock(&file);
            Ok(false)
        }
        Err(_) => Ok(true),
    }
}

/// Pid written by the running daemon for this mode, if any.
pub fn read_daemon_pid(mode: PrivilegeMode) -> Result<u32> {
    let path = paths::daemon_pid_path(mode)?;
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read pid file: {}", path.display()))?;
    content
        .trim()
        .parse()
        .with_context(|| format!("Malformed pid file: {}", path.display()))
}

/// Held for the lifetime of a serving daemon. Acquiring fails when another
/// daemon of the same mode already holds the lock.
#[derive(Debug)]
pub struct DaemonLock {
    // Keeps the advisory lock alive; released on drop/death.
    _file: File,
    pid_path: PathBuf,
}

impl DaemonLock {
    pub fn acquire(mode: PrivilegeMode) -> Result<Self> {
        let file = open_lock_file(&paths::daemon_lock_path(mode)?)?;
        if file.try_lock_exclusive().is_err() {
            match read_daemon_pid(mode) {
                Ok(pid) => bail!("A {} daemon is already running (pid {})", mode, pid),
                Err(_) => bail!("A {} daemon is already running", mode),
            }
        }
        let pid_path = paths::daemon_pid_path(mode)?;
        fs::write(&pid_path, std::process::id().to_string())
            .with_context(|| format!("Failed to write pid file: {}", pid_path.display()))?;
        Ok(Self {
            _file: file,
            pid_path,
        })
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.pid_path);
    }
}

/// Blocks until this process holds the spawn lock for a mode.
///
/// Clients take this around probe-then-spawn so concurrent CLI invocations
/// race the lock instead of each spawning a daemon. Dropping the file
/// releases it.
pub fn acquire_spawn_lock(mode: PrivilegeMode) -> Result<File> {
    let file = open_lock_file(&paths::daemon_spawn_lock_path(mode)?)?;
    file.lock_exclusive()
        .context("Failed to take the daemon spawn lock")?;
    Ok(file)
}

/// Whether a pid names a live process.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // Signal 0 probes existence without delivering anything.
    unsafe { nix::libc::kill(pid as i32, 0) == 0 }
}

#[cfg(windows)]
pub fn is_process_alive(pid: u32) -> bool {
    const PROCESS_QUERY_LIMITED_INFORMATION: u32 = 0x1000;
    const STILL_ACTIVE: u32 = 259;
    #[link(name = "kernel32")]
    extern "system" {
        fn OpenProcess(access: u32, inherit: i32, pid: u32) -> isize;
        fn GetExitCodeProcess(handle: isize, code: *mut u32) -> i32;
        fn CloseHandle(handle: isize) -> i32;
    }
    if pid == 0 {
        return false;
    }
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle == 0 {
            return false;
        }
        let mut code = 0u32;
        let ok = GetExitCodeProcess(handle, &mut code);
        CloseHandle(handle);
        ok != 0 && code == STILL_ACTIVE
    }
}
