use super::lock::{is_daemon_running, is_process_alive, read_daemon_pid, DaemonLock};
use super::PrivilegeMode;
use serial_test::serial;

fn test_home() -> tempfile::TempDir {
    let home = tempfile::tempdir().unwrap();
    std::env::set_var("KUBETUN_HOME", home.path());
    home
}

#[test]
#[serial]
fn test_acquire_marks_daemon_running() {
    let _home = test_home();
    assert!(!is_daemon_running(PrivilegeMode::User).unwrap());

    let lock = DaemonLock::acquire(PrivilegeMode::User).unwrap();
    assert!(is_daemon_running(PrivilegeMode::User).unwrap());
    assert_eq!(read_daemon_pid(PrivilegeMode::User).unwrap(), std::process::id());

    drop(lock);
    assert!(!is_daemon_running(PrivilegeMode::User).unwrap());
    assert!(read_daemon_pid(PrivilegeMode::User).is_err());
}

#[test]
#[serial]
fn test_second_acquire_fails() {
    let _home = test_home();
    let _lock = DaemonLock::acquire(PrivilegeMode::User).unwrap();
    let err = DaemonLock::acquire(PrivilegeMode::User).unwrap_err();
    assert!(err.to_string().contains("already running"));
}

#[test]
#[serial]
fn test_privilege_modes_are_independent() {
    let _home = test_home();
    let _user = DaemonLock::acquire(PrivilegeMode::User).unwrap();
    assert!(!is_daemon_running(PrivilegeMode::Sudo).unwrap());
    let _sudo = DaemonLock::acquire(PrivilegeMode::Sudo).unwrap();
    assert!(is_daemon_running(PrivilegeMode::Sudo).unwrap());
}

#[test]
fn test_is_process_alive() {
    assert!(is_process_alive(std::process::id()));
    assert!(!is_process_alive(0));
}
