use super::{ProfileStore, SessionKey, SessionRecord, SessionRegistry, SessionRole, SessionStatus};

fn key(local_port: u16) -> SessionKey {
    SessionKey {
        namespace: "default".to_string(),
        application: "bookinfo".to_string(),
        workload: "ratings".to_string(),
        local_port,
        remote_port: 80,
    }
}

fn record(local_port: u16) -> SessionRecord {
    SessionRecord::new(
        key(local_port),
        "deployment".to_string(),
        SessionRole::Daemon,
        false,
    )
}

#[test]
fn test_upsert_is_written_through() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = SessionRegistry::new(ProfileStore::open(tmp.path()));
    registry.upsert(record(8080)).unwrap();

    // A fresh store over the same root must already see the session.
    let fresh = ProfileStore::open(tmp.path());
    let persisted = fresh.list_sessions("default", "bookinfo").unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].key, key(8080));
}

#[test]
fn test_update_status_persists_transition() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = SessionRegistry::new(ProfileStore::open(tmp.path()));
    registry.upsert(record(8080)).unwrap();
    registry
        .update_status(&key(8080), SessionStatus::Connected, "")
        .unwrap();

    let fresh = ProfileStore::open(tmp.path());
    let persisted = fresh.list_sessions("default", "bookinfo").unwrap();
    assert_eq!(persisted[0].status, SessionStatus::Connected);
}

#[test]
fn test_update_status_unknown_key_is_noop() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = SessionRegistry::new(ProfileStore::open(tmp.path()));
    registry
        .update_status(&key(8080), SessionStatus::Connected, "")
        .unwrap();
    assert!(registry.get(&key(8080)).is_none());
    let fresh = ProfileStore::open(tmp.path());
    assert!(fresh.list_sessions("default", "bookinfo").unwrap().is_empty());
}

#[test]
fn test_remove_deletes_persisted_record() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = SessionRegistry::new(ProfileStore::open(tmp.path()));
    registry.upsert(record(8080)).unwrap();
    registry.remove(&key(8080)).unwrap();
    assert!(registry.get(&key(8080)).is_none());
    let fresh = ProfileStore::open(tmp.path());
    assert!(fresh.list_sessions("default", "bookinfo").unwrap().is_empty());
}

#[test]
fn test_list_filters_by_application() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = SessionRegistry::new(ProfileStore::open(tmp.path()));
    registry.upsert(record(8080)).unwrap();
    assert_eq!(registry.list("default", "bookinfo").len(), 1);
    assert!(registry.list("default", "other").is_empty());
}

#[test]
fn test_list_reconciled_marks_dead_owner_stale() {
    let tmp = tempfile::tempdir().unwrap();
    // Session persisted by a daemon that no longer exists.
    let mut orphan = record(8080);
    orphan.owner_daemon_pid = 0;
    orphan.set_status(SessionStatus::Connected, "");
    ProfileStore::open(tmp.path()).upsert_session(&orphan).unwrap();

    let registry = SessionRegistry::new(ProfileStore::open(tmp.path()));
    let sessions = registry.list_reconciled("default", "bookinfo").unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Stopped);
    assert!(sessions[0].reason.contains("stale"));
}

#[test]
fn test_list_reconciled_prefers_live_state() {
    let tmp = tempfile::tempdir().unwrap();
    let registry = SessionRegistry::new(ProfileStore::open(tmp.path()));
    registry.upsert(record(8080)).unwrap();
    registry
        .update_status(&key(8080), SessionStatus::Connected, "")
        .unwrap();
    let sessions = registry.list_reconciled("default", "bookinfo").unwrap();
    assert_eq!(sessions[0].status, SessionStatus::Connected);
    assert_eq!(sessions[0].owner_daemon_pid, std::process::id());
}
