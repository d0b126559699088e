use super::{ProfileStore, SessionKey, SessionRecord, SessionRole, SessionStatus};

fn record(namespace: &str, application: &str, workload: &str, local_port: u16) -> SessionRecord {
    SessionRecord::new(
        SessionKey {
            namespace: namespace.to_string(),
            application: application.to_string(),
            workload: workload.to_string(),
            local_port,
            remote_port: 80,
        },
        "deployment".to_string(),
        SessionRole::Daemon,
        false,
    )
}

#[test]
fn test_load_missing_profile_is_empty() {
    let tmp = tempfile::tempdir().unwrap();
    let store = ProfileStore::open(tmp.path());
    let profile = store.load("default", "bookinfo").unwrap();
    assert_eq!(profile.namespace, "default");
    assert!(profile.workloads.is_empty());
}

#[test]
fn test_upsert_then_list() {
    let tmp = tempfile::tempdir().unwrap();
    let store = ProfileStore::open(tmp.path());
    store.upsert_session(&record("default", "bookinfo", "ratings", 8080)).unwrap();
    store.upsert_session(&record("default", "bookinfo", "ratings", 8081)).unwrap();
    store.upsert_session(&record("default", "bookinfo", "web", 9090)).unwrap();

    let sessions = store.list_sessions("default", "bookinfo").unwrap();
    assert_eq!(sessions.len(), 3);

    let profile = store.load("default", "bookinfo").unwrap();
    assert_eq!(profile.workloads.len(), 2);
}

#[test]
fn test_upsert_replaces_existing_key() {
    let tmp = tempfile::tempdir().unwrap();
    let store = ProfileStore::open(tmp.path());
    let mut r = record("default", "bookinfo", "ratings", 8080);
    store.upsert_session(&r).unwrap();
    r.set_status(SessionStatus::Connected, "");
    store.upsert_session(&r).unwrap();

    let sessions = store.list_sessions("default", "bookinfo").unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Connected);
}

#[test]
fn test_remove_session() {
    let tmp = tempfile::tempdir().unwrap();
    let store = ProfileStore::open(tmp.path());
    let r = record("default", "bookinfo", "ratings", 8080);
    store.upsert_session(&r).unwrap();
    store.remove_session(&r.key).unwrap();
    assert!(store.list_sessions("default", "bookinfo").unwrap().is_empty());

    // Removing again is not an error.
    store.remove_session(&r.key).unwrap();
}

#[test]
fn test_list_all_spans_namespaces() {
    let tmp = tempfile::tempdir().unwrap();
    let store = ProfileStore::open(tmp.path());
    store.upsert_session(&record("default", "bookinfo", "ratings", 8080)).unwrap();
    store.upsert_session(&record("dev", "shop", "cart", 8081)).unwrap();
    assert_eq!(store.list_all_sessions().unwrap().len(), 2);
}

#[test]
fn test_list_all_skips_unreadable_profiles() {
    let tmp = tempfile::tempdir().unwrap();
    let store = ProfileStore::open(tmp.path());
    store.upsert_session(&record("default", "bookinfo", "ratings", 8080)).unwrap();
    let bad_dir = tmp.path().join("broken");
    std::fs::create_dir_all(&bad_dir).unwrap();
    std::fs::write(bad_dir.join("app.json"), "not json").unwrap();
    assert_eq!(store.list_all_sessions().unwrap().len(), 1);
}
