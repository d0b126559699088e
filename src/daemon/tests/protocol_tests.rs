use super::protocol::{DaemonRequest, DaemonResponse, PortForwardRequest};
use crate::sessions::{SessionKey, SessionRecord, SessionRole};

#[test]
fn test_request_wire_format_is_tagged() {
    let json = serde_json::to_string(&DaemonRequest::GetServerInfo).unwrap();
    assert_eq!(json, r#"{"type":"GetServerInfo"}"#);

    let json = serde_json::to_string(&DaemonRequest::PortForwardList {
        namespace: "default".to_string(),
        application: "bookinfo".to_string(),
    })
    .unwrap();
    assert!(json.contains(r#""type":"PortForwardList""#));
    assert!(json.contains(r#""namespace":"default""#));
}

#[test]
fn test_unknown_request_is_a_decode_error() {
    assert!(serde_json::from_str::<DaemonRequest>(r#"{"type":"Bogus"}"#).is_err());
    assert!(serde_json::from_str::<DaemonRequest>("not json at all").is_err());
}

#[test]
fn test_port_forward_request_defaults_workload_type() {
    let request: DaemonRequest = serde_json::from_str(
        r#"{
            "type": "PortForwardStart",
            "namespace": "default",
            "application": "bookinfo",
            "workload": "ratings",
            "local_port": 8080,
            "remote_port": 80,
            "container": null,
            "pod_name": null,
            "kubeconfig": null
        }"#,
    )
    .unwrap();
    let DaemonRequest::PortForwardStart(PortForwardRequest { workload_type, .. }) = request else {
        panic!("decoded into the wrong variant");
    };
    assert_eq!(workload_type, "deployment");
}

#[test]
fn test_response_roundtrip() {
    let record = SessionRecord::new(
        SessionKey {
            namespace: "default".to_string(),
            application: "bookinfo".to_string(),
            workload: "ratings".to_string(),
            local_port: 8080,
            remote_port: 80,
        },
        "deployment".to_string(),
        SessionRole::Daemon,
        false,
    );
    let json = serde_json::to_string(&DaemonResponse::Sessions(vec![record])).unwrap();
    let decoded: DaemonResponse = serde_json::from_str(&json).unwrap();
    let DaemonResponse::Sessions(sessions) = decoded else {
        panic!("decoded into the wrong variant");
    };
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].key.local_port, 8080);
}

#[test]
fn test_error_response_carries_message() {
    let json = serde_json::to_string(&DaemonResponse::error("no such session")).unwrap();
    let decoded: DaemonResponse = serde_json::from_str(&json).unwrap();
    let DaemonResponse::Error { message } = decoded else {
        panic!("decoded into the wrong variant");
    };
    assert_eq!(message, "no such session");
}
