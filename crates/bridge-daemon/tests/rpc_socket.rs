//! End-to-end tests driving the control socket exactly as a real client
//! would: connect, write a newline-delimited JSON-RPC request, read a
//! newline-delimited response.
//!
//! Each test binds its own socket under a fresh temp directory so tests can
//! run concurrently without colliding.

use std::path::PathBuf;

use bridge_daemon::config::Config;
use bridge_daemon::startup::build_app_state;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// Spawn the dispatcher behind a real `UnixListener`, accepting connections
/// until the test's `JoinHandle` is dropped/aborted.
async fn spawn_server(state: bridge_daemon::state::SharedAppState) -> (PathBuf, tokio::task::JoinHandle<()>) {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("bridge.sock");
    std::mem::forget(dir);

    let listener = UnixListener::bind(&socket_path).unwrap();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let state = state.clone();
            tokio::spawn(bridge_daemon::rpc::serve_connection(state, stream));
        }
    });

    (socket_path, handle)
}

async fn test_config() -> Config {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.keystore.backend = "memory".to_owned();
    config.server.runtime_dir = dir.path().to_path_buf();
    std::mem::forget(dir);
    config
}

/// One request/response round trip over a freshly connected socket.
async fn call(socket_path: &PathBuf, method: &str, params: Value) -> Value {
    let mut stream = UnixStream::connect(socket_path).await.unwrap();
    let request = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
    let mut line = serde_json::to_vec(&request).unwrap();
    line.push(b'\n');
    stream.write_all(&line).await.unwrap();

    let (read_half, _write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let response_line = lines.next_line().await.unwrap().unwrap();
    serde_json::from_str(&response_line).unwrap()
}

#[tokio::test]
async fn credential_round_trip_over_the_socket() {
    let config = test_config().await;
    let (state, _enforcer) = build_app_state(&config).await.unwrap();
    let (socket_path, _server) = spawn_server(state).await;

    let stored = call(
        &socket_path,
        "credential.store",
        json!({ "id": "anthropic-default", "provider": "anthropic", "token": "sk-ant-xyz" }),
    )
    .await;
    assert_eq!(stored["result"]["id"], "anthropic-default");

    let retrieved = call(&socket_path, "credential.retrieve", json!({ "id": "anthropic-default" })).await;
    assert_eq!(retrieved["result"]["token"], "sk-ant-xyz");

    let deleted = call(&socket_path, "credential.delete", json!({ "id": "anthropic-default" })).await;
    assert_eq!(deleted["result"]["ok"], true);

    let missing = call(&socket_path, "credential.retrieve", json!({ "id": "anthropic-default" })).await;
    assert!(missing["error"].is_object());
}

#[tokio::test]
async fn session_and_token_round_trip_with_ttl_string() {
    let config = test_config().await;
    let (state, _enforcer) = build_app_state(&config).await.unwrap();
    let (socket_path, _server) = spawn_server(state).await;

    let created = call(
        &socket_path,
        "session.create",
        json!({ "container": "agent-1", "room": "room-1", "ttl": "10m" }),
    )
    .await;
    let session_id = created["result"]["sessionId"].as_str().unwrap().to_owned();

    let minted = call(&socket_path, "token.mint", json!({ "sessionId": session_id })).await;
    let token = minted["result"]["token"].as_str().unwrap().to_owned();

    let validated = call(&socket_path, "token.validate", json!({ "token": token })).await;
    assert_eq!(validated["result"]["sid"], session_id);
    assert_eq!(validated["result"]["rid"], "room-1");
}

#[tokio::test]
async fn budget_warns_then_hard_stops_then_reports_not_found() {
    let mut config = test_config().await;
    config.budget.default_token_limit = 100;
    config.budget.warning_threshold = 0.8;
    config.budget.hard_stop = true;
    let (state, _enforcer) = build_app_state(&config).await.unwrap();
    let (socket_path, _server) = spawn_server(state).await;

    let created = call(
        &socket_path,
        "session.create",
        json!({ "container": "agent-1", "room": "room-1", "ttl": "1h" }),
    )
    .await;
    let session_id = created["result"]["sessionId"].as_str().unwrap().to_owned();

    let warn_point = call(
        &socket_path,
        "budget.record",
        json!({ "sessionId": session_id, "in": 50, "out": 35, "model": "gpt-4o" }),
    )
    .await;
    assert_eq!(warn_point["result"]["ok"], true);

    let exceeded = call(
        &socket_path,
        "budget.record",
        json!({ "sessionId": session_id, "in": 10, "out": 10, "model": "gpt-4o" }),
    )
    .await;
    assert!(exceeded["error"].is_object());

    let after_stop = call(
        &socket_path,
        "budget.record",
        json!({ "sessionId": session_id, "in": 1, "out": 1, "model": "gpt-4o" }),
    )
    .await;
    assert_eq!(after_stop["error"]["code"], bridge_daemon::error::NOT_FOUND);
}

#[tokio::test]
async fn rate_limited_calls_are_denied_after_the_window_fills() {
    let mut config = test_config().await;
    config.security.rate_limit_calls = 3;
    config.security.rate_limit_window_secs = 60;
    let (state, _enforcer) = build_app_state(&config).await.unwrap();
    let (socket_path, _server) = spawn_server(state).await;

    for n in 0..3 {
        let started = call(
            &socket_path,
            "call.start",
            json!({ "roomId": "room-1", "offerSdp": "v=0", "principal": "alice" }),
        )
        .await;
        assert!(started["result"].is_object(), "call {n} should have been admitted");
    }

    let denied = call(
        &socket_path,
        "call.start",
        json!({ "roomId": "room-1", "offerSdp": "v=0", "principal": "alice" }),
    )
    .await;
    assert_eq!(denied["error"]["code"], bridge_daemon::error::RATE_LIMITED);

    let recent = state.audit.recent(10).await;
    let denial = recent
        .iter()
        .find(|r| r.action == bridge_core::audit::AuditAction::AdmissionDenied)
        .expect("an access_denied audit record should have been emitted");
    assert_eq!(denial.outcome, bridge_core::audit::AuditOutcome::Denied);
    assert_eq!(denial.actor, "alice");
    assert_eq!(denial.detail.get("rule").and_then(Value::as_str), Some("rate_limit"));
}

#[tokio::test]
async fn blocked_container_is_denied_before_session_create() {
    let mut config = test_config().await;
    config.security.block_principals = vec!["evil-agent".to_owned()];
    let (state, _enforcer) = build_app_state(&config).await.unwrap();
    let (socket_path, _server) = spawn_server(state.clone()).await;

    let denied = call(
        &socket_path,
        "session.create",
        json!({ "container": "evil-agent", "room": "room-1", "ttl": "10m" }),
    )
    .await;
    assert_eq!(denied["error"]["code"], bridge_daemon::error::POLICY_VIOLATION);
    assert!(state.sessions.list().await.is_empty());

    let recent = state.audit.recent(10).await;
    let denial = recent
        .iter()
        .find(|r| r.action == bridge_core::audit::AuditAction::AdmissionDenied)
        .expect("an access_denied audit record should have been emitted");
    assert_eq!(denial.detail.get("rule").and_then(Value::as_str), Some("principal:evil-agent"));
}

#[tokio::test]
async fn ttl_sweep_expires_a_short_lived_session() {
    let config = test_config().await;
    let (state, enforcer) = build_app_state(&config).await.unwrap();
    let (socket_path, _server) = spawn_server(state.clone()).await;

    let created = call(
        &socket_path,
        "session.create",
        json!({ "container": "agent-1", "room": "room-1", "ttl": 1 }),
    )
    .await;
    let session_id = created["result"]["sessionId"].as_str().unwrap().to_owned();

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let report = enforcer.sweep_once().await;
    assert_eq!(report.sessions_expired, 1);

    let status = call(&socket_path, "status", json!({})).await;
    assert_eq!(status["result"]["sessions"], 1);

    let ended = call(&socket_path, "session.end", json!({ "sessionId": session_id })).await;
    assert!(ended["result"].is_object());
}

#[tokio::test]
async fn call_lifecycle_reaches_connected_and_rejects_a_second_answer() {
    let config = test_config().await;
    let (state, _enforcer) = build_app_state(&config).await.unwrap();
    let (socket_path, _server) = spawn_server(state).await;

    let started = call(
        &socket_path,
        "call.start",
        json!({ "roomId": "room-1", "offerSdp": "v=0", "principal": "alice", "callee": "bob" }),
    )
    .await;
    let call_id = started["result"]["id"].as_str().unwrap().to_owned();
    assert_eq!(started["result"]["state"], "Invite");

    let answered = call(
        &socket_path,
        "call.answer",
        json!({ "callId": call_id, "answerSdp": "v=0" }),
    )
    .await;
    assert_eq!(answered["result"]["ok"], true);

    let second_answer = call(
        &socket_path,
        "call.answer",
        json!({ "callId": call_id, "answerSdp": "v=0" }),
    )
    .await;
    assert!(second_answer["error"].is_object());

    let unauthorized_candidates = call(
        &socket_path,
        "call.candidates",
        json!({ "callId": call_id, "sender": "mallory", "candidates": ["c1"] }),
    )
    .await;
    assert_eq!(unauthorized_candidates["error"]["code"], bridge_daemon::error::UNAUTHORIZED);

    let authorized_candidates = call(
        &socket_path,
        "call.candidates",
        json!({ "callId": call_id, "sender": "alice", "candidates": ["c1"] }),
    )
    .await;
    assert_eq!(authorized_candidates["result"]["ok"], true);
}
