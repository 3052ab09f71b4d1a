#![cfg(unix)]

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mcp_session::SessionOptions;
use mcpd::client::{self, RequestError};
use mcpd::dispatch::Dispatcher;
use mcpd::{Pool, ServerSpec};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

struct TestDaemon {
    dispatcher: Arc<Dispatcher>,
    socket: PathBuf,
    serve: tokio::task::JoinHandle<()>,
}

fn spawn_daemon(dir: &tempfile::TempDir) -> TestDaemon {
    let socket = dir.path().join("mcpd.sock");
    let listener = UnixListener::bind(&socket).expect("bind test socket");
    let pool = Arc::new(Pool::new(SessionOptions::default()));
    let dispatcher = Arc::new(Dispatcher::new(pool));
    let serve = tokio::spawn(
        dispatcher
            .clone()
            .serve(listener, Duration::from_secs(2)),
    );
    TestDaemon {
        dispatcher,
        socket,
        serve,
    }
}

async fn request(socket: &Path, request: Value) -> Value {
    client::roundtrip(socket, &request, Duration::from_secs(10))
        .await
        .map_err(RequestError::into_error)
        .expect("daemon round trip")
}

async fn teardown(daemon: TestDaemon) {
    daemon.dispatcher.trigger_shutdown();
    tokio::time::timeout(Duration::from_secs(5), daemon.serve)
        .await
        .expect("serve task completed")
        .expect("serve task ok");
}

#[tokio::test]
async fn start_call_status_stop_flow() {
    let dir = tempfile::tempdir().unwrap();
    let stub = common::write_stub(&dir);
    let command = common::stub_command_line(&stub, None);
    let id = ServerSpec::parse(&command).unwrap().id();
    let daemon = spawn_daemon(&dir);

    let response = request(
        &daemon.socket,
        serde_json::json!({ "command": "start", "server": id, "server_command": command }),
    )
    .await;
    assert_eq!(response["success"], true);
    assert_eq!(response["server"], id.as_str());

    let response = request(
        &daemon.socket,
        serde_json::json!({
            "command": "call",
            "server": id,
            "tool": "echo",
            "arguments": { "msg": "hi" },
        }),
    )
    .await;
    assert_eq!(response["success"], true);
    assert_eq!(response["result"]["content"][0]["text"], "hi");

    let status = request(&daemon.socket, serde_json::json!({ "command": "status" })).await;
    assert_eq!(status["status"], "running");
    assert_eq!(status["server_count"], 1);
    assert_eq!(status["on_demand"][0], id.as_str());
    assert!(status["auto_started"].as_array().unwrap().is_empty());

    let response = request(
        &daemon.socket,
        serde_json::json!({ "command": "stop", "server": id }),
    )
    .await;
    assert_eq!(response["success"], true);

    let status = request(&daemon.socket, serde_json::json!({ "command": "status" })).await;
    assert_eq!(status["server_count"], 0);

    teardown(daemon).await;
}

#[tokio::test]
async fn call_lazily_starts_when_full_spec_is_supplied() {
    let dir = tempfile::tempdir().unwrap();
    let stub = common::write_stub(&dir);
    let command = common::stub_command_line(&stub, None);
    let daemon = spawn_daemon(&dir);

    let response = request(
        &daemon.socket,
        serde_json::json!({
            "command": "call",
            "server_command": command,
            "tool": "echo",
            "arguments": { "msg": "lazy" },
        }),
    )
    .await;
    assert_eq!(response["success"], true);
    assert_eq!(response["result"]["content"][0]["text"], "lazy");

    teardown(daemon).await;
}

#[tokio::test]
async fn call_without_spec_for_unknown_id_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = spawn_daemon(&dir);

    let id = ServerSpec::parse("never-started").unwrap().id();
    let response = request(
        &daemon.socket,
        serde_json::json!({ "command": "call", "server": id, "tool": "echo" }),
    )
    .await;
    assert_eq!(response["success"], false);
    assert_eq!(response["kind"], "not_found");

    teardown(daemon).await;
}

#[tokio::test]
async fn malformed_requests_are_bad_requests() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = spawn_daemon(&dir);

    let mut stream = UnixStream::connect(&daemon.socket).await.unwrap();
    stream.write_all(b"this is not json\n").await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    let response: Value = serde_json::from_str(response.trim()).unwrap();
    assert_eq!(response["success"], false);
    assert_eq!(response["kind"], "bad_request");

    // Valid JSON missing a required field.
    let response = request(&daemon.socket, serde_json::json!({ "command": "stop" })).await;
    assert_eq!(response["kind"], "bad_request");

    // Unknown extra fields are fine.
    let response = request(
        &daemon.socket,
        serde_json::json!({ "command": "status", "unknown_field": 42 }),
    )
    .await;
    assert_eq!(response["status"], "running");

    teardown(daemon).await;
}

#[tokio::test]
async fn oversize_frame_is_rejected_and_connection_closed() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = spawn_daemon(&dir);

    let mut stream = UnixStream::connect(&daemon.socket).await.unwrap();
    let mut frame = vec![b'x'; 2 * 1024 * 1024];
    frame.push(b'\n');
    // The daemon may close the connection before the whole frame is
    // written; a broken pipe here is part of the expected behavior.
    let _ = stream.write_all(&frame).await;

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    let response: Value = serde_json::from_str(response.trim()).unwrap();
    assert_eq!(response["success"], false);
    assert_eq!(response["error"], "oversize");
    assert_eq!(response["kind"], "oversize");

    // The daemon itself is unaffected.
    let status = request(&daemon.socket, serde_json::json!({ "command": "status" })).await;
    assert_eq!(status["status"], "running");

    teardown(daemon).await;
}

#[tokio::test]
async fn concurrent_calls_share_one_session() {
    let dir = tempfile::tempdir().unwrap();
    let stub = common::write_stub(&dir);
    let command = common::stub_command_line(&stub, None);
    let daemon = spawn_daemon(&dir);

    let call = |msg: &str| {
        let socket = daemon.socket.clone();
        let request = serde_json::json!({
            "command": "call",
            "server_command": command,
            "tool": "echo",
            "arguments": { "msg": msg },
        });
        tokio::spawn(async move {
            client::roundtrip(&socket, &request, Duration::from_secs(10))
                .await
                .map_err(RequestError::into_error)
                .expect("round trip")
        })
    };

    let a = call("hi");
    let b = call("ho");
    let a = a.await.unwrap();
    let b = b.await.unwrap();
    assert_eq!(a["result"]["content"][0]["text"], "hi");
    assert_eq!(b["result"]["content"][0]["text"], "ho");

    let status = request(&daemon.socket, serde_json::json!({ "command": "status" })).await;
    assert_eq!(status["server_count"], 1);

    teardown(daemon).await;
}

#[tokio::test]
async fn list_all_reports_exactly_the_started_servers() {
    let dir = tempfile::tempdir().unwrap();
    let stub = common::write_stub(&dir);
    let command_a = common::stub_command_line(&stub, Some("a"));
    let command_b = common::stub_command_line(&stub, Some("b"));
    let id_a = ServerSpec::parse(&command_a).unwrap().id();
    let id_b = ServerSpec::parse(&command_b).unwrap().id();
    let daemon = spawn_daemon(&dir);

    for command in [&command_a, &command_b] {
        let response = request(
            &daemon.socket,
            serde_json::json!({ "command": "start", "server_command": command }),
        )
        .await;
        assert_eq!(response["success"], true);
    }

    let response = request(&daemon.socket, serde_json::json!({ "command": "list-all" })).await;
    assert_eq!(response["success"], true);
    assert_eq!(response["server_count"], 2);
    assert_eq!(response["total_tools"], 2);
    let servers = response["servers"].as_object().unwrap();
    assert_eq!(servers.len(), 2);
    assert_eq!(servers[id_a.as_str()]["tool_count"], 1);
    assert_eq!(servers[id_b.as_str()]["tool_count"], 1);

    teardown(daemon).await;
}

#[tokio::test]
async fn shutdown_returns_immediately_then_serve_drains() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = spawn_daemon(&dir);

    let response = request(&daemon.socket, serde_json::json!({ "command": "shutdown" })).await;
    assert_eq!(response["success"], true);

    tokio::time::timeout(Duration::from_secs(5), daemon.serve)
        .await
        .expect("serve task completed")
        .expect("serve task ok");
}
