#![cfg(unix)]

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mcp_session::SessionOptions;
use mcpd::client::{ClientOptions, ToolClient};
use mcpd::dispatch::Dispatcher;
use mcpd::Pool;
use tokio::net::UnixListener;

fn client(socket: &Path, no_daemon: bool) -> ToolClient {
    let mut options = ClientOptions::new(socket.to_path_buf());
    options.no_daemon = no_daemon;
    options.probe_timeout = Duration::from_millis(500);
    ToolClient::new(options)
}

#[tokio::test]
async fn missing_daemon_falls_back_to_direct_mode() {
    let dir = tempfile::tempdir().unwrap();
    let stub = common::write_stub(&dir);
    let command = common::stub_command_line(&stub, None);
    let socket = dir.path().join("absent.sock");

    let client = client(&socket, false);

    let tools = client.list_tools(&command).await.expect("list ok");
    let tools = tools.as_array().expect("tools array");
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], "echo");

    let result = client
        .call_tool(&command, "echo", serde_json::json!({ "msg": "direct" }), None)
        .await
        .expect("call ok");
    assert_eq!(result["content"][0]["text"], "direct");
}

#[tokio::test]
async fn dead_socket_file_falls_back_silently() {
    let dir = tempfile::tempdir().unwrap();
    let stub = common::write_stub(&dir);
    let command = common::stub_command_line(&stub, None);

    // Socket file exists but nothing is listening.
    let socket = dir.path().join("stale.sock");
    let stale = std::os::unix::net::UnixListener::bind(&socket).unwrap();
    drop(stale);

    let client = client(&socket, false);
    let result = client
        .call_tool(&command, "echo", serde_json::json!({ "msg": "fallback" }), None)
        .await
        .expect("call ok via fallback");
    assert_eq!(result["content"][0]["text"], "fallback");
}

#[tokio::test]
async fn daemon_and_direct_paths_return_identical_payloads() {
    let dir = tempfile::tempdir().unwrap();
    let stub = common::write_stub(&dir);
    let command = common::stub_command_line(&stub, None);

    let socket = dir.path().join("mcpd.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    let pool = Arc::new(Pool::new(SessionOptions::default()));
    let dispatcher = Arc::new(Dispatcher::new(pool));
    let serve = tokio::spawn(dispatcher.clone().serve(listener, Duration::from_secs(2)));

    let via_daemon = client(&socket, false);
    let via_direct = client(&socket, true);

    let daemon_tools = via_daemon.list_tools(&command).await.expect("daemon list");
    let direct_tools = via_direct.list_tools(&command).await.expect("direct list");
    assert_eq!(daemon_tools, direct_tools);

    let arguments = serde_json::json!({ "msg": "same" });
    let daemon_result = via_daemon
        .call_tool(&command, "echo", arguments.clone(), None)
        .await
        .expect("daemon call");
    let direct_result = via_direct
        .call_tool(&command, "echo", arguments, None)
        .await
        .expect("direct call");
    assert_eq!(daemon_result, direct_result);

    dispatcher.trigger_shutdown();
    tokio::time::timeout(Duration::from_secs(5), serve)
        .await
        .expect("serve completed")
        .expect("serve ok");
}

#[tokio::test]
async fn no_daemon_flag_never_touches_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let stub = common::write_stub(&dir);
    let command = common::stub_command_line(&stub, None);

    let socket = dir.path().join("mcpd.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    let pool = Arc::new(Pool::new(SessionOptions::default()));
    let dispatcher = Arc::new(Dispatcher::new(pool.clone()));
    let serve = tokio::spawn(dispatcher.clone().serve(listener, Duration::from_secs(2)));

    let client = client(&socket, true);
    let result = client
        .call_tool(&command, "echo", serde_json::json!({ "msg": "x" }), None)
        .await
        .expect("direct call ok");
    assert_eq!(result["content"][0]["text"], "x");

    // Direct mode must not have populated the daemon's pool.
    assert!(pool.list_ids().is_empty());

    dispatcher.trigger_shutdown();
    tokio::time::timeout(Duration::from_secs(5), serve)
        .await
        .expect("serve completed")
        .expect("serve ok");
}
