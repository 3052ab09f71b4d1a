//! Transparent daemon-or-direct client.
//!
//! Every call probes the daemon socket under a short deadline and forwards
//! the request when the daemon answers; any failure before the real request
//! has been sent silently degrades to a one-shot direct-spawn session. Both
//! paths return the same payload for the same inputs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use mcp_session::{Session, SessionOptions};
use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::protocol;
use crate::server::ServerSpec;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub socket_path: PathBuf,
    /// Force direct mode, never touching the daemon.
    pub no_daemon: bool,
    /// Emit one stderr line naming the chosen path per call.
    pub verbose: bool,
    pub probe_timeout: Duration,
    pub control_timeout: Duration,
    pub call_timeout: Duration,
    pub session_options: SessionOptions,
}

impl ClientOptions {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            no_daemon: false,
            verbose: false,
            probe_timeout: Duration::from_secs(1),
            control_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            session_options: SessionOptions::default(),
        }
    }
}

/// Why a daemon round trip failed, split at the point of no return: once
/// the request has been written, falling back could run a tool twice.
#[derive(Debug)]
pub enum RequestError {
    BeforeSend(anyhow::Error),
    AfterSend(anyhow::Error),
}

impl RequestError {
    pub fn into_error(self) -> anyhow::Error {
        match self {
            RequestError::BeforeSend(err) | RequestError::AfterSend(err) => err,
        }
    }
}

/// Connects, sends one request, reads one response.
pub async fn roundtrip(
    socket: &Path,
    request: &Value,
    timeout: Duration,
) -> Result<Value, RequestError> {
    let mut stream = match tokio::time::timeout(timeout, UnixStream::connect(socket)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            return Err(RequestError::BeforeSend(
                anyhow::Error::new(err).context("connect to daemon"),
            ));
        }
        Err(_) => {
            return Err(RequestError::BeforeSend(anyhow::anyhow!(
                "daemon connect timed out after {timeout:?}"
            )));
        }
    };

    let mut line = match serde_json::to_string(request) {
        Ok(line) => line,
        Err(err) => {
            return Err(RequestError::BeforeSend(
                anyhow::Error::new(err).context("serialize daemon request"),
            ));
        }
    };
    line.push('\n');
    match tokio::time::timeout(timeout, stream.write_all(line.as_bytes())).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            return Err(RequestError::BeforeSend(
                anyhow::Error::new(err).context("send daemon request"),
            ));
        }
        Err(_) => {
            return Err(RequestError::BeforeSend(anyhow::anyhow!(
                "daemon write timed out after {timeout:?}"
            )));
        }
    }

    // The daemon now owns the request; everything past this point is final.
    let mut reader = BufReader::new(stream);
    let frame = match tokio::time::timeout(timeout, protocol::read_frame(&mut reader)).await {
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => {
            return Err(RequestError::AfterSend(anyhow::anyhow!(
                "daemon closed the connection without a response"
            )));
        }
        Ok(Err(protocol::FrameError::Oversize)) => {
            return Err(RequestError::AfterSend(anyhow::anyhow!(
                "daemon response exceeded the frame limit"
            )));
        }
        Ok(Err(protocol::FrameError::Io(err))) => {
            return Err(RequestError::AfterSend(
                anyhow::Error::new(err).context("read daemon response"),
            ));
        }
        Err(_) => {
            return Err(RequestError::AfterSend(anyhow::anyhow!(
                "daemon response timed out after {timeout:?}"
            )));
        }
    };

    serde_json::from_slice(&frame)
        .map_err(|err| RequestError::AfterSend(anyhow::Error::new(err).context("parse daemon response")))
}

/// True when something on the socket answers `status` with
/// `status == "running"` within `timeout`.
pub async fn daemon_available(socket: &Path, timeout: Duration) -> bool {
    if !socket.exists() {
        return false;
    }
    let request = serde_json::json!({ "command": "status" });
    match roundtrip(socket, &request, timeout).await {
        Ok(response) => response["status"] == "running",
        Err(_) => false,
    }
}

/// One `status` round trip with control-command semantics.
pub async fn daemon_status(socket: &Path, timeout: Duration) -> anyhow::Result<Value> {
    let request = serde_json::json!({ "command": "status" });
    roundtrip(socket, &request, timeout)
        .await
        .map_err(RequestError::into_error)
        .context("daemon status")
}

/// Sends `shutdown`; returns the daemon's (immediate) acknowledgement.
pub async fn shutdown_daemon(socket: &Path, timeout: Duration) -> anyhow::Result<Value> {
    let request = serde_json::json!({ "command": "shutdown" });
    roundtrip(socket, &request, timeout)
        .await
        .map_err(RequestError::into_error)
        .context("daemon shutdown")
}

pub struct ToolClient {
    options: ClientOptions,
}

impl ToolClient {
    pub fn new(options: ClientOptions) -> Self {
        Self { options }
    }

    /// Lists tools of `server_command`, via the daemon when it is usable.
    /// Returns the `tools` array.
    pub async fn list_tools(&self, server_command: &str) -> anyhow::Result<Value> {
        let spec = ServerSpec::parse(server_command)
            .map_err(|err| anyhow::anyhow!("invalid server command: {err}"))?;

        if self.daemon_usable().await {
            self.note_path("daemon");
            let request = serde_json::json!({
                "command": "list",
                "server": spec.id(),
                "server_command": server_command,
            });
            // Lazy-start (a full handshake) plus the daemon-side list
            // deadline can exceed a bare control timeout.
            let socket_deadline = self.options.session_options.handshake_timeout
                + self.options.session_options.list_timeout
                + self.options.control_timeout;
            match roundtrip(&self.options.socket_path, &request, socket_deadline).await {
                Ok(response) => return take_field(response, "tools"),
                Err(RequestError::AfterSend(err)) => return Err(err),
                Err(RequestError::BeforeSend(err)) => {
                    tracing::debug!(error = %err, "daemon unreachable before send, using direct mode");
                }
            }
        }

        self.note_path("direct");
        let session = self.direct_session(&spec).await?;
        let result = session.list_tools().await;
        session.shutdown().await;
        Ok(Value::Array(result?))
    }

    /// Calls `tool` on `server_command`, via the daemon when it is usable.
    /// Returns the tool result payload.
    pub async fn call_tool(
        &self,
        server_command: &str,
        tool: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> anyhow::Result<Value> {
        let spec = ServerSpec::parse(server_command)
            .map_err(|err| anyhow::anyhow!("invalid server command: {err}"))?;
        let effective = timeout.unwrap_or(self.options.call_timeout);

        if self.daemon_usable().await {
            self.note_path("daemon");
            let mut request = serde_json::json!({
                "command": "call",
                "server": spec.id(),
                "server_command": server_command,
                "tool": tool,
                "arguments": arguments.clone(),
            });
            if let Some(timeout) = timeout {
                request["timeout_ms"] = serde_json::json!(timeout.as_millis() as u64);
            }
            // The daemon enforces the per-call deadline; pad the socket
            // deadline (including a possible lazy-start handshake) so the
            // daemon's timeout error reaches us instead of ours firing.
            let socket_deadline = self.options.session_options.handshake_timeout
                + effective
                + self.options.control_timeout;
            match roundtrip(&self.options.socket_path, &request, socket_deadline).await {
                Ok(response) => return take_field(response, "result"),
                Err(RequestError::AfterSend(err)) => return Err(err),
                Err(RequestError::BeforeSend(err)) => {
                    tracing::debug!(error = %err, "daemon unreachable before send, using direct mode");
                }
            }
        }

        self.note_path("direct");
        let session = self.direct_session(&spec).await?;
        let result = session.call_tool(tool, arguments, Some(effective)).await;
        session.shutdown().await;
        Ok(result?)
    }

    /// Tools of every server cached by the daemon. Daemon-only: without a
    /// daemon there is no pool to enumerate.
    pub async fn list_all(&self) -> anyhow::Result<Value> {
        let request = serde_json::json!({ "command": "list-all" });
        // list-all performs one live tools/list per cached server.
        let response = roundtrip(
            &self.options.socket_path,
            &request,
            self.options.call_timeout,
        )
        .await
        .map_err(RequestError::into_error)
        .context("list-all requires a running daemon")?;
        if response["success"] == Value::Bool(true) {
            Ok(response)
        } else {
            Err(daemon_error(&response))
        }
    }

    async fn daemon_usable(&self) -> bool {
        if self.options.no_daemon {
            return false;
        }
        daemon_available(&self.options.socket_path, self.options.probe_timeout).await
    }

    async fn direct_session(&self, spec: &ServerSpec) -> anyhow::Result<Session> {
        Session::spawn(
            spec.command(),
            spec.args(),
            spec.env(),
            self.options.session_options.clone(),
        )
        .await
        .with_context(|| format!("start mcp server: {}", spec.command()))
    }

    fn note_path(&self, path: &str) {
        if self.options.verbose {
            eprintln!("[mcpd] using {path} mode");
        }
    }
}

fn take_field(mut response: Value, field: &str) -> anyhow::Result<Value> {
    if response["success"] == Value::Bool(true) {
        Ok(response[field].take())
    } else {
        Err(daemon_error(&response))
    }
}

fn daemon_error(response: &Value) -> anyhow::Error {
    let kind = response["kind"].as_str().unwrap_or("error");
    let message = response["error"].as_str().unwrap_or("unknown daemon error");
    anyhow::anyhow!("{kind}: {message}")
}
