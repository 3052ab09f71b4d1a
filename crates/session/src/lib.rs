#![forbid(unsafe_code)]

//! `mcp-session` owns one MCP server child process and exposes a typed RPC
//! surface over its stdio.
//!
//! Protocol: JSON-RPC 2.0, one JSON object per line in both directions. The
//! session performs the `initialize` handshake once at startup, then serves
//! `tools/list` and `tools/call` (plus raw requests) to any number of
//! concurrent callers. Requests are matched to responses strictly by id; a
//! single reader task is the only consumer of the child's stdout.
//!
//! Non-goals:
//! - Acting as a JSON-RPC server (child notifications and server->client
//!   requests are discarded)
//! - Automatic restart (that policy lives with the caller)

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

mod error;
mod rpc;

pub use error::Error;

use rpc::{Completion, RpcHandle};

/// MCP protocol revision sent in the `initialize` handshake.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Client identity reported to the server during `initialize`.
    pub client_name: String,
    pub client_version: String,
    /// Fixed deadline for the `initialize` round trip.
    pub handshake_timeout: Duration,
    /// Default deadline for `tools/list`.
    pub list_timeout: Duration,
    /// Default deadline for `tools/call`.
    pub call_timeout: Duration,
    /// How long `shutdown` waits for the child after closing stdin, and
    /// again after killing it.
    pub stop_grace: Duration,
    /// Maximum bytes for a single line of child stdout.
    pub max_line_bytes: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            client_name: "mcpd".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            handshake_timeout: Duration::from_secs(5),
            list_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(2),
            max_line_bytes: 16 * 1024 * 1024,
        }
    }
}

/// A live MCP server child and its multiplexed JSON-RPC state.
///
/// Cheap to share behind an `Arc`; all request methods take `&self` and
/// concurrent callers are interleaved by request id. Writes to the child's
/// stdin are serialized internally.
pub struct Session {
    rpc: RpcHandle,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
    child: tokio::sync::Mutex<Option<Child>>,
    initialize_result: Value,
    options: SessionOptions,
    started: Instant,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    /// Spawns `program args..` with `env` overlaid onto the current process
    /// environment and performs the MCP handshake.
    pub async fn spawn(
        program: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        options: SessionOptions,
    ) -> Result<Self, Error> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.stderr(Stdio::inherit());
        Self::spawn_command(cmd, options).await
    }

    /// Spawns a prepared command (stdin/stdout are overridden with pipes)
    /// and performs the MCP handshake.
    pub async fn spawn_command(mut cmd: Command, options: SessionOptions) -> Result<Self, Error> {
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(Error::Spawn)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Protocol("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Protocol("child stdout not captured".to_string()))?;

        Self::create(stdout, stdin, Some(child), options).await
    }

    /// Attaches to an in-memory transport. Test seam: the peer must speak
    /// the same line-delimited JSON-RPC as a real child.
    pub async fn connect_io<R, W>(read: R, write: W, options: SessionOptions) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::create(read, write, None, options).await
    }

    async fn create<R, W>(
        read: R,
        write: W,
        child: Option<Child>,
        options: SessionOptions,
    ) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let rpc = RpcHandle::new(write);
        let reader = rpc::spawn_reader(read, rpc.clone(), options.max_line_bytes);

        let initialize_result = match handshake(&rpc, &options).await {
            Ok(result) => result,
            Err(err) => {
                reader.abort();
                rpc.mark_dead("initialize failed").await;
                if let Some(mut child) = child {
                    let _ = child.start_kill();
                    let _ = tokio::time::timeout(options.stop_grace, child.wait()).await;
                }
                return Err(err);
            }
        };

        Ok(Self {
            rpc,
            reader: Mutex::new(Some(reader)),
            child: tokio::sync::Mutex::new(child),
            initialize_result,
            options,
            started: Instant::now(),
        })
    }

    /// The server's `initialize` result, verbatim.
    pub fn initialize_result(&self) -> &Value {
        &self.initialize_result
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// False once the reader has observed child exit (or a framing
    /// violation) or after `shutdown`.
    pub fn is_alive(&self) -> bool {
        !self.rpc.is_dead()
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.rpc.pending_len()
    }

    /// Sends `tools/list` and returns the `tools` array.
    pub async fn list_tools(&self) -> Result<Vec<Value>, Error> {
        let result = match self
            .roundtrip("tools/list", None, self.options.list_timeout)
            .await?
        {
            Completion::Result(result) => result,
            Completion::RpcError { code, message, .. } => {
                return Err(Error::Protocol(format!(
                    "tools/list rejected (code {code}): {message}"
                )));
            }
            Completion::Invalid(msg) => return Err(Error::Protocol(msg)),
            Completion::Dead(reason) => return Err(Error::ChildDead(reason)),
        };

        match result.get("tools").and_then(Value::as_array) {
            Some(tools) => Ok(tools.clone()),
            None => Err(Error::Protocol(
                "malformed tools/list response: missing tools array".to_string(),
            )),
        }
    }

    /// Sends `tools/call` and returns the result payload verbatim.
    ///
    /// `timeout` overrides the configured call deadline for this one call.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, Error> {
        let params = serde_json::json!({ "name": tool, "arguments": arguments });
        let deadline = timeout.unwrap_or(self.options.call_timeout);
        match self.roundtrip("tools/call", Some(params), deadline).await? {
            Completion::Result(result) => Ok(result),
            Completion::RpcError {
                code,
                message,
                data,
            } => Err(Error::Tool {
                code,
                message,
                data,
            }),
            Completion::Invalid(msg) => Err(Error::Protocol(msg)),
            Completion::Dead(reason) => Err(Error::ChildDead(reason)),
        }
    }

    /// Raw JSON-RPC request escape hatch. JSON-RPC errors map to
    /// `Error::Protocol`.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, Error> {
        match self.roundtrip(method, params, timeout).await? {
            Completion::Result(result) => Ok(result),
            Completion::RpcError { code, message, .. } => Err(Error::Protocol(format!(
                "{method} rejected (code {code}): {message}"
            ))),
            Completion::Invalid(msg) => Err(Error::Protocol(msg)),
            Completion::Dead(reason) => Err(Error::ChildDead(reason)),
        }
    }

    async fn roundtrip(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<Completion, Error> {
        match tokio::time::timeout(deadline, self.rpc.call(method, params)).await {
            Ok(completion) => Ok(completion),
            // Dropping the call future evicted the pending slot; a late
            // response will be discarded by the reader.
            Err(_) => Err(Error::Timeout(deadline)),
        }
    }

    /// Stops the session: fails all pending requests with `ChildDead`,
    /// closes the child's stdin, waits briefly for exit, then kills and
    /// reaps. Idempotent.
    pub async fn shutdown(&self) {
        if let Ok(mut guard) = self.reader.lock() {
            if let Some(reader) = guard.take() {
                reader.abort();
            }
        }
        self.rpc.mark_dead("session stopped").await;

        let mut slot = self.child.lock().await;
        let Some(mut child) = slot.take() else {
            return;
        };

        let grace = self.options.stop_grace;
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        if child.start_kill().is_err() {
            // Already gone; reap whatever is left.
            let _ = child.try_wait();
            return;
        }
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            tracing::warn!("mcp server did not exit after kill");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.reader.lock() {
            if let Some(reader) = guard.take() {
                reader.abort();
            }
        }
        // The child (if any) was spawned with kill_on_drop, so dropping the
        // handle is enough to avoid leaking it.
    }
}

async fn handshake(rpc: &RpcHandle, options: &SessionOptions) -> Result<Value, Error> {
    let params = serde_json::json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "clientInfo": {
            "name": options.client_name,
            "version": options.client_version,
        },
        "capabilities": {},
    });

    let outcome = tokio::time::timeout(
        options.handshake_timeout,
        rpc.call("initialize", Some(params)),
    )
    .await;
    let completion = outcome.map_err(|_| {
        Error::Protocol(format!(
            "initialize timed out after {:?}",
            options.handshake_timeout
        ))
    })?;

    let result = match completion {
        Completion::Result(result) => result,
        Completion::RpcError { code, message, .. } => {
            return Err(Error::Protocol(format!(
                "initialize rejected (code {code}): {message}"
            )));
        }
        Completion::Invalid(msg) => return Err(Error::Protocol(msg)),
        // Exit during the handshake is a protocol failure of start(), not a
        // runtime child death.
        Completion::Dead(reason) => {
            return Err(Error::Protocol(format!(
                "server exited during initialize: {reason}"
            )));
        }
    };

    rpc.notify("notifications/initialized", None)
        .await
        .map_err(|err| Error::Protocol(format!("initialized notification failed: {err}")))?;

    Ok(result)
}
