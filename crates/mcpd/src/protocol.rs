//! Control-socket wire format: one JSON object per line, one request and one
//! response per connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::server::ServerId;

/// Hard cap on a single request frame. Oversize frames are answered with an
/// `oversize` error and the connection is closed.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Stable machine-readable error taxonomy carried in the `kind` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SpawnError,
    ProtocolError,
    ToolError,
    NotFound,
    ChildDead,
    Timeout,
    Oversize,
    AlreadyRunning,
    BadRequest,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SpawnError => "spawn_error",
            ErrorKind::ProtocolError => "protocol_error",
            ErrorKind::ToolError => "tool_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ChildDead => "child_dead",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Oversize => "oversize",
            ErrorKind::AlreadyRunning => "already_running",
            ErrorKind::BadRequest => "bad_request",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn kind_of(err: &mcp_session::Error) -> ErrorKind {
    match err {
        mcp_session::Error::Spawn(_) => ErrorKind::SpawnError,
        mcp_session::Error::Protocol(_) => ErrorKind::ProtocolError,
        mcp_session::Error::Tool { .. } => ErrorKind::ToolError,
        mcp_session::Error::ChildDead(_) => ErrorKind::ChildDead,
        mcp_session::Error::Timeout(_) => ErrorKind::Timeout,
    }
}

/// A control-socket request. Unknown fields are ignored; a missing required
/// field is a `bad_request`.
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Request {
    Start {
        #[serde(default)]
        server: Option<ServerId>,
        server_command: String,
    },
    Stop {
        server: ServerId,
    },
    Call {
        #[serde(default)]
        server: Option<ServerId>,
        #[serde(default)]
        server_command: Option<String>,
        tool: String,
        #[serde(default)]
        arguments: Option<Value>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    List {
        #[serde(default)]
        server: Option<ServerId>,
        #[serde(default)]
        server_command: Option<String>,
    },
    ListAll,
    Status,
    Shutdown,
}

pub fn success(message: impl Into<String>) -> Value {
    serde_json::json!({ "success": true, "message": message.into() })
}

pub fn error(kind: ErrorKind, message: impl ToString) -> Value {
    serde_json::json!({
        "success": false,
        "error": message.to_string(),
        "kind": kind,
    })
}

pub fn session_error(err: &mcp_session::Error) -> Value {
    error(kind_of(err), err)
}

#[derive(Debug)]
pub enum FrameError {
    Oversize,
    Io(std::io::Error),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError::Io(err)
    }
}

/// Reads one newline-terminated frame, enforcing [`MAX_FRAME_BYTES`].
/// Returns `None` on a clean EOF before any payload.
pub async fn read_frame<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, FrameError> {
    use tokio::io::AsyncBufReadExt;

    let mut buf = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if buf.is_empty() {
                return Ok(None);
            }
            break;
        }

        let newline_pos = available.iter().position(|b| *b == b'\n');
        let take = newline_pos
            .map(|idx| idx.saturating_add(1))
            .unwrap_or(available.len());
        if buf.len().saturating_add(take) > MAX_FRAME_BYTES {
            return Err(FrameError::Oversize);
        }
        buf.extend_from_slice(&available[..take]);
        reader.consume(take);

        if newline_pos.is_some() {
            break;
        }
    }

    if buf.ends_with(b"\n") {
        buf.pop();
        if buf.ends_with(b"\r") {
            buf.pop();
        }
    }

    Ok(Some(buf))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    write: &mut W,
    value: &Value,
) -> std::io::Result<()> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    write.write_all(line.as_bytes()).await?;
    write.flush().await
}
