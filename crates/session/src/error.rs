use std::time::Duration;

use serde_json::Value;

/// Failures a session surfaces to its callers.
///
/// The variants mirror what the daemon reports over the control socket, so
/// the dispatcher can map them to wire error kinds without inspecting
/// message text.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The child process could not be launched.
    #[error("failed to spawn mcp server: {0}")]
    Spawn(#[source] std::io::Error),
    /// The child broke MCP framing or failed the initialize handshake.
    #[error("mcp protocol error: {0}")]
    Protocol(String),
    /// The child answered `tools/call` with a JSON-RPC error.
    #[error("tool error {code}: {message}")]
    Tool {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    /// The child exited. Every pending request on the session fails with
    /// this, and so does every request issued afterwards.
    #[error("mcp server exited: {0}")]
    ChildDead(String),
    /// The caller's per-request deadline expired. A response arriving later
    /// is dropped by the reader.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    pub fn is_child_dead(&self) -> bool {
        matches!(self, Error::ChildDead(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}
