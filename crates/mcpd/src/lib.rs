//! Daemon-side and client-side building blocks for the `mcpd` binary.
//!
//! The daemon keeps MCP server children warm in a [`pool::Pool`], serves a
//! newline-JSON control protocol on a Unix socket ([`dispatch`]), boots the
//! configured catalog ([`init`]), keeps auto-started servers alive
//! ([`monitor`]), and manages its own process lifecycle ([`supervisor`]).
//! The [`client`] module is the transparent daemon-or-direct client the CLI
//! uses.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod init;
pub mod monitor;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod supervisor;

pub use config::Config;
pub use pool::Pool;
pub use server::{ServerId, ServerSpec};

/// Default control socket path; `MCP_DAEMON_SOCKET` overrides it.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/mcp-daemon.sock";

/// Environment variable overriding the control socket path.
pub const SOCKET_ENV_VAR: &str = "MCP_DAEMON_SOCKET";

/// Resolves the socket path: explicit flag > environment > config > default.
pub fn resolve_socket_path(
    explicit: Option<std::path::PathBuf>,
    config: &Config,
) -> std::path::PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    if let Some(path) = std::env::var_os(SOCKET_ENV_VAR).filter(|v| !v.is_empty()) {
        return std::path::PathBuf::from(path);
    }
    if let Some(path) = config.daemon().socket_path.clone() {
        return path;
    }
    std::path::PathBuf::from(DEFAULT_SOCKET_PATH)
}
