//! Server catalog and daemon settings, read once at boot.
//!
//! File format (camelCase on disk):
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "filesystem": {
//!       "command": "npx",
//!       "args": ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"],
//!       "env": { "FS_READONLY": "1" },
//!       "autoStart": true,
//!       "optional": false
//!     }
//!   },
//!   "daemon": {
//!     "socketPath": "/tmp/mcp-daemon.sock",
//!     "initializationTimeout": 60,
//!     "parallelInitialization": 4,
//!     "onInitFailure": "warn",
//!     "healthCheckInterval": 30
//!   }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::init::{InitSettings, OnInitFailure};
use crate::server::ServerSpec;

/// Environment variable pointing at a config file.
pub const CONFIG_ENV_VAR: &str = "MCP_DAEMON_CONFIG";

const CONFIG_FILE_NAME: &str = "mcp-config.json";
const USER_CONFIG_DIR: &str = ".mcpd";

#[derive(Debug, Clone, Default)]
pub struct Config {
    path: Option<PathBuf>,
    servers: Vec<(String, ServerSpec)>,
    daemon: DaemonSettings,
}

#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub socket_path: Option<PathBuf>,
    pub initialization_timeout: Duration,
    pub parallel_initialization: usize,
    pub on_init_failure: OnInitFailure,
    pub health_check_interval: Duration,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            socket_path: None,
            initialization_timeout: Duration::from_secs(60),
            parallel_initialization: 4,
            on_init_failure: OnInitFailure::default(),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

impl DaemonSettings {
    pub fn init_settings(&self) -> InitSettings {
        InitSettings {
            timeout: self.initialization_timeout,
            parallel: self.parallel_initialization,
            on_failure: self.on_init_failure,
        }
    }
}

impl Config {
    /// Loads from the first path found by [`discover`]; a missing file
    /// yields an empty catalog with default settings.
    pub async fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = discover(explicit) else {
            return Ok(Self::default());
        };
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("read config file: {}", path.display()))?;
        let mut config = Self::from_slice(&bytes)
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        config.path = Some(path);
        Ok(config)
    }

    pub fn from_slice(bytes: &[u8]) -> anyhow::Result<Self> {
        let file: file_format::FileConfig =
            serde_json::from_slice(bytes).context("parse config json")?;
        file.into_config()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The validated catalog, ordered by server name.
    pub fn servers(&self) -> &[(String, ServerSpec)] {
        &self.servers
    }

    pub fn daemon(&self) -> &DaemonSettings {
        &self.daemon
    }
}

/// Config discovery precedence: explicit path > `MCP_DAEMON_CONFIG` >
/// `./mcp-config.json` > `~/.mcpd/mcp-config.json`.
pub fn discover(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Some(value) = std::env::var_os(CONFIG_ENV_VAR).filter(|v| !v.is_empty()) {
        let path = PathBuf::from(value);
        if path.exists() {
            return Some(path);
        }
    }

    let cwd_config = PathBuf::from(CONFIG_FILE_NAME);
    if cwd_config.exists() {
        return Some(cwd_config);
    }

    if let Some(home) = std::env::var_os("HOME").filter(|v| !v.is_empty()) {
        let user_config = PathBuf::from(home).join(USER_CONFIG_DIR).join(CONFIG_FILE_NAME);
        if user_config.exists() {
            return Some(user_config);
        }
    }

    None
}

mod file_format {
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Duration;

    use serde::Deserialize;

    use crate::init::OnInitFailure;
    use crate::server::ServerSpec;

    use super::{Config, DaemonSettings};

    fn default_true() -> bool {
        true
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct FileConfig {
        #[serde(default)]
        mcp_servers: BTreeMap<String, FileServer>,
        #[serde(default)]
        daemon: FileDaemon,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct FileServer {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default = "default_true")]
        auto_start: bool,
        #[serde(default)]
        optional: bool,
        /// Free-form, shown by listing tools; accepted but unused here.
        #[serde(default)]
        #[allow(dead_code)]
        description: Option<String>,
    }

    #[derive(Debug, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct FileDaemon {
        socket_path: Option<PathBuf>,
        initialization_timeout: Option<u64>,
        parallel_initialization: Option<usize>,
        on_init_failure: Option<OnInitFailure>,
        health_check_interval: Option<u64>,
    }

    impl FileConfig {
        pub(super) fn into_config(self) -> anyhow::Result<Config> {
            let mut servers = Vec::with_capacity(self.mcp_servers.len());
            for (name, server) in self.mcp_servers {
                if name.trim().is_empty() {
                    anyhow::bail!("mcp server name must not be empty");
                }
                let spec = ServerSpec::new(server.command, server.args)
                    .map_err(|err| anyhow::anyhow!("invalid mcp server config (server={name}): {err}"))?
                    .with_env(server.env)
                    .with_auto_start(server.auto_start)
                    .with_optional(server.optional);
                servers.push((name, spec));
            }

            let defaults = DaemonSettings::default();
            let daemon = DaemonSettings {
                socket_path: self.daemon.socket_path,
                initialization_timeout: match self.daemon.initialization_timeout {
                    Some(0) => anyhow::bail!("daemon.initializationTimeout must be >= 1"),
                    Some(secs) => Duration::from_secs(secs),
                    None => defaults.initialization_timeout,
                },
                parallel_initialization: match self.daemon.parallel_initialization {
                    Some(0) => anyhow::bail!("daemon.parallelInitialization must be >= 1"),
                    Some(parallel) => parallel,
                    None => defaults.parallel_initialization,
                },
                on_init_failure: self
                    .daemon
                    .on_init_failure
                    .unwrap_or(defaults.on_init_failure),
                health_check_interval: match self.daemon.health_check_interval {
                    Some(0) => anyhow::bail!("daemon.healthCheckInterval must be >= 1"),
                    Some(secs) => Duration::from_secs(secs),
                    None => defaults.health_check_interval,
                },
            };

            Ok(Config {
                path: None,
                servers,
                daemon,
            })
        }
    }
}
