//! Daemon process lifecycle: single-instance enforcement, control-socket
//! setup, signal handling, and orderly shutdown.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mcp_session::SessionOptions;
use tokio::net::UnixListener;

use crate::client;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::init::{self, RequiredServersFailed};
use crate::monitor;
use crate::pool::Pool;

const STALE_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("daemon already running at {0}")]
    AlreadyRunning(PathBuf),
    #[error("failed to set up control socket {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Init(#[from] RequiredServersFailed),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DaemonError {
    /// Exit code contract: 0 clean shutdown, 1 required-init failure, 2
    /// instance conflict, 3 bind/permission error.
    pub fn exit_code(&self) -> i32 {
        match self {
            DaemonError::AlreadyRunning(_) => 2,
            DaemonError::Bind { .. } => 3,
            DaemonError::Init(_) | DaemonError::Other(_) => 1,
        }
    }
}

pub struct DaemonOptions {
    pub socket_path: PathBuf,
    pub config: Config,
    /// When false, the catalog is ignored at boot (`--no-auto-init`).
    pub auto_init: bool,
    pub session_options: SessionOptions,
}

/// Runs the daemon until shutdown. The socket file is unlinked on every
/// exit path once it has been bound.
pub async fn run(options: DaemonOptions) -> Result<(), DaemonError> {
    let DaemonOptions {
        socket_path,
        config,
        auto_init,
        session_options,
    } = options;

    recover_stale_socket(&socket_path).await?;
    let listener = UnixListener::bind(&socket_path).map_err(|source| DaemonError::Bind {
        path: socket_path.clone(),
        source,
    })?;
    let _socket_guard = SocketGuard(socket_path.clone());
    restrict_socket_mode(&socket_path).map_err(|source| DaemonError::Bind {
        path: socket_path.clone(),
        source,
    })?;
    tracing::info!(
        socket = %socket_path.display(),
        pid = std::process::id(),
        "daemon listening"
    );

    let pool = Arc::new(Pool::new(session_options));
    let mut dispatcher = Dispatcher::new(pool.clone());

    if auto_init {
        let settings = config.daemon().init_settings();
        match init::initialize_servers(&pool, config.servers(), &settings).await {
            Ok(result) => {
                if result.total > 0 {
                    dispatcher.set_initialization(result.summary());
                }
            }
            Err(failed) => {
                tracing::error!(error = %failed, "required server initialization failed");
                pool.stop_all().await;
                return Err(DaemonError::Init(failed));
            }
        }
    } else {
        tracing::info!("auto-initialization disabled");
    }

    let dispatcher = Arc::new(dispatcher);
    spawn_signal_handler(dispatcher.clone())?;
    let monitor_task = tokio::spawn(monitor::run(
        pool.clone(),
        config.daemon().health_check_interval,
        dispatcher.shutdown_signal(),
    ));

    dispatcher.serve(listener, SHUTDOWN_GRACE).await;
    let _ = monitor_task.await;
    tracing::info!("daemon stopped");
    Ok(())
}

/// A leftover socket file either belongs to a live daemon (abort) or to a
/// dead one (unlink and proceed).
async fn recover_stale_socket(socket_path: &Path) -> Result<(), DaemonError> {
    if !socket_path.exists() {
        return Ok(());
    }
    if client::daemon_available(socket_path, STALE_PROBE_TIMEOUT).await {
        return Err(DaemonError::AlreadyRunning(socket_path.to_path_buf()));
    }
    tracing::warn!(socket = %socket_path.display(), "removing stale socket");
    tokio::fs::remove_file(socket_path)
        .await
        .map_err(|source| DaemonError::Bind {
            path: socket_path.to_path_buf(),
            source,
        })
}

fn restrict_socket_mode(socket_path: &Path) -> std::io::Result<()> {
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
}

fn spawn_signal_handler(dispatcher: Arc<Dispatcher>) -> Result<(), DaemonError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())
        .map_err(|err| DaemonError::Other(anyhow::Error::new(err).context("install SIGINT handler")))?;
    let mut terminate = signal(SignalKind::terminate())
        .map_err(|err| DaemonError::Other(anyhow::Error::new(err).context("install SIGTERM handler")))?;

    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        tracing::info!("received shutdown signal");
        dispatcher.trigger_shutdown();
    });
    Ok(())
}

struct SocketGuard(PathBuf);

impl Drop for SocketGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

pub enum Forked {
    /// The original process; the daemon continues in a grandchild.
    Parent,
    /// The detached daemon process.
    Child,
}

/// Classic double-fork detach: fork, new session, fork again, stdio to
/// /dev/null. Must be called before any tokio runtime is created.
pub fn daemonize() -> std::io::Result<Forked> {
    use nix::unistd::{fork, setsid, ForkResult};

    // SAFETY: called before the async runtime exists, while the process is
    // still single-threaded.
    match unsafe { fork() }.map_err(std::io::Error::from)? {
        ForkResult::Parent { .. } => return Ok(Forked::Parent),
        ForkResult::Child => {}
    }

    setsid().map_err(std::io::Error::from)?;

    // SAFETY: as above; the intermediate child has not spawned threads.
    match unsafe { fork() }.map_err(std::io::Error::from)? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    redirect_stdio_to_null()?;
    Ok(Forked::Child)
}

fn redirect_stdio_to_null() -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for target in [0, 1, 2] {
        nix::unistd::dup2(devnull.as_raw_fd(), target).map_err(std::io::Error::from)?;
    }
    Ok(())
}
