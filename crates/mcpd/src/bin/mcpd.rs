use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;

use mcpd::client::{self, ClientOptions, ToolClient};
use mcpd::supervisor::{self, DaemonOptions, Forked};
use mcpd::Config;

#[derive(Parser)]
#[command(name = "mcpd")]
#[command(about = "MCP process-pool daemon and direct-call client")]
struct Cli {
    /// Control socket path (default: $MCP_DAEMON_SOCKET, then config, then
    /// /tmp/mcp-daemon.sock).
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Print which path (daemon or direct) served each call.
    #[arg(long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage the daemon process.
    #[command(subcommand)]
    Daemon(DaemonCommand),
    /// List tools exposed by an MCP server.
    ListTools {
        /// Full launch command of the server, quoted as one argument.
        server_command: String,
        /// Raw JSON output instead of the readable listing.
        #[arg(long, default_value_t = false)]
        json: bool,
        /// Skip the daemon and spawn the server directly.
        #[arg(long, default_value_t = false)]
        no_daemon: bool,
    },
    /// Call a tool with JSON arguments.
    CallTool {
        server_command: String,
        tool: String,
        /// JSON object of tool arguments.
        arguments: String,
        /// Skip the daemon and spawn the server directly.
        #[arg(long, default_value_t = false)]
        no_daemon: bool,
        /// Per-call timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// List tools from every server cached by the daemon.
    ListAll,
}

#[derive(Subcommand)]
enum DaemonCommand {
    /// Start the daemon.
    Start {
        /// Stay attached to the terminal instead of detaching.
        #[arg(long, default_value_t = false)]
        foreground: bool,
        /// Skip catalog auto-initialization.
        #[arg(long, default_value_t = false)]
        no_auto_init: bool,
        /// Config file path (default: discovery order, see docs).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Stop the daemon.
    Stop,
    /// Show daemon status.
    Status {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Command::Daemon(DaemonCommand::Start {
            foreground,
            no_auto_init,
            config,
        }) => daemon_start(cli.socket, foreground, no_auto_init, config),
        command => client_main(cli.socket, cli.verbose, command),
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// The daemon start path runs outside a long-lived runtime: the pre-flight
/// probe and config load use a throwaway runtime, the double fork happens
/// while single-threaded, and only then is the real runtime built.
fn daemon_start(
    socket: Option<PathBuf>,
    foreground: bool,
    no_auto_init: bool,
    config_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    let preflight = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build preflight runtime")?;
    let config = preflight.block_on(Config::load(config_path.as_deref()))?;
    let socket_path = mcpd::resolve_socket_path(socket, &config);
    let running =
        preflight.block_on(client::daemon_available(&socket_path, Duration::from_secs(1)));
    drop(preflight);

    if running {
        eprintln!("Error: daemon already running at {}", socket_path.display());
        eprintln!("Use 'mcpd daemon stop' to stop it first");
        std::process::exit(2);
    }

    if !foreground {
        match supervisor::daemonize().context("daemonize")? {
            Forked::Parent => {
                println!("daemon started (socket: {})", socket_path.display());
                return Ok(());
            }
            Forked::Child => {}
        }
    }

    let runtime = tokio::runtime::Runtime::new().context("build tokio runtime")?;
    let outcome = runtime.block_on(supervisor::run(DaemonOptions {
        socket_path,
        config,
        auto_init: !no_auto_init,
        session_options: Default::default(),
    }));
    match outcome {
        Ok(()) => Ok(()),
        Err(err) => {
            tracing::error!(error = %err, "daemon exited with error");
            std::process::exit(err.exit_code());
        }
    }
}

fn client_main(socket: Option<PathBuf>, verbose: bool, command: Command) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("build tokio runtime")?;
    runtime.block_on(async move {
        let config = match Config::load(None).await {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "ignoring unreadable config");
                Config::default()
            }
        };
        let socket_path = mcpd::resolve_socket_path(socket, &config);

        match command {
            Command::Daemon(DaemonCommand::Start { .. }) => unreachable!("handled in main"),
            Command::Daemon(DaemonCommand::Stop) => daemon_stop(&socket_path).await,
            Command::Daemon(DaemonCommand::Status { json }) => {
                daemon_status(&socket_path, json).await
            }
            Command::ListTools {
                server_command,
                json,
                no_daemon,
            } => {
                let tools = tool_client(socket_path, verbose, no_daemon)
                    .list_tools(&server_command)
                    .await
                    .with_context(|| format!("list-tools {server_command}"))?;
                print_tools(&server_command, &tools, json)
            }
            Command::CallTool {
                server_command,
                tool,
                arguments,
                no_daemon,
                timeout_ms,
            } => {
                let arguments: Value =
                    serde_json::from_str(&arguments).context("parse tool arguments json")?;
                let result = tool_client(socket_path, verbose, no_daemon)
                    .call_tool(
                        &server_command,
                        &tool,
                        arguments,
                        timeout_ms.map(Duration::from_millis),
                    )
                    .await
                    .with_context(|| format!("call-tool {server_command} {tool}"))?;
                println!("{}", serde_json::to_string_pretty(&result)?);
                Ok(())
            }
            Command::ListAll => {
                let response = tool_client(socket_path, verbose, false).list_all().await?;
                println!("{}", serde_json::to_string_pretty(&response)?);
                Ok(())
            }
        }
    })
}

fn tool_client(socket_path: PathBuf, verbose: bool, no_daemon: bool) -> ToolClient {
    let mut options = ClientOptions::new(socket_path);
    options.verbose = verbose;
    options.no_daemon = no_daemon;
    ToolClient::new(options)
}

async fn daemon_stop(socket_path: &Path) -> anyhow::Result<()> {
    if !socket_path.exists() {
        println!("daemon is not running");
        return Ok(());
    }

    match client::shutdown_daemon(socket_path, Duration::from_secs(5)).await {
        Ok(response) if response["success"] == true => {
            // Shutdown is acknowledged before cleanup finishes; poll until
            // the socket is gone.
            for _ in 0..20 {
                if !socket_path.exists() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            println!("daemon stopped");
            Ok(())
        }
        Ok(response) => anyhow::bail!(
            "error stopping daemon: {}",
            response["error"].as_str().unwrap_or("unknown error")
        ),
        Err(err) => {
            tracing::debug!(error = %err, "shutdown request failed; treating socket as stale");
            let _ = tokio::fs::remove_file(socket_path).await;
            println!("daemon is not running (stale socket removed)");
            Ok(())
        }
    }
}

async fn daemon_status(socket_path: &Path, json: bool) -> anyhow::Result<()> {
    if !socket_path.exists() {
        println!("daemon is not running");
        return Ok(());
    }
    let status = match client::daemon_status(socket_path, Duration::from_secs(5)).await {
        Ok(status) => status,
        Err(err) => {
            tracing::debug!(error = %err, "status request failed");
            println!("daemon is not running");
            return Ok(());
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!(
        "Daemon status: {}",
        status["status"].as_str().unwrap_or("unknown")
    );
    println!("Socket: {}", socket_path.display());
    println!(
        "Active servers: {}",
        status["server_count"].as_u64().unwrap_or(0)
    );

    let auto_started = status["auto_started"].as_array().cloned().unwrap_or_default();
    if !auto_started.is_empty() {
        println!("\nAuto-started servers (from config):");
        for entry in &auto_started {
            let id = entry["id"].as_str().unwrap_or("?");
            match entry["uptime_seconds"].as_f64() {
                Some(uptime) => println!("  - {id} (uptime: {})", format_uptime(uptime)),
                None => println!("  - {id}"),
            }
        }
    }

    let on_demand = status["on_demand"].as_array().cloned().unwrap_or_default();
    if !on_demand.is_empty() {
        println!("\nOn-demand servers:");
        for entry in &on_demand {
            println!("  - {}", entry.as_str().unwrap_or("?"));
        }
    }
    Ok(())
}

fn print_tools(server_command: &str, tools: &Value, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(tools)?);
        return Ok(());
    }

    println!("# Available tools from: {server_command}\n");
    for tool in tools.as_array().map(Vec::as_slice).unwrap_or(&[]) {
        println!("## {}\n", tool["name"].as_str().unwrap_or("<unnamed>"));
        if let Some(description) = tool["description"].as_str() {
            println!("{description}\n");
        }
        if let Some(schema) = tool.get("inputSchema") {
            println!("```json\n{}\n```\n", serde_json::to_string_pretty(schema)?);
        }
    }
    Ok(())
}

fn format_uptime(seconds: f64) -> String {
    let seconds = seconds as u64;
    if seconds < 60 {
        format!("{seconds}s")
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
