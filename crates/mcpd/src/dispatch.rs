//! Control-socket server: accepts concurrent clients, reads one JSON
//! request per connection, routes it to the pool, writes one JSON response,
//! and closes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

use crate::pool::{Pool, PoolEntry};
use crate::protocol::{
    self, error, kind_of, session_error, success, ErrorKind, FrameError, Request,
};
use crate::server::{ServerId, ServerSpec};

pub struct Dispatcher {
    pool: Arc<Pool>,
    /// Most recent boot's initialization summary, surfaced in `status`.
    initialization: Option<Value>,
    shutdown: watch::Sender<bool>,
}

impl Dispatcher {
    pub fn new(pool: Arc<Pool>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            pool,
            initialization: None,
            shutdown,
        }
    }

    pub fn set_initialization(&mut self, summary: Value) {
        self.initialization = Some(summary);
    }

    /// Receiver that flips to true once shutdown has been requested, either
    /// by the `shutdown` command or by a signal.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn trigger_shutdown(&self) {
        // send_replace stores the flag even when no receiver exists yet.
        self.shutdown.send_replace(true);
    }

    /// Serves the listener until shutdown, then drains in-flight connection
    /// tasks under `grace` and stops the pool.
    pub async fn serve(self: Arc<Self>, listener: UnixListener, grace: Duration) {
        let mut stop = self.shutdown_signal();
        let mut tasks = tokio::task::JoinSet::new();

        while !*stop.borrow_and_update() {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let this = self.clone();
                            tasks.spawn(async move { this.handle_connection(stream).await });
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                        }
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        // Stop accepting before draining.
        drop(listener);
        tracing::info!(in_flight = tasks.len(), "draining connections before shutdown");
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(abandoned = tasks.len(), "grace period expired");
                    tasks.abort_all();
                    break;
                }
            }
        }

        self.pool.stop_all().await;
    }

    async fn handle_connection(&self, stream: UnixStream) {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        let frame = match protocol::read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(FrameError::Oversize) => {
                let _ = protocol::write_frame(
                    &mut write,
                    &error(ErrorKind::Oversize, "oversize"),
                )
                .await;
                return;
            }
            Err(FrameError::Io(err)) => {
                tracing::debug!(error = %err, "client read failed");
                return;
            }
        };

        let response = match serde_json::from_slice::<Request>(&frame) {
            Ok(request) => self.handle(request).await,
            Err(err) => error(ErrorKind::BadRequest, format!("invalid request: {err}")),
        };

        if let Err(err) = protocol::write_frame(&mut write, &response).await {
            tracing::debug!(error = %err, "client write failed");
        }
    }

    /// Routes one request. Public so tests can exercise the command surface
    /// without a socket.
    pub async fn handle(&self, request: Request) -> Value {
        match request {
            Request::Start {
                server: _,
                server_command,
            } => {
                let spec = match ServerSpec::parse(&server_command) {
                    Ok(spec) => spec,
                    Err(err) => return error(ErrorKind::BadRequest, err),
                };
                match self.pool.start(&spec, false).await {
                    Ok(id) => serde_json::json!({
                        "success": true,
                        "server": id,
                        "message": format!("server {id} ready"),
                    }),
                    Err(err) => session_error(&err),
                }
            }

            Request::Stop { server } => {
                if self.pool.stop(&server).await {
                    success(format!("server {server} stopped"))
                } else {
                    success(format!("server {server} not running"))
                }
            }

            Request::Call {
                server,
                server_command,
                tool,
                arguments,
                timeout_ms,
            } => {
                let (id, entry) = match self.resolve(server, server_command).await {
                    Ok(resolved) => resolved,
                    Err(response) => return response,
                };
                let arguments = arguments.unwrap_or_else(|| serde_json::json!({}));
                let timeout = timeout_ms.map(Duration::from_millis);
                match entry.session.call_tool(&tool, arguments, timeout).await {
                    Ok(result) => serde_json::json!({ "success": true, "result": result }),
                    Err(err) => {
                        self.prune_if_dead(&id, &err).await;
                        session_error(&err)
                    }
                }
            }

            Request::List {
                server,
                server_command,
            } => {
                let (id, entry) = match self.resolve(server, server_command).await {
                    Ok(resolved) => resolved,
                    Err(response) => return response,
                };
                match entry.session.list_tools().await {
                    Ok(tools) => serde_json::json!({ "success": true, "tools": tools }),
                    Err(err) => {
                        self.prune_if_dead(&id, &err).await;
                        session_error(&err)
                    }
                }
            }

            Request::ListAll => {
                let mut servers = serde_json::Map::new();
                let mut total_tools = 0usize;
                for (id, entry) in self.pool.entries() {
                    match entry.session.list_tools().await {
                        Ok(tools) => {
                            let count = tools.len();
                            total_tools += count;
                            servers.insert(
                                id.to_string(),
                                serde_json::json!({ "tools": tools, "tool_count": count }),
                            );
                        }
                        Err(err) => {
                            self.prune_if_dead(&id, &err).await;
                            servers.insert(
                                id.to_string(),
                                serde_json::json!({
                                    "error": err.to_string(),
                                    "kind": kind_of(&err),
                                }),
                            );
                        }
                    }
                }
                serde_json::json!({
                    "success": true,
                    "server_count": servers.len(),
                    "total_tools": total_tools,
                    "servers": servers,
                })
            }

            Request::Status => {
                let rows = self.pool.snapshot();
                let all: Vec<String> = rows.iter().map(|(id, _, _)| id.to_string()).collect();
                let auto_started: Vec<Value> = rows
                    .iter()
                    .filter(|(_, auto, _)| *auto)
                    .map(|(id, _, uptime)| {
                        serde_json::json!({
                            "id": id,
                            "uptime_seconds": uptime.as_secs_f64(),
                        })
                    })
                    .collect();
                let on_demand: Vec<String> = rows
                    .iter()
                    .filter(|(_, auto, _)| !auto)
                    .map(|(id, _, _)| id.to_string())
                    .collect();

                let mut response = serde_json::json!({
                    "status": "running",
                    "servers": all,
                    "server_count": rows.len(),
                    "auto_started": auto_started,
                    "on_demand": on_demand,
                });
                if let Some(init) = &self.initialization {
                    response["initialization"] = init.clone();
                }
                response
            }

            Request::Shutdown => {
                tracing::info!("shutdown requested over control socket");
                self.trigger_shutdown();
                success("daemon shutting down")
            }
        }
    }

    /// Finds the target session, lazily starting it (auto=false) when the
    /// full launch spec was supplied. The daemon never consults
    /// configuration to resolve a missing id.
    async fn resolve(
        &self,
        server: Option<ServerId>,
        server_command: Option<String>,
    ) -> Result<(ServerId, PoolEntry), Value> {
        if let Some(command) = server_command {
            let spec =
                ServerSpec::parse(&command).map_err(|err| error(ErrorKind::BadRequest, err))?;
            let id = spec.id();
            if let Some(entry) = self.pool.entry(&id) {
                return Ok((id, entry));
            }
            let id = self
                .pool
                .start(&spec, false)
                .await
                .map_err(|err| session_error(&err))?;
            match self.pool.entry(&id) {
                Some(entry) => Ok((id, entry)),
                None => Err(error(
                    ErrorKind::NotFound,
                    format!("server {id} not running"),
                )),
            }
        } else if let Some(id) = server {
            match self.pool.entry(&id) {
                Some(entry) => Ok((id, entry)),
                None => Err(error(
                    ErrorKind::NotFound,
                    format!("server {id} not running; start it first or send server_command"),
                )),
            }
        } else {
            Err(error(
                ErrorKind::BadRequest,
                "missing server or server_command",
            ))
        }
    }

    /// Dead on-demand sessions are evicted so the next request with a full
    /// launch spec starts fresh. Auto-started sessions stay: the monitor
    /// owns their restart.
    async fn prune_if_dead(&self, id: &ServerId, err: &mcp_session::Error) {
        if err.is_child_dead() && !self.pool.is_auto(id) {
            self.pool.stop(id).await;
        }
    }
}
