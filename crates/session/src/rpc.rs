//! Request/response plumbing shared by every session: the pending map, the
//! writer lock, and the single reader task that demultiplexes child stdout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::Error;

/// What the reader hands back to a caller waiting on a request id.
#[derive(Debug)]
pub(crate) enum Completion {
    Result(Value),
    RpcError {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    /// The response matched our id but was not a valid JSON-RPC response.
    Invalid(String),
    Dead(String),
}

type Pending = Arc<Mutex<HashMap<i64, oneshot::Sender<Completion>>>>;

#[derive(Clone)]
pub(crate) struct RpcHandle {
    write: Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
    next_id: Arc<AtomicI64>,
    pending: Pending,
    dead: Arc<AtomicBool>,
    dead_reason: Arc<Mutex<Option<String>>>,
}

impl RpcHandle {
    pub(crate) fn new<W>(write: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            write: Arc::new(tokio::sync::Mutex::new(Box::new(write))),
            next_id: Arc::new(AtomicI64::new(1)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            dead: Arc::new(AtomicBool::new(false)),
            dead_reason: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Relaxed)
    }

    pub(crate) fn dead_reason(&self) -> String {
        lock_unpoisoned(&self.dead_reason)
            .clone()
            .unwrap_or_else(|| "server closed connection".to_string())
    }

    /// Marks the session dead, fails every pending slot, and closes the
    /// write end so the child sees EOF on stdin.
    pub(crate) async fn mark_dead(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.dead.swap(true, Ordering::Relaxed) {
            return;
        }
        {
            let mut guard = lock_unpoisoned(&self.dead_reason);
            if guard.is_none() {
                *guard = Some(reason.clone());
            }
        }

        let drained = {
            let mut pending = lock_unpoisoned(&self.pending);
            std::mem::take(&mut *pending)
        };
        for (_id, tx) in drained {
            let _ = tx.send(Completion::Dead(reason.clone()));
        }

        let mut write = self.write.lock().await;
        let _ = write.shutdown().await;
        // `tokio::process::ChildStdin` only fully closes the pipe on drop;
        // swapping in a sink guarantees the child observes EOF.
        let _ = std::mem::replace(&mut *write, Box::new(tokio::io::sink()));
    }

    pub(crate) async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        if self.is_dead() {
            return Err(Error::ChildDead(self.dead_reason()));
        }
        let mut msg = Map::new();
        msg.insert("jsonrpc".to_string(), Value::String("2.0".to_string()));
        msg.insert("method".to_string(), Value::String(method.to_string()));
        if let Some(params) = params.filter(|v| !v.is_null()) {
            msg.insert("params".to_string(), params);
        }
        self.write_value(&Value::Object(msg)).await
    }

    /// Issues a request and waits for its completion. Dropping the returned
    /// future (e.g. on a caller timeout) evicts the pending slot, so a late
    /// response is silently discarded by the reader.
    pub(crate) async fn call(&self, method: &str, params: Option<Value>) -> Completion {
        if self.is_dead() {
            return Completion::Dead(self.dead_reason());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock_unpoisoned(&self.pending);
            pending.insert(id, tx);
        }
        let mut guard = PendingGuard {
            pending: self.pending.clone(),
            id,
            armed: true,
        };

        let mut req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
        });
        if let Some(params) = params.filter(|v| !v.is_null()) {
            req["params"] = params;
        }

        if let Err(err) = self.write_value(&req).await {
            return match err {
                Error::ChildDead(reason) => Completion::Dead(reason),
                other => Completion::Invalid(other.to_string()),
            };
        }

        match rx.await {
            Ok(completion) => {
                guard.armed = false;
                completion
            }
            Err(_) => Completion::Dead(self.dead_reason()),
        }
    }

    async fn write_value(&self, value: &Value) -> Result<(), Error> {
        let mut line = match serde_json::to_string(value) {
            Ok(line) => line,
            Err(err) => return Err(Error::Protocol(format!("serialize request: {err}"))),
        };
        line.push('\n');

        let write_result = {
            let mut write = self.write.lock().await;
            async {
                write.write_all(line.as_bytes()).await?;
                write.flush().await
            }
            .await
        };
        if let Err(err) = write_result {
            let reason = format!("write to server stdin failed: {err}");
            self.mark_dead(reason.clone()).await;
            return Err(Error::ChildDead(reason));
        }
        Ok(())
    }
}

struct PendingGuard {
    pending: Pending,
    id: i64,
    armed: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut pending = lock_unpoisoned(&self.pending);
        pending.remove(&self.id);
    }
}

pub(crate) fn spawn_reader<R>(
    read: R,
    handle: RpcHandle,
    max_line_bytes: usize,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = tokio::io::BufReader::new(read);
        let max_line_bytes = max_line_bytes.max(1);
        loop {
            match read_line_limited(&mut reader, max_line_bytes).await {
                Ok(Some(line)) => {
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    let value: Value = match serde_json::from_slice(&line) {
                        Ok(value) => value,
                        Err(err) => {
                            handle
                                .mark_dead(format!("invalid json from server: {err}"))
                                .await;
                            return;
                        }
                    };
                    route(&handle, value);
                }
                Ok(None) => {
                    handle.mark_dead("server closed stdout").await;
                    return;
                }
                Err(err) => {
                    handle
                        .mark_dead(format!("error reading server stdout: {err}"))
                        .await;
                    return;
                }
            }
        }
    })
}

fn route(handle: &RpcHandle, value: Value) {
    let Value::Object(map) = value else {
        // Only objects can carry a response; anything else is noise.
        tracing::debug!("discarding non-object message from server");
        return;
    };

    if let Some(method) = map.get("method").and_then(Value::as_str) {
        // Notifications and server->client requests are not part of the
        // session contract; drop them.
        tracing::debug!(method, "discarding server-originated message");
        return;
    }

    let Some(id) = map.get("id").and_then(Value::as_i64) else {
        return;
    };

    let tx = {
        let mut pending = lock_unpoisoned(&handle.pending);
        pending.remove(&id)
    };
    // No slot: the caller timed out (or was cancelled) before the response
    // arrived. Drop it.
    let Some(tx) = tx else {
        return;
    };

    let completion = classify_response(&map);
    let _ = tx.send(completion);
}

fn classify_response(map: &Map<String, Value>) -> Completion {
    match (map.get("error"), map.get("result")) {
        (Some(Value::Object(error)), None) => {
            let (Some(code), Some(message)) = (
                error.get("code").and_then(Value::as_i64),
                error.get("message").and_then(Value::as_str),
            ) else {
                return Completion::Invalid("malformed json-rpc error object".to_string());
            };
            Completion::RpcError {
                code,
                message: message.to_string(),
                data: error.get("data").cloned(),
            }
        }
        (Some(_), None) => Completion::Invalid("malformed json-rpc error object".to_string()),
        (None, Some(result)) => Completion::Result(result.clone()),
        _ => Completion::Invalid(
            "invalid response: must carry exactly one of result/error".to_string(),
        ),
    }
}

async fn read_line_limited<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<Option<Vec<u8>>, std::io::Error> {
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
        if buf.len().saturating_add(take) > max_bytes {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "message line too large",
            ));
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

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RpcHandle {
    pub(crate) fn pending_len(&self) -> usize {
        lock_unpoisoned(&self.pending).len()
    }
}
