//! The session pool: a typed map from [`ServerId`] to a live
//! [`mcp_session::Session`], plus the auto-started bookkeeping the monitor
//! and the status command rely on.
//!
//! The pool holds no policy: it never retries, never restarts, and never
//! reads configuration. The state lock guards map operations only; child
//! I/O (spawning, stopping) always happens outside it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mcp_session::{Session, SessionOptions};

use crate::server::{ServerId, ServerSpec};

#[derive(Clone)]
pub struct PoolEntry {
    pub session: Arc<Session>,
    pub spec: ServerSpec,
    pub auto: bool,
}

#[derive(Default)]
struct PoolState {
    sessions: HashMap<ServerId, PoolEntry>,
    /// Launch specs of auto-started servers. Normally a subset of
    /// `sessions`; an entry may outlive its session while the monitor is
    /// between restart attempts.
    auto_specs: HashMap<ServerId, ServerSpec>,
}

pub struct Pool {
    state: Mutex<PoolState>,
    /// Per-id guards so concurrent starts of the same id spawn at most one
    /// child without holding the state lock across the spawn.
    start_guards: Mutex<HashMap<ServerId, Arc<tokio::sync::Mutex<()>>>>,
    session_options: SessionOptions,
}

impl Pool {
    pub fn new(session_options: SessionOptions) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            start_guards: Mutex::new(HashMap::new()),
            session_options,
        }
    }

    /// Starts `spec` if its id is not already live; idempotent otherwise.
    /// On failure the map is unchanged and the originating error is
    /// returned.
    pub async fn start(
        &self,
        spec: &ServerSpec,
        auto: bool,
    ) -> Result<ServerId, mcp_session::Error> {
        let id = spec.id();
        if self.reuse_existing(&id, spec, auto) {
            return Ok(id);
        }

        let guard = self.start_guard(&id);
        let _held = guard.lock().await;
        if self.reuse_existing(&id, spec, auto) {
            return Ok(id);
        }

        let session = Session::spawn(
            spec.command(),
            spec.args(),
            spec.env(),
            self.session_options.clone(),
        )
        .await?;
        let session = Arc::new(session);

        {
            let mut state = self.lock_state();
            state.sessions.insert(
                id.clone(),
                PoolEntry {
                    session,
                    spec: spec.clone(),
                    auto,
                },
            );
            if auto {
                state.auto_specs.insert(id.clone(), spec.clone());
            }
        }
        tracing::info!(server = %id, command = spec.command(), auto, "mcp server started");
        Ok(id)
    }

    /// Returns true when a live session for `id` already exists. A dead
    /// session still in the map is evicted (and reaped in the background)
    /// so the caller proceeds to spawn a fresh one.
    fn reuse_existing(&self, id: &ServerId, spec: &ServerSpec, auto: bool) -> bool {
        let stale = {
            let mut state = self.lock_state();
            match state.sessions.get(id) {
                Some(entry) if entry.session.is_alive() => {
                    if auto {
                        state.auto_specs.insert(id.clone(), spec.clone());
                    }
                    return true;
                }
                Some(_) => state.sessions.remove(id),
                None => None,
            }
        };
        if let Some(entry) = stale {
            tracing::debug!(server = %id, "evicting dead session before restart");
            tokio::spawn(async move { entry.session.shutdown().await });
        }
        false
    }

    /// Removes `id` and stops its session. Idempotent; unknown ids succeed.
    /// Returns true when a session was actually removed.
    pub async fn stop(&self, id: &ServerId) -> bool {
        let entry = {
            let mut state = self.lock_state();
            state.auto_specs.remove(id);
            state.sessions.remove(id)
        };
        // Start guards are left in place: removing one here could let a
        // concurrent start of the same id spawn a second child.
        match entry {
            Some(entry) => {
                entry.session.shutdown().await;
                tracing::info!(server = %id, "mcp server stopped");
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &ServerId) -> Option<Arc<Session>> {
        self.lock_state()
            .sessions
            .get(id)
            .map(|entry| entry.session.clone())
    }

    pub fn entry(&self, id: &ServerId) -> Option<PoolEntry> {
        self.lock_state().sessions.get(id).cloned()
    }

    pub fn contains(&self, id: &ServerId) -> bool {
        self.lock_state().sessions.contains_key(id)
    }

    pub fn is_auto(&self, id: &ServerId) -> bool {
        self.lock_state().auto_specs.contains_key(id)
    }

    pub fn list_ids(&self) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> = self.lock_state().sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot of live sessions for `list-all` style iteration.
    pub fn entries(&self) -> Vec<(ServerId, PoolEntry)> {
        let mut entries: Vec<(ServerId, PoolEntry)> = self
            .lock_state()
            .sessions
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Auto-started ids with their original launch specs; includes ids whose
    /// session is currently gone (the monitor's restart worklist).
    pub fn auto_entries(&self) -> Vec<(ServerId, ServerSpec)> {
        let mut entries: Vec<(ServerId, ServerSpec)> = self
            .lock_state()
            .auto_specs
            .iter()
            .map(|(id, spec)| (id.clone(), spec.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Status view: (id, auto-started, uptime) per live session, sorted by
    /// id.
    pub fn snapshot(&self) -> Vec<(ServerId, bool, Duration)> {
        let state = self.lock_state();
        let mut rows: Vec<(ServerId, bool, Duration)> = state
            .sessions
            .iter()
            .map(|(id, entry)| {
                (
                    id.clone(),
                    state.auto_specs.contains_key(id),
                    entry.session.uptime(),
                )
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// Stops every session in parallel and clears all bookkeeping.
    pub async fn stop_all(&self) {
        let entries: Vec<PoolEntry> = {
            let mut state = self.lock_state();
            state.auto_specs.clear();
            state.sessions.drain().map(|(_, entry)| entry).collect()
        };
        {
            let mut guards = self.lock_guards();
            guards.clear();
        }
        if entries.is_empty() {
            return;
        }

        let mut set = tokio::task::JoinSet::new();
        for entry in entries {
            set.spawn(async move { entry.session.shutdown().await });
        }
        while set.join_next().await.is_some() {}
        tracing::info!("all mcp servers stopped");
    }

    fn start_guard(&self, id: &ServerId) -> Arc<tokio::sync::Mutex<()>> {
        let mut guards = self.lock_guards();
        guards
            .entry(id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_guards(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<ServerId, Arc<tokio::sync::Mutex<()>>>> {
        self.start_guards.lock().unwrap_or_else(|e| e.into_inner())
    }
}
