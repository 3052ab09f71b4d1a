//! Health monitoring for auto-started servers: any that have died are
//! restarted through the pool, with per-id doubling backoff capped at
//! eight health intervals.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::pool::Pool;
use crate::server::ServerId;

struct Backoff {
    delay: Duration,
    next_attempt: Instant,
}

/// Runs until `stop` flips to true. Non-auto-started sessions are never
/// touched; their death surfaces on the next client request instead.
pub async fn run(pool: Arc<Pool>, interval: Duration, mut stop: watch::Receiver<bool>) {
    let interval = interval.max(Duration::from_millis(10));
    let max_backoff = interval * 8;
    let mut backoff: HashMap<ServerId, Backoff> = HashMap::new();

    tracing::debug!(interval_seconds = interval.as_secs_f64(), "health monitor started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately; consume it so the first real
    // pass happens one interval after startup.
    ticker.tick().await;

    while !*stop.borrow_and_update() {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
                continue;
            }
        }

        let auto = pool.auto_entries();
        backoff.retain(|id, _| auto.iter().any(|(auto_id, _)| auto_id == id));

        for (id, spec) in auto {
            let healthy = pool
                .get(&id)
                .map(|session| session.is_alive())
                .unwrap_or(false);
            if healthy {
                backoff.remove(&id);
                continue;
            }

            let now = Instant::now();
            if let Some(state) = backoff.get(&id) {
                if now < state.next_attempt {
                    continue;
                }
            }

            tracing::warn!(server = %id, "auto-started server is down, restarting");
            match pool.start(&spec, true).await {
                Ok(_) => {
                    tracing::info!(server = %id, "restart successful");
                    backoff.remove(&id);
                }
                Err(err) => {
                    tracing::error!(server = %id, error = %err, "restart failed");
                    let delay = match backoff.get(&id) {
                        Some(state) => (state.delay * 2).min(max_backoff),
                        None => interval,
                    };
                    backoff.insert(
                        id,
                        Backoff {
                            delay,
                            next_attempt: now + delay,
                        },
                    );
                }
            }
        }
    }

    tracing::debug!("health monitor stopped");
}
