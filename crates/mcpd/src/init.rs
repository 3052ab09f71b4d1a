//! Boot-time initialization: start every auto-start catalog entry in
//! bounded-parallelism batches under one global deadline, then apply the
//! configured failure policy.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::pool::Pool;
use crate::server::{ServerId, ServerSpec};

/// What to do when an auto-start entry fails to come up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OnInitFailure {
    /// A failed non-optional entry aborts the daemon (exit code 1).
    Fail,
    /// Log every failure; the daemon continues.
    #[default]
    Warn,
    /// Continue silently.
    Ignore,
}

#[derive(Debug, Clone)]
pub struct InitSettings {
    /// Global deadline for the whole boot, not per entry.
    pub timeout: Duration,
    /// Entries started concurrently per batch; batches are sequential.
    pub parallel: usize,
    pub on_failure: OnInitFailure,
}

impl Default for InitSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            parallel: 4,
            on_failure: OnInitFailure::Warn,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerInitRecord {
    pub name: String,
    pub id: ServerId,
    pub optional: bool,
    pub duration: Duration,
    pub error: Option<String>,
}

impl ServerInitRecord {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

/// One boot's outcome; kept around so `status` can surface it.
#[derive(Debug, Clone, Default)]
pub struct InitializationResult {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub optional_failures: usize,
    pub servers: Vec<ServerInitRecord>,
}

impl InitializationResult {
    pub fn required_failures(&self) -> Vec<&str> {
        self.servers
            .iter()
            .filter(|record| !record.success() && !record.optional)
            .map(|record| record.name.as_str())
            .collect()
    }

    /// Compact JSON view for the `status` response.
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "total": self.total,
            "successful": self.successful,
            "failed": self.failed,
            "optional_failures": self.optional_failures,
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to start required servers: {names}")]
pub struct RequiredServersFailed {
    pub names: String,
    pub result: InitializationResult,
}

/// Starts all `auto_start` entries of the catalog. Returns `Err` only under
/// the `fail` policy with at least one non-optional failure.
pub async fn initialize_servers(
    pool: &Arc<Pool>,
    catalog: &[(String, ServerSpec)],
    settings: &InitSettings,
) -> Result<InitializationResult, RequiredServersFailed> {
    let entries: Vec<(String, ServerSpec)> = catalog
        .iter()
        .filter(|(_, spec)| spec.auto_start())
        .cloned()
        .collect();
    if entries.is_empty() {
        tracing::info!("no servers configured for auto-start");
        return Ok(InitializationResult::default());
    }

    let parallel = settings.parallel.max(1);
    let deadline = Instant::now() + settings.timeout;
    tracing::info!(
        total = entries.len(),
        parallel,
        timeout_seconds = settings.timeout.as_secs(),
        "initializing auto-start servers"
    );

    let total = entries.len();
    let mut records = Vec::with_capacity(total);
    for batch in entries.chunks(parallel) {
        if Instant::now() >= deadline {
            // Global deadline exceeded: remaining entries are never
            // attempted and count as timed out.
            for (name, spec) in batch {
                records.push(timeout_record(name, spec, settings.timeout));
            }
            continue;
        }

        let mut set = tokio::task::JoinSet::new();
        for (name, spec) in batch {
            let pool = pool.clone();
            let name = name.clone();
            let spec = spec.clone();
            let total_timeout = settings.timeout;
            set.spawn(async move {
                start_one(&pool, name, spec, deadline, total_timeout).await
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::error!(error = %err, "initialization task failed");
                }
            }
        }
    }

    let successful = records.iter().filter(|r| r.success()).count();
    let failed = records.len() - successful;
    let required_failures: Vec<String> = records
        .iter()
        .filter(|r| !r.success() && !r.optional)
        .map(|r| r.name.clone())
        .collect();
    let optional_failures = failed - required_failures.len();

    for record in &records {
        match &record.error {
            None => tracing::info!(
                server = %record.name,
                duration_ms = record.duration.as_millis() as u64,
                "server ready"
            ),
            Some(error) => {
                if settings.on_failure != OnInitFailure::Ignore {
                    tracing::warn!(server = %record.name, error = %error, optional = record.optional, "server failed to start");
                }
            }
        }
    }

    let result = InitializationResult {
        total,
        successful,
        failed,
        optional_failures,
        servers: records,
    };
    tracing::info!(
        successful,
        total,
        failed,
        optional_failures,
        "initialization complete"
    );

    if settings.on_failure == OnInitFailure::Fail && !required_failures.is_empty() {
        return Err(RequiredServersFailed {
            names: required_failures.join(", "),
            result,
        });
    }
    Ok(result)
}

async fn start_one(
    pool: &Arc<Pool>,
    name: String,
    spec: ServerSpec,
    deadline: Instant,
    total_timeout: Duration,
) -> ServerInitRecord {
    let started = Instant::now();
    let outcome = tokio::time::timeout_at(deadline, pool.start(&spec, true)).await;
    let error = match outcome {
        Ok(Ok(_)) => None,
        Ok(Err(err)) => Some(err.to_string()),
        Err(_) => Some(format!(
            "initialization timed out (>{}s)",
            total_timeout.as_secs()
        )),
    };
    ServerInitRecord {
        name,
        id: spec.id(),
        optional: spec.optional(),
        duration: started.elapsed(),
        error,
    }
}

fn timeout_record(name: &str, spec: &ServerSpec, total_timeout: Duration) -> ServerInitRecord {
    ServerInitRecord {
        name: name.to_string(),
        id: spec.id(),
        optional: spec.optional(),
        duration: Duration::ZERO,
        error: Some(format!(
            "initialization timed out (>{}s)",
            total_timeout.as_secs()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_init_failure_parses_lowercase() {
        assert_eq!(
            serde_json::from_str::<OnInitFailure>("\"fail\"").unwrap(),
            OnInitFailure::Fail
        );
        assert_eq!(
            serde_json::from_str::<OnInitFailure>("\"warn\"").unwrap(),
            OnInitFailure::Warn
        );
        assert_eq!(
            serde_json::from_str::<OnInitFailure>("\"ignore\"").unwrap(),
            OnInitFailure::Ignore
        );
        assert!(serde_json::from_str::<OnInitFailure>("\"abort\"").is_err());
    }

    #[test]
    fn result_counts_required_failures() {
        let spec = ServerSpec::parse("echo-server").unwrap();
        let result = InitializationResult {
            total: 3,
            successful: 1,
            failed: 2,
            optional_failures: 1,
            servers: vec![
                ServerInitRecord {
                    name: "ok".into(),
                    id: spec.id(),
                    optional: false,
                    duration: Duration::ZERO,
                    error: None,
                },
                ServerInitRecord {
                    name: "required-broken".into(),
                    id: spec.id(),
                    optional: false,
                    duration: Duration::ZERO,
                    error: Some("spawn failed".into()),
                },
                ServerInitRecord {
                    name: "optional-broken".into(),
                    id: spec.id(),
                    optional: true,
                    duration: Duration::ZERO,
                    error: Some("spawn failed".into()),
                },
            ],
        };
        assert_eq!(result.required_failures(), vec!["required-broken"]);
        assert_eq!(result.summary()["failed"], 2);
    }
}
