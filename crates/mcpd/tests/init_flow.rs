#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use mcp_session::SessionOptions;
use mcpd::init::{initialize_servers, InitSettings, OnInitFailure};
use mcpd::{Pool, ServerSpec};

fn settings(on_failure: OnInitFailure) -> InitSettings {
    InitSettings {
        timeout: Duration::from_secs(10),
        parallel: 2,
        on_failure,
    }
}

fn stub_catalog(dir: &tempfile::TempDir, names: &[(&str, bool, bool)]) -> Vec<(String, ServerSpec)> {
    let stub = common::write_stub(dir);
    names
        .iter()
        .copied()
        .map(|(name, auto_start, optional)| {
            let spec = ServerSpec::parse(&common::stub_command_line(&stub, Some(name)))
                .unwrap()
                .with_auto_start(auto_start)
                .with_optional(optional);
            (name.to_string(), spec)
        })
        .collect()
}

#[tokio::test]
async fn starts_only_auto_start_entries() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = stub_catalog(&dir, &[("alpha", true, false), ("beta", false, false)]);
    let pool = Arc::new(Pool::new(SessionOptions::default()));

    let result = initialize_servers(&pool, &catalog, &settings(OnInitFailure::Warn))
        .await
        .expect("init ok");
    assert_eq!(result.total, 1);
    assert_eq!(result.successful, 1);
    assert_eq!(result.failed, 0);

    assert!(pool.contains(&catalog[0].1.id()));
    assert!(!pool.contains(&catalog[1].1.id()));
    assert!(pool.is_auto(&catalog[0].1.id()));

    pool.stop_all().await;
}

#[tokio::test]
async fn empty_catalog_returns_an_empty_result() {
    let pool = Arc::new(Pool::new(SessionOptions::default()));
    let result = initialize_servers(&pool, &[], &settings(OnInitFailure::Fail))
        .await
        .expect("init ok");
    assert_eq!(result.total, 0);
    assert_eq!(result.successful, 0);
}

#[tokio::test]
async fn optional_failure_never_trips_the_fail_policy() {
    let dir = tempfile::tempdir().unwrap();
    let mut catalog = stub_catalog(&dir, &[("good", true, false)]);
    catalog.push((
        "flaky".to_string(),
        ServerSpec::parse("/nonexistent/mcp-server-binary")
            .unwrap()
            .with_optional(true),
    ));
    let pool = Arc::new(Pool::new(SessionOptions::default()));

    let result = initialize_servers(&pool, &catalog, &settings(OnInitFailure::Fail))
        .await
        .expect("optional failure must not abort");
    assert_eq!(result.total, 2);
    assert_eq!(result.successful, 1);
    assert_eq!(result.failed, 1);
    assert_eq!(result.optional_failures, 1);
    assert!(result.required_failures().is_empty());

    pool.stop_all().await;
}

#[tokio::test]
async fn required_failure_under_fail_policy_errors() {
    let dir = tempfile::tempdir().unwrap();
    let mut catalog = stub_catalog(&dir, &[("good", true, false)]);
    catalog.push((
        "broken".to_string(),
        ServerSpec::parse("/nonexistent/mcp-server-binary").unwrap(),
    ));
    let pool = Arc::new(Pool::new(SessionOptions::default()));

    let err = initialize_servers(&pool, &catalog, &settings(OnInitFailure::Fail))
        .await
        .expect_err("required failure must abort");
    assert!(err.names.contains("broken"));
    assert_eq!(err.result.failed, 1);
    assert_eq!(err.result.optional_failures, 0);

    pool.stop_all().await;
}

#[tokio::test]
async fn required_failure_under_warn_policy_continues() {
    let dir = tempfile::tempdir().unwrap();
    let mut catalog = stub_catalog(&dir, &[("good", true, false)]);
    catalog.push((
        "broken".to_string(),
        ServerSpec::parse("/nonexistent/mcp-server-binary").unwrap(),
    ));
    let pool = Arc::new(Pool::new(SessionOptions::default()));

    let result = initialize_servers(&pool, &catalog, &settings(OnInitFailure::Warn))
        .await
        .expect("warn policy continues");
    assert_eq!(result.successful, 1);
    assert_eq!(result.failed, 1);
    assert_eq!(result.required_failures(), vec!["broken"]);

    pool.stop_all().await;
}

#[tokio::test]
async fn global_deadline_marks_unreached_entries_as_timed_out() {
    // Children that never complete the handshake.
    let slow = "sh -c \"cat > /dev/null\"";
    let catalog: Vec<(String, ServerSpec)> = (0..3)
        .map(|idx| {
            (
                format!("slow-{idx}"),
                ServerSpec::parse(&format!("{slow} --tag-{idx}")).unwrap(),
            )
        })
        .collect();
    let pool = Arc::new(Pool::new(SessionOptions::default()));

    let settings = InitSettings {
        timeout: Duration::from_millis(200),
        parallel: 1,
        on_failure: OnInitFailure::Warn,
    };
    let started = std::time::Instant::now();
    let result = initialize_servers(&pool, &catalog, &settings)
        .await
        .expect("warn policy continues");
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "global deadline must bound the whole boot"
    );
    assert_eq!(result.total, 3);
    assert_eq!(result.successful, 0);
    assert_eq!(result.failed, 3);
    assert!(result
        .servers
        .iter()
        .all(|record| record.error.as_deref().unwrap_or("").contains("timed out")));

    pool.stop_all().await;
}
