#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use mcp_session::SessionOptions;
use mcpd::{monitor, Pool, ServerSpec};
use tokio::sync::watch;

#[tokio::test]
async fn auto_started_server_is_restarted_after_crash() {
    let dir = tempfile::tempdir().unwrap();
    let stub = common::write_stub(&dir);
    let spec = ServerSpec::parse(&common::stub_command_line(&stub, None)).unwrap();

    let pool = Arc::new(Pool::new(SessionOptions::default()));
    let id = pool.start(&spec, true).await.expect("auto start");

    // Simulate an external crash: the session dies but stays registered.
    pool.get(&id).expect("session present").shutdown().await;
    assert!(!pool.get(&id).unwrap().is_alive());

    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(monitor::run(
        pool.clone(),
        Duration::from_millis(50),
        stop_rx,
    ));

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if pool
                .get(&id)
                .map(|session| session.is_alive())
                .unwrap_or(false)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("monitor restarted the server");

    assert!(pool.is_auto(&id));

    let _ = stop_tx.send(true);
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("monitor stopped")
        .expect("monitor ok");
    pool.stop_all().await;
}

#[tokio::test]
async fn on_demand_servers_are_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let stub = common::write_stub(&dir);
    let spec = ServerSpec::parse(&common::stub_command_line(&stub, None)).unwrap();

    let pool = Arc::new(Pool::new(SessionOptions::default()));
    let id = pool.start(&spec, false).await.expect("start");
    pool.get(&id).expect("session present").shutdown().await;

    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(monitor::run(
        pool.clone(),
        Duration::from_millis(50),
        stop_rx,
    ));

    tokio::time::sleep(Duration::from_millis(300)).await;
    // Still the same dead session: the monitor only owns auto-started ids.
    assert!(!pool.get(&id).expect("session still present").is_alive());

    let _ = stop_tx.send(true);
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("monitor stopped")
        .expect("monitor ok");
    pool.stop_all().await;
}

#[tokio::test]
async fn failed_restarts_keep_retrying_with_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let stub = common::write_stub(&dir);
    let spec = ServerSpec::parse(&common::stub_command_line(&stub, None)).unwrap();

    let pool = Arc::new(Pool::new(SessionOptions::default()));
    let id = pool.start(&spec, true).await.expect("auto start");
    pool.get(&id).expect("session present").shutdown().await;

    // Make restarts fail by removing the script, then restore it.
    std::fs::remove_file(&stub).unwrap();

    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(monitor::run(
        pool.clone(),
        Duration::from_millis(50),
        stop_rx,
    ));

    tokio::time::sleep(Duration::from_millis(200)).await;
    // The id must still be on the monitor's worklist.
    assert!(pool.is_auto(&id));

    std::fs::write(&stub, common::STUB_SERVER).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if pool
                .get(&id)
                .map(|session| session.is_alive())
                .unwrap_or(false)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("monitor eventually restarted the server");

    let _ = stop_tx.send(true);
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("monitor stopped")
        .expect("monitor ok");
    pool.stop_all().await;
}
