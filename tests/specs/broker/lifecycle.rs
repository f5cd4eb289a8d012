//! Broker lifecycle specs: single-instance policy and idle shutdown.

use crate::prelude::*;

use std::time::Duration;

use serial_test::serial;

use lmb_broker::lifecycle::{self, Config, LifecycleError};
use lmb_broker::logbuf::LogBuffer;

#[tokio::test]
async fn second_broker_on_same_pipe_detects_contention() {
    let broker = start_broker().await;

    let config = Config {
        pipe_name: "lm-tools-bridge-spec".to_string(),
        socket_path: broker.socket_path.clone(),
        http_port: 0,
        log_file: None,
        idle_grace: Duration::from_secs(10),
        prune_interval: Duration::from_secs(1),
    };

    match lifecycle::startup(config, LogBuffer::new(None)).await {
        Err(LifecycleError::AlreadyRunning(path)) => {
            assert_eq!(path, broker.socket_path);
        }
        Ok(_) => panic!("second broker must not bind the same pipe"),
        Err(other) => panic!("expected AlreadyRunning, got {other:?}"),
    }
}

/// With no heartbeats and a shrunken grace window, the broker shuts itself
/// down: both listeners stop serving.
#[tokio::test]
async fn idle_broker_shuts_down_after_grace() {
    let broker =
        start_broker_with(Duration::from_millis(150), Duration::from_millis(25)).await;
    let client = reqwest::Client::new();
    assert!(client
        .get(format!("{}/mcp/health", broker.base))
        .send()
        .await
        .is_ok());

    // No instance ever heartbeats; idle shutdown must fire.
    let deadline =
        std::time::Instant::now() + std::time::Duration::from_millis(SPEC_WAIT_MAX_MS);
    loop {
        if client
            .get(format!("{}/mcp/health", broker.base))
            .send()
            .await
            .is_err()
        {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "idle shutdown did not fire"
        );
        tokio::time::sleep(std::time::Duration::from_millis(SPEC_POLL_INTERVAL_MS)).await;
    }
}

/// A heartbeat keeps the broker alive through the grace window.
#[tokio::test]
async fn heartbeats_defer_idle_shutdown() {
    let broker =
        start_broker_with(Duration::from_millis(200), Duration::from_millis(25)).await;
    let client = reqwest::Client::new();

    // Heartbeat repeatedly past the point where an idle broker would exit.
    for _ in 0..6 {
        heartbeat(&broker, "inst-a", 50001, "/work/alpha").await;
        tokio::time::sleep(Duration::from_millis(60)).await;
    }
    assert!(
        client
            .get(format!("{}/mcp/health", broker.base))
            .send()
            .await
            .is_ok(),
        "broker must stay up while instances heartbeat"
    );
}

/// Timing knobs can come from the environment (used by editor test beds).
#[test]
#[serial]
fn env_overrides_feed_config() {
    std::env::set_var("LMB_IDLE_GRACE_MS", "1234");
    std::env::set_var("LMB_PRUNE_INTERVAL_MS", "111");

    let config = Config::load();
    assert_eq!(config.idle_grace, Duration::from_millis(1234));
    assert_eq!(config.prune_interval, Duration::from_millis(111));

    std::env::remove_var("LMB_IDLE_GRACE_MS");
    std::env::remove_var("LMB_PRUNE_INTERVAL_MS");

    let config = Config::load();
    assert_eq!(config.idle_grace, Duration::from_secs(10));
    assert_eq!(config.prune_interval, Duration::from_secs(1));
}
