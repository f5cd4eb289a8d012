//! Control-plane specs: the editor-extension surface over the Unix socket.

use crate::prelude::*;

use lmb_broker::control::{ControlRequest, ControlResponse, BROKER_VERSION};
use lmb_core::InstanceId;

#[tokio::test]
async fn health_answers_pong() {
    let broker = start_broker().await;
    let response = control_call(&broker.socket_path, &ControlRequest::Health).await;
    assert_eq!(response, ControlResponse::Pong);
}

#[tokio::test]
async fn status_counts_live_instances() {
    let broker = start_broker().await;
    heartbeat(&broker, "inst-a", 50001, "/work/alpha").await;

    match control_call(&broker.socket_path, &ControlRequest::Status).await {
        ControlResponse::Status {
            version, instances, ..
        } => {
            assert_eq!(version, BROKER_VERSION);
            assert_eq!(instances, 1);
        }
        other => panic!("expected Status, got {other:?}"),
    }
}

#[tokio::test]
async fn heartbeat_is_idempotent_for_same_instance() {
    let broker = start_broker().await;
    heartbeat(&broker, "inst-a", 50001, "/work/alpha").await;
    heartbeat(&broker, "inst-a", 50001, "/work/alpha").await;

    match control_call(&broker.socket_path, &ControlRequest::List).await {
        ControlResponse::Instances { instances, .. } => {
            assert_eq!(instances.len(), 1);
            assert_eq!(instances[0].port, 50001);
        }
        other => panic!("expected Instances, got {other:?}"),
    }
}

/// Allocation skips live ports and honors the floor.
#[tokio::test]
async fn allocation_scenario() {
    let broker = start_broker().await;

    // A occupies 50001 via heartbeat.
    heartbeat(&broker, "inst-a", 50001, "/work/alpha").await;

    // B asks for 50001, gets 50002.
    let response = control_call(
        &broker.socket_path,
        &ControlRequest::Allocate {
            instance_id: InstanceId::new("inst-b"),
            preferred_port: 50001,
            min_port: None,
        },
    )
    .await;
    assert_eq!(response, ControlResponse::Allocated { port: 50002 });

    // B confirms by heartbeating with 50002.
    heartbeat(&broker, "inst-b", 50002, "/work/beta").await;

    // C asks for 50001 with a floor of 50010, gets 50010.
    let response = control_call(
        &broker.socket_path,
        &ControlRequest::Allocate {
            instance_id: InstanceId::new("inst-c"),
            preferred_port: 50001,
            min_port: Some(50010),
        },
    )
    .await;
    assert_eq!(response, ControlResponse::Allocated { port: 50010 });
}

#[tokio::test]
async fn resolve_picks_deepest_match_and_respects_boundaries() {
    let broker = start_broker().await;
    heartbeat(&broker, "inst-a", 50001, "/work/alpha").await;

    match control_call(
        &broker.socket_path,
        &ControlRequest::Resolve {
            cwd: "/work/alpha/src/module".to_string(),
        },
    )
    .await
    {
        ControlResponse::Resolved {
            instance: Some(instance),
        } => assert_eq!(instance.instance_id, "inst-a"),
        other => panic!("expected a match, got {other:?}"),
    }

    match control_call(
        &broker.socket_path,
        &ControlRequest::Resolve {
            cwd: "/work/alpha-sibling".to_string(),
        },
    )
    .await
    {
        ControlResponse::Resolved { instance: None } => {}
        other => panic!("expected no match, got {other:?}"),
    }
}

#[tokio::test]
async fn bye_unregisters_the_instance() {
    let broker = start_broker().await;
    heartbeat(&broker, "inst-a", 50001, "/work/alpha").await;

    let response = control_call(
        &broker.socket_path,
        &ControlRequest::Bye {
            instance_id: InstanceId::new("inst-a"),
        },
    )
    .await;
    assert_eq!(response, ControlResponse::Ok);

    match control_call(&broker.socket_path, &ControlRequest::List).await {
        ControlResponse::Instances { instances, .. } => assert!(instances.is_empty()),
        other => panic!("expected Instances, got {other:?}"),
    }
}

/// Version-locked shutdown for upgrades.
#[tokio::test]
async fn shutdown_honors_expected_version() {
    let broker = start_broker().await;
    let client = reqwest::Client::new();

    // Mismatched version: refused, broker keeps serving.
    let response = control_call(
        &broker.socket_path,
        &ControlRequest::Shutdown {
            reason: Some("upgrade".to_string()),
            expected_version: Some("9.9.9".to_string()),
        },
    )
    .await;
    assert_eq!(
        response,
        ControlResponse::VersionMismatch {
            version: BROKER_VERSION.to_string(),
        }
    );
    assert!(client
        .get(format!("{}/mcp/health", broker.base))
        .send()
        .await
        .is_ok());

    // Matching version: the reply arrives, then the listeners close.
    let response = control_call(
        &broker.socket_path,
        &ControlRequest::Shutdown {
            reason: Some("upgrade".to_string()),
            expected_version: Some(BROKER_VERSION.to_string()),
        },
    )
    .await;
    assert_eq!(response, ControlResponse::ShuttingDown);

    // Health must eventually stop answering.
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
            "public endpoint still serving after shutdown"
        );
        tokio::time::sleep(std::time::Duration::from_millis(SPEC_POLL_INTERVAL_MS)).await;
    }
}
