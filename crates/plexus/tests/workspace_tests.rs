//! Workspace status plugin integration tests.

use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use plexus_protocol::MessageType;
use plexus_protocol::bus::{WorkspaceStatusUpdate, subjects};
use plexus_protocol::models::{InitState, Workspace, WorkspaceState};

mod common;
use common::{TestServer, assert_error, test_config};

fn workspace(id: i64, owner_id: i64, init_state: InitState, state: WorkspaceState) -> Workspace {
    Workspace {
        id,
        owner_id,
        init_state,
        state,
        expiration: None,
    }
}

/// Seed user 1 with an active workspace 10 that is still waiting on its agent.
async fn connecting_workspace(server: &TestServer) -> Workspace {
    server.seed_user(1, "ada", 1).await;
    let ws = workspace(10, 1, InitState::AgentConnecting, WorkspaceState::Active);
    server.store.upsert_workspace(&ws).await.unwrap();
    ws
}

async fn subscribe(server: &TestServer, client: &mut common::Client, workspace_id: &str) {
    let reply = client
        .request("w", MessageType::WorkspaceSubscribe, json!({"workspace_id": workspace_id}))
        .await;
    assert_eq!(reply.message_type, MessageType::WorkspaceStatusUpdate, "{reply:?}");
    assert_eq!(reply.payload["workspace"]["id"], workspace_id);
    let id: i64 = workspace_id.parse().unwrap();
    server.wait_for_subscribers(&subjects::workspace_status(id), 1).await;
}

async fn publish_completed(server: &TestServer, ws: &Workspace) {
    let update = WorkspaceStatusUpdate {
        workspace: Workspace {
            init_state: InitState::Completed,
            ..ws.clone()
        },
        resources: None,
    };
    server
        .publisher
        .publish(&subjects::workspace_status(ws.id), &update)
        .await;
}

#[tokio::test]
async fn subscribe_replies_with_current_status() {
    let server = TestServer::start().await;
    connecting_workspace(&server).await;
    let mut ada = server.connect_as(1).await;

    let reply = ada
        .request("w", MessageType::WorkspaceSubscribe, json!({"workspace_id": "10"}))
        .await;
    assert_eq!(reply.message_type, MessageType::WorkspaceStatusUpdate);
    assert_eq!(reply.payload["workspace"]["init_state"], "agent-connecting");
    assert_eq!(reply.payload["workspace"]["state"], "active");
}

#[tokio::test]
async fn foreign_or_missing_workspaces_are_not_found() {
    let server = TestServer::start().await;
    connecting_workspace(&server).await;
    server.seed_user(2, "bob", 1).await;
    let mut bob = server.connect_as(2).await;

    let reply = bob
        .request("w", MessageType::WorkspaceSubscribe, json!({"workspace_id": "10"}))
        .await;
    assert_error(&reply, "bad_request", "workspace not found");

    let reply = bob
        .request("m", MessageType::WorkspaceSubscribe, json!({"workspace_id": "999"}))
        .await;
    assert_error(&reply, "bad_request", "workspace not found");
}

#[tokio::test]
async fn anonymous_cannot_watch_workspaces() {
    let server = TestServer::start().await;
    let mut anon = server.connect_anonymous().await;
    let reply = anon
        .request("w", MessageType::WorkspaceSubscribe, json!({"workspace_id": "10"}))
        .await;
    assert_error(&reply, "bad_request", "authentication required");
}

#[tokio::test]
async fn completion_is_held_until_the_stall_times_out() {
    let server = TestServer::start().await;
    let ws = connecting_workspace(&server).await;
    let mut ada = server.connect_as(1).await;
    subscribe(&server, &mut ada, "10").await;

    let started = Instant::now();
    publish_completed(&server, &ws).await;

    let frame = ada.recv_type(MessageType::WorkspaceStatusUpdate).await;
    let waited = started.elapsed();
    assert_eq!(frame.sequence_id, "");
    assert_eq!(frame.payload["workspace"]["init_state"], "completed");
    // stall_timeout_ms is 600 in the test config.
    assert!(waited >= Duration::from_millis(550), "released after {waited:?}");
}

#[tokio::test]
async fn completion_is_released_once_an_agent_appears() {
    let server = TestServer::start().await;
    let ws = connecting_workspace(&server).await;
    let mut ada = server.connect_as(1).await;
    subscribe(&server, &mut ada, "10").await;

    let started = Instant::now();
    publish_completed(&server, &ws).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    server.store.attach_agent(10, "ws://127.0.0.1:1", "s").await.unwrap();

    let frame = ada.recv_type(MessageType::WorkspaceStatusUpdate).await;
    let waited = started.elapsed();
    assert_eq!(frame.payload["workspace"]["init_state"], "completed");
    assert!(waited >= Duration::from_millis(150), "released after {waited:?}");
    assert!(waited < Duration::from_millis(550), "released after {waited:?}");
}

#[tokio::test]
async fn updates_that_need_no_stall_pass_straight_through() {
    let server = TestServer::start().await;
    server.seed_user(1, "ada", 1).await;
    let ws = workspace(10, 1, InitState::Completed, WorkspaceState::Active);
    server.store.upsert_workspace(&ws).await.unwrap();
    let mut ada = server.connect_as(1).await;
    subscribe(&server, &mut ada, "10").await;

    let started = Instant::now();
    let stopping = WorkspaceStatusUpdate {
        workspace: Workspace {
            state: WorkspaceState::Stopping,
            ..ws.clone()
        },
        resources: None,
    };
    server
        .publisher
        .publish(&subjects::workspace_status(10), &stopping)
        .await;

    let frame = ada.recv_type(MessageType::WorkspaceStatusUpdate).await;
    assert_eq!(frame.payload["workspace"]["state"], "stopping");
    assert!(started.elapsed() < Duration::from_millis(300));
}

#[tokio::test]
async fn unsubscribe_is_silent_and_stops_updates() {
    let server = TestServer::start().await;
    let ws = connecting_workspace(&server).await;
    let mut ada = server.connect_as(1).await;
    subscribe(&server, &mut ada, "10").await;

    ada.send("u", MessageType::WorkspaceUnsubscribe, json!({"workspace_id": "10"}))
        .await;
    server.wait_for_subscribers(&subjects::workspace_status(10), 0).await;

    publish_completed(&server, &ws).await;
    ada.assert_silent(Duration::from_millis(800)).await;
}

#[tokio::test]
async fn active_workspaces_are_sampled() {
    let mut config = test_config();
    config.workspace.sample_interval_ms = 150;
    let server = TestServer::start_with(config).await;
    server.seed_user(1, "ada", 1).await;
    server
        .store
        .upsert_workspace(&workspace(10, 1, InitState::Completed, WorkspaceState::Active))
        .await
        .unwrap();
    server
        .store
        .upsert_workspace(&workspace(11, 1, InitState::Completed, WorkspaceState::Stopped))
        .await
        .unwrap();

    let mut ada = server.connect_as(1).await;
    subscribe(&server, &mut ada, "10").await;
    let reply = ada
        .request("w2", MessageType::WorkspaceSubscribe, json!({"workspace_id": "11"}))
        .await;
    assert_eq!(reply.payload["workspace"]["state"], "stopped");

    let sample = ada.recv_type(MessageType::WorkspaceStatusUpdate).await;
    assert_eq!(sample.sequence_id, "");
    assert_eq!(sample.payload["workspace"]["id"], "10");
    assert_eq!(sample.payload["resources"]["cpu_limit"], 2.0);
    assert_eq!(sample.payload["resources"]["memory_usage"], 0.25);

    let calls = server.client.calls.lock().unwrap().clone();
    assert!(calls.iter().all(|call| *call == (10, 1)), "{calls:?}");
}
