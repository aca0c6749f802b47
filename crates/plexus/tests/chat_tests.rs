//! Chat plugin integration tests over a live socket.

use std::time::Duration;

use serde_json::json;

use plexus_protocol::MessageType;
use plexus_protocol::bus::subjects;
use plexus_protocol::models::ChatType;

mod common;
use common::{TestServer, assert_error};

const QUIET: Duration = Duration::from_millis(300);

/// Drain for `wait` and fail if any frame of `message_type` shows up.
async fn assert_no(client: &mut common::Client, message_type: MessageType, wait: Duration) {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let left = deadline.saturating_duration_since(tokio::time::Instant::now());
        if left.is_zero() {
            return;
        }
        match client.recv_within(left).await {
            Some(frame) => assert_ne!(frame.message_type, message_type, "unexpected {frame:?}"),
            None => return,
        }
    }
}

#[tokio::test]
async fn send_message_echoes_to_sender_only_once() {
    let server = TestServer::start().await;
    server.seed_user(1, "ada", 3).await;
    let mut ada = server.connect_as(1).await;

    ada.send("a", MessageType::ChatSendMessage, json!({"chat_id": "0", "body": "hi"}))
        .await;
    let echo = ada.recv().await;
    assert_eq!(echo.sequence_id, "a");
    assert_eq!(echo.message_type, MessageType::ChatSendMessage);
    assert_eq!(echo.payload["chat_id"], "0");
    assert_eq!(echo.payload["author_id"], "1");
    assert_eq!(echo.payload["body"], "hi");
    assert_eq!(echo.payload["author_renown"], 3);

    // The bus fan-out of its own message is suppressed.
    ada.assert_silent(QUIET).await;
}

#[tokio::test]
async fn second_connection_of_the_sender_gets_no_copy() {
    let server = TestServer::start().await;
    server.seed_user(1, "ada", 3).await;
    let mut desk = server.connect_as(1).await;
    let mut phone = server.connect_as(1).await;
    server.wait_for_subscribers(&subjects::chat_messages(0), 2).await;

    desk.send("a", MessageType::ChatSendMessage, json!({"chat_id": "0", "body": "hi"}))
        .await;
    let echo = desk.recv().await;
    assert_eq!((echo.sequence_id.as_str(), &echo.message_type), ("a", &MessageType::ChatSendMessage));

    desk.assert_silent(QUIET).await;
    phone.assert_silent(QUIET).await;
}

#[tokio::test]
async fn members_receive_broadcast_without_sequence_id() {
    let server = TestServer::start().await;
    server.seed_user(1, "ada", 1).await;
    server.seed_user(2, "bob", 2).await;
    server
        .store
        .insert_chat(42, "crew", ChatType::PrivateGroup, &[1, 2])
        .await
        .unwrap();

    let mut ada = server.connect_as(1).await;
    let mut bob = server.connect_as(2).await;

    ada.send("x", MessageType::ChatSendMessage, json!({"chat_id": "42", "body": "hello crew"}))
        .await;

    let echo = ada.recv().await;
    assert_eq!((echo.sequence_id.as_str(), &echo.message_type), ("x", &MessageType::ChatSendMessage));

    let incoming = bob.recv().await;
    assert_eq!(incoming.message_type, MessageType::ChatIncomingMessage);
    assert_eq!(incoming.sequence_id, "");
    assert_eq!(incoming.payload["chat_id"], "42");
    assert_eq!(incoming.payload["body"], "hello crew");
    assert_eq!(incoming.payload["author_renown"], 1);

    ada.assert_silent(QUIET).await;
    bob.assert_silent(QUIET).await;
}

#[tokio::test]
async fn non_members_cannot_post_to_private_chats() {
    let server = TestServer::start().await;
    server.seed_user(1, "ada", 1).await;
    server.seed_user(2, "bob", 1).await;
    server.seed_user(3, "eve", 1).await;
    server
        .store
        .insert_chat(42, "crew", ChatType::PrivateGroup, &[1, 2])
        .await
        .unwrap();

    let mut eve = server.connect_as(3).await;
    let reply = eve
        .request("p", MessageType::ChatSendMessage, json!({"chat_id": "42", "body": "let me in"}))
        .await;
    assert_eq!(reply.message_type, MessageType::ErrorGeneric);
    assert_eq!(reply.payload["code"], "bad_request");
}

#[tokio::test]
async fn subscribing_to_a_non_challenge_chat_is_rejected() {
    let server = TestServer::start().await;
    server.seed_user(1, "ada", 1).await;
    let mut ada = server.connect_as(1).await;

    let reply = ada
        .request("s", MessageType::ChatSubscribe, json!({"chat_id": "0", "chat_type": 0}))
        .await;
    assert_error(&reply, "bad_request", "invalid chat type");

    // Still the only subscription on the global chat: one listener per connection.
    assert_eq!(server.bus.subscriber_count(&subjects::chat_messages(0)), 1);
}

#[tokio::test]
async fn challenge_subscribe_is_idempotent_and_unsubscribe_stops_delivery() {
    let server = TestServer::start().await;
    server.seed_user(1, "ada", 1).await;
    server
        .store
        .insert_chat(77, "weekly challenge", ChatType::Challenge, &[])
        .await
        .unwrap();

    let mut ada = server.connect_as(1).await;
    let mut watcher = server.connect_anonymous().await;

    for seq in ["s1", "s2"] {
        let reply = watcher
            .request(seq, MessageType::ChatSubscribe, json!({"chat_id": "77", "chat_type": 5}))
            .await;
        assert_eq!(reply.message_type, MessageType::ChatSubscribe);
        assert_eq!(reply.payload["chat"]["id"], "77");
    }

    ada.request("m1", MessageType::ChatSendMessage, json!({"chat_id": "77", "body": "go"}))
        .await;
    let incoming = watcher.recv_type(MessageType::ChatIncomingMessage).await;
    assert_eq!(incoming.payload["body"], "go");
    assert_no(&mut watcher, MessageType::ChatIncomingMessage, QUIET).await;

    let reply = watcher
        .request("u1", MessageType::ChatUnsubscribe, json!({"chat_id": "77"}))
        .await;
    assert_eq!(reply.payload["chat_id"], "77");

    ada.request("m2", MessageType::ChatSendMessage, json!({"chat_id": "77", "body": "still there?"}))
        .await;
    assert_no(&mut watcher, MessageType::ChatIncomingMessage, QUIET).await;

    let reply = watcher
        .request("u2", MessageType::ChatUnsubscribe, json!({"chat_id": "77"}))
        .await;
    assert_error(&reply, "bad_request", "chat is not subscribed");
}

#[tokio::test]
async fn unknown_challenge_is_invalid() {
    let server = TestServer::start().await;
    let mut anon = server.connect_anonymous().await;
    let reply = anon
        .request("s", MessageType::ChatSubscribe, json!({"chat_id": "404", "chat_type": 5}))
        .await;
    assert_error(&reply, "bad_request", "invalid chat");
}

#[tokio::test]
async fn new_chat_reaches_connected_members() {
    let server = TestServer::start().await;
    server.seed_user(1, "ada", 1).await;
    server.seed_user(2, "bob", 1).await;
    server.seed_user(3, "cy", 1).await;

    let mut ada = server.connect_as(1).await;
    let mut bob = server.connect_as(2).await;

    let created = ada
        .request(
            "n",
            MessageType::ChatNew,
            json!({"name": "trio", "chat_type": 3, "users": ["2", "3"]}),
        )
        .await;
    assert_eq!(created.message_type, MessageType::ChatNew, "{created:?}");
    let chat_id = created.payload["id"].as_str().unwrap().to_string();

    let broadcast = bob.recv_type(MessageType::ChatNewBroadcast).await;
    assert_eq!(broadcast.payload["id"], chat_id.as_str());
    assert_eq!(broadcast.sequence_id, "");

    // Bob is now subscribed and sees traffic in the new chat.
    ada.request("m", MessageType::ChatSendMessage, json!({"chat_id": chat_id, "body": "welcome"}))
        .await;
    let incoming = bob.recv_type(MessageType::ChatIncomingMessage).await;
    assert_eq!(incoming.payload["body"], "welcome");
}

#[tokio::test]
async fn new_chat_update_event_skips_the_creator() {
    let server = TestServer::start().await;
    server.seed_user(1, "ada", 1).await;
    server.seed_user(2, "bob", 1).await;
    server.seed_user(3, "cy", 1).await;

    let mut ada = server.connect_as(1).await;
    let mut bob = server.connect_as(2).await;

    let created = ada
        .request(
            "n",
            MessageType::ChatNew,
            json!({"name": "trio", "chat_type": 3, "users": ["2", "3"]}),
        )
        .await;
    assert_eq!(created.message_type, MessageType::ChatNew, "{created:?}");

    let updated = bob.recv_type(MessageType::ChatUpdatedEvent).await;
    assert_eq!(updated.sequence_id, "");
    assert_no(&mut ada, MessageType::ChatUpdatedEvent, QUIET).await;
}

#[tokio::test]
async fn removed_member_is_kicked_and_stops_receiving() {
    let server = TestServer::start().await;
    server.seed_user(1, "ada", 1).await;
    server.seed_user(2, "bob", 1).await;
    server.seed_user(3, "cy", 1).await;
    server
        .store
        .insert_chat(42, "crew", ChatType::PrivateGroup, &[1, 2, 3])
        .await
        .unwrap();

    let mut ada = server.connect_as(1).await;
    let mut bob = server.connect_as(2).await;

    let reply = ada
        .request("e", MessageType::ChatUpdate, json!({"chat_id": "42", "remove_users": ["2"]}))
        .await;
    assert_eq!(reply.message_type, MessageType::ChatUpdate, "{reply:?}");

    let kick = bob.recv_type(MessageType::ChatKick).await;
    assert_eq!(kick.payload["chat_id"], "42");
    // The kick is pushed before the subscription is dropped.
    tokio::time::sleep(Duration::from_millis(100)).await;

    ada.request("m", MessageType::ChatSendMessage, json!({"chat_id": "42", "body": "bye bob"}))
        .await;
    assert_no(&mut bob, MessageType::ChatIncomingMessage, QUIET).await;
}

#[tokio::test]
async fn anonymous_connections_are_read_only() {
    let server = TestServer::start().await;
    let mut anon = server.connect_anonymous().await;

    let reply = anon
        .request("a", MessageType::ChatSendMessage, json!({"chat_id": "0", "body": "hi"}))
        .await;
    assert_error(&reply, "bad_request", "authentication required");

    let reply = anon
        .request("g", MessageType::ChatGetMessages, json!({"chat_id": "0"}))
        .await;
    assert_eq!(reply.message_type, MessageType::ChatGetMessages);
    assert!(reply.payload["messages"].is_array());
}

#[tokio::test]
async fn invalid_ids_are_validation_errors() {
    let server = TestServer::start().await;
    server.seed_user(1, "ada", 1).await;
    let mut ada = server.connect_as(1).await;

    let reply = ada
        .request("v", MessageType::ChatSendMessage, json!({"chat_id": "zero", "body": "hi"}))
        .await;
    assert_eq!(reply.message_type, MessageType::ErrorValidation);
    assert_eq!(reply.payload["code"], "validation");
    assert_eq!(reply.payload["validation_errors"]["chat_id"], "number");
}
